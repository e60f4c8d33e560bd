//! Process wide header injection.
//!
//! The platform can configure headers that get appended to every outgoing
//! request and/or response. Setting a header that is already configured
//! replaces its value.

use parking_lot::Mutex;
use rsip::{Header, Headers};

#[derive(Default)]
struct HeaderSet {
    headers: Vec<(String, String)>,
}

impl HeaderSet {
    fn set(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_string();
        } else {
            self.headers.push((name.to_string(), value.to_string()));
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.headers.len();
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.headers.len()
    }

    fn apply(&self, headers: &mut Headers) {
        for (name, value) in &self.headers {
            headers.push(Header::Other(name.clone(), value.clone()));
        }
    }
}

/// Global request/response header sets.
#[derive(Default)]
pub struct GlobalHeaders {
    request: Mutex<HeaderSet>,
    response: Mutex<HeaderSet>,
}

impl GlobalHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_request_header(&self, name: &str, value: &str) {
        self.request.lock().set(name, value);
    }

    pub fn set_response_header(&self, name: &str, value: &str) {
        self.response.lock().set(name, value);
    }

    pub fn remove_request_header(&self, name: &str) -> bool {
        self.request.lock().remove(name)
    }

    pub fn remove_response_header(&self, name: &str) -> bool {
        self.response.lock().remove(name)
    }

    pub fn apply_to_request(&self, request: &mut rsip::Request) {
        self.request.lock().apply(&mut request.headers);
    }

    pub fn apply_to_response(&self, response: &mut rsip::Response) {
        self.response.lock().apply(&mut response.headers);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn duplicate_set_replaces() {
        let globals = GlobalHeaders::new();
        globals.set_request_header("X-Platform", "tandem");
        globals.set_request_header("x-platform", "tandem-2");

        let raw = "OPTIONS sip:a@b SIP/2.0\r\n\
                   Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bKx\r\n\
                   From: <sip:a@b>;tag=t\r\n\
                   To: <sip:a@b>\r\n\
                   Call-ID: c\r\n\
                   CSeq: 1 OPTIONS\r\n\
                   Content-Length: 0\r\n\r\n";
        let mut request = rsip::Request::try_from(raw.as_bytes()).unwrap();

        globals.apply_to_request(&mut request);

        let values = tandem_core::msg::other_headers(&request.headers, "X-Platform");
        assert_eq!(values, vec!["tandem-2".to_string()]);
    }
}
