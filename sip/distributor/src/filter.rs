//! Message filtering: URI sanitation and multihoming rewrites.

use rsip::prelude::*;
use rsip::{Header, Method, Param};
use std::net::IpAddr;

use tandem_core::config::TransportConfig;
use tandem_core::transport::TpHandle;

/// URI parameters that are meaningful in a Request-URI; everything else
/// is stripped before the request leaves the stack.
const ALLOWED_RURI_PARAMS: &[&str] = &["transport", "user", "method", "ttl", "maddr", "lr"];

/// Methods that establish a dialog and therefore must carry a Contact.
fn is_dialog_creating(method: &Method) -> bool {
    matches!(method, Method::Invite | Method::Subscribe | Method::Refer)
}

/// Strip Request-URI parameters that have no business there.
pub fn sanitize_request_uri(request: &mut rsip::Request) {
    request.uri.params.retain(|param: &Param| {
        let printed = param.to_string();
        let name = printed
            .trim_start_matches(';')
            .split('=')
            .next()
            .unwrap_or("")
            .trim();

        ALLOWED_RURI_PARAMS
            .iter()
            .any(|allowed| name.eq_ignore_ascii_case(allowed))
    });

    // Header fields embedded in the Request-URI are equally unwelcome
    request.uri.headers.clear();
}

/// Reject requests that are unusable before any state is touched: a
/// Request-URI outside `sip:`/`sips:` and dialog-creating requests
/// without a Contact.
pub fn validate_incoming(request: &rsip::Request) -> Result<(), rsip::StatusCode> {
    if let Some(scheme) = &request.uri.scheme
        && !matches!(scheme, rsip::Scheme::Sip | rsip::Scheme::Sips)
    {
        return Err(rsip::StatusCode::UnsupportedUriScheme);
    }

    if is_dialog_creating(&request.method)
        && !request
            .headers
            .iter()
            .any(|h| matches!(h, Header::Contact(_)))
    {
        return Err(rsip::StatusCode::BadRequest);
    }

    Ok(())
}

/// Rewrite the signaling addresses of an outgoing request for
/// multihoming: when the target lies outside every local network, the
/// transport's external address replaces the bound one in Via and
/// Contact, and in the SDP connection line.
pub fn rewrite_outgoing(
    request: &mut rsip::Request,
    config: &TransportConfig,
    transport: &TpHandle,
    target: IpAddr,
) {
    let Some(external) = config.external_signaling_address else {
        return;
    };

    if config.local_net.iter().any(|net| net.contains(target)) {
        return;
    }

    let local_host = transport.sent_by().ip().to_string();
    let external_host = external.to_string();
    let external_port = if config.external_signaling_port != 0 {
        Some(config.external_signaling_port)
    } else {
        None
    };

    let mut rewritten = Vec::with_capacity(request.headers.iter().count());

    for header in request.headers.iter() {
        match header {
            Header::Via(via) => {
                let mut value = via.value().replace(&local_host, &external_host);
                if let Some(port) = external_port {
                    value = replace_port_after_host(&value, &external_host, port);
                }
                rewritten.push(Header::Via(value.into()));
            }
            Header::Contact(contact) => {
                let mut value = contact.value().replace(&local_host, &external_host);
                if let Some(port) = external_port {
                    value = replace_port_after_host(&value, &external_host, port);
                }
                rewritten.push(Header::Contact(value.into()));
            }
            other => rewritten.push(other.clone()),
        }
    }

    request.headers = rewritten.into();

    // SDP connection address rewrite
    if !request.body.is_empty()
        && let Ok(body) = std::str::from_utf8(&request.body)
        && body.starts_with("v=0")
    {
        let media_external = config
            .external_media_address
            .map(|a| a.to_string())
            .unwrap_or_else(|| external_host.clone());

        let rewritten: String = body
            .lines()
            .map(|line| {
                if line.starts_with("c=IN IP4 ") || line.starts_with("c=IN IP6 ") {
                    let fields: Vec<&str> = line.splitn(3, ' ').collect();
                    if fields.len() == 3 && fields[2] == local_host {
                        return format!("{} {} {media_external}", fields[0], fields[1]);
                    }
                }
                line.to_string()
            })
            .collect::<Vec<_>>()
            .join("\r\n");

        request.body = rewritten.into_bytes();
        let len = request.body.len();

        let headers: Vec<Header> = request
            .headers
            .iter()
            .map(|h| match h {
                Header::ContentLength(_) => Header::ContentLength(len.to_string().into()),
                other => other.clone(),
            })
            .collect();
        request.headers = headers.into();
    }
}

/// Replace the port immediately following `host` (if any) with `port`.
fn replace_port_after_host(value: &str, host: &str, port: u16) -> String {
    let Some(position) = value.find(host) else {
        return value.to_string();
    };

    let after = position + host.len();
    let rest = &value[after..];

    if let Some(stripped) = rest.strip_prefix(':') {
        let digits = stripped.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits > 0 {
            return format!("{}:{port}{}", &value[..after], &stripped[digits..]);
        }
    }

    format!("{}:{port}{rest}", &value[..after])
}

#[cfg(test)]
mod test {
    use super::*;
    use tandem_core::config::{Cidr, TransportProtocol};

    fn parse_request(raw: &str) -> rsip::Request {
        rsip::Request::try_from(raw.as_bytes()).unwrap()
    }

    #[test]
    fn request_uri_is_sanitized() {
        let mut request = parse_request(
            "INVITE sip:bob@example.com;ob;transport=udp;custom=1 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bKx\r\n\
             From: <sip:alice@example.com>;tag=a\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: c1\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:alice@1.2.3.4>\r\n\
             Content-Length: 0\r\n\r\n",
        );

        sanitize_request_uri(&mut request);

        let uri = request.uri.to_string();
        assert!(uri.contains("transport=udp"), "{uri}");
        assert!(!uri.contains("ob"), "{uri}");
        assert!(!uri.contains("custom"), "{uri}");
    }

    #[test]
    fn dialog_creating_requests_need_contact() {
        let request = parse_request(
            "INVITE sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bKx\r\n\
             From: <sip:alice@example.com>;tag=a\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: c1\r\n\
             CSeq: 1 INVITE\r\n\
             Content-Length: 0\r\n\r\n",
        );

        assert_eq!(
            validate_incoming(&request),
            Err(rsip::StatusCode::BadRequest)
        );

        let request = parse_request(
            "OPTIONS sip:bob@example.com SIP/2.0\r\n\
             Via: SIP/2.0/UDP 1.2.3.4;branch=z9hG4bKx\r\n\
             From: <sip:alice@example.com>;tag=a\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: c2\r\n\
             CSeq: 1 OPTIONS\r\n\
             Content-Length: 0\r\n\r\n",
        );

        assert_eq!(validate_incoming(&request), Ok(()));
    }

    #[test]
    fn external_address_rewrites_signaling_and_sdp() {
        use async_trait::async_trait;
        use std::fmt;
        use std::net::SocketAddr;

        #[derive(Debug)]
        struct Bound;

        #[async_trait]
        impl tandem_core::transport::Transport for Bound {
            fn name(&self) -> &str {
                "lan"
            }

            fn protocol(&self) -> TransportProtocol {
                TransportProtocol::Udp
            }

            fn bound(&self) -> SocketAddr {
                "10.0.0.5:5060".parse().unwrap()
            }

            fn sent_by(&self) -> SocketAddr {
                "10.0.0.5:5060".parse().unwrap()
            }

            async fn send(&self, _b: &[u8], _t: SocketAddr) -> std::io::Result<()> {
                Ok(())
            }
        }

        impl fmt::Display for Bound {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "UDP:lan")
            }
        }

        let body = "v=0\r\n\
                    o=- 1 1 IN IP4 10.0.0.5\r\n\
                    s=-\r\n\
                    c=IN IP4 10.0.0.5\r\n\
                    t=0 0\r\n\
                    m=audio 4000 RTP/AVP 0\r\n";

        let raw = format!(
            "INVITE sip:bob@203.0.113.7 SIP/2.0\r\n\
             Via: SIP/2.0/UDP 10.0.0.5:5060;branch=z9hG4bKx\r\n\
             From: <sip:alice@example.com>;tag=a\r\n\
             To: <sip:bob@example.com>\r\n\
             Call-ID: c1\r\n\
             CSeq: 1 INVITE\r\n\
             Contact: <sip:alice@10.0.0.5:5060>\r\n\
             Content-Type: application/sdp\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len(),
        );
        let mut request = parse_request(&raw);

        let mut config = TransportConfig::new(
            "lan",
            TransportProtocol::Udp,
            "10.0.0.5:5060".parse().unwrap(),
        );
        config.external_signaling_address = Some("198.51.100.99".parse().unwrap());
        config.external_media_address = Some("198.51.100.98".parse().unwrap());
        config.local_net = vec![Cidr::parse("10.0.0.0/8").unwrap()];

        let transport = TpHandle::new(Bound);

        // Local target: untouched
        let mut local = request.clone();
        rewrite_outgoing(&mut local, &config, &transport, "10.0.0.9".parse().unwrap());
        assert!(local.to_string().contains("10.0.0.5"));
        assert!(!local.to_string().contains("198.51.100.99"));

        // External target: Via/Contact and SDP rewritten
        rewrite_outgoing(
            &mut request,
            &config,
            &transport,
            "203.0.113.7".parse().unwrap(),
        );

        let printed = request.to_string();
        assert!(printed.contains("Via: SIP/2.0/UDP 198.51.100.99"), "{printed}");
        assert!(printed.contains("sip:alice@198.51.100.99"), "{printed}");
        assert!(printed.contains("c=IN IP4 198.51.100.98"), "{printed}");
        assert!(!printed.contains("c=IN IP4 10.0.0.5"), "{printed}");
    }
}
