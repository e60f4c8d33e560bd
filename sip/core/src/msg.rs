//! Helpers for building and picking apart rsip messages.

use rand::distr::{Alphanumeric, SampleString};
use rsip::prelude::*;
use rsip::{Header, Headers, Method, Param, StatusCode, Version};
use std::net::SocketAddr;

use crate::transport::TpHandle;

/// Magic cookie every RFC 3261 branch starts with.
pub const BRANCH_COOKIE: &str = "z9hG4bK";

pub fn make_tag() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), 8)
}

pub fn make_branch() -> String {
    format!(
        "{BRANCH_COOKIE}{}",
        Alphanumeric.sample_string(&mut rand::rng(), 16)
    )
}

pub fn make_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn host_with_port(addr: SocketAddr) -> rsip::HostWithPort {
    rsip::HostWithPort {
        host: addr.ip().into(),
        port: Some(addr.port().into()),
    }
}

fn transport_param(transport: &TpHandle) -> rsip::Transport {
    match transport.protocol() {
        crate::config::TransportProtocol::Udp => rsip::Transport::Udp,
        crate::config::TransportProtocol::Tcp => rsip::Transport::Tcp,
        crate::config::TransportProtocol::Tls => rsip::Transport::Tls,
        crate::config::TransportProtocol::Ws => rsip::Transport::Ws,
    }
}

/// Everything needed to build an out-of-dialog request.
pub struct RequestParts {
    pub method: Method,
    pub target: rsip::Uri,
    pub from: rsip::Uri,
    pub to: rsip::Uri,
    pub cseq: u32,
    pub call_id: String,
    pub from_tag: String,
    pub user_agent: Option<String>,
}

/// Build a request, returning it together with the generated branch.
pub fn build_request(parts: RequestParts, transport: &TpHandle) -> (rsip::Request, String) {
    let branch = make_branch();

    let via = rsip::typed::Via {
        version: Version::V2,
        transport: transport_param(transport),
        uri: rsip::Uri {
            scheme: None,
            auth: None,
            host_with_port: host_with_port(transport.sent_by()),
            params: vec![],
            headers: vec![],
        },
        params: vec![Param::Branch(branch.clone().into())],
    };

    let from = rsip::typed::From {
        display_name: None,
        uri: parts.from,
        params: vec![Param::Tag(parts.from_tag.into())],
    };

    let to = rsip::typed::To {
        display_name: None,
        uri: parts.to,
        params: vec![],
    };

    let mut headers: Headers = vec![
        Header::Via(via.into()),
        Header::CallId(parts.call_id.into()),
        Header::From(from.into()),
        Header::To(to.into()),
        Header::CSeq(
            rsip::typed::CSeq {
                seq: parts.cseq,
                method: parts.method,
            }
            .into(),
        ),
        Header::MaxForwards(70.to_string().into()),
    ]
    .into();

    if let Some(user_agent) = parts.user_agent {
        headers.push(Header::UserAgent(user_agent.into()));
    }

    let request = rsip::Request {
        method: parts.method,
        uri: parts.target,
        version: Version::V2,
        headers,
        body: vec![],
    };

    (request, branch)
}

/// Build a response mirroring the dialog identifying headers of `request`.
///
/// `with_to_tag` appends a locally generated tag when the To header does
/// not carry one yet.
pub fn response_for(
    request: &rsip::Request,
    status_code: StatusCode,
    with_to_tag: bool,
) -> rsip::Response {
    let mut headers = Headers::default();

    for header in request.headers.iter() {
        match header {
            Header::Via(via) => headers.push(Header::Via(via.clone())),
            Header::From(from) => headers.push(Header::From(from.clone())),
            Header::CallId(call_id) => headers.push(Header::CallId(call_id.clone())),
            Header::CSeq(cseq) => headers.push(Header::CSeq(cseq.clone())),
            Header::To(to) => {
                let to = if with_to_tag {
                    match to.typed() {
                        Ok(typed) if typed.tag().is_none() => {
                            typed.with_tag(make_tag().into()).into()
                        }
                        _ => to.clone(),
                    }
                } else {
                    to.clone()
                };
                headers.push(Header::To(to));
            }
            _ => {}
        }
    }

    headers.push(Header::ContentLength(0.to_string().into()));

    rsip::Response {
        status_code,
        version: Version::V2,
        headers,
        body: vec![],
    }
}

/// Branch parameter of the topmost Via header.
pub fn top_via_branch(headers: &Headers) -> Option<String> {
    let via = headers.iter().find_map(|h| match h {
        Header::Via(via) => Some(via),
        _ => None,
    })?;

    let typed = via.typed().ok()?;

    typed.params.iter().find_map(|p| match p {
        Param::Branch(branch) => Some(branch.value().to_string()),
        _ => None,
    })
}

/// Value of the Expires header, if present and numeric.
pub fn expires_header(headers: &Headers) -> Option<u32> {
    headers.iter().find_map(|h| match h {
        Header::Expires(expires) => expires.value().trim().parse().ok(),
        _ => None,
    })
}

/// All Contact headers in order of appearance.
pub fn contact_headers(headers: &Headers) -> Vec<rsip::headers::Contact> {
    headers
        .iter()
        .filter_map(|h| match h {
            Header::Contact(contact) => Some(contact.clone()),
            _ => None,
        })
        .collect()
}

/// All values of the non-standard header `name` (case insensitive), in
/// order of appearance.
pub fn other_headers(headers: &Headers, name: &str) -> Vec<String> {
    headers
        .iter()
        .filter_map(|h| match h {
            Header::Other(n, v) if n.eq_ignore_ascii_case(name) => Some(v.clone()),
            _ => None,
        })
        .collect()
}

/// Comma separated token list of every Supported header.
pub fn supported_tokens(headers: &Headers) -> Vec<String> {
    let mut tokens = Vec::new();

    for header in headers.iter() {
        if let Header::Supported(supported) = header {
            tokens.extend(
                supported
                    .value()
                    .split(',')
                    .map(|t| t.trim().to_ascii_lowercase())
                    .filter(|t| !t.is_empty()),
            );
        }
    }

    tokens
}

/// User part of the From URI.
pub fn from_user(request: &rsip::Request) -> Option<String> {
    let from = request.from_header().ok()?.typed().ok()?;
    from.uri.auth.as_ref().map(|auth| auth.user.clone())
}
