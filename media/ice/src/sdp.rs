//! The slice of SDP the ICE engine reads and writes.
//!
//! Only the transport-relevant lines are modelled: the media line's port,
//! the connection address, `a=rtcp`, the ICE attributes and the RS/RR
//! bandwidth lines. Codec negotiation lives elsewhere.

use std::fmt;
use std::str::FromStr;

use crate::candidate::IceCandidate;

/// Entry of an `a=remote-candidates` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCandidate {
    pub component: u8,
    pub addr: String,
    pub port: u16,
}

/// One media section.
#[derive(Debug, Clone, Default)]
pub struct StreamDescription {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,

    /// Media level connection address (c=).
    pub connection: Option<String>,
    /// `b=<modifier>:<value>` lines.
    pub bandwidth: Vec<(String, u32)>,
    /// `a=rtcp` port.
    pub rtcp_port: Option<u16>,

    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub candidates: Vec<IceCandidate>,
    pub remote_candidates: Vec<RemoteCandidate>,
    pub mismatch: bool,
}

impl StreamDescription {
    pub fn audio(port: u16) -> Self {
        Self {
            media: "audio".into(),
            port,
            protocol: "RTP/AVP".into(),
            formats: vec!["0".into()],
            ..Default::default()
        }
    }

    /// The default RTCP destination: explicit `a=rtcp` port or media
    /// port + 1.
    pub fn rtcp_destination(&self) -> u16 {
        self.rtcp_port.unwrap_or(self.port + 1)
    }
}

impl fmt::Display for StreamDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.media, self.port, self.protocol)?;
        for format in &self.formats {
            write!(f, " {format}")?;
        }
        write!(f, "\r\n")?;

        if let Some(connection) = &self.connection {
            let ip_version = if connection.contains(':') { "IP6" } else { "IP4" };
            write!(f, "c=IN {ip_version} {connection}\r\n")?;
        }

        for (modifier, value) in &self.bandwidth {
            write!(f, "b={modifier}:{value}\r\n")?;
        }

        if let Some(rtcp_port) = self.rtcp_port {
            write!(f, "a=rtcp:{rtcp_port}\r\n")?;
        }

        if self.mismatch {
            write!(f, "a=ice-mismatch\r\n")?;
        }

        if let Some(ufrag) = &self.ufrag {
            write!(f, "a=ice-ufrag:{ufrag}\r\n")?;
        }
        if let Some(pwd) = &self.pwd {
            write!(f, "a=ice-pwd:{pwd}\r\n")?;
        }

        for candidate in &self.candidates {
            write!(f, "a=candidate:{candidate}\r\n")?;
        }

        if !self.remote_candidates.is_empty() {
            write!(f, "a=remote-candidates:")?;
            for (i, rc) in self.remote_candidates.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{} {} {}", rc.component, rc.addr, rc.port)?;
            }
            write!(f, "\r\n")?;
        }

        Ok(())
    }
}

/// A whole session description, reduced to transport concerns.
#[derive(Debug, Clone, Default)]
pub struct SessionDescription {
    /// Session level connection address.
    pub connection: Option<String>,
    pub ice_lite: bool,
    /// Session level ICE credentials, media level ones win.
    pub ufrag: Option<String>,
    pub pwd: Option<String>,
    pub streams: Vec<StreamDescription>,
}

impl SessionDescription {
    /// Effective connection address of `stream`.
    pub fn connection_of<'a>(&'a self, stream: &'a StreamDescription) -> Option<&'a str> {
        stream
            .connection
            .as_deref()
            .or(self.connection.as_deref())
    }

    /// Effective ICE credentials of `stream`.
    pub fn credentials_of<'a>(&'a self, stream: &'a StreamDescription) -> Option<(&'a str, &'a str)> {
        let ufrag = stream.ufrag.as_deref().or(self.ufrag.as_deref())?;
        let pwd = stream.pwd.as_deref().or(self.pwd.as_deref())?;
        Some((ufrag, pwd))
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\n")?;
        write!(f, "o=- 0 0 IN IP4 0.0.0.0\r\n")?;
        write!(f, "s=-\r\n")?;

        if let Some(connection) = &self.connection {
            let ip_version = if connection.contains(':') { "IP6" } else { "IP4" };
            write!(f, "c=IN {ip_version} {connection}\r\n")?;
        }

        write!(f, "t=0 0\r\n")?;

        if self.ice_lite {
            write!(f, "a=ice-lite\r\n")?;
        }
        if let Some(ufrag) = &self.ufrag {
            write!(f, "a=ice-ufrag:{ufrag}\r\n")?;
        }
        if let Some(pwd) = &self.pwd {
            write!(f, "a=ice-pwd:{pwd}\r\n")?;
        }

        for stream in &self.streams {
            write!(f, "{stream}")?;
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed session description: {0}")]
pub struct ParseSdpError(String);

impl FromStr for SessionDescription {
    type Err = ParseSdpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut session = SessionDescription::default();
        let mut current: Option<StreamDescription> = None;

        for line in s.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }

            let (kind, value) = line
                .split_once('=')
                .ok_or_else(|| ParseSdpError(format!("line without '=': {line}")))?;

            match kind {
                "m" => {
                    if let Some(done) = current.take() {
                        session.streams.push(done);
                    }

                    let mut fields = value.split(' ');
                    let media = fields
                        .next()
                        .ok_or_else(|| ParseSdpError("empty m= line".into()))?;
                    let port = fields
                        .next()
                        .and_then(|p| p.parse().ok())
                        .ok_or_else(|| ParseSdpError(format!("bad m= port: {line}")))?;
                    let protocol = fields
                        .next()
                        .ok_or_else(|| ParseSdpError(format!("m= without protocol: {line}")))?;

                    current = Some(StreamDescription {
                        media: media.to_string(),
                        port,
                        protocol: protocol.to_string(),
                        formats: fields.map(str::to_string).collect(),
                        ..Default::default()
                    });
                }
                "c" => {
                    let addr = value
                        .rsplit(' ')
                        .next()
                        .ok_or_else(|| ParseSdpError(format!("bad c= line: {line}")))?
                        .to_string();

                    match &mut current {
                        Some(stream) => stream.connection = Some(addr),
                        None => session.connection = Some(addr),
                    }
                }
                "b" => {
                    if let Some(stream) = &mut current
                        && let Some((modifier, amount)) = value.split_once(':')
                        && let Ok(amount) = amount.parse()
                    {
                        stream.bandwidth.push((modifier.to_string(), amount));
                    }
                }
                "a" => {
                    let (name, attr_value) = match value.split_once(':') {
                        Some((name, v)) => (name, Some(v)),
                        None => (value, None),
                    };

                    match (name, attr_value, &mut current) {
                        ("ice-lite", _, None) => session.ice_lite = true,
                        ("ice-ufrag", Some(v), Some(stream)) => {
                            stream.ufrag = Some(v.to_string())
                        }
                        ("ice-ufrag", Some(v), None) => session.ufrag = Some(v.to_string()),
                        ("ice-pwd", Some(v), Some(stream)) => stream.pwd = Some(v.to_string()),
                        ("ice-pwd", Some(v), None) => session.pwd = Some(v.to_string()),
                        ("ice-mismatch", _, Some(stream)) => stream.mismatch = true,
                        ("rtcp", Some(v), Some(stream)) => {
                            // a=rtcp:<port> [nettype addrtype addr]
                            stream.rtcp_port = v
                                .split(' ')
                                .next()
                                .and_then(|p| p.parse().ok());
                        }
                        ("candidate", Some(v), Some(stream)) => {
                            match v.parse::<IceCandidate>() {
                                Ok(candidate) => stream.candidates.push(candidate),
                                Err(_) => {
                                    return Err(ParseSdpError(format!(
                                        "bad candidate: {v}"
                                    )));
                                }
                            }
                        }
                        ("remote-candidates", Some(v), Some(stream)) => {
                            let fields: Vec<&str> = v.split(' ').collect();
                            for triple in fields.chunks(3) {
                                let [component, addr, port] = triple else {
                                    return Err(ParseSdpError(format!(
                                        "bad remote-candidates: {v}"
                                    )));
                                };

                                let component = component.parse().map_err(|_| {
                                    ParseSdpError(format!("bad remote-candidates: {v}"))
                                })?;
                                let port = port.parse().map_err(|_| {
                                    ParseSdpError(format!("bad remote-candidates: {v}"))
                                })?;

                                stream.remote_candidates.push(RemoteCandidate {
                                    component,
                                    addr: addr.to_string(),
                                    port,
                                });
                            }
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }

        if let Some(done) = current.take() {
            session.streams.push(done);
        }

        Ok(session)
    }
}
