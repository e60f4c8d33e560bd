//! The `a=candidate` attribute.

use nom::branch::alt;
use nom::bytes::complete::{tag, tag_no_case, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, map_res, opt};
use nom::sequence::{preceded, tuple};
use std::fmt;
use std::str::FromStr;

type IResult<'i, T> = nom::IResult<&'i str, T>;

/// Type of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateType::Host => "host",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::Relayed => "relay",
        }
    }
}

impl fmt::Display for CandidateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate line:
/// `<foundation> <comp> UDP <prio> <addr> <port> typ <type>[ raddr <addr> rport <port>]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub foundation: String,
    /// RTP = 1, RTCP = 2.
    pub component: u8,
    pub transport: String,
    pub priority: u32,
    /// IP address or FQDN; the address family is inferred from the
    /// presence of `:` in the string.
    pub addr: String,
    pub port: u16,
    pub typ: CandidateType,
    pub raddr: Option<String>,
    pub rport: Option<u16>,
}

impl IceCandidate {
    pub fn is_ipv6(&self) -> bool {
        self.addr.contains(':')
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("malformed candidate attribute")]
pub struct InvalidCandidate;

fn token(i: &str) -> IResult<'_, &str> {
    take_while1(|c: char| !c.is_ascii_whitespace())(i)
}

fn number<T: FromStr>(i: &str) -> IResult<'_, T> {
    map_res(digit1, FromStr::from_str)(i)
}

fn candidate_type(i: &str) -> IResult<'_, CandidateType> {
    alt((
        map(tag_no_case("host"), |_| CandidateType::Host),
        map(tag_no_case("srflx"), |_| CandidateType::ServerReflexive),
        map(tag_no_case("prflx"), |_| CandidateType::PeerReflexive),
        map(tag_no_case("relay"), |_| CandidateType::Relayed),
    ))(i)
}

fn candidate(i: &str) -> IResult<'_, IceCandidate> {
    map(
        tuple((
            opt(tag("candidate:")),
            token,
            preceded(char(' '), number::<u8>),
            preceded(char(' '), token),
            preceded(char(' '), number::<u32>),
            preceded(char(' '), token),
            preceded(char(' '), number::<u16>),
            preceded(tag(" typ "), candidate_type),
            opt(preceded(tag(" raddr "), token)),
            opt(preceded(tag(" rport "), number::<u16>)),
        )),
        |(_, foundation, component, transport, priority, addr, port, typ, raddr, rport)| {
            IceCandidate {
                foundation: foundation.to_string(),
                component,
                transport: transport.to_string(),
                priority,
                addr: addr.to_string(),
                port,
                typ,
                raddr: raddr.map(str::to_string),
                rport,
            }
        },
    )(i)
}

impl FromStr for IceCandidate {
    type Err = InvalidCandidate;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        all_consuming(candidate)(s.trim())
            .map(|(_, c)| c)
            .map_err(|_| InvalidCandidate)
    }
}

impl fmt::Display for IceCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {} typ {}",
            self.foundation,
            self.component,
            self.transport,
            self.priority,
            self.addr,
            self.port,
            self.typ,
        )?;

        if let (Some(raddr), Some(rport)) = (&self.raddr, self.rport) {
            write!(f, " raddr {raddr} rport {rport}")?;
        }

        Ok(())
    }
}
