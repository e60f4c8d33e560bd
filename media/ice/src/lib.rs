//! ICE media-transport offer/answer engine.
//!
//! Owns the SDP side of ICE: candidate attribute encoding and parsing,
//! controlling/controlled role selection, offer verification with restart
//! and mismatch detection, and the RTP/RTCP packet flow gate including
//! symmetric-RTP learning for non-ICE peers.

mod candidate;
mod flow;
mod sdp;
mod session;

pub use candidate::{CandidateType, IceCandidate, InvalidCandidate};
pub use flow::{
    Component, Demuxed, PacketFlow, RTCP_NAT_PROBATION_CNT, RTP_NAT_PROBATION_CNT,
};
pub use sdp::{ParseSdpError, RemoteCandidate, SessionDescription, StreamDescription};
pub use session::{IceRole, IceSession, NominatedPair, SdpVerdict, SessionState};
