//! RTP/RTCP packet flow gating.
//!
//! Incoming packets from the active session are demultiplexed on their
//! component. When ICE is disabled (legacy peers) the flow falls back to
//! symmetric-RTP learning: a consistent stream of packets from an
//! unexpected source eventually becomes the new transmission target.

use std::net::SocketAddr;

/// Consecutive packets from one new source before RTP switches to it.
pub const RTP_NAT_PROBATION_CNT: u32 = 10;
/// Consecutive packets from one new source before RTCP switches to it.
pub const RTCP_NAT_PROBATION_CNT: u32 = 3;

/// Component of the media stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Component {
    Rtp = 1,
    Rtcp = 2,
}

/// Where an incoming packet belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demuxed {
    Rtp,
    Rtcp,
    /// Unknown component id; the packet is dropped.
    Discard,
}

struct Channel {
    /// Address we currently transmit to.
    remote: Option<SocketAddr>,
    probation_limit: u32,
    /// Source currently on probation and its consecutive packet count.
    candidate: Option<(SocketAddr, u32)>,
}

impl Channel {
    fn new(probation_limit: u32) -> Self {
        Self {
            remote: None,
            probation_limit,
            candidate: None,
        }
    }

    /// Track `source`; returns true when the channel switched to it.
    fn learn(&mut self, source: SocketAddr) -> bool {
        match self.remote {
            None => {
                self.remote = Some(source);
                true
            }
            Some(remote) if remote == source => {
                self.candidate = None;
                false
            }
            Some(_) => {
                let count = match self.candidate {
                    Some((candidate, count)) if candidate == source => count + 1,
                    _ => 1,
                };

                if count >= self.probation_limit {
                    self.remote = Some(source);
                    self.candidate = None;
                    true
                } else {
                    self.candidate = Some((source, count));
                    false
                }
            }
        }
    }
}

/// Gates RTP/RTCP in and out of one media stream.
pub struct PacketFlow {
    /// When set, packets come pre-classified from the ICE session and no
    /// source learning happens.
    ice_active: bool,
    rtp: Channel,
    rtcp: Channel,
    /// Percentage of outgoing RTP packets to drop, for loss simulation.
    tx_drop_pct: u8,
}

impl PacketFlow {
    pub fn new(ice_active: bool) -> Self {
        Self {
            ice_active,
            rtp: Channel::new(RTP_NAT_PROBATION_CNT),
            rtcp: Channel::new(RTCP_NAT_PROBATION_CNT),
            tx_drop_pct: 0,
        }
    }

    pub fn set_ice_active(&mut self, active: bool) {
        self.ice_active = active;
    }

    /// Configure the remote addresses taken from SDP.
    pub fn set_remote(&mut self, rtp: Option<SocketAddr>, rtcp: Option<SocketAddr>) {
        self.rtp.remote = rtp;
        self.rtp.candidate = None;
        self.rtcp.remote = rtcp;
        self.rtcp.candidate = None;
    }

    /// Simulate transmission loss; `pct` of outgoing RTP is dropped.
    pub fn set_tx_drop_pct(&mut self, pct: u8) {
        self.tx_drop_pct = pct.min(100);
    }

    pub fn remote_rtp(&self) -> Option<SocketAddr> {
        self.rtp.remote
    }

    pub fn remote_rtcp(&self) -> Option<SocketAddr> {
        self.rtcp.remote
    }

    /// Classify an incoming packet by component id (RTP = 1, RTCP = 2).
    ///
    /// In legacy mode the source feeds the symmetric learning of the
    /// matching channel.
    pub fn demux(&mut self, component: u8, source: SocketAddr) -> Demuxed {
        let (demuxed, channel) = match component {
            1 => (Demuxed::Rtp, &mut self.rtp),
            2 => (Demuxed::Rtcp, &mut self.rtcp),
            _ => return Demuxed::Discard,
        };

        if !self.ice_active && channel.learn(source) {
            log::info!(
                "remote {} address switched to {source}",
                if component == 1 { "RTP" } else { "RTCP" },
            );
        }

        demuxed
    }

    /// Whether an outgoing RTP packet should actually be sent.
    pub fn permit_rtp_tx(&self) -> bool {
        if self.tx_drop_pct == 0 {
            return true;
        }

        rand::random_range(0..100u8) >= self.tx_drop_pct
    }
}
