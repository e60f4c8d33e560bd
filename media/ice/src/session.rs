//! ICE offer/answer state.
//!
//! The connectivity checks themselves run in an embedded checklist that
//! reports nominated pairs back; this module owns everything SDP-facing:
//! role selection, candidate emission, offer verification and
//! restart/mismatch detection.

use rand::distr::{Alphanumeric, SampleString};

use crate::candidate::{CandidateType, IceCandidate};
use crate::sdp::{RemoteCandidate, SessionDescription, StreamDescription};

/// Length of generated ufrag and pwd tokens.
const CREDENTIAL_LEN: usize = 8;

fn random_credential() -> String {
    Alphanumeric.sample_string(&mut rand::rng(), CREDENTIAL_LEN)
}

/// Negotiation role of this agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IceRole {
    /// No offer/answer has happened yet.
    #[default]
    Unset,
    Controlling,
    Controlled,
}

/// Lifecycle of the embedded checklist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Complete,
    Failed,
}

/// Verdict over a received offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdpVerdict {
    /// 1 if only RTP matched (or RTCP is absent), 2 if both did.
    pub match_comp_cnt: u8,
    /// A default destination was not covered by any candidate.
    pub ice_mismatch: bool,
    /// The peer changed credentials on a running session.
    pub ice_restart: bool,
}

/// A nominated candidate pair for one component.
#[derive(Debug, Clone)]
pub struct NominatedPair {
    pub component: u8,
    pub local: IceCandidate,
    pub remote: IceCandidate,
}

/// Remote half of the negotiation.
#[derive(Debug, Clone)]
struct RemoteIce {
    ufrag: String,
    pwd: String,
    candidates: Vec<IceCandidate>,
    ice_lite: bool,
}

/// Per-stream ICE negotiation state.
#[derive(Debug)]
pub struct IceSession {
    components: u8,
    role: IceRole,
    state: SessionState,

    local_ufrag: String,
    local_pwd: String,
    local_candidates: Vec<IceCandidate>,

    remote: Option<RemoteIce>,
    nominated: Vec<NominatedPair>,

    /// We generated the outstanding offer.
    pending_offer: bool,
}

impl IceSession {
    /// `components` is 1 (RTP only, rtcp-mux or RTCP-less) or 2.
    pub fn new(components: u8) -> Self {
        assert!(components == 1 || components == 2);

        Self {
            components,
            role: IceRole::Unset,
            state: SessionState::Idle,
            local_ufrag: random_credential(),
            local_pwd: random_credential(),
            local_candidates: Vec::new(),
            remote: None,
            nominated: Vec::new(),
            pending_offer: false,
        }
    }

    pub fn role(&self) -> IceRole {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn components(&self) -> u8 {
        self.components
    }

    pub fn credentials(&self) -> (&str, &str) {
        (&self.local_ufrag, &self.local_pwd)
    }

    pub fn local_candidates(&self) -> &[IceCandidate] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[IceCandidate] {
        self.remote.as_ref().map(|r| r.candidates.as_slice()).unwrap_or(&[])
    }

    /// Register a local host candidate for `component`.
    ///
    /// Priority follows the usual type-preference formula; adding the
    /// same address twice is a no-op.
    pub fn add_host_candidate(&mut self, component: u8, addr: impl Into<String>, port: u16) {
        let addr = addr.into();

        if self
            .local_candidates
            .iter()
            .any(|c| c.component == component && c.addr == addr && c.port == port)
        {
            return;
        }

        let type_preference = 126u32;
        let local_preference = 65535u32;
        let priority =
            (type_preference << 24) + (local_preference << 8) + (256 - component as u32);

        self.local_candidates.push(IceCandidate {
            foundation: format!("H{:x}", fletcher(&addr)),
            component,
            transport: "UDP".into(),
            priority,
            addr,
            port,
            typ: CandidateType::Host,
            raddr: None,
            rport: None,
        });
    }

    /// Add a server reflexive candidate discovered through STUN.
    pub fn add_reflexive_candidate(
        &mut self,
        component: u8,
        addr: impl Into<String>,
        port: u16,
        base_addr: impl Into<String>,
        base_port: u16,
    ) {
        let addr = addr.into();
        let base_addr = base_addr.into();

        let type_preference = 100u32;
        let local_preference = 65535u32;
        let priority =
            (type_preference << 24) + (local_preference << 8) + (256 - component as u32);

        self.local_candidates.push(IceCandidate {
            foundation: format!("S{:x}", fletcher(&base_addr)),
            component,
            transport: "UDP".into(),
            priority,
            addr,
            port,
            typ: CandidateType::ServerReflexive,
            raddr: Some(base_addr),
            rport: Some(base_port),
        });
    }

    /// The checklist finished; remember the nominated pairs.
    pub fn complete(&mut self, nominated: Vec<NominatedPair>) {
        self.nominated = nominated;
        self.state = SessionState::Complete;
    }

    pub fn fail(&mut self) {
        self.state = SessionState::Failed;
    }

    pub fn nominated(&self) -> &[NominatedPair] {
        &self.nominated
    }

    /// Offer/answer finished without a role having been chosen (the
    /// session-timer re-INVITE corner). We only seize control when the
    /// outstanding offer was ours; an answering side stays unset and
    /// starts no checks.
    pub fn media_start(&mut self) {
        if self.role == IceRole::Unset && self.pending_offer {
            self.role = IceRole::Controlling;
        }

        if self.role != IceRole::Unset && self.state == SessionState::Idle {
            self.state = SessionState::Running;
        }
    }

    /// Produce the media section of an offer.
    pub fn encode_offer(&mut self, restart: bool) -> StreamDescription {
        if self.role == IceRole::Unset {
            // We are the offerer
            self.role = IceRole::Controlling;
        }

        if restart {
            self.local_ufrag = random_credential();
            self.local_pwd = random_credential();
            self.nominated.clear();
            self.state = SessionState::Running;
        }

        self.pending_offer = true;
        self.encode(self.components)
    }

    /// Produce the media section of an answer to a verified offer.
    ///
    /// A mismatching offer is answered with `a=ice-mismatch`, no
    /// candidates, and ICE disabled for the stream.
    pub fn encode_answer(&mut self, verdict: &SdpVerdict) -> StreamDescription {
        if verdict.ice_mismatch {
            self.state = SessionState::Idle;

            let mut stream = self.default_stream();
            stream.mismatch = true;
            return stream;
        }

        if verdict.ice_restart {
            self.local_ufrag = random_credential();
            self.local_pwd = random_credential();
            self.nominated.clear();
            self.state = SessionState::Running;
        }

        self.pending_offer = false;
        self.encode(verdict.match_comp_cnt)
    }

    /// Consume a remote offer: role selection and remote candidate
    /// bookkeeping. Follow with [`verify_offer`](Self::verify_offer) and
    /// [`encode_answer`](Self::encode_answer).
    pub fn receive_offer(&mut self, session: &SessionDescription, stream_index: usize) {
        let Some(stream) = session.streams.get(stream_index) else {
            return;
        };

        // The answerer is controlled, unless the offerer is a lite
        // implementation which never controls
        self.role = if session.ice_lite {
            IceRole::Controlling
        } else {
            IceRole::Controlled
        };
        self.pending_offer = false;

        let Some((ufrag, pwd)) = session.credentials_of(stream) else {
            self.remote = None;
            return;
        };

        self.remote = Some(RemoteIce {
            ufrag: ufrag.to_string(),
            pwd: pwd.to_string(),
            candidates: stream.candidates.clone(),
            ice_lite: session.ice_lite,
        });
    }

    /// Check a remote offer against its own candidate lines.
    pub fn verify_offer(
        &self,
        session: &SessionDescription,
        stream_index: usize,
    ) -> SdpVerdict {
        let Some(stream) = session.streams.get(stream_index) else {
            return SdpVerdict {
                match_comp_cnt: 0,
                ice_mismatch: true,
                ice_restart: false,
            };
        };

        let connection = session.connection_of(stream).unwrap_or_default();
        let has_rtcp = stream.rtcp_port.is_some() || self.components > 1;

        let covered = |component: u8, addr: &str, port: u16| {
            stream
                .candidates
                .iter()
                .any(|c| c.component == component && c.addr == addr && c.port == port)
        };

        let comp1_found = covered(1, connection, stream.port);
        let comp2_found = covered(2, connection, stream.rtcp_destination());

        let (match_comp_cnt, ice_mismatch) = if comp1_found && (self.components == 1 || !has_rtcp)
        {
            (1, false)
        } else if comp1_found && comp2_found {
            (2, false)
        } else {
            let count = if self.components > 1 && has_rtcp { 2 } else { 1 };
            (count, true)
        };

        // A changed ufrag/pwd on a live session is a restart offer
        let ice_restart = match (&self.remote, session.credentials_of(stream)) {
            (Some(remote), Some((ufrag, pwd)))
                if matches!(self.state, SessionState::Running | SessionState::Complete) =>
            {
                remote.ufrag != ufrag || remote.pwd != pwd
            }
            _ => false,
        };

        SdpVerdict {
            match_comp_cnt,
            ice_mismatch,
            ice_restart,
        }
    }

    /// Whether the peer announced itself as ice-lite.
    pub fn remote_is_lite(&self) -> bool {
        self.remote.as_ref().is_some_and(|r| r.ice_lite)
    }

    fn default_stream(&self) -> StreamDescription {
        let mut stream = StreamDescription::audio(0);

        if let Some(first) = self.local_candidates.iter().find(|c| c.component == 1) {
            stream.port = first.port;
            stream.connection = Some(first.addr.clone());
        }

        stream
    }

    /// The common offer/answer encoding path.
    fn encode(&self, components: u8) -> StreamDescription {
        let mut stream = self.default_stream();

        let completed = self.state == SessionState::Complete && !self.nominated.is_empty();

        if completed {
            // Only the nominated candidates; default destination follows
            // the RTP pair
            if let Some(rtp) = self.nominated.iter().find(|p| p.component == 1) {
                stream.port = rtp.local.port;
                stream.connection = Some(rtp.local.addr.clone());
            }

            for pair in &self.nominated {
                if pair.component > components {
                    continue;
                }

                stream.candidates.push(pair.local.clone());

                if components == 2 && pair.component == 2 {
                    stream.rtcp_port = Some(pair.local.port);
                }
            }

            if self.role == IceRole::Controlling {
                stream.remote_candidates = self
                    .nominated
                    .iter()
                    .filter(|p| p.component <= components)
                    .map(|p| RemoteCandidate {
                        component: p.component,
                        addr: p.remote.addr.clone(),
                        port: p.remote.port,
                    })
                    .collect();
            }
        } else {
            stream.candidates = self
                .local_candidates
                .iter()
                .filter(|c| c.component <= components)
                .cloned()
                .collect();

            if components == 2
                && let Some(rtcp) = self
                    .local_candidates
                    .iter()
                    .find(|c| c.component == 2)
            {
                stream.rtcp_port = Some(rtcp.port);
            }
        }

        stream.ufrag = Some(self.local_ufrag.clone());
        stream.pwd = Some(self.local_pwd.clone());

        if components == 1 {
            // No RTCP: drop a=rtcp and promise zero report bandwidth
            stream.rtcp_port = None;
            stream.bandwidth.push(("RS".into(), 0));
            stream.bandwidth.push(("RR".into(), 0));
        }

        stream
    }
}

/// Small non-cryptographic digest used to derive stable foundations.
fn fletcher(input: &str) -> u32 {
    let mut a: u32 = 0;
    let mut b: u32 = 0;

    for byte in input.bytes() {
        a = (a + byte as u32) % 65535;
        b = (b + a) % 65535;
    }

    (b << 16) | a
}
