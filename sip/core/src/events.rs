//! Structured core events.
//!
//! Everything externally observable (management surface, security auditing)
//! flows through one broadcast bus. Publishing never blocks; a bus without
//! subscribers drops events silently.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::status::ContactStatusKind;

/// Reduced outbound registration status shown to external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationLabel {
    Unregistered,
    Registered,
    Rejected,
}

impl RegistrationLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegistrationLabel::Unregistered => "Unregistered",
            RegistrationLabel::Registered => "Registered",
            RegistrationLabel::Rejected => "Rejected",
        }
    }
}

/// Security relevant observations raised by the distributor.
#[derive(Debug, Clone)]
pub enum SecurityEvent {
    /// Too many requests from one source failed endpoint identification.
    UnidentifiedRequest {
        source: SocketAddr,
        count: u32,
        window: Duration,
    },
    /// A challenge was answered with bad credentials.
    ChallengeResponseFailed {
        source: SocketAddr,
        endpoint: String,
    },
}

/// Event published on the core bus.
#[derive(Debug, Clone)]
pub enum CoreEvent {
    ContactAdded {
        contact: String,
        aor: String,
        expiration: u32,
        user_agent: Option<String>,
    },
    ContactRefreshed {
        contact: String,
        aor: String,
        expiration: u32,
        user_agent: Option<String>,
    },
    ContactRemoved {
        contact: String,
        aor: String,
    },
    /// A qualify run changed the reachability of a contact.
    ContactStatusChanged {
        contact: String,
        aor: String,
        old: ContactStatusKind,
        new: ContactStatusKind,
        rtt: Duration,
    },
    EndpointStateChanged {
        endpoint: String,
        online: bool,
    },
    OutboundRegistrationStateChanged {
        registration: String,
        status: RegistrationLabel,
        code: Option<u16>,
    },
    Security(SecurityEvent),
}

/// Broadcast bus carrying [`CoreEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<CoreEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CoreEvent>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CoreEvent) {
        log::debug!("event: {event:?}");
        let _ = self.tx.send(Arc::new(event));
    }
}
