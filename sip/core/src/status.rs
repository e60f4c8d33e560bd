//! Contact status snapshots.
//!
//! Statuses are immutable once published; an update builds a new snapshot
//! and replaces the map entry, so readers holding an `Arc` never observe a
//! half written status.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::stats;

/// Reachability verdict for a single contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContactStatusKind {
    /// Contact exists but was never probed.
    #[default]
    Created,
    /// Probing is disabled for the contact.
    Unknown,
    Reachable,
    Unreachable,
    /// Contact is being deleted.
    Removed,
}

impl ContactStatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactStatusKind::Created => "Created",
            ContactStatusKind::Unknown => "Unknown",
            ContactStatusKind::Reachable => "Reachable",
            ContactStatusKind::Unreachable => "Unreachable",
            ContactStatusKind::Removed => "Removed",
        }
    }
}

impl fmt::Display for ContactStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable status snapshot of one contact.
#[derive(Debug, Clone)]
pub struct ContactStatus {
    pub contact_id: String,
    pub uri: String,
    pub aor: String,
    pub status: ContactStatusKind,
    pub last_status: ContactStatusKind,
    /// Round trip time of the last successful qualify, zero when not
    /// measured.
    pub rtt: Duration,
    /// Security mechanisms announced by the registrar (RFC 3329); carried
    /// so in-dialog requests can send Security-Verify.
    pub security_mechanisms: Vec<String>,
}

impl ContactStatus {
    pub fn new(contact_id: impl Into<String>, uri: impl Into<String>, aor: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            uri: uri.into(),
            aor: aor.into(),
            status: ContactStatusKind::Created,
            last_status: ContactStatusKind::Created,
            rtt: Duration::ZERO,
            security_mechanisms: Vec::new(),
        }
    }

    /// Derive the snapshot that follows this one.
    pub fn advance(&self, status: ContactStatusKind, rtt: Duration) -> Self {
        Self {
            contact_id: self.contact_id.clone(),
            uri: self.uri.clone(),
            aor: self.aor.clone(),
            status,
            last_status: self.status,
            rtt,
            security_mechanisms: self.security_mechanisms.clone(),
        }
    }

    /// Same snapshot with a new set of announced security mechanisms.
    pub fn with_security(&self, security_mechanisms: Vec<String>) -> Self {
        Self {
            contact_id: self.contact_id.clone(),
            uri: self.uri.clone(),
            aor: self.aor.clone(),
            status: self.status,
            last_status: self.last_status,
            rtt: self.rtt,
            security_mechanisms,
        }
    }
}

/// Map of the current status of every known contact.
#[derive(Default)]
pub struct ContactStatusMap {
    map: RwLock<HashMap<String, Arc<ContactStatus>>>,
}

impl ContactStatusMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, contact_id: &str) -> Option<Arc<ContactStatus>> {
        self.map.read().get(contact_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ContactStatus>> {
        self.map.read().values().cloned().collect()
    }

    /// Insert `status`, replacing (and returning) any previous snapshot
    /// for the same contact.
    pub fn insert(&self, status: ContactStatus) -> Option<Arc<ContactStatus>> {
        let status = Arc::new(status);
        let old = self
            .map
            .write()
            .insert(status.contact_id.clone(), status.clone());

        stats::contact_status_changed(old.as_deref().map(|o| o.status), status.status);

        old
    }

    /// Remove the status for `contact_id`.
    ///
    /// The snapshot is taken out exactly once; racing removers see `None`.
    pub fn remove(&self, contact_id: &str) -> Option<Arc<ContactStatus>> {
        let old = self.map.write().remove(contact_id)?;
        stats::contact_status_changed(Some(old.status), ContactStatusKind::Removed);
        stats::contact_status_dropped(ContactStatusKind::Removed);
        Some(old)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn replace_keeps_previous_snapshot_alive() {
        let map = ContactStatusMap::new();

        map.insert(ContactStatus::new("c1", "sip:a@1.2.3.4", "alice"));
        let first = map.get("c1").unwrap();

        let next = first.advance(ContactStatusKind::Reachable, Duration::from_micros(1500));
        map.insert(next);

        // The old snapshot is untouched by the replacement
        assert_eq!(first.status, ContactStatusKind::Created);

        let current = map.get("c1").unwrap();
        assert_eq!(current.status, ContactStatusKind::Reachable);
        assert_eq!(current.last_status, ContactStatusKind::Created);
        assert_eq!(current.rtt, Duration::from_micros(1500));
    }

    #[test]
    fn remove_is_single_shot() {
        let map = ContactStatusMap::new();
        map.insert(ContactStatus::new("c1", "sip:a@1.2.3.4", "alice"));

        assert!(map.remove("c1").is_some());
        assert!(map.remove("c1").is_none());
    }
}
