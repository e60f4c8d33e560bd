//! Reliable transport shutdown monitor.
//!
//! Interested parties (outbound registrations, dialogs) register a callback
//! for a transport; when the transport dies the callbacks fire once on the
//! notifier's task and the registrations are gone. Registering again with
//! the same key data replaces the previous callback instead of stacking a
//! duplicate.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::transport::{TpHandle, TpKey};

pub type ShutdownCallback = Arc<dyn Fn(&TpHandle) + Send + Sync>;

struct MonitorEntry {
    /// Identifies the registration for replace/unregister, `None` entries
    /// are never deduplicated.
    key_data: Option<String>,
    callback: ShutdownCallback,
}

/// Watches reliable transports for shutdown.
#[derive(Default)]
pub struct TransportMonitor {
    entries: Mutex<HashMap<TpKey, Vec<MonitorEntry>>>,
}

impl TransportMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` to run when `transport` shuts down.
    ///
    /// Unreliable transports are ignored. With `key_data` set, an existing
    /// registration carrying equal key data is replaced.
    pub fn register(
        &self,
        transport: &TpHandle,
        key_data: Option<String>,
        callback: ShutdownCallback,
    ) {
        if !transport.reliable() {
            return;
        }

        let mut entries = self.entries.lock();
        let list = entries.entry(transport.key()).or_default();

        if let Some(key_data) = &key_data
            && let Some(existing) = list
                .iter_mut()
                .find(|e| e.key_data.as_deref() == Some(key_data))
        {
            existing.callback = callback;
            return;
        }

        list.push(MonitorEntry { key_data, callback });
    }

    /// Drop the registration for `key_data` on `transport`, if any.
    pub fn unregister(&self, transport: &TpHandle, key_data: &str) {
        let mut entries = self.entries.lock();
        if let Some(list) = entries.get_mut(&transport.key()) {
            list.retain(|e| e.key_data.as_deref() != Some(key_data));
            if list.is_empty() {
                entries.remove(&transport.key());
            }
        }
    }

    /// Number of callbacks armed for `transport`.
    pub fn armed(&self, transport: &TpHandle) -> usize {
        self.entries
            .lock()
            .get(&transport.key())
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Fire and clear every callback registered for `transport`.
    ///
    /// Called by the platform's transport layer when a connection oriented
    /// transport is gone. Callbacks run outside the lock.
    pub fn notify_shutdown(&self, transport: &TpHandle) {
        let list = self.entries.lock().remove(&transport.key());

        if let Some(list) = list {
            log::debug!(
                "transport {transport} shut down, notifying {} monitor(s)",
                list.len()
            );

            for entry in list {
                (entry.callback)(transport);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TransportProtocol;
    use crate::transport::Transport;
    use async_trait::async_trait;
    use std::fmt;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct FakeTcp(SocketAddr);

    #[async_trait]
    impl Transport for FakeTcp {
        fn name(&self) -> &str {
            "fake-tcp"
        }

        fn protocol(&self) -> TransportProtocol {
            TransportProtocol::Tcp
        }

        fn bound(&self) -> SocketAddr {
            self.0
        }

        fn sent_by(&self) -> SocketAddr {
            self.0
        }

        async fn send(&self, _bytes: &[u8], _target: SocketAddr) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl fmt::Display for FakeTcp {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TCP:{}", self.0)
        }
    }

    #[test]
    fn duplicate_key_data_replaces() {
        let monitor = TransportMonitor::new();
        let tp = TpHandle::new(FakeTcp("127.0.0.1:5060".parse().unwrap()));

        let fired = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let fired = fired.clone();
            monitor.register(
                &tp,
                Some("reg/trunk".into()),
                Arc::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }

        assert_eq!(monitor.armed(&tp), 1);

        monitor.notify_shutdown(&tp);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Entries are consumed by the notification
        monitor.notify_shutdown(&tp);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
