//! Tracking of requests that failed endpoint identification.
//!
//! Repeated unidentified traffic from one source inside a short window is
//! a scanning signature; the tracker raises a security event when the
//! configured count is reached and decays entries on the `prune`
//! serializer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::time::Instant;

use tandem_core::Core;
use tandem_core::events::{CoreEvent, SecurityEvent};
use tandem_core::scheduler::RunPolicy;

struct Entry {
    count: u32,
    first_seen: Instant,
}

/// Src-address → count/first-seen table.
pub struct UnidentifiedTracker {
    core: Core,
    entries: Mutex<HashMap<IpAddr, Entry>>,
}

impl UnidentifiedTracker {
    pub fn new(core: Core) -> std::sync::Arc<Self> {
        let tracker = std::sync::Arc::new(Self {
            core: core.clone(),
            entries: Mutex::new(HashMap::new()),
        });

        let interval = core.global.read().unidentified_request_prune_interval;
        if interval != Duration::ZERO {
            let prune = core
                .serializers
                .get_or_create("prune", &core.shutdown_group);

            let weak = std::sync::Arc::downgrade(&tracker);
            core.scheduler.schedule(
                "distributor/unid-prune",
                interval,
                RunPolicy::FixedInterval,
                Some(prune),
                &core.shutdown_group,
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(tracker) = weak.upgrade() {
                            tracker.prune();
                        }
                    }
                },
            );
        }

        tracker
    }

    /// Count an unidentified request from `source`.
    ///
    /// Raises the security event exactly when the count reaches the
    /// configured threshold within the window.
    pub fn track(&self, source: SocketAddr) {
        let (count_limit, period) = {
            let global = self.core.global.read();
            (
                global.unidentified_request_count,
                global.unidentified_request_period,
            )
        };

        let now = Instant::now();
        let mut entries = self.entries.lock();

        let entry = entries.entry(source.ip()).or_insert(Entry {
            count: 0,
            first_seen: now,
        });

        if now.duration_since(entry.first_seen) > period {
            // Window expired, start counting fresh
            entry.count = 0;
            entry.first_seen = now;
        }

        entry.count += 1;

        if entry.count == count_limit {
            log::warn!(
                "{} unidentified requests from {source} within {period:?}",
                entry.count
            );
            self.core
                .events
                .publish(CoreEvent::Security(SecurityEvent::UnidentifiedRequest {
                    source,
                    count: entry.count,
                    window: period,
                }));
        }
    }

    /// Identification succeeded for `source`; forget its strikes.
    pub fn forgive(&self, source: SocketAddr) {
        self.entries.lock().remove(&source.ip());
    }

    pub fn count(&self, source: SocketAddr) -> u32 {
        self.entries
            .lock()
            .get(&source.ip())
            .map(|e| e.count)
            .unwrap_or(0)
    }

    fn prune(&self) {
        let prune_after = self.core.global.read().unidentified_request_prune_interval;
        let now = Instant::now();

        self.entries
            .lock()
            .retain(|_, entry| now.duration_since(entry.first_seen) < prune_after);
    }
}
