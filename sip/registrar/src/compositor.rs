//! Endpoint state composition.
//!
//! Every endpoint has one compositor which folds the availability bits of
//! all AORs the endpoint references into a single online/offline verdict.
//! Compositors are keyed by endpoint *name*; the AORs hold them in a flat
//! vector, which breaks the endpoint → AOR → compositor → endpoint cycle.

use parking_lot::Mutex;
use std::collections::HashMap;

use tandem_core::Core;
use tandem_core::config::PersistentEndpoint;
use tandem_core::events::CoreEvent;

struct CompositorState {
    aor_statuses: HashMap<String, bool>,
    /// Publishing is gated while the composition is being rebuilt.
    active: bool,
    last_published: Option<bool>,
}

/// Aggregates AOR availability into endpoint state.
pub struct EndpointCompositor {
    name: String,
    state: Mutex<CompositorState>,
}

impl EndpointCompositor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(CompositorState {
                aor_statuses: HashMap::new(),
                active: false,
                last_published: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record the availability of `aor` and republish if warranted.
    pub fn set_aor_status(&self, core: &Core, aor: &str, available: bool) {
        let mut state = self.state.lock();
        state.aor_statuses.insert(aor.to_string(), available);

        if state.active {
            self.publish(core, &mut state);
        }
    }

    /// Forget `aor` entirely, e.g. when the endpoint no longer references
    /// it.
    pub fn forget_aor(&self, core: &Core, aor: &str) {
        let mut state = self.state.lock();
        state.aor_statuses.remove(aor);

        if state.active {
            self.publish(core, &mut state);
        }
    }

    /// End the rebuild phase and publish the initial verdict.
    pub fn activate(&self, core: &Core) {
        let mut state = self.state.lock();
        state.active = true;
        self.publish(core, &mut state);
    }

    /// Stop publishing; used while the owning endpoint is reconfigured or
    /// removed.
    pub fn deactivate(&self) {
        self.state.lock().active = false;
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    fn publish(&self, core: &Core, state: &mut CompositorState) {
        let online = state.aor_statuses.values().any(|v| *v);

        // Equal-state republication is suppressed
        if state.last_published == Some(online) {
            return;
        }
        state.last_published = Some(online);

        let mut persistent = core
            .persistent_endpoints
            .get(&self.name)
            .map(|p| (*p).clone())
            .unwrap_or_else(|| PersistentEndpoint::new(self.name.clone()));
        persistent.online = online;
        core.persistent_endpoints.apply(persistent);

        log::info!(
            "endpoint {} is now {}",
            self.name,
            if online { "Online" } else { "Offline" }
        );

        core.events.publish(CoreEvent::EndpointStateChanged {
            endpoint: self.name.clone(),
            online,
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tandem_core::config::{GlobalConfig, SystemConfig};

    #[tokio::test]
    async fn publishes_only_on_change_and_when_active() {
        let core = Core::new(GlobalConfig::default(), SystemConfig::default());
        let mut events = core.events.subscribe();

        let compositor = EndpointCompositor::new("alice-phone");

        // Inactive: no publication
        compositor.set_aor_status(&core, "alice", true);
        assert!(events.try_recv().is_err());

        compositor.activate(&core);
        match events.try_recv().unwrap().as_ref() {
            CoreEvent::EndpointStateChanged { endpoint, online } => {
                assert_eq!(endpoint, "alice-phone");
                assert!(*online);
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Same verdict again: suppressed
        compositor.set_aor_status(&core, "alice", true);
        assert!(events.try_recv().is_err());

        // Last AOR goes away: offline
        compositor.forget_aor(&core, "alice");
        match events.try_recv().unwrap().as_ref() {
            CoreEvent::EndpointStateChanged { online, .. } => assert!(!*online),
            other => panic!("unexpected event {other:?}"),
        }

        assert!(!core.persistent_endpoints.get("alice-phone").unwrap().online);
    }
}
