//! The shared core context.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::DigestVerifier;
use crate::config::{
    AorConfig, AuthConfig, Contact, DomainAliasConfig, EndpointConfig, GlobalConfig,
    IdentifyConfig, PersistentEndpoint, SystemConfig, TransportConfig,
};
use crate::events::EventBus;
use crate::line::LineBindings;
use crate::monitor::TransportMonitor;
use crate::scheduler::Scheduler;
use crate::serializer::{Serializer, SerializerRegistry, ShutdownGroup};
use crate::status::ContactStatusMap;
use crate::store::Store;
use crate::transport::TransportRegistry;
use crate::tx::{PendingRequests, Requester};

/// Everything the four engines share: stores, serializers, transports and
/// the event bus.
///
/// A wrapper around an `Arc`'d inner struct, cheap to clone and hand to
/// every engine. The inverse of construction is [`Core::shutdown`], which
/// joins every serializer with a bounded timeout.
#[derive(Clone)]
pub struct Core {
    inner: Arc<CoreInner>,
}

pub struct CoreInner {
    pub global: RwLock<GlobalConfig>,
    pub system: SystemConfig,

    pub shutdown_group: ShutdownGroup,
    pub serializers: SerializerRegistry,
    pub scheduler: Scheduler,
    /// Owns all structural changes to the AOR/compositor registry.
    pub management: Serializer,

    pub endpoints: Store<EndpointConfig>,
    pub persistent_endpoints: Store<PersistentEndpoint>,
    pub aors: Store<AorConfig>,
    pub contacts: Store<Contact>,
    pub auths: Store<AuthConfig>,
    pub identifies: Store<IdentifyConfig>,
    pub domain_aliases: Store<DomainAliasConfig>,
    pub transport_configs: Store<TransportConfig>,

    pub contact_status: ContactStatusMap,
    pub transports: TransportRegistry,
    pub monitor: TransportMonitor,
    pub requester: Requester,
    pub lines: LineBindings,
    pub events: EventBus,
}

impl std::ops::Deref for Core {
    type Target = CoreInner;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl Core {
    pub fn new(global: GlobalConfig, system: SystemConfig) -> Self {
        let shutdown_group = ShutdownGroup::new();
        let management = Serializer::spawn("management", &shutdown_group);
        let requester = Requester::new(
            Arc::new(PendingRequests::new()),
            system.timer_t1,
            system.timer_b,
        );

        Self {
            inner: Arc::new(CoreInner {
                global: RwLock::new(global),
                system,
                serializers: SerializerRegistry::new(),
                scheduler: Scheduler::new(),
                management,
                shutdown_group,
                endpoints: Store::new(),
                persistent_endpoints: Store::new(),
                aors: Store::new(),
                contacts: Store::new(),
                auths: Store::new(),
                identifies: Store::new(),
                domain_aliases: Store::new(),
                transport_configs: Store::new(),
                contact_status: ContactStatusMap::new(),
                transports: TransportRegistry::new(),
                monitor: TransportMonitor::new(),
                requester,
                lines: LineBindings::new(),
                events: EventBus::new(),
            }),
        }
    }

    /// A verifier configured from the current global options.
    pub fn digest_verifier(&self) -> DigestVerifier {
        let global = self.global.read();
        DigestVerifier::new(global.default_realm.clone(), Duration::from_secs(32))
    }

    /// Auth sections referenced by `names`, skipping unknown ones.
    pub fn resolve_auths(&self, names: &[String]) -> Vec<Arc<AuthConfig>> {
        names
            .iter()
            .filter_map(|name| self.auths.get(name))
            .collect()
    }

    /// Serializer owning the availability state of `aor`.
    pub fn aor_serializer(&self, aor: &str) -> Serializer {
        self.serializers
            .get_or_create(&format!("pjsip/options/{aor}"), &self.shutdown_group)
    }

    /// Serializer owning the binding mutations of `aor`.
    pub fn registrar_serializer(&self, aor: &str) -> Serializer {
        self.serializers
            .get_or_create(&format!("registrar:{aor}"), &self.shutdown_group)
    }

    /// Serializer owning one outbound registration.
    pub fn outreg_serializer(&self, registration: &str) -> Serializer {
        self.serializers
            .get_or_create(&format!("pjsip/outreg/{registration}"), &self.shutdown_group)
    }

    /// Drain the management serializer, then join every serializer.
    ///
    /// Returns the number of tasks that outlived `timeout`; a non zero
    /// residue is logged by the caller and means state is leaked rather
    /// than corrupted.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        // Give management a chance to finish structural work first
        let _ = self.management.send_wait(async {}).await;

        let residue = self.shutdown_group.shutdown(timeout).await;
        if residue != 0 {
            log::warn!("core shutdown left {residue} task(s) behind");
        }
        residue
    }
}
