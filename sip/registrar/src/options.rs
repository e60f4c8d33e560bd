//! The availability engine.
//!
//! Runs the periodic OPTIONS qualify cycle per AOR, maintains the
//! `available` contact count, and feeds the endpoint state compositors.
//! Structural changes (which AORs exist, which compositors they feed) are
//! made on the `management` serializer; per-AOR state is only touched on
//! the AOR's own serializer.

use parking_lot::Mutex;
use rsip::StatusCode;
use rsip::prelude::*;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use tandem_core::config::{AorConfig, Contact, EndpointConfig};
use tandem_core::events::CoreEvent;
use tandem_core::msg::{self, RequestParts, response_for};
use tandem_core::scheduler::{RunPolicy, SchedTask};
use tandem_core::status::{ContactStatus, ContactStatusKind};
use tandem_core::store::StoreObserver;
use tandem_core::{Core, stats};

use crate::compositor::EndpointCompositor;
use crate::location::Locator;

struct AorStateInner {
    qualify_frequency: u32,
    qualify_timeout: Duration,
    authenticate_qualify: bool,
    /// Reachable contacts when qualifying, total contacts otherwise.
    available: u32,
    compositors: Vec<Arc<EndpointCompositor>>,
    sched_task: Option<Arc<SchedTask>>,
}

/// Runtime availability state of one AOR.
struct AorState {
    name: String,
    inner: Mutex<AorStateInner>,
}

/// The OPTIONS/availability engine.
///
/// Created by [`AvailabilityEngine::start`]; dropped state is torn down by
/// the core's shutdown group.
pub struct AvailabilityEngine {
    core: Core,
    locator: Locator,
    aors: Mutex<HashMap<String, Arc<AorState>>>,
    compositors: Mutex<HashMap<String, Arc<EndpointCompositor>>>,
}

impl AvailabilityEngine {
    /// Build the engine, wire the store observers and synchronize with the
    /// already configured objects.
    pub async fn start(core: Core) -> Arc<Self> {
        let engine = Arc::new(Self {
            locator: Locator::new(core.clone()),
            core,
            aors: Mutex::new(HashMap::new()),
            compositors: Mutex::new(HashMap::new()),
        });

        engine.core.aors.observe(Arc::new(AorObserver {
            engine: Arc::downgrade(&engine),
        }));
        engine.core.endpoints.observe(Arc::new(EndpointObserver {
            engine: Arc::downgrade(&engine),
        }));
        engine.core.contacts.observe(Arc::new(ContactObserver {
            engine: Arc::downgrade(&engine),
        }));

        let this = engine.clone();
        let _ = engine
            .core
            .management
            .send_wait(async move { this.resync().await })
            .await;

        engine
    }

    /// Rebuild all runtime state from the stores. Runs on `management`.
    async fn resync(self: &Arc<Self>) {
        for aor in self.core.aors.all() {
            self.apply_aor(aor).await;
        }

        for endpoint in self.core.endpoints.all() {
            self.apply_endpoint(endpoint).await;
        }
    }

    fn aor_state(&self, name: &str) -> Option<Arc<AorState>> {
        self.aors.lock().get(name).cloned()
    }

    /// Create or update the runtime state of `aor`. Runs on `management`.
    async fn apply_aor(self: &Arc<Self>, aor: Arc<AorConfig>) {
        let state = {
            let mut aors = self.aors.lock();
            aors.entry(aor.id.clone())
                .or_insert_with(|| {
                    Arc::new(AorState {
                        name: aor.id.clone(),
                        inner: Mutex::new(AorStateInner {
                            qualify_frequency: 0,
                            qualify_timeout: aor.qualify_timeout,
                            authenticate_qualify: aor.authenticate_qualify,
                            available: 0,
                            compositors: Vec::new(),
                            sched_task: None,
                        }),
                    })
                })
                .clone()
        };

        let serializer = self.core.aor_serializer(&aor.id);
        let this = self.clone();

        let _ = serializer
            .send_wait(async move {
                this.apply_aor_on_serializer(&state, &aor);
            })
            .await;
    }

    fn apply_aor_on_serializer(self: &Arc<Self>, state: &Arc<AorState>, aor: &Arc<AorConfig>) {
        let contacts = self.locator.aor_contacts(aor);

        let mut inner = state.inner.lock();
        inner.qualify_timeout = aor.qualify_timeout;
        inner.authenticate_qualify = aor.authenticate_qualify;

        let frequency_changed = inner.qualify_frequency != aor.qualify_frequency;
        inner.qualify_frequency = aor.qualify_frequency;

        let was_available = inner.available > 0;

        if aor.qualify_frequency == 0 {
            if let Some(task) = inner.sched_task.take() {
                self.core.scheduler.cancel_if_active(&task);
            }

            // Availability degenerates to "has contacts"
            inner.available = self.count_contacts(aor);
        } else {
            inner.available = contacts
                .iter()
                .filter(|c| {
                    self.core
                        .contact_status
                        .get(&c.id)
                        .is_some_and(|s| s.status == ContactStatusKind::Reachable)
                })
                .count() as u32;

            if frequency_changed || inner.sched_task.is_none() {
                if let Some(task) = inner.sched_task.take() {
                    self.core.scheduler.cancel_if_active(&task);
                }

                let this = self.clone();
                let aor_name = state.name.clone();
                inner.sched_task = Some(self.core.scheduler.schedule(
                    format!("pjsip/options/{}", state.name),
                    Duration::from_secs(aor.qualify_frequency as u64),
                    RunPolicy::FixedInterval,
                    Some(self.core.aor_serializer(&state.name)),
                    &self.core.shutdown_group,
                    move || {
                        let this = this.clone();
                        let aor_name = aor_name.clone();
                        async move { this.qualify_aor(&aor_name) }
                    },
                ));
            }
        }

        let is_available = inner.available > 0;
        if was_available != is_available {
            Self::notify_compositors(&self.core, &state.name, &inner, is_available);
        }

        drop(inner);

        // Make sure every contact has a status snapshot
        for contact in &contacts {
            if self.core.contact_status.get(&contact.id).is_none() {
                let mut status = ContactStatus::new(&contact.id, &contact.uri, &contact.aor);
                if aor.qualify_frequency == 0 {
                    status.status = ContactStatusKind::Unknown;
                    status.last_status = ContactStatusKind::Unknown;
                }
                self.core.contact_status.insert(status);
            }
        }
    }

    /// Tear down the runtime state of a removed AOR. Runs on `management`.
    async fn remove_aor(self: &Arc<Self>, name: &str) {
        let Some(state) = self.aors.lock().remove(name) else {
            return;
        };

        let serializer = self.core.aor_serializer(name);
        let core = self.core.clone();
        let _ = serializer
            .send_wait(async move {
                let mut inner = state.inner.lock();
                if let Some(task) = inner.sched_task.take() {
                    core.scheduler.cancel_if_active(&task);
                }

                for compositor in inner.compositors.drain(..) {
                    compositor.forget_aor(&core, &state.name);
                }
            })
            .await;

        self.core.serializers.remove(&format!("pjsip/options/{name}"));
    }

    /// Create or refresh the compositor wiring of `endpoint`. Runs on
    /// `management`.
    async fn apply_endpoint(self: &Arc<Self>, endpoint: Arc<EndpointConfig>) {
        let compositor = {
            let mut compositors = self.compositors.lock();
            compositors
                .entry(endpoint.id.clone())
                .or_insert_with(|| Arc::new(EndpointCompositor::new(endpoint.id.clone())))
                .clone()
        };

        // Gate publishing while the composition is rebuilt
        compositor.deactivate();

        for aor_name in &endpoint.aors {
            if self.core.aors.get(aor_name).is_none() {
                log::warn!(
                    "endpoint {} references unknown AOR {aor_name}",
                    endpoint.id
                );
                continue;
            }

            let Some(state) = self.aor_state(aor_name) else {
                continue;
            };

            let serializer = self.core.aor_serializer(aor_name);
            let core = self.core.clone();
            let compositor = compositor.clone();

            let _ = serializer
                .send_wait(async move {
                    let mut inner = state.inner.lock();

                    if !inner
                        .compositors
                        .iter()
                        .any(|c| c.name() == compositor.name())
                    {
                        inner.compositors.push(compositor.clone());
                    }

                    let available = inner.available > 0;
                    drop(inner);

                    compositor.set_aor_status(&core, &state.name, available);
                })
                .await;
        }

        compositor.activate(&self.core);
    }

    /// Drop the compositor of a removed endpoint. Runs on `management`.
    async fn remove_endpoint(self: &Arc<Self>, name: &str) {
        let Some(compositor) = self.compositors.lock().remove(name) else {
            return;
        };

        compositor.deactivate();

        let states: Vec<_> = self.aors.lock().values().cloned().collect();
        for state in states {
            let serializer = self.core.aor_serializer(&state.name);
            let compositor = compositor.clone();
            let _ = serializer
                .send_wait(async move {
                    state
                        .inner
                        .lock()
                        .compositors
                        .retain(|c| c.name() != compositor.name());
                })
                .await;
        }
    }

    /// Current contact count of an unqualified AOR: configured permanent
    /// contacts plus live dynamic bindings. Counting from the
    /// configuration keeps the result stable no matter whether permanent
    /// contacts have been materialized in the store yet.
    fn count_contacts(&self, aor: &AorConfig) -> u32 {
        (aor.permanent_contacts.len() + self.locator.dynamic_contacts(&aor.id).len()) as u32
    }

    /// A contact appeared. Runs on the AOR serializer.
    fn contact_added(self: &Arc<Self>, contact: Arc<Contact>) {
        let Some(state) = self.aor_state(&contact.aor) else {
            return;
        };

        let mut inner = state.inner.lock();

        if inner.qualify_frequency == 0 {
            let Some(config) = self.core.aors.get(&contact.aor) else {
                return;
            };

            let was_available = inner.available > 0;
            inner.available = self.count_contacts(&config);

            // The first contact flips the AOR available
            if !was_available && inner.available > 0 {
                Self::notify_compositors(&self.core, &state.name, &inner, true);
            }
        } else {
            // Probe the new binding right away instead of waiting a full
            // cycle
            let timeout = inner.qualify_timeout;
            let authenticate = inner.authenticate_qualify;
            drop(inner);

            self.spawn_qualify(&state.name, contact, timeout, authenticate);
            return;
        }

        log::debug!(
            "AOR {} now has {} available contact(s)",
            state.name,
            inner.available
        );
    }

    /// A contact went away. `old_status` is the snapshot captured before
    /// removal. Runs on the AOR serializer.
    fn contact_removed(&self, contact: &Contact, old_status: Option<Arc<ContactStatus>>) {
        let Some(state) = self.aor_state(&contact.aor) else {
            return;
        };

        let mut inner = state.inner.lock();

        if inner.qualify_frequency == 0 {
            let Some(config) = self.core.aors.get(&contact.aor) else {
                return;
            };

            let was_available = inner.available > 0;
            inner.available = self.count_contacts(&config);

            // Removing the last contact flips the AOR unavailable
            if was_available && inner.available == 0 {
                Self::notify_compositors(&self.core, &state.name, &inner, false);
            }
        } else if old_status.is_some_and(|s| s.status == ContactStatusKind::Reachable)
            && inner.available > 0
        {
            inner.available -= 1;
            if inner.available == 0 {
                Self::notify_compositors(&self.core, &state.name, &inner, false);
            }
        }

        log::debug!(
            "AOR {} now has {} available contact(s)",
            state.name,
            inner.available
        );
    }

    /// One full qualify sweep over the contacts of `aor`. Runs on the AOR
    /// serializer; the individual probes run concurrently and commit back
    /// onto the serializer.
    fn qualify_aor(self: &Arc<Self>, aor: &str) {
        let Some(state) = self.aor_state(aor) else {
            return;
        };

        let Some(config) = self.core.aors.get(aor) else {
            return;
        };

        let (timeout, authenticate) = {
            let inner = state.inner.lock();
            (inner.qualify_timeout, inner.authenticate_qualify)
        };

        for contact in self.locator.aor_contacts(&config) {
            self.spawn_qualify(aor, contact, timeout, authenticate);
        }
    }

    /// Qualify every contact of `aor` immediately.
    pub fn qualify_now(self: &Arc<Self>, aor: &str) {
        let serializer = self.core.aor_serializer(aor);
        let this = self.clone();
        let aor = aor.to_string();
        let _ = serializer.submit(async move { this.qualify_aor(&aor) });
    }

    fn spawn_qualify(
        self: &Arc<Self>,
        aor: &str,
        contact: Arc<Contact>,
        timeout: Duration,
        authenticate: bool,
    ) {
        let this = self.clone();
        let aor = aor.to_string();

        self.core.shutdown_group.spawn(async move {
            let started = Instant::now();

            let verdict = match tokio::time::timeout(timeout, this.probe(&contact, authenticate))
                .await
            {
                Ok(Ok(())) => (ContactStatusKind::Reachable, started.elapsed()),
                Ok(Err(e)) => {
                    log::debug!("qualify of {} failed: {e}", contact.uri);
                    (ContactStatusKind::Unreachable, Duration::ZERO)
                }
                Err(_) => (ContactStatusKind::Unreachable, Duration::ZERO),
            };

            let serializer = this.core.aor_serializer(&aor);
            let this2 = this.clone();
            let _ = serializer.submit(async move {
                this2.commit_status(&contact, verdict.0, verdict.1);
            });
        });
    }

    /// Send one OPTIONS towards `contact`. Any final response counts as
    /// reachable; timeouts and transport errors do not.
    async fn probe(&self, contact: &Contact, authenticate: bool) -> tandem_core::Result<()> {
        let endpoint = self.binding_endpoint(contact);

        let transport = {
            let name = endpoint.as_ref().and_then(|e| e.transport.clone());
            self.core.transports.select(name.as_deref())?
        };

        let target_uri = rsip::Uri::try_from(contact.uri.as_str())?;
        let target = resolve_uri(&target_uri).await?;

        let from_user = endpoint
            .as_ref()
            .map(|e| e.id.clone())
            .unwrap_or_else(|| contact.aor.clone());

        let user_agent = self.core.global.read().user_agent.clone();

        let build = |cseq: u32| {
            msg::build_request(
                RequestParts {
                    method: rsip::Method::Options,
                    target: target_uri.clone(),
                    from: rsip::Uri {
                        scheme: Some(rsip::Scheme::Sip),
                        auth: Some(rsip::Auth {
                            user: from_user.clone(),
                            password: None,
                        }),
                        host_with_port: msg::host_with_port(transport.sent_by()),
                        params: vec![],
                        headers: vec![],
                    },
                    to: target_uri.clone(),
                    cseq,
                    call_id: msg::make_call_id(),
                    from_tag: msg::make_tag(),
                    user_agent: Some(user_agent.clone()),
                },
                &transport,
            )
        };

        let (request, branch) = build(1);
        let response = self
            .core
            .requester
            .send(&transport, target, branch, request)
            .await?;

        if matches!(
            response.status_code,
            StatusCode::Unauthorized | StatusCode::ProxyAuthenticationRequired
        ) && authenticate
        {
            if let Some(endpoint) = &endpoint {
                let auths = self.core.resolve_auths(&endpoint.outbound_auth);
                if let Some(auth) = auths.first() {
                    let mut credentials = tandem_core::auth::DigestCredentials::new();
                    credentials.set_default(tandem_core::auth::DigestUser::new(
                        auth.username.clone(),
                        auth.password.clone(),
                    ));

                    let mut authenticator =
                        tandem_core::auth::DigestAuthenticator::new(credentials);

                    if authenticator.handle_rejection(&response).is_ok() {
                        let (mut request, branch) = build(2);
                        authenticator.authorize_request(
                            &mut request.headers,
                            &rsip::Method::Options,
                            &target_uri,
                        );

                        let _ = self
                            .core
                            .requester
                            .send(&transport, target, branch, request)
                            .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// The endpoint a qualify is sent on behalf of: the contact's own
    /// association, else the first endpoint feeding this AOR's compositor
    /// vector.
    fn binding_endpoint(&self, contact: &Contact) -> Option<Arc<EndpointConfig>> {
        if let Some(name) = &contact.endpoint_name
            && let Some(endpoint) = self.core.endpoints.get(name)
        {
            return Some(endpoint);
        }

        let state = self.aor_state(&contact.aor)?;
        let first = state
            .inner
            .lock()
            .compositors
            .first()
            .map(|c| c.name().to_string())?;

        self.core.endpoints.get(&first)
    }

    /// Fold a probe verdict into the status table and the AOR counters.
    /// Runs on the AOR serializer.
    fn commit_status(&self, contact: &Contact, status: ContactStatusKind, rtt: Duration) {
        // The contact may have been deleted while the probe was in flight
        let Some(old) = self.core.contact_status.get(&contact.id) else {
            return;
        };
        if self.core.contacts.get(&contact.id).is_none() {
            return;
        }

        let new = old.advance(status, rtt);
        let changed = old.status != new.status;
        self.core.contact_status.insert(new);

        stats::contact_rtt(&contact.id, rtt);

        if changed {
            self.core.events.publish(CoreEvent::ContactStatusChanged {
                contact: contact.id.clone(),
                aor: contact.aor.clone(),
                old: old.status,
                new: status,
                rtt,
            });
        } else {
            log::debug!(
                "contact {}/{} status unchanged: {status}, rtt {rtt:?}",
                contact.aor,
                contact.uri
            );
        }

        let Some(state) = self.aor_state(&contact.aor) else {
            return;
        };

        let mut inner = state.inner.lock();
        if inner.qualify_frequency == 0 {
            return;
        }

        match (old.status, status) {
            (ContactStatusKind::Reachable, s) if s != ContactStatusKind::Reachable => {
                inner.available = inner.available.saturating_sub(1);
                if inner.available == 0 {
                    Self::notify_compositors(&self.core, &contact.aor, &inner, false);
                }
            }
            (s, ContactStatusKind::Reachable) if s != ContactStatusKind::Reachable => {
                inner.available += 1;
                if inner.available == 1 {
                    Self::notify_compositors(&self.core, &contact.aor, &inner, true);
                }
            }
            _ => {}
        }

        log::debug!(
            "AOR {} now has {} available contact(s)",
            contact.aor,
            inner.available
        );
    }

    fn notify_compositors(core: &Core, aor: &str, inner: &AorStateInner, available: bool) {
        for compositor in &inner.compositors {
            compositor.set_aor_status(core, aor, available);
        }
    }

    /// Answer an incoming OPTIONS addressed to a configured endpoint.
    pub fn handle_options(&self, request: &rsip::Request) -> rsip::Response {
        let mut response = response_for(request, StatusCode::OK, true);

        response.headers.push(rsip::Header::Allow(
            "OPTIONS, REGISTER, INVITE, ACK, BYE, CANCEL, INFO, NOTIFY".into(),
        ));
        response
            .headers
            .push(rsip::Header::Accept("application/sdp".into()));

        response
    }

    /// Availability snapshot of `aor`, for the management surface.
    pub fn aor_available(&self, aor: &str) -> Option<u32> {
        self.aor_state(aor).map(|s| s.inner.lock().available)
    }
}

async fn resolve_uri(uri: &rsip::Uri) -> tandem_core::Result<SocketAddr> {
    let port = uri
        .host_with_port
        .port
        .as_ref()
        .map(|p| *p.value())
        .unwrap_or(5060);

    match &uri.host_with_port.host {
        rsip::Host::IpAddr(ip) => Ok(SocketAddr::new(*ip, port)),
        rsip::Host::Domain(domain) => {
            let host = domain.to_string();
            tokio::net::lookup_host((host.as_str(), port))
                .await?
                .next()
                .ok_or_else(|| {
                    tandem_core::Error::Other(format!("no address found for {host}"))
                })
        }
    }
}

struct AorObserver {
    engine: Weak<AvailabilityEngine>,
}

impl StoreObserver<AorConfig> for AorObserver {
    fn created(&self, object: &Arc<AorConfig>) {
        self.dispatch(object.clone());
    }

    fn updated(&self, object: &Arc<AorConfig>, _old: &Arc<AorConfig>) {
        self.dispatch(object.clone());
    }

    fn deleted(&self, object: &Arc<AorConfig>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let name = object.id.clone();
        let _ = engine.core.management.submit({
            let engine = engine.clone();
            async move { engine.remove_aor(&name).await }
        });
    }

    fn loaded(&self) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let _ = engine.core.management.submit({
            let engine = engine.clone();
            async move { engine.resync().await }
        });
    }
}

impl AorObserver {
    fn dispatch(&self, aor: Arc<AorConfig>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let _ = engine.core.management.submit({
            let engine = engine.clone();
            async move { engine.apply_aor(aor).await }
        });
    }
}

struct EndpointObserver {
    engine: Weak<AvailabilityEngine>,
}

impl StoreObserver<EndpointConfig> for EndpointObserver {
    fn created(&self, object: &Arc<EndpointConfig>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let endpoint = object.clone();
        let _ = engine.core.management.submit({
            let engine = engine.clone();
            async move { engine.apply_endpoint(endpoint).await }
        });
    }

    fn updated(&self, object: &Arc<EndpointConfig>, _old: &Arc<EndpointConfig>) {
        self.created(object);
    }

    fn deleted(&self, object: &Arc<EndpointConfig>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let name = object.id.clone();
        let _ = engine.core.management.submit({
            let engine = engine.clone();
            async move { engine.remove_endpoint(&name).await }
        });
    }
}

struct ContactObserver {
    engine: Weak<AvailabilityEngine>,
}

impl StoreObserver<Contact> for ContactObserver {
    fn created(&self, object: &Arc<Contact>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        let contact = object.clone();
        let serializer = engine.core.aor_serializer(&contact.aor);
        let _ = serializer.submit({
            let engine = engine.clone();
            async move { engine.contact_added(contact) }
        });
    }

    fn deleted(&self, object: &Arc<Contact>) {
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        // Capture the status before the deleter tears it down
        let old_status = engine.core.contact_status.get(&object.id);

        let contact = object.clone();
        let serializer = engine.core.aor_serializer(&contact.aor);
        let _ = serializer.submit({
            let engine = engine.clone();
            async move { engine.contact_removed(&contact, old_status) }
        });
    }
}
