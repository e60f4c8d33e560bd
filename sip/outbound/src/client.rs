//! The per-registration client state machine.

use parking_lot::Mutex;
use rsip::prelude::*;
use rsip::{Header, Param};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;

use tandem_core::auth::{DigestAuthenticator, DigestCredentials, DigestUser};
use tandem_core::config::AuthType;
use tandem_core::events::{CoreEvent, RegistrationLabel};
use tandem_core::msg::{self, RequestParts};
use tandem_core::scheduler::{RunPolicy, SchedTask};
use tandem_core::serializer::Serializer;
use tandem_core::transport::TpHandle;
use tandem_core::{Core, stats};

use crate::config::{RegistrationConfig, SecurityNegotiation};
use crate::oauth::TokenCache;

/// Refresh this many seconds before the binding expires.
const REREGISTER_BUFFER_TIME: u32 = 10;

/// Internal state of one outbound registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    Unregistered,
    Registered,
    RejectedTemporary,
    RejectedPermanent,
    Stopping,
    Stopped,
}

impl RegistrationStatus {
    /// The reduced label external observers see.
    pub fn label(&self) -> RegistrationLabel {
        match self {
            RegistrationStatus::Registered => RegistrationLabel::Registered,
            RegistrationStatus::RejectedTemporary | RegistrationStatus::RejectedPermanent => {
                RegistrationLabel::Rejected
            }
            _ => RegistrationLabel::Unregistered,
        }
    }
}

struct ClientInner {
    config: Arc<RegistrationConfig>,
    status: RegistrationStatus,
    /// Label currently reflected in the state gauges.
    published_label: Option<&'static str>,
    retries: u32,
    /// Total REGISTER attempts, diagnostics only.
    attempts: u32,
    cseq: u32,
    call_id: String,
    from_tag: String,
    auth_attempted: bool,
    authenticator: DigestAuthenticator,
    line_token: Option<String>,
    last_code: Option<u16>,
    expires_at: Option<Instant>,
    sched: Option<Arc<SchedTask>>,
    in_flight: bool,
    destroy_pending: bool,
    security_servers: Vec<String>,
    targets: Vec<SocketAddr>,
    target_index: usize,
    transport: Option<TpHandle>,
}

/// Runtime twin of a [`RegistrationConfig`].
pub struct ClientState {
    name: String,
    serializer: Serializer,
    inner: Mutex<ClientInner>,
}

impl ClientState {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> RegistrationStatus {
        self.inner.lock().status
    }

    pub fn label(&self) -> RegistrationLabel {
        self.inner.lock().status.label()
    }

    pub fn attempts(&self) -> u32 {
        self.inner.lock().attempts
    }

    pub fn last_code(&self) -> Option<u16> {
        self.inner.lock().last_code
    }

    pub fn line_token(&self) -> Option<String> {
        self.inner.lock().line_token.clone()
    }

    pub fn security_servers(&self) -> Vec<String> {
        self.inner.lock().security_servers.clone()
    }
}

/// What to do after processing a response.
enum Next {
    Done,
    Resend,
}

/// Maintains every configured outbound registration.
pub struct OutboundRegistrationEngine {
    core: Core,
    states: Mutex<HashMap<String, Arc<ClientState>>>,
    token_cache: Mutex<Option<Arc<TokenCache>>>,
}

impl OutboundRegistrationEngine {
    pub fn new(core: Core) -> Arc<Self> {
        let engine = Arc::new(Self {
            core: core.clone(),
            states: Mutex::new(HashMap::new()),
            token_cache: Mutex::new(None),
        });

        // A permanently rejected registration gets another chance when
        // its credentials change
        core.auths.observe(Arc::new(AuthObserver {
            engine: Arc::downgrade(&engine),
        }));

        engine
    }

    /// Install the provider used for `google_oauth` auth sections.
    pub fn set_token_cache(&self, cache: Arc<TokenCache>) {
        *self.token_cache.lock() = Some(cache);
    }

    pub fn state(&self, name: &str) -> Option<Arc<ClientState>> {
        self.states.lock().get(name).cloned()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientState>> {
        self.states.lock().values().cloned().collect()
    }

    /// Apply `config`, creating or replacing the registration.
    ///
    /// The first REGISTER fires after a random delay in
    /// `(0, max_random_initial_delay]` seconds, clamped by the global
    /// `max_initial_qualify_time`.
    pub fn apply(self: &Arc<Self>, config: RegistrationConfig) -> tandem_core::Result<()> {
        config.validate()?;
        let config = Arc::new(config);

        let state = {
            let mut states = self.states.lock();

            if let Some(existing) = states.get(&config.id) {
                existing.inner.lock().config = config.clone();
                existing.clone()
            } else {
                let line_token = config.line.then(|| {
                    let endpoint = config.endpoint.clone().unwrap_or_default();
                    self.core.lines.allocate(&config.id, endpoint)
                });

                let state = Arc::new(ClientState {
                    name: config.id.clone(),
                    serializer: self.core.outreg_serializer(&config.id),
                    inner: Mutex::new(ClientInner {
                        config: config.clone(),
                        status: RegistrationStatus::Unregistered,
                        published_label: None,
                        retries: 0,
                        attempts: 0,
                        cseq: 0,
                        call_id: msg::make_call_id(),
                        from_tag: msg::make_tag(),
                        auth_attempted: false,
                        authenticator: DigestAuthenticator::default(),
                        line_token,
                        last_code: None,
                        expires_at: None,
                        sched: None,
                        in_flight: false,
                        destroy_pending: false,
                        security_servers: Vec::new(),
                        targets: Vec::new(),
                        target_index: 0,
                        transport: None,
                    }),
                });

                states.insert(config.id.clone(), state.clone());
                state
            }
        };

        stats::registration_count(self.states.lock().len());

        // A reload re-arms a permanently rejected registration
        {
            let mut inner = state.inner.lock();
            if inner.status == RegistrationStatus::RejectedPermanent {
                inner.status = RegistrationStatus::Unregistered;
                inner.retries = 0;
            }
            inner.authenticator.reset();
            inner.auth_attempted = false;
            inner.targets.clear();
            inner.target_index = 0;
        }

        let max_delay = {
            let global = self.core.global.read();
            if global.max_initial_qualify_time > 0 {
                config
                    .max_random_initial_delay
                    .min(global.max_initial_qualify_time)
            } else {
                config.max_random_initial_delay
            }
        };

        let initial = if max_delay > 0 {
            rand::random_range(0..max_delay) + 1
        } else {
            1
        };

        log::debug!(
            "scheduling initial REGISTER of {} in {initial} second(s)",
            config.id
        );
        self.schedule(&state, initial, false);

        Ok(())
    }

    /// Tear the registration down, unregistering first when bound.
    ///
    /// With a transaction in flight the destruction is deferred until its
    /// response (or timeout) has been processed.
    pub async fn remove(self: &Arc<Self>, name: &str) {
        let Some(state) = self.states.lock().remove(name) else {
            return;
        };

        stats::registration_count(self.states.lock().len());

        let this = self.clone();
        let _ = state
            .serializer
            .clone()
            .send_wait(async move {
                let needs_unregister = {
                    let mut inner = state.inner.lock();
                    inner.destroy_pending = true;

                    if let Some(task) = inner.sched.take() {
                        this.core.scheduler.cancel_if_active(&task);
                    }

                    if inner.in_flight {
                        // Deferred: the in-flight attempt finishes the job
                        // when its response or timeout is processed
                        return;
                    }

                    inner.status == RegistrationStatus::Registered
                };

                if needs_unregister {
                    this.set_status(&state, RegistrationStatus::Stopping);
                    // The attempt sees destroy_pending and finalizes
                    this.attempt(&state, true).await;
                } else {
                    this.finalize_destroy(&state);
                }
            })
            .await;
    }

    /// Management action: remove the binding but keep the configuration.
    pub fn unregister(self: &Arc<Self>, name: &str) {
        let Some(state) = self.state(name) else {
            return;
        };

        {
            let mut inner = state.inner.lock();
            if let Some(task) = inner.sched.take() {
                self.core.scheduler.cancel_if_active(&task);
            }
        }

        let this = self.clone();
        let state2 = state.clone();
        let _ = state
            .serializer
            .submit(async move { this.attempt(&state2, true).await });
    }

    /// Management action: issue a fresh REGISTER now.
    pub fn register_now(self: &Arc<Self>, name: &str) {
        if let Some(state) = self.state(name) {
            self.schedule(&state, 0, false);
        }
    }

    fn schedule(self: &Arc<Self>, state: &Arc<ClientState>, seconds: u32, remove_binding: bool) {
        let mut inner = state.inner.lock();

        if let Some(task) = inner.sched.take() {
            self.core.scheduler.cancel_if_active(&task);
        }

        let this = self.clone();
        let state2 = state.clone();

        if seconds == 0 {
            drop(inner);
            let state3 = state2.clone();
            let _ = state.serializer.submit(async move {
                this.attempt(&state3, remove_binding).await;
            });
            return;
        }

        inner.sched = Some(self.core.scheduler.schedule(
            format!("pjsip/outreg/{}", state.name),
            Duration::from_secs(seconds as u64),
            RunPolicy::OneShot,
            Some(state.serializer.clone()),
            &self.core.shutdown_group,
            move || {
                let this = this.clone();
                let state = state2.clone();
                async move {
                    this.attempt(&state, remove_binding).await;
                }
            },
        ));
    }

    /// One REGISTER attempt plus everything that follows from its
    /// response. Runs on the registration's serializer.
    async fn attempt(self: &Arc<Self>, state: &Arc<ClientState>, remove_binding: bool) {
        let mut remove_binding = remove_binding;

        loop {
            let prepared = match self.prepare_request(state, remove_binding) {
                Ok(prepared) => prepared,
                Err(e) => {
                    log::warn!("registration {}: {e}", state.name);
                    self.handle_failure(state, None, remove_binding);
                    if state.inner.lock().destroy_pending {
                        self.finalize_destroy(state);
                    }
                    return;
                }
            };

            let Some((transport, target, branch, request)) = prepared else {
                // Attempt suppressed (shutdown race or missing token)
                self.handle_failure(state, None, remove_binding);
                if state.inner.lock().destroy_pending {
                    self.finalize_destroy(state);
                }
                return;
            };

            state.inner.lock().in_flight = true;
            let result = self
                .core
                .requester
                .send(&transport, target, branch, request)
                .await;
            state.inner.lock().in_flight = false;

            let next = match result {
                Ok(response) => self.handle_response(state, &response, remove_binding, &transport),
                Err(e) => {
                    log::warn!(
                        "registration {}: no response from {target}: {e}",
                        state.name
                    );
                    self.handle_timeout(state, remove_binding)
                }
            };

            if state.inner.lock().destroy_pending {
                if !remove_binding
                    && state.inner.lock().status == RegistrationStatus::Registered
                {
                    // The destroy was deferred on us; unregister first
                    self.set_status(state, RegistrationStatus::Stopping);
                    remove_binding = true;
                    continue;
                }

                self.finalize_destroy(state);
                return;
            }

            match next {
                Next::Done => return,
                Next::Resend => continue,
            }
        }
    }

    /// Build the next REGISTER. Returns `None` when the attempt cannot be
    /// made right now (e.g. a bearer token is still being fetched).
    #[allow(clippy::type_complexity)]
    fn prepare_request(
        &self,
        state: &Arc<ClientState>,
        remove_binding: bool,
    ) -> tandem_core::Result<Option<(TpHandle, SocketAddr, String, rsip::Request)>> {
        let mut inner = state.inner.lock();
        let config = inner.config.clone();

        let transport = self.core.transports.select(config.transport.as_deref())?;
        inner.transport = Some(transport.clone());

        if inner.targets.is_empty() {
            // Resolution happens lazily; IP literals resolve here, names
            // were resolved by the caller's resolver ahead of time
            let route = config
                .outbound_proxy
                .clone()
                .unwrap_or_else(|| config.server_uri.clone());
            inner.targets = resolve_targets(&route)?;
            inner.target_index = 0;
        }

        let target = inner.targets[inner.target_index];

        let server_uri = rsip::Uri::try_from(config.server_uri.as_str())?;
        let client_uri = rsip::Uri::try_from(config.client_uri.as_str())?;

        inner.cseq += 1;
        inner.attempts += 1;

        let user_agent = self.core.global.read().user_agent.clone();

        let (mut request, branch) = msg::build_request(
            RequestParts {
                method: rsip::Method::Register,
                target: server_uri.clone(),
                from: client_uri.clone(),
                to: client_uri.clone(),
                cseq: inner.cseq,
                call_id: inner.call_id.clone(),
                from_tag: inner.from_tag.clone(),
                user_agent: Some(user_agent),
            },
            &transport,
        );

        request
            .headers
            .push(Header::Contact(self.contact_value(&inner, &transport).into()));
        request.headers.push(Header::Expires(
            if remove_binding { 0 } else { config.expiration }
                .to_string()
                .into(),
        ));

        let mut supported = Vec::new();
        if config.support_path {
            supported.push("path");
        }
        if config.support_outbound {
            supported.push("outbound");
        }
        if !supported.is_empty() {
            request
                .headers
                .push(Header::Supported(supported.join(", ").into()));
        }

        if config.security_negotiation == SecurityNegotiation::Mediasec {
            if inner.security_servers.is_empty() {
                for mechanism in &config.security_mechanisms {
                    request.headers.push(Header::Other(
                        "Security-Client".into(),
                        mechanism.clone(),
                    ));
                }
            } else {
                for server in &inner.security_servers {
                    request
                        .headers
                        .push(Header::Other("Security-Verify".into(), server.clone()));
                }
            }
        }

        // Either a bearer token or a digest answer, never both
        let auths = self.core.resolve_auths(&config.outbound_auth);
        if let Some(oauth) = auths.iter().find(|a| a.auth_type == AuthType::GoogleOauth) {
            let cache = self.token_cache.lock().clone();
            let Some(cache) = cache else {
                log::warn!(
                    "registration {} uses google_oauth but no token provider is installed",
                    state.name
                );
                return Ok(None);
            };

            let Some(token) = cache.get(&self.core, oauth) else {
                log::debug!(
                    "registration {}: bearer token not ready, deferring attempt",
                    state.name
                );
                return Ok(None);
            };

            request
                .headers
                .push(Header::Authorization(format!("Bearer {token}").into()));
        } else {
            let method = rsip::Method::Register;
            let uri = server_uri.clone();
            inner.authorize(&mut request.headers, &method, &uri, &auths);
        }

        Ok(Some((transport, target, branch, request)))
    }

    fn contact_value(&self, inner: &ClientInner, transport: &TpHandle) -> String {
        let config = &inner.config;

        let user = config.contact_user.clone().unwrap_or_else(|| {
            rsip::Uri::try_from(config.client_uri.as_str())
                .ok()
                .and_then(|u| u.auth.map(|a| a.user))
                .unwrap_or_else(|| "s".into())
        });

        let sent_by = transport.sent_by();
        let mut uri = format!("sip:{user}@{sent_by}");

        if transport.protocol() != tandem_core::config::TransportProtocol::Udp {
            uri.push_str(&format!(
                ";transport={}",
                transport.protocol().as_str().to_ascii_lowercase()
            ));
        }

        if let Some(token) = &inner.line_token {
            uri.push_str(&format!(";line={token}"));
        }

        for (name, value) in &config.contact_header_params {
            if value.is_empty() {
                uri.push_str(&format!(";{name}"));
            } else {
                uri.push_str(&format!(";{name}={value}"));
            }
        }

        format!("<{uri}>")
    }

    fn handle_response(
        self: &Arc<Self>,
        state: &Arc<ClientState>,
        response: &rsip::Response,
        remove_binding: bool,
        transport: &TpHandle,
    ) -> Next {
        let code = response.status_code.code();
        state.inner.lock().last_code = Some(code);

        let config = state.inner.lock().config.clone();

        // RFC 3329: remember the server's mechanisms for Security-Verify
        if config.security_negotiation == SecurityNegotiation::Mediasec
            && matches!(code, 401 | 407 | 494)
        {
            let servers = msg::other_headers(&response.headers, "Security-Server");
            if !servers.is_empty() {
                state.inner.lock().security_servers = servers.clone();
                self.propagate_security_mechanisms(&config, servers);
            }
        }

        if matches!(code, 401 | 407) && !remove_binding {
            let auths = self.core.resolve_auths(&config.outbound_auth);

            let mut inner = state.inner.lock();
            if !inner.auth_attempted && !auths.is_empty() {
                let mut credentials = DigestCredentials::new();
                for auth in &auths {
                    let user = DigestUser::new(auth.username.clone(), auth.password.clone());
                    match &auth.realm {
                        Some(realm) => credentials.add_for_realm(realm.clone(), user),
                        None => credentials.set_default(user),
                    }
                }
                inner.authenticator.set_credentials(credentials);

                match inner.authenticator.handle_rejection(response) {
                    Ok(()) => {
                        inner.auth_attempted = true;
                        log::debug!(
                            "registration {}: answering authentication challenge",
                            state.name
                        );
                        return Next::Resend;
                    }
                    Err(e) => {
                        log::warn!(
                            "registration {}: cannot answer challenge: {e}",
                            state.name
                        );
                    }
                }
            }
            drop(inner);
            return self.classify_failure(state, code);
        }

        if code == 494 {
            // Security agreement round trip; retry carrying Security-Verify
            let mut inner = state.inner.lock();
            inner.retries += 1;
            drop(inner);
            self.set_status(state, RegistrationStatus::RejectedTemporary);
            self.schedule(state, 0, remove_binding);
            return Next::Done;
        }

        state.inner.lock().auth_attempted = false;

        if (200..300).contains(&code) {
            let expiration = if remove_binding {
                0
            } else {
                self.response_expiration(state, response)
            };

            if expiration > 0 {
                log::info!("outbound registration {} successful", state.name);
                {
                    let mut inner = state.inner.lock();
                    inner.retries = 0;
                    inner.expires_at =
                        Some(Instant::now() + Duration::from_secs(expiration as u64));
                }
                self.set_status(state, RegistrationStatus::Registered);

                let refresh = expiration.saturating_sub(REREGISTER_BUFFER_TIME);
                self.schedule(state, refresh, false);

                if transport.reliable() {
                    self.arm_transport_monitor(state, transport);
                }
            } else {
                log::info!("outbound unregistration {} successful", state.name);
                state.inner.lock().expires_at = None;
                self.set_status(state, RegistrationStatus::Unregistered);

                if transport.reliable() {
                    self.core.monitor.unregister(transport, &state.name);
                }
            }

            return Next::Done;
        }

        // Retry-After overrides any computed back-off
        if let Some(retry_after) = retry_after_seconds(response) {
            let mut inner = state.inner.lock();
            inner.retries += 1;
            drop(inner);
            self.set_status(state, RegistrationStatus::RejectedTemporary);
            log::warn!(
                "registration {}: {code} with Retry-After, retrying in {retry_after} second(s)",
                state.name
            );
            self.schedule(state, retry_after, false);
            return Next::Done;
        }

        if matches!(code, 408 | 503) {
            // Failover through the remaining resolved addresses first
            let mut inner = state.inner.lock();
            if inner.target_index + 1 < inner.targets.len() {
                inner.target_index += 1;
                log::warn!(
                    "registration {}: {code}, failing over to next server address",
                    state.name
                );
                return Next::Resend;
            }
            inner.targets.clear();
            inner.target_index = 0;
        }

        self.classify_failure(state, code)
    }

    fn handle_timeout(self: &Arc<Self>, state: &Arc<ClientState>, remove_binding: bool) -> Next {
        if remove_binding {
            return Next::Done;
        }

        {
            let mut inner = state.inner.lock();
            inner.last_code = Some(408);

            if inner.target_index + 1 < inner.targets.len() {
                inner.target_index += 1;
                log::warn!(
                    "registration {}: timeout, failing over to next server address",
                    state.name
                );
                return Next::Resend;
            }

            inner.targets.clear();
            inner.target_index = 0;
        }

        self.classify_failure(state, 408)
    }

    fn handle_failure(self: &Arc<Self>, state: &Arc<ClientState>, code: Option<u16>, remove_binding: bool) {
        if remove_binding {
            return;
        }
        // Transport and local errors are temporal
        let _ = self.classify_failure(state, code.unwrap_or(503));
    }

    /// The temporal/fatal decision tree.
    fn classify_failure(self: &Arc<Self>, state: &Arc<ClientState>, code: u16) -> Next {
        let config = state.inner.lock().config.clone();

        let temporal = matches!(code, 408 | 500 | 502 | 503 | 504)
            || (600..700).contains(&code)
            || (matches!(code, 401 | 407) && !config.auth_rejection_permanent);

        if config.retry_interval > 0 && temporal {
            let retries = state.inner.lock().retries;

            if retries == config.max_retries {
                log::warn!(
                    "registration {}: maximum retries reached, stopping registration attempts",
                    state.name
                );
                self.set_status(state, RegistrationStatus::RejectedPermanent);
            } else {
                state.inner.lock().retries += 1;
                log::warn!(
                    "registration {}: {code}, retrying in {} second(s)",
                    state.name,
                    config.retry_interval
                );
                self.set_status(state, RegistrationStatus::RejectedTemporary);
                self.schedule(state, config.retry_interval, false);
            }
            return Next::Done;
        }

        let retries = state.inner.lock().retries;

        if code == 403 && config.forbidden_retry_interval > 0 && retries < config.max_retries {
            state.inner.lock().retries += 1;
            log::warn!(
                "registration {}: 403 Forbidden, retrying in {} second(s)",
                state.name,
                config.forbidden_retry_interval
            );
            self.set_status(state, RegistrationStatus::RejectedTemporary);
            self.schedule(state, config.forbidden_retry_interval, false);
        } else if config.fatal_retry_interval > 0 && retries < config.max_retries {
            state.inner.lock().retries += 1;
            log::warn!(
                "registration {}: fatal response {code}, retrying in {} second(s)",
                state.name,
                config.fatal_retry_interval
            );
            self.set_status(state, RegistrationStatus::RejectedTemporary);
            self.schedule(state, config.fatal_retry_interval, false);
        } else {
            log::warn!(
                "registration {}: fatal response {code}, stopping outbound registration",
                state.name
            );
            self.set_status(state, RegistrationStatus::RejectedPermanent);
        }

        Next::Done
    }

    /// Binding lifetime granted by a 2xx: the expires of our own contact,
    /// else the Expires header, else what we asked for.
    fn response_expiration(&self, state: &Arc<ClientState>, response: &rsip::Response) -> u32 {
        let inner = state.inner.lock();

        let own_user = inner
            .config
            .contact_user
            .clone()
            .or_else(|| {
                rsip::Uri::try_from(inner.config.client_uri.as_str())
                    .ok()
                    .and_then(|u| u.auth.map(|a| a.user))
            })
            .unwrap_or_default();

        for contact in msg::contact_headers(&response.headers) {
            let Ok(typed) = contact.typed() else { continue };

            let user_matches = typed
                .uri
                .auth
                .as_ref()
                .is_some_and(|a| a.user == own_user);
            if !user_matches {
                continue;
            }

            let expires = typed.params.iter().find_map(|p| match p {
                Param::Expires(e) => e.value().parse::<u32>().ok(),
                Param::Other(k, Some(v)) if k.value().eq_ignore_ascii_case("expires") => {
                    v.value().parse::<u32>().ok()
                }
                _ => None,
            });

            if let Some(expires) = expires {
                return expires;
            }
        }

        msg::expires_header(&response.headers).unwrap_or(inner.config.expiration)
    }

    /// Re-register as soon as the transport the binding lives on dies.
    fn arm_transport_monitor(self: &Arc<Self>, state: &Arc<ClientState>, transport: &TpHandle) {
        let engine = Arc::downgrade(self);
        let state_weak = Arc::downgrade(state);

        self.core.monitor.register(
            transport,
            Some(state.name.clone()),
            Arc::new(move |tp| {
                let (Some(engine), Some(state)) = (engine.upgrade(), state_weak.upgrade()) else {
                    return;
                };

                log::info!(
                    "transport {tp} shut down, re-registering {}",
                    state.name
                );

                {
                    let mut inner = state.inner.lock();
                    if let Some(task) = inner.sched.take() {
                        engine.core.scheduler.cancel_if_active(&task);
                    }
                }

                let state2 = state.clone();
                let _ = state.serializer.submit(async move {
                    engine.attempt(&state2, false).await;
                });
            }),
        );
    }

    /// Copy Security-Server mechanisms onto the contact statuses of the
    /// registration's endpoint so in-dialog requests can attach
    /// Security-Verify.
    fn propagate_security_mechanisms(&self, config: &RegistrationConfig, servers: Vec<String>) {
        let Some(endpoint) = config
            .endpoint
            .as_ref()
            .and_then(|name| self.core.endpoints.get(name))
        else {
            return;
        };

        for aor in &endpoint.aors {
            for contact in self.core.contacts.find(|c| &c.aor == aor) {
                if let Some(status) = self.core.contact_status.get(&contact.id) {
                    self.core
                        .contact_status
                        .insert(status.with_security(servers.clone()));
                }
            }
        }
    }

    fn set_status(self: &Arc<Self>, state: &Arc<ClientState>, status: RegistrationStatus) {
        let (changed, label, old_label, code) = {
            let mut inner = state.inner.lock();
            let changed = inner.status != status;
            inner.status = status;

            let label = status.label();
            let old_label = inner.published_label;
            inner.published_label = Some(label.as_str());

            (changed, label, old_label, inner.last_code)
        };

        if !changed {
            return;
        }

        stats::registration_state_changed(old_label, Some(label.as_str()));

        self.core
            .events
            .publish(CoreEvent::OutboundRegistrationStateChanged {
                registration: state.name.clone(),
                status: label,
                code,
            });
    }

    /// An auth section changed; re-arm the registrations it rejected.
    fn auth_changed(self: &Arc<Self>, auth_id: &str) {
        let states: Vec<_> = self.states.lock().values().cloned().collect();

        for state in states {
            let rearm = {
                let mut inner = state.inner.lock();
                if inner.status != RegistrationStatus::RejectedPermanent
                    || !inner.config.outbound_auth.iter().any(|a| a == auth_id)
                {
                    continue;
                }

                inner.retries = 0;
                inner.auth_attempted = false;
                inner.authenticator.reset();
                true
            };

            if rearm {
                log::info!(
                    "auth {auth_id} changed, re-arming rejected registration {}",
                    state.name
                );
                self.set_status(&state, RegistrationStatus::Unregistered);
                self.schedule(&state, 0, false);
            }
        }
    }

    fn finalize_destroy(self: &Arc<Self>, state: &Arc<ClientState>) {
        {
            let mut inner = state.inner.lock();
            if let Some(task) = inner.sched.take() {
                self.core.scheduler.cancel_if_active(&task);
            }

            if let Some(transport) = inner.transport.take() {
                self.core.monitor.unregister(&transport, &state.name);
            }

            inner.authenticator.reset();
            inner.security_servers.clear();
        }

        self.core.lines.release_for_registration(&state.name);
        self.set_status(state, RegistrationStatus::Stopped);
        self.core
            .serializers
            .remove(&format!("pjsip/outreg/{}", state.name));

        log::debug!("registration {} stopped", state.name);
    }
}

struct AuthObserver {
    engine: Weak<OutboundRegistrationEngine>,
}

impl tandem_core::store::StoreObserver<tandem_core::config::AuthConfig> for AuthObserver {
    fn created(&self, object: &Arc<tandem_core::config::AuthConfig>) {
        if let Some(engine) = self.engine.upgrade() {
            engine.auth_changed(&object.id);
        }
    }

    fn updated(
        &self,
        object: &Arc<tandem_core::config::AuthConfig>,
        _old: &Arc<tandem_core::config::AuthConfig>,
    ) {
        if let Some(engine) = self.engine.upgrade() {
            engine.auth_changed(&object.id);
        }
    }
}

fn retry_after_seconds(response: &rsip::Response) -> Option<u32> {
    response.headers.iter().find_map(|h| match h {
        Header::RetryAfter(retry_after) => {
            // The value may carry a comment or parameters; the leading
            // integer is all we honour
            retry_after
                .value()
                .trim()
                .split(|c: char| !c.is_ascii_digit())
                .next()
                .and_then(|s| s.parse().ok())
        }
        _ => None,
    })
}

/// Resolve a SIP URI to its socket addresses.
///
/// IP literals short circuit; everything else goes through the system
/// resolver. Multiple records feed the 408/503 failover chain.
fn resolve_targets(uri: &str) -> tandem_core::Result<Vec<SocketAddr>> {
    let uri = rsip::Uri::try_from(uri)?;

    let port = uri
        .host_with_port
        .port
        .as_ref()
        .map(|p| *p.value())
        .unwrap_or(5060);

    match &uri.host_with_port.host {
        rsip::Host::IpAddr(ip) => Ok(vec![SocketAddr::new(*ip, port)]),
        rsip::Host::Domain(domain) => {
            let host = domain.to_string();
            let addrs: Vec<_> = std::net::ToSocketAddrs::to_socket_addrs(&(host.as_str(), port))
                .map_err(|e| {
                    tandem_core::Error::Other(format!("failed to resolve {host}: {e}"))
                })?
                .collect();

            if addrs.is_empty() {
                return Err(tandem_core::Error::Other(format!(
                    "no addresses found for {host}"
                )));
            }

            Ok(addrs)
        }
    }
}

impl ClientInner {
    fn authorize(
        &mut self,
        headers: &mut rsip::Headers,
        method: &rsip::Method,
        uri: &rsip::Uri,
        auths: &[Arc<tandem_core::config::AuthConfig>],
    ) {
        if !self.authenticator.has_challenge() {
            return;
        }

        // Refresh the credential view; the auth store may have changed
        // since the challenge was cached
        let mut credentials = DigestCredentials::new();
        for auth in auths {
            let user = DigestUser::new(auth.username.clone(), auth.password.clone());
            match &auth.realm {
                Some(realm) => credentials.add_for_realm(realm.clone(), user),
                None => credentials.set_default(user),
            }
        }
        self.authenticator.set_credentials(credentials);

        self.authenticator.authorize_request(headers, method, uri);
    }
}
