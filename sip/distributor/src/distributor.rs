//! The request distributor.
//!
//! Classifies incoming messages, picks (or recalls) the serializer that
//! owns their dialog, resolves the originating endpoint and runs the
//! authentication gate before handing the request to the registered
//! handlers.

use async_trait::async_trait;
use rsip::{Method, SipMessage, StatusCode};
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::Instrument;

use tandem_core::auth::{CheckAuthResult, DigestVerifier};
use tandem_core::config::EndpointConfig;
use tandem_core::events::{CoreEvent, SecurityEvent};
use tandem_core::msg::{response_for, top_via_branch};
use tandem_core::serializer::SerializerPool;
use tandem_core::transport::{MessageTpInfo, ReceivedMessage};
use tandem_core::Core;

use crate::dialog::{DialogKey, DialogMap};
use crate::global_headers::GlobalHeaders;
use crate::identify::{EndpointIdentifier, default_identifiers};
use crate::unidentified::UnidentifiedTracker;

/// A request travelling through the handler chain.
pub struct RequestContext {
    pub request: rsip::Request,
    pub tp_info: MessageTpInfo,
    /// Resolved endpoint; `None` marks an unidentified (artificial)
    /// source that survived the auth gate only because the gate was
    /// skipped for its method.
    pub endpoint: Option<Arc<EndpointConfig>>,
}

impl RequestContext {
    /// Send `response` back where the request came from, with the global
    /// response headers applied.
    pub async fn respond(&self, globals: &GlobalHeaders, mut response: rsip::Response) -> io::Result<()> {
        globals.apply_to_response(&mut response);

        self.tp_info
            .transport
            .send(response.to_string().as_bytes(), self.tp_info.source)
            .await
    }
}

/// A consumer of distributed requests (registrar, OPTIONS responder,
/// dialog layers).
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Inspect `ctx`; return `None` to consume the request, or hand it
    /// back for the next handler.
    async fn receive(&self, distributor: &Distributor, ctx: RequestContext)
    -> Option<RequestContext>;
}

/// Distributes parsed messages onto serializers.
pub struct Distributor {
    core: Core,
    pool: SerializerPool,
    dialogs: DialogMap,
    identifiers: Vec<Arc<dyn EndpointIdentifier>>,
    unidentified: Arc<UnidentifiedTracker>,
    verifier: DigestVerifier,
    globals: GlobalHeaders,
    handlers: Vec<Arc<dyn RequestHandler>>,
}

impl Distributor {
    pub fn new(core: Core) -> DistributorBuilder {
        DistributorBuilder {
            identifiers: default_identifiers(),
            handlers: Vec::new(),
            core,
        }
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn dialogs(&self) -> &DialogMap {
        &self.dialogs
    }

    pub fn globals(&self) -> &GlobalHeaders {
        &self.globals
    }

    pub fn unidentified(&self) -> &UnidentifiedTracker {
        &self.unidentified
    }

    /// Run the distribution loop over `rx` until the channel closes or the
    /// core shuts down.
    pub fn spawn(self: &Arc<Self>, mut rx: mpsc::Receiver<ReceivedMessage>) {
        let this = self.clone();
        let token = self.core.shutdown_group.token().clone();

        self.core.shutdown_group.spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = token.cancelled() => return,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => return,
                    },
                };

                this.deliver(message).await;
            }
        });
    }

    /// Route one parsed message.
    pub async fn deliver(self: &Arc<Self>, message: ReceivedMessage) {
        match message.message {
            SipMessage::Response(response) => self.deliver_response(response),
            SipMessage::Request(request) => {
                self.deliver_request(request, message.tp_info).await;
            }
        }
    }

    fn deliver_response(&self, response: rsip::Response) {
        // In-flight client transactions come first
        if self.core.requester.pending().handle_response(&response) {
            return;
        }

        // Out-of-dialog response: recall the serializer that issued the
        // request so it observes the response in order
        if let Some(branch) = top_via_branch(&response.headers)
            && let Some((serializer, _)) = self.dialogs.transaction(&branch)
        {
            let code = response.status_code.code();
            let _ = serializer.submit(async move {
                log::debug!("late response {code} delivered to owning serializer");
            });
            return;
        }

        log::debug!(
            "dropping orphaned response {}",
            response.status_code.code()
        );
    }

    async fn deliver_request(self: &Arc<Self>, request: rsip::Request, tp_info: MessageTpInfo) {
        let ctx = RequestContext {
            request,
            tp_info,
            endpoint: None,
        };

        // Tagless CANCEL: find the INVITE transaction and its serializer
        if ctx.request.method == Method::Cancel && DialogKey::of_request(&ctx.request).is_none() {
            let branch = top_via_branch(&ctx.request.headers);

            let Some((serializer, _)) =
                branch.as_deref().and_then(|b| self.dialogs.transaction(b))
            else {
                let response =
                    response_for(&ctx.request, StatusCode::CallTransactionDoesNotExist, true);
                let _ = ctx.respond(&self.globals, response).await;
                return;
            };

            let this = self.clone();
            let _ = serializer.submit(async move { this.process(ctx).await });
            return;
        }

        // Overload protection: shed new requests before they queue
        if ctx.request.method != Method::Ack && self.pool.overloaded() {
            log::warn!(
                "distributor overloaded ({} queued), rejecting request from {}",
                self.pool.queued(),
                ctx.tp_info.source
            );
            let response = response_for(&ctx.request, StatusCode::ServiceUnavailable, true);
            let _ = ctx.respond(&self.globals, response).await;
            return;
        }

        let serializer = match DialogKey::of_request(&ctx.request) {
            Some(key) => match self.dialogs.lookup(&key) {
                Some(serializer) => serializer,
                None => self.pool.pick(),
            },
            None => self.pool.pick(),
        };

        // Stamp the transaction so CANCELs and retransmissions land on the
        // same serializer
        if ctx.request.method != Method::Ack
            && let Some(branch) = top_via_branch(&ctx.request.headers)
        {
            self.dialogs.stamp_transaction(
                branch,
                serializer.clone(),
                DialogKey::of_request(&ctx.request),
            );
        }

        let this = self.clone();
        if serializer
            .submit(async move { this.process(ctx).await })
            .is_err()
        {
            log::debug!("serializer rejected task, core is shutting down");
        }
    }

    /// Identification, the auth gate and the handler chain. Runs on the
    /// chosen serializer.
    async fn process(self: &Arc<Self>, mut ctx: RequestContext) {
        let span = tracing::info_span!(
            "request",
            method = %ctx.request.method,
            source = %ctx.tp_info.source,
        );

        async {
            if let Err(code) = crate::filter::validate_incoming(&ctx.request) {
                let response = response_for(&ctx.request, code, true);
                let _ = ctx.respond(&self.globals, response).await;
                return;
            }

            ctx.endpoint = self.identify(&ctx);

            match &ctx.endpoint {
                Some(endpoint) => {
                    log::debug!(
                        "request from {} identified as endpoint {}",
                        ctx.tp_info.source,
                        endpoint.id
                    );
                }
                None => {
                    self.unidentified.track(ctx.tp_info.source);
                }
            }

            // ACK cannot be answered, CANCEL cannot be challenged
            let gate_exempt =
                matches!(ctx.request.method, Method::Ack | Method::Cancel);

            if !gate_exempt && !self.check_auth(&ctx).await {
                return;
            }

            for handler in &self.handlers {
                ctx = match handler.receive(self, ctx).await {
                    Some(ctx) => ctx,
                    None => return,
                };
            }

            if ctx.request.method != Method::Ack {
                log::debug!("no handler consumed {} request", ctx.request.method);
                let response = response_for(&ctx.request, StatusCode::NotImplemented, true);
                let _ = ctx.respond(&self.globals, response).await;
            }
        }
        .instrument(span)
        .await
    }

    fn identify(&self, ctx: &RequestContext) -> Option<Arc<EndpointConfig>> {
        for identifier in &self.identifiers {
            if let Some(endpoint) =
                identifier.identify(&self.core, &ctx.request, ctx.tp_info.source)
            {
                log::debug!(
                    "endpoint {} resolved by the {} identifier",
                    endpoint.id,
                    identifier.name()
                );
                return Some(endpoint);
            }
        }

        None
    }

    /// The authentication gate. Returns true when processing may
    /// continue.
    async fn check_auth(&self, ctx: &RequestContext) -> bool {
        let auths = match &ctx.endpoint {
            Some(endpoint) => self.core.resolve_auths(&endpoint.auth),
            None => {
                // Artificial endpoint: challenge so scanners cannot tell
                // configured endpoints from unknown ones
                let response = self.verifier.challenge(&ctx.request, &[], false);
                let _ = ctx.respond(&self.globals, response).await;
                return false;
            }
        };

        let auth_refs: Vec<&tandem_core::config::AuthConfig> =
            auths.iter().map(|a| a.as_ref()).collect();

        match self.verifier.verify(&ctx.request, &auth_refs) {
            CheckAuthResult::Success => {
                self.unidentified.forgive(ctx.tp_info.source);
                true
            }
            CheckAuthResult::Challenge(response) => {
                let _ = ctx.respond(&self.globals, response).await;
                false
            }
            CheckAuthResult::Failed(response) => {
                let endpoint = ctx
                    .endpoint
                    .as_ref()
                    .map(|e| e.id.clone())
                    .unwrap_or_default();

                log::warn!(
                    "failed authentication challenge from {} for endpoint {endpoint}",
                    ctx.tp_info.source
                );
                self.core.events.publish(CoreEvent::Security(
                    SecurityEvent::ChallengeResponseFailed {
                        source: ctx.tp_info.source,
                        endpoint,
                    },
                ));

                let _ = ctx.respond(&self.globals, response).await;
                false
            }
            CheckAuthResult::Error => {
                let response =
                    response_for(&ctx.request, StatusCode::ServerInternalError, true);
                let _ = ctx.respond(&self.globals, response).await;
                false
            }
        }
    }
}

/// Assembles a [`Distributor`].
pub struct DistributorBuilder {
    core: Core,
    identifiers: Vec<Arc<dyn EndpointIdentifier>>,
    handlers: Vec<Arc<dyn RequestHandler>>,
}

impl DistributorBuilder {
    /// Replace the identifier chain. Order is meaningful: the first match
    /// wins.
    pub fn identifiers(mut self, identifiers: Vec<Arc<dyn EndpointIdentifier>>) -> Self {
        self.identifiers = identifiers;
        self
    }

    /// Append a handler. Handlers run in insertion order.
    pub fn handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Arc<Distributor> {
        let system = &self.core.system;
        let pool = SerializerPool::spawn(
            "pjsip/distributor",
            system.threadpool_size,
            system.threadpool_queue_high_water,
            &self.core.shutdown_group,
        );

        let unidentified = UnidentifiedTracker::new(self.core.clone());
        let verifier = self.core.digest_verifier();

        Arc::new(Distributor {
            core: self.core,
            pool,
            dialogs: DialogMap::new(),
            identifiers: self.identifiers,
            unidentified,
            verifier,
            globals: GlobalHeaders::new(),
            handlers: self.handlers,
        })
    }
}
