//! Distribution, identification and gating scenarios.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tandem_core::Core;
use tandem_core::config::{
    AuthConfig, Cidr, EndpointConfig, GlobalConfig, IdentifyConfig, SystemConfig,
    TransportProtocol,
};
use tandem_core::events::{CoreEvent, SecurityEvent};
use tandem_core::transport::{MessageTpInfo, ReceivedMessage, Transport, TpHandle};
use tandem_distributor::{DialogKey, Distributor, RequestContext, RequestHandler};

/// Records everything "sent" through it.
#[derive(Default)]
struct CollectingTransport {
    sent: Arc<Mutex<Vec<rsip::SipMessage>>>,
}

#[async_trait]
impl Transport for CollectingTransport {
    fn name(&self) -> &str {
        "collect"
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::Udp
    }

    fn bound(&self) -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    fn sent_by(&self) -> SocketAddr {
        "127.0.0.1:5060".parse().unwrap()
    }

    async fn send(&self, bytes: &[u8], _target: SocketAddr) -> std::io::Result<()> {
        if let Ok(message) = rsip::SipMessage::try_from(bytes) {
            self.sent.lock().push(message);
        }
        Ok(())
    }
}

impl fmt::Debug for CollectingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectingTransport").finish()
    }
}

impl fmt::Display for CollectingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UDP:collect")
    }
}

fn collecting() -> (TpHandle, Arc<Mutex<Vec<rsip::SipMessage>>>) {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport = TpHandle::new(CollectingTransport { sent: sent.clone() });
    (transport, sent)
}

fn received(request: rsip::Request, source: &str, transport: &TpHandle) -> ReceivedMessage {
    ReceivedMessage {
        tp_info: MessageTpInfo {
            timestamp: SystemTime::now(),
            source: source.parse().unwrap(),
            transport: transport.clone(),
        },
        message: rsip::SipMessage::Request(request),
    }
}

fn options_request(from_user: &str, call_id: &str) -> rsip::Request {
    let raw = format!(
        "OPTIONS sip:tandem@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK{call_id}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:{from_user}@example.com>;tag=ft-{call_id}\r\n\
         To: <sip:tandem@example.com>\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: 1 OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    );
    rsip::Request::try_from(raw.as_bytes()).unwrap()
}

fn in_dialog_request(method: &str, call_id: &str, seq: u32) -> rsip::Request {
    let raw = format!(
        "{method} sip:tandem@example.com SIP/2.0\r\n\
         Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bK{call_id}-{seq}\r\n\
         Max-Forwards: 70\r\n\
         From: <sip:alice@example.com>;tag=remote-{call_id}\r\n\
         To: <sip:tandem@example.com>;tag=local-{call_id}\r\n\
         Call-ID: {call_id}\r\n\
         CSeq: {seq} {method}\r\n\
         Content-Length: 0\r\n\r\n"
    );
    rsip::Request::try_from(raw.as_bytes()).unwrap()
}

/// Consumes every request, recording who it was attributed to.
struct Recorder {
    seen: Arc<Mutex<Vec<(String, String, u32)>>>,
}

#[async_trait]
impl RequestHandler for Recorder {
    fn name(&self) -> &'static str {
        "recorder"
    }

    async fn receive(
        &self,
        distributor: &Distributor,
        ctx: RequestContext,
    ) -> Option<RequestContext> {
        use rsip::prelude::*;

        let endpoint = ctx
            .endpoint
            .as_ref()
            .map(|e| e.id.clone())
            .unwrap_or_else(|| "<artificial>".into());

        let call_id = ctx
            .request
            .call_id_header()
            .map(|c| c.value().to_string())
            .unwrap_or_default();

        let seq = ctx
            .request
            .cseq_header()
            .ok()
            .and_then(|c| c.typed().ok())
            .map(|c| c.seq)
            .unwrap_or(0);

        self.seen.lock().push((endpoint, call_id, seq));

        let response =
            tandem_core::msg::response_for(&ctx.request, rsip::StatusCode::OK, true);
        let _ = ctx.respond(distributor.globals(), response).await;

        None
    }
}

async fn drain(core: &Core) {
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let _ = core.management.send_wait(async {}).await;
}

/// S3: identify-by-IP resolves requests from the permitted network; other
/// sources are tracked as unidentified and challenged.
#[tokio::test]
async fn identify_by_ip() {
    let core = Core::new(GlobalConfig::default(), SystemConfig::default());
    core.endpoints.apply(EndpointConfig::new("net1"));

    let mut identify = IdentifyConfig::new("net1-id", "net1");
    identify.matches = vec![Cidr::parse("10.0.0.0/24").unwrap()];
    core.identifies.apply(identify);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let distributor = Distributor::new(core.clone())
        .handler(Arc::new(Recorder { seen: seen.clone() }))
        .build();

    let (transport, sent) = collecting();

    // Permitted source
    distributor
        .deliver(received(
            options_request("anyone", "s3-a"),
            "10.0.0.7:5060",
            &transport,
        ))
        .await;
    drain(&core).await;

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].0, "net1");

    // Outside the permitted network: artificial endpoint, counted once
    distributor
        .deliver(received(
            options_request("anyone", "s3-b"),
            "10.0.1.1:5060",
            &transport,
        ))
        .await;
    drain(&core).await;

    assert_eq!(seen.lock().len(), 1, "unidentified request reached handler");
    assert_eq!(
        distributor.unidentified().count("10.0.1.1:5060".parse().unwrap()),
        1
    );

    // The unidentified source received a challenge
    let challenged = sent.lock().iter().any(|m| match m {
        rsip::SipMessage::Response(r) => r.status_code == rsip::StatusCode::Unauthorized,
        _ => false,
    });
    assert!(challenged);
}

/// Repeated unidentified traffic raises a security event at the
/// configured count.
#[tokio::test]
async fn unidentified_flood_raises_security_event() {
    let core = Core::new(GlobalConfig::default(), SystemConfig::default());
    let mut events = core.events.subscribe();

    let distributor = Distributor::new(core.clone()).build();
    let (transport, _sent) = collecting();

    let limit = core.global.read().unidentified_request_count;

    for i in 0..limit {
        distributor
            .deliver(received(
                options_request("scanner", &format!("flood-{i}")),
                "203.0.113.66:5060",
                &transport,
            ))
            .await;
    }
    drain(&core).await;

    let mut raised = 0;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Security(SecurityEvent::UnidentifiedRequest { source, count, .. }) =
            event.as_ref()
        {
            assert_eq!(source.ip().to_string(), "203.0.113.66");
            assert_eq!(*count, limit);
            raised += 1;
        }
    }
    assert_eq!(raised, 1);
}

/// The auth gate: challenge without credentials, pass with them, raise a
/// security event on bad ones.
#[tokio::test]
async fn auth_gate_outcomes() {
    let core = Core::new(GlobalConfig::default(), SystemConfig::default());

    let mut auth = AuthConfig::new("alice-auth");
    auth.username = "alice".into();
    auth.password = "hunter2".into();
    core.auths.apply(auth);

    let mut endpoint = EndpointConfig::new("alice");
    endpoint.auth = vec!["alice-auth".into()];
    core.endpoints.apply(endpoint);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let distributor = Distributor::new(core.clone())
        .handler(Arc::new(Recorder { seen: seen.clone() }))
        .build();

    let (transport, sent) = collecting();
    let mut events = core.events.subscribe();

    // No credentials: challenged, handler untouched
    distributor
        .deliver(received(
            options_request("alice", "auth-1"),
            "9.9.9.9:5060",
            &transport,
        ))
        .await;
    drain(&core).await;

    assert!(seen.lock().is_empty());
    let challenge = match sent.lock().last().cloned() {
        Some(rsip::SipMessage::Response(r)) => {
            assert_eq!(r.status_code, rsip::StatusCode::Unauthorized);
            r
        }
        other => panic!("expected challenge, got {other:?}"),
    };

    // Correct credentials pass the gate
    let mut credentials = tandem_core::auth::DigestCredentials::new();
    credentials.set_default(tandem_core::auth::DigestUser::new("alice", "hunter2"));
    let mut authenticator = tandem_core::auth::DigestAuthenticator::new(credentials);
    authenticator.handle_rejection(&challenge).unwrap();

    let mut request = options_request("alice", "auth-2");
    let uri = request.uri.clone();
    authenticator.authorize_request(&mut request.headers, &rsip::Method::Options, &uri);

    distributor
        .deliver(received(request, "9.9.9.9:5060", &transport))
        .await;
    drain(&core).await;

    assert_eq!(seen.lock().len(), 1);
    assert_eq!(seen.lock()[0].0, "alice");

    // Wrong credentials raise the failed-challenge event
    let mut credentials = tandem_core::auth::DigestCredentials::new();
    credentials.set_default(tandem_core::auth::DigestUser::new("alice", "wrong"));
    let mut authenticator = tandem_core::auth::DigestAuthenticator::new(credentials);

    distributor
        .deliver(received(
            options_request("alice", "auth-3"),
            "9.9.9.9:5060",
            &transport,
        ))
        .await;
    drain(&core).await;

    let challenge = match sent.lock().last().cloned() {
        Some(rsip::SipMessage::Response(r)) => r,
        other => panic!("expected challenge, got {other:?}"),
    };
    authenticator.handle_rejection(&challenge).unwrap();

    let mut request = options_request("alice", "auth-4");
    let uri = request.uri.clone();
    authenticator.authorize_request(&mut request.headers, &rsip::Method::Options, &uri);

    distributor
        .deliver(received(request, "9.9.9.9:5060", &transport))
        .await;
    drain(&core).await;

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if let CoreEvent::Security(SecurityEvent::ChallengeResponseFailed { endpoint, .. }) =
            event.as_ref()
        {
            assert_eq!(endpoint, "alice");
            failed = true;
        }
    }
    assert!(failed);
}

/// S7: within one dialog, observation order matches arrival order.
#[tokio::test]
async fn in_dialog_ordering_is_preserved() {
    let core = Core::new(GlobalConfig::default(), SystemConfig::default());
    core.endpoints.apply(EndpointConfig::new("alice"));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let distributor = Distributor::new(core.clone())
        .handler(Arc::new(Recorder { seen: seen.clone() }))
        .build();

    let (transport, _sent) = collecting();

    // Two established dialogs on two different serializers
    for dialog in ["dlg-a", "dlg-b"] {
        let key = DialogKey {
            call_id: dialog.into(),
            local_tag: format!("local-{dialog}"),
            remote_tag: format!("remote-{dialog}"),
        };
        let serializer = core
            .serializers
            .get_or_create(&format!("dialog/{dialog}"), &core.shutdown_group);
        distributor.dialogs().assign(key, serializer);
    }

    // Interleave 100 in-dialog requests
    for seq in 1..=50u32 {
        for dialog in ["dlg-a", "dlg-b"] {
            let method = if seq % 2 == 0 { "INFO" } else { "BYE" };
            distributor
                .deliver(received(
                    in_dialog_request(method, dialog, seq),
                    "1.2.3.4:5060",
                    &transport,
                ))
                .await;
        }
    }

    drain(&core).await;

    let seen = seen.lock();
    assert_eq!(seen.len(), 100);

    for dialog in ["dlg-a", "dlg-b"] {
        let sequence: Vec<u32> = seen
            .iter()
            .filter(|(_, call_id, _)| call_id == dialog)
            .map(|(_, _, seq)| *seq)
            .collect();

        assert_eq!(sequence, (1..=50).collect::<Vec<_>>(), "{dialog}");
    }
}

/// Back-pressure: past 3x the high-water mark new requests get 503 and no
/// task is enqueued.
#[tokio::test]
async fn overload_sheds_with_503() {
    let mut system = SystemConfig::default();
    system.threadpool_size = 1;
    system.threadpool_queue_high_water = 1;

    let core = Core::new(GlobalConfig::default(), system);
    core.endpoints.apply(EndpointConfig::new("alice"));

    let gate = Arc::new(tokio::sync::Notify::new());

    struct Blocker {
        gate: Arc<tokio::sync::Notify>,
        handled: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl RequestHandler for Blocker {
        fn name(&self) -> &'static str {
            "blocker"
        }

        async fn receive(
            &self,
            _distributor: &Distributor,
            _ctx: RequestContext,
        ) -> Option<RequestContext> {
            *self.handled.lock() += 1;
            self.gate.notified().await;
            None
        }
    }

    let handled = Arc::new(Mutex::new(0));
    let distributor = Distributor::new(core.clone())
        .handler(Arc::new(Blocker {
            gate: gate.clone(),
            handled: handled.clone(),
        }))
        .build();

    let (transport, sent) = collecting();

    // Fill the single serializer: one running plus a queue beyond 3x
    for i in 0..5 {
        distributor
            .deliver(received(
                options_request("alice", &format!("fill-{i}")),
                "1.2.3.4:5060",
                &transport,
            ))
            .await;
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // The pool now holds > 3 x high_water tasks; the next request is shed
    distributor
        .deliver(received(
            options_request("alice", "shed-me"),
            "1.2.3.4:5060",
            &transport,
        ))
        .await;

    let shed = sent.lock().iter().any(|m| match m {
        rsip::SipMessage::Response(r) => {
            r.status_code == rsip::StatusCode::ServiceUnavailable
        }
        _ => false,
    });
    assert!(shed);
    assert_eq!(*handled.lock(), 1, "only the running task reached a handler");

    // Unblock so shutdown is clean
    for _ in 0..10 {
        gate.notify_waiters();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

/// Full pipeline: a REGISTER travels through identification and the gate
/// into the registrar.
#[tokio::test]
async fn register_reaches_the_registrar() {
    use tandem_registrar::Registrar;

    let core = Core::new(GlobalConfig::default(), SystemConfig::default());

    let mut aor = tandem_core::config::AorConfig::new("alice");
    aor.max_contacts = 1;
    core.aors.apply(aor);

    let mut endpoint = EndpointConfig::new("alice");
    endpoint.aors = vec!["alice".into()];
    core.endpoints.apply(endpoint);

    struct RegistrarHandler {
        registrar: Registrar,
    }

    #[async_trait]
    impl RequestHandler for RegistrarHandler {
        fn name(&self) -> &'static str {
            "registrar"
        }

        async fn receive(
            &self,
            distributor: &Distributor,
            ctx: RequestContext,
        ) -> Option<RequestContext> {
            if ctx.request.method != rsip::Method::Register {
                return Some(ctx);
            }

            let Some(endpoint) = ctx.endpoint.clone() else {
                return Some(ctx);
            };

            let response = self
                .registrar
                .handle_register(&ctx.request, &endpoint, Some(ctx.tp_info.source))
                .await;
            let _ = ctx.respond(distributor.globals(), response).await;

            None
        }
    }

    let distributor = Distributor::new(core.clone())
        .handler(Arc::new(RegistrarHandler {
            registrar: Registrar::new(core.clone()),
        }))
        .build();

    let (transport, sent) = collecting();

    let raw = "REGISTER sip:example.com SIP/2.0\r\n\
               Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKreg1\r\n\
               Max-Forwards: 70\r\n\
               From: <sip:alice@example.com>;tag=ft\r\n\
               To: <sip:alice@example.com>\r\n\
               Call-ID: reg-call\r\n\
               CSeq: 1 REGISTER\r\n\
               Contact: <sip:alice@1.2.3.4:5060>;expires=120\r\n\
               Content-Length: 0\r\n\r\n";
    let request = rsip::Request::try_from(raw.as_bytes()).unwrap();

    distributor
        .deliver(received(request, "1.2.3.4:5060", &transport))
        .await;
    drain(&core).await;

    match sent.lock().last() {
        Some(rsip::SipMessage::Response(response)) => {
            assert_eq!(response.status_code, rsip::StatusCode::OK);
        }
        other => panic!("expected 200 OK, got {other:?}"),
    }

    assert_eq!(core.contacts.len(), 1);
    let contact = core.contacts.all().pop().unwrap();
    assert_eq!(contact.aor, "alice");
    assert_eq!(contact.endpoint_name.as_deref(), Some("alice"));
}
