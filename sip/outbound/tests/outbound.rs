//! Outbound registration state machine scenarios.

use async_trait::async_trait;
use parking_lot::Mutex;
use rsip::prelude::*;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tandem_core::Core;
use tandem_core::auth::{CheckAuthResult, DigestVerifier};
use tandem_core::config::{AuthConfig, GlobalConfig, SystemConfig, TransportProtocol};
use tandem_core::events::RegistrationLabel;
use tandem_core::msg::response_for;
use tandem_core::transport::{Transport, TpHandle};
use tandem_outbound::{OutboundRegistrationEngine, RegistrationConfig, SecurityNegotiation};

type Handler = dyn Fn(&rsip::Request, usize) -> Option<rsip::Response> + Send + Sync;

/// A scripted far-end registrar.
struct ScriptedRegistrar {
    core: Core,
    reliable: bool,
    handler: Box<Handler>,
    requests: Arc<Mutex<Vec<(Instant, rsip::Request)>>>,
}

impl ScriptedRegistrar {
    fn install(
        core: &Core,
        reliable: bool,
        handler: impl Fn(&rsip::Request, usize) -> Option<rsip::Response> + Send + Sync + 'static,
    ) -> (TpHandle, Arc<Mutex<Vec<(Instant, rsip::Request)>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let transport = TpHandle::new(ScriptedRegistrar {
            core: core.clone(),
            reliable,
            handler: Box::new(handler),
            requests: requests.clone(),
        });
        core.transports.register(transport.clone());
        (transport, requests)
    }
}

#[async_trait]
impl Transport for ScriptedRegistrar {
    fn name(&self) -> &str {
        "scripted"
    }

    fn protocol(&self) -> TransportProtocol {
        if self.reliable {
            TransportProtocol::Tcp
        } else {
            TransportProtocol::Udp
        }
    }

    fn reliable(&self) -> bool {
        self.reliable
    }

    fn bound(&self) -> SocketAddr {
        "127.0.0.1:5061".parse().unwrap()
    }

    fn sent_by(&self) -> SocketAddr {
        "198.51.100.10:5061".parse().unwrap()
    }

    async fn send(&self, bytes: &[u8], _target: SocketAddr) -> std::io::Result<()> {
        let Ok(request) = rsip::Request::try_from(bytes) else {
            return Ok(());
        };

        let n = {
            let mut requests = self.requests.lock();
            requests.push((Instant::now(), request.clone()));
            requests.len()
        };

        if let Some(response) = (self.handler)(&request, n) {
            self.core.requester.pending().handle_response(&response);
        }

        Ok(())
    }
}

impl fmt::Debug for ScriptedRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedRegistrar").finish()
    }
}

impl fmt::Display for ScriptedRegistrar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:scripted", if self.reliable { "TCP" } else { "UDP" })
    }
}

fn core() -> Core {
    Core::new(GlobalConfig::default(), SystemConfig::default())
}

fn config(id: &str) -> RegistrationConfig {
    let mut config =
        RegistrationConfig::new(id, "sip:192.0.2.10:5060", "sip:100@192.0.2.10");
    // Deterministic 1s initial delay
    config.max_random_initial_delay = 1;
    config
}

fn ok_with_expires(request: &rsip::Request, expires: u32) -> rsip::Response {
    let mut response = response_for(request, rsip::StatusCode::OK, true);
    response
        .headers
        .push(rsip::Header::Expires(expires.to_string().into()));
    response
}

fn request_expires(request: &rsip::Request) -> Option<u32> {
    tandem_core::msg::expires_header(&request.headers)
}

#[tokio::test(start_paused = true)]
async fn registers_and_refreshes() {
    let core = core();
    let (_tp, requests) =
        ScriptedRegistrar::install(&core, false, |req, _| Some(ok_with_expires(req, 60)));

    let engine = OutboundRegistrationEngine::new(core.clone());
    engine.apply(config("trunk")).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let state = engine.state("trunk").unwrap();
    assert_eq!(state.label(), RegistrationLabel::Registered);
    assert_eq!(requests.lock().len(), 1);

    // Refresh fires at expiration - 10s
    tokio::time::sleep(Duration::from_secs(51)).await;
    let log = requests.lock();
    assert_eq!(log.len(), 2);

    let delta = log[1].0.duration_since(log[0].0);
    assert_eq!(delta.as_secs(), 50);

    // The binding carries our contact with the configured expiration
    assert_eq!(request_expires(&log[0].1), Some(3600));
}

/// S4: 403 with forbidden_retry_interval=30 retries exactly 30s later.
#[tokio::test(start_paused = true)]
async fn forbidden_retry_interval_is_honoured() {
    let core = core();
    let (_tp, requests) = ScriptedRegistrar::install(&core, false, |req, _| {
        Some(response_for(req, rsip::StatusCode::Forbidden, true))
    });

    let engine = OutboundRegistrationEngine::new(core.clone());
    let mut config = config("trunk");
    config.forbidden_retry_interval = 30;
    config.max_retries = 5;
    engine.apply(config).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let state = engine.state("trunk").unwrap();
    assert_eq!(state.label(), RegistrationLabel::Rejected);
    assert_eq!(requests.lock().len(), 1);

    tokio::time::sleep(Duration::from_secs(31)).await;

    let log = requests.lock();
    assert_eq!(log.len(), 2);
    let delta = log[1].0.duration_since(log[0].0).as_secs();
    assert!((29..=31).contains(&delta), "retried after {delta}s");
}

/// Retry bound: a persistently failing registration gives up after
/// max_retries + 1 attempts with retry_interval between them.
#[tokio::test(start_paused = true)]
async fn retry_bound_reaches_rejected() {
    let core = core();
    let (_tp, requests) = ScriptedRegistrar::install(&core, false, |req, _| {
        Some(response_for(req, rsip::StatusCode::ServiceUnavailable, true))
    });

    let engine = OutboundRegistrationEngine::new(core.clone());
    let mut config = config("trunk");
    config.retry_interval = 10;
    config.max_retries = 3;
    engine.apply(config).unwrap();

    // Initial attempt + 3 retries, then permanent rejection
    tokio::time::sleep(Duration::from_secs(2 + 4 * 10)).await;

    assert_eq!(requests.lock().len(), 4);

    let state = engine.state("trunk").unwrap();
    assert_eq!(state.label(), RegistrationLabel::Rejected);
    assert_eq!(
        state.status(),
        tandem_outbound::RegistrationStatus::RejectedPermanent
    );

    // No further attempts once permanently rejected
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(requests.lock().len(), 4);

    let log = requests.lock();
    for pair in log.windows(2) {
        assert_eq!(pair[1].0.duration_since(pair[0].0).as_secs(), 10);
    }
}

#[tokio::test(start_paused = true)]
async fn digest_challenge_is_answered() {
    let core = core();

    let mut auth = AuthConfig::new("trunk-auth");
    auth.username = "100".into();
    auth.password = "hunter2".into();
    auth.realm = Some("registrar".into());
    let stored = core.auths.apply(auth);

    let verifier = Arc::new(DigestVerifier::new("registrar", Duration::from_secs(300)));

    let (_tp, requests) = ScriptedRegistrar::install(&core, false, {
        let verifier = verifier.clone();
        move |req, _| match verifier.verify(req, &[&stored]) {
            CheckAuthResult::Success => Some(ok_with_expires(req, 60)),
            CheckAuthResult::Challenge(response) | CheckAuthResult::Failed(response) => {
                Some(response)
            }
            CheckAuthResult::Error => None,
        }
    });

    let engine = OutboundRegistrationEngine::new(core.clone());
    let mut config = config("trunk");
    config.outbound_auth = vec!["trunk-auth".into()];
    engine.apply(config).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let state = engine.state("trunk").unwrap();
    assert_eq!(state.label(), RegistrationLabel::Registered);

    // Challenge round trip: 401 then authenticated REGISTER
    let log = requests.lock();
    assert_eq!(log.len(), 2);
    assert!(
        log[1]
            .1
            .headers
            .iter()
            .any(|h| matches!(h, rsip::Header::Authorization(_)))
    );
}

#[tokio::test(start_paused = true)]
async fn remove_unregisters_first() {
    let core = core();
    let (_tp, requests) =
        ScriptedRegistrar::install(&core, false, |req, _| Some(ok_with_expires(req, 3600)));

    let engine = OutboundRegistrationEngine::new(core.clone());
    engine.apply(config("trunk")).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        engine.state("trunk").unwrap().label(),
        RegistrationLabel::Registered
    );

    engine.remove("trunk").await;
    assert!(engine.state("trunk").is_none());

    let log = requests.lock();
    assert_eq!(log.len(), 2);
    assert_eq!(request_expires(&log[1].1), Some(0));
}

/// S5: transport shutdown triggers an immediate re-REGISTER.
#[tokio::test(start_paused = true)]
async fn transport_shutdown_reregisters() {
    let core = core();
    let (tp, requests) =
        ScriptedRegistrar::install(&core, true, |req, _| Some(ok_with_expires(req, 3600)));

    let engine = OutboundRegistrationEngine::new(core.clone());
    engine.apply(config("trunk")).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(requests.lock().len(), 1);

    core.monitor.notify_shutdown(&tp);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(requests.lock().len(), 2);
    assert_eq!(
        engine.state("trunk").unwrap().label(),
        RegistrationLabel::Registered
    );

    // The refresh reschedules from the new registration, not the old one
    let log = requests.lock();
    let delta = log[1].0.duration_since(log[0].0);
    assert!(delta < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn line_token_is_allocated_and_stamped() {
    let core = core();
    let (_tp, requests) =
        ScriptedRegistrar::install(&core, false, |req, _| Some(ok_with_expires(req, 60)));

    let engine = OutboundRegistrationEngine::new(core.clone());
    let mut config = config("trunk");
    config.line = true;
    config.endpoint = Some("trunk-endpoint".into());
    engine.apply(config).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let token = engine.state("trunk").unwrap().line_token().unwrap();
    assert_eq!(token.len(), 8);

    let binding = core.lines.lookup(&token).unwrap();
    assert_eq!(binding.registration, "trunk");
    assert_eq!(binding.endpoint, "trunk-endpoint");

    let log = requests.lock();
    let contact = log[0]
        .1
        .headers
        .iter()
        .find_map(|h| match h {
            rsip::Header::Contact(c) => Some(c.value().to_string()),
            _ => None,
        })
        .unwrap();
    assert!(contact.contains(&format!(";line={token}")), "{contact}");
}

#[tokio::test(start_paused = true)]
async fn mediasec_round_trip() {
    let core = core();

    let (_tp, requests) = ScriptedRegistrar::install(&core, false, |req, n| {
        if n == 1 {
            let mut response = response_for(req, rsip::StatusCode::Unauthorized, true);
            response.headers.push(rsip::Header::Other(
                "Security-Server".into(),
                "msrp-tls".into(),
            ));
            response.headers.push(rsip::Header::Other(
                "Security-Server".into(),
                "sdes-srtp".into(),
            ));
            response.headers.push(rsip::Header::WwwAuthenticate(
                "Digest realm=\"registrar\", nonce=\"abc\", algorithm=MD5, qop=\"auth\"".into(),
            ));
            Some(response)
        } else {
            Some(ok_with_expires(req, 60))
        }
    });

    let mut auth = AuthConfig::new("trunk-auth");
    auth.username = "100".into();
    auth.password = "hunter2".into();
    auth.realm = Some("registrar".into());
    core.auths.apply(auth);

    let engine = OutboundRegistrationEngine::new(core.clone());
    let mut config = config("trunk");
    config.security_negotiation = SecurityNegotiation::Mediasec;
    config.security_mechanisms = vec!["sdes-srtp".into()];
    config.outbound_auth = vec!["trunk-auth".into()];
    engine.apply(config).unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;

    let log = requests.lock();
    assert!(log.len() >= 2);

    // First request offers Security-Client, the retry echoes the server's
    // mechanisms in Security-Verify
    let first = &log[0].1;
    assert_eq!(
        tandem_core::msg::other_headers(&first.headers, "Security-Client"),
        vec!["sdes-srtp".to_string()]
    );

    let second = &log[1].1;
    assert_eq!(
        tandem_core::msg::other_headers(&second.headers, "Security-Verify"),
        vec!["msrp-tls".to_string(), "sdes-srtp".to_string()]
    );

    assert_eq!(
        engine.state("trunk").unwrap().security_servers(),
        vec!["msrp-tls".to_string(), "sdes-srtp".to_string()]
    );
}
