//! Qualify cycle and endpoint state composition.

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tandem_core::Core;
use tandem_core::config::{AorConfig, EndpointConfig, GlobalConfig, SystemConfig, TransportProtocol};
use tandem_core::msg::response_for;
use tandem_core::status::ContactStatusKind;
use tandem_core::transport::{Transport, TpHandle};
use tandem_registrar::{AvailabilityEngine, BindingSource, Locator};

/// Answers every OPTIONS it is asked to send, unless muted.
struct EchoTransport {
    core: Core,
    muted: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for EchoTransport {
    fn name(&self) -> &str {
        "echo"
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
        if self.muted.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Ok(request) = rsip::Request::try_from(bytes) {
            let response = response_for(&request, rsip::StatusCode::OK, true);
            self.core.requester.pending().handle_response(&response);
        }

        Ok(())
    }
}

impl fmt::Debug for EchoTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EchoTransport").finish()
    }
}

impl fmt::Display for EchoTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UDP:echo")
    }
}

fn core() -> Core {
    Core::new(GlobalConfig::default(), SystemConfig::default())
}

async fn settle(core: &Core) {
    // Let management finish structural work
    let _ = core.management.send_wait(async {}).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Unqualified AORs: availability is simply "has contacts", and the
/// endpoint state follows it.
#[tokio::test]
async fn unqualified_aor_follows_contact_count() {
    let core = core();
    let locator = Locator::new(core.clone());

    let mut aor = AorConfig::new("alice");
    aor.max_contacts = 2;
    let aor = core.aors.apply(aor);

    let mut endpoint = EndpointConfig::new("alice-phone");
    endpoint.aors = vec!["alice".into()];

    let _engine = AvailabilityEngine::start(core.clone()).await;
    core.endpoints.apply(endpoint);
    settle(&core).await;

    // No contacts yet: offline
    assert!(!core.persistent_endpoints.get("alice-phone").unwrap().online);

    let added = locator.add_contact(
        &aor,
        "sip:alice@1.2.3.4",
        chrono::Utc::now() + chrono::Duration::seconds(600),
        &BindingSource::default(),
    );
    settle(&core).await;

    assert!(core.persistent_endpoints.get("alice-phone").unwrap().online);

    locator.delete_contact(&added);
    settle(&core).await;

    assert!(!core.persistent_endpoints.get("alice-phone").unwrap().online);
}

/// Qualified AORs: reachability reflects OPTIONS results, and losing the
/// last reachable contact flips the endpoint offline.
#[tokio::test(start_paused = true)]
async fn qualify_cycle_drives_reachability() {
    let core = core();
    let locator = Locator::new(core.clone());

    let muted = Arc::new(AtomicBool::new(false));
    core.transports.register(TpHandle::new(EchoTransport {
        core: core.clone(),
        muted: muted.clone(),
    }));

    let mut aor = AorConfig::new("bob");
    aor.max_contacts = 1;
    aor.qualify_frequency = 30;
    aor.qualify_timeout = Duration::from_secs(3);
    let aor = core.aors.apply(aor);

    let mut endpoint = EndpointConfig::new("bob-phone");
    endpoint.aors = vec!["bob".into()];

    let _engine = AvailabilityEngine::start(core.clone()).await;
    core.endpoints.apply(endpoint);
    settle(&core).await;

    let contact = locator.add_contact(
        &aor,
        "sip:bob@192.0.2.5:5060",
        chrono::Utc::now() + chrono::Duration::seconds(3600),
        &BindingSource::default(),
    );

    // The new contact is probed immediately
    settle(&core).await;
    let status = core.contact_status.get(&contact.id).unwrap();
    assert_eq!(status.status, ContactStatusKind::Reachable);
    assert!(core.persistent_endpoints.get("bob-phone").unwrap().online);

    // Stop answering; within 2 cycles + timeout the contact must drop
    muted.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(2 * 30 + 3 + 1)).await;
    settle(&core).await;

    let status = core.contact_status.get(&contact.id).unwrap();
    assert_eq!(status.status, ContactStatusKind::Unreachable);
    assert_eq!(status.last_status, ContactStatusKind::Reachable);
    assert!(!core.persistent_endpoints.get("bob-phone").unwrap().online);

    // Recovery works the same way
    muted.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(31)).await;
    settle(&core).await;

    let status = core.contact_status.get(&contact.id).unwrap();
    assert_eq!(status.status, ContactStatusKind::Reachable);
    assert!(core.persistent_endpoints.get("bob-phone").unwrap().online);
}

/// Endpoint aggregation over two AORs: online iff any AOR is available.
#[tokio::test]
async fn endpoint_state_aggregates_over_aors() {
    let core = core();
    let locator = Locator::new(core.clone());

    let mut home = AorConfig::new("carol-home");
    home.max_contacts = 1;
    let home = core.aors.apply(home);

    let mut office = AorConfig::new("carol-office");
    office.max_contacts = 1;
    let office = core.aors.apply(office);

    let mut endpoint = EndpointConfig::new("carol");
    endpoint.aors = vec!["carol-home".into(), "carol-office".into()];

    let _engine = AvailabilityEngine::start(core.clone()).await;
    core.endpoints.apply(endpoint);
    settle(&core).await;

    let home_contact = locator.add_contact(
        &home,
        "sip:carol@10.0.0.1",
        chrono::Utc::now() + chrono::Duration::seconds(600),
        &BindingSource::default(),
    );
    let office_contact = locator.add_contact(
        &office,
        "sip:carol@10.0.0.2",
        chrono::Utc::now() + chrono::Duration::seconds(600),
        &BindingSource::default(),
    );
    settle(&core).await;

    assert!(core.persistent_endpoints.get("carol").unwrap().online);

    // One AOR emptying keeps the endpoint online
    locator.delete_contact(&home_contact);
    settle(&core).await;
    assert!(core.persistent_endpoints.get("carol").unwrap().online);

    // Both empty: offline
    locator.delete_contact(&office_contact);
    settle(&core).await;
    assert!(!core.persistent_endpoints.get("carol").unwrap().online);
}

/// Incoming OPTIONS to a known endpoint gets a 200 with capabilities.
#[tokio::test]
async fn incoming_options_is_answered() {
    let core = core();
    let engine = AvailabilityEngine::start(core.clone()).await;

    let raw = "OPTIONS sip:tandem@example.com SIP/2.0\r\n\
               Via: SIP/2.0/UDP 1.2.3.4:5060;branch=z9hG4bKopts\r\n\
               Max-Forwards: 70\r\n\
               From: <sip:probe@example.com>;tag=t\r\n\
               To: <sip:tandem@example.com>\r\n\
               Call-ID: options-1\r\n\
               CSeq: 1 OPTIONS\r\n\
               Content-Length: 0\r\n\r\n";
    let request = rsip::Request::try_from(raw.as_bytes()).unwrap();

    let response = engine.handle_options(&request);
    assert_eq!(response.status_code, rsip::StatusCode::OK);
    assert!(
        response
            .headers
            .iter()
            .any(|h| matches!(h, rsip::Header::Allow(_)))
    );
}
