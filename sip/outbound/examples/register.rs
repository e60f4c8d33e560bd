use std::time::Duration;
use tokio::sync::mpsc;

use tandem_core::Core;
use tandem_core::config::{AuthConfig, GlobalConfig, SystemConfig};
use tandem_core::transport::Udp;
use tandem_outbound::{OutboundRegistrationEngine, RegistrationConfig};

/// Register `sip:100@<server>` against a remote registrar:
///
/// ```sh
/// cargo run --example register -- sip:registrar.example.com 100 hunter2
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let server = args.next().unwrap_or_else(|| "sip:127.0.0.1:5060".into());
    let user = args.next().unwrap_or_else(|| "100".into());
    let password = args.next().unwrap_or_default();

    let core = Core::new(GlobalConfig::default(), SystemConfig::default());

    // Responses are fed back through the request distributor in the full
    // stack; a bare example can loop them into the pending table directly
    let (tx, mut rx) = mpsc::channel(32);
    let transport = Udp::spawn("udp0", "0.0.0.0:5060", tx, &core.shutdown_group).await?;
    core.transports.register(transport);

    let loop_core = core.clone();
    core.shutdown_group.spawn(async move {
        while let Some(message) = rx.recv().await {
            if let rsip::SipMessage::Response(response) = message.message {
                loop_core.requester.pending().handle_response(&response);
            }
        }
    });

    if !password.is_empty() {
        let mut auth = AuthConfig::new("reg-auth");
        auth.username = user.clone();
        auth.password = password;
        core.auths.apply(auth);
    }

    let engine = OutboundRegistrationEngine::new(core.clone());

    let mut config = RegistrationConfig::new(
        "example",
        server.clone(),
        format!("sip:{user}@{}", server.trim_start_matches("sip:")),
    );
    config.outbound_auth = vec!["reg-auth".into()];
    engine.apply(config)?;

    let mut events = core.events.subscribe();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = async {
            while let Ok(event) = events.recv().await {
                println!("{event:?}");
            }
        } => {}
    }

    // Unregister and drain on the way out
    engine.remove("example").await;
    core.shutdown(Duration::from_secs(10)).await;

    Ok(())
}
