use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use tandem_core::Core;
use tandem_core::config::{AorConfig, AuthConfig, EndpointConfig, GlobalConfig, SystemConfig};
use tandem_core::transport::Udp;
use tandem_distributor::{Distributor, RequestContext, RequestHandler};
use tandem_registrar::{AvailabilityEngine, Registrar};

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

struct OptionsHandler {
    engine: Arc<AvailabilityEngine>,
}

#[async_trait]
impl RequestHandler for OptionsHandler {
    fn name(&self) -> &'static str {
        "options"
    }

    async fn receive(
        &self,
        distributor: &Distributor,
        ctx: RequestContext,
    ) -> Option<RequestContext> {
        if ctx.request.method != rsip::Method::Options {
            return Some(ctx);
        }

        let response = self.engine.handle_options(&ctx.request);
        let _ = ctx.respond(distributor.globals(), response).await;

        None
    }
}

/// Serve REGISTER and OPTIONS for the endpoint `alice` on UDP 5060.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let core = Core::new(GlobalConfig::default(), SystemConfig::default());

    let mut aor = AorConfig::new("alice");
    aor.max_contacts = 3;
    core.aors.apply(aor);

    let mut auth = AuthConfig::new("alice-auth");
    auth.username = "alice".into();
    auth.password = "hunter2".into();
    core.auths.apply(auth);

    let mut endpoint = EndpointConfig::new("alice");
    endpoint.aors = vec!["alice".into()];
    endpoint.auth = vec!["alice-auth".into()];
    core.endpoints.apply(endpoint);

    let availability = AvailabilityEngine::start(core.clone()).await;
    let registrar = Registrar::new(core.clone());
    registrar.locator().spawn_expiration_reaper();

    let distributor = Distributor::new(core.clone())
        .handler(Arc::new(RegistrarHandler { registrar }))
        .handler(Arc::new(OptionsHandler {
            engine: availability,
        }))
        .build();

    let (tx, rx) = mpsc::channel(64);
    let transport = Udp::spawn("udp0", "0.0.0.0:5060", tx, &core.shutdown_group).await?;
    core.transports.register(transport);
    distributor.spawn(rx);

    log::info!("listening on udp 0.0.0.0:5060");
    tokio::signal::ctrl_c().await?;

    core.shutdown(Duration::from_secs(10)).await;
    Ok(())
}
