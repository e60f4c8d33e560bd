//! Endpoint identification.
//!
//! Identifiers are consulted in configuration order until one resolves an
//! endpoint. The set and their order are part of the platform design, not
//! an accident of registration order.

use parking_lot::Mutex;
use rsip::Param;
use rsip::prelude::*;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tandem_core::Core;
use tandem_core::config::{EndpointConfig, IdentifyMethod};

/// One identification strategy.
pub trait EndpointIdentifier: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn identify(
        &self,
        core: &Core,
        request: &rsip::Request,
        source: SocketAddr,
    ) -> Option<Arc<EndpointConfig>>;
}

/// Matches the From-URI user part against endpoint ids.
pub struct UsernameIdentifier;

impl EndpointIdentifier for UsernameIdentifier {
    fn name(&self) -> &'static str {
        "username"
    }

    fn identify(
        &self,
        core: &Core,
        request: &rsip::Request,
        _source: SocketAddr,
    ) -> Option<Arc<EndpointConfig>> {
        let user = tandem_core::msg::from_user(request)?;

        let endpoint = core.endpoints.get(&user)?;
        endpoint
            .identify_by
            .contains(&IdentifyMethod::Username)
            .then_some(endpoint)
    }
}

/// Matches the Authorization username against configured inbound auth
/// sections.
pub struct AuthUsernameIdentifier;

impl EndpointIdentifier for AuthUsernameIdentifier {
    fn name(&self) -> &'static str {
        "auth_username"
    }

    fn identify(
        &self,
        core: &Core,
        request: &rsip::Request,
        _source: SocketAddr,
    ) -> Option<Arc<EndpointConfig>> {
        let username = request.headers.iter().find_map(|h| match h {
            rsip::Header::Authorization(authorization) => {
                tandem_core::auth::authorization_username(authorization.value())
            }
            _ => None,
        })?;

        for endpoint in core.endpoints.all() {
            if !endpoint.identify_by.contains(&IdentifyMethod::AuthUsername) {
                continue;
            }

            let matches = core
                .resolve_auths(&endpoint.auth)
                .iter()
                .any(|auth| auth.username == username);

            if matches {
                return Some(endpoint);
            }
        }

        None
    }
}

/// Matches the source address (or a configured header) against `identify`
/// sections.
///
/// Hostname permits are resolved out of band via [`IpIdentifier::resolve`];
/// the identify path itself never blocks on DNS.
pub struct IpIdentifier {
    resolved: Mutex<HashMap<String, Vec<IpAddr>>>,
}

impl Default for IpIdentifier {
    fn default() -> Self {
        Self::new()
    }
}

impl IpIdentifier {
    pub fn new() -> Self {
        Self {
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the hostname permits of every identify section, optionally
    /// including `_sip._udp`/`_sip._tcp`/`_sips._tcp` SRV targets.
    pub async fn resolve(&self, core: &Core) {
        let resolver = match hickory_resolver::TokioResolver::builder_tokio() {
            Ok(builder) => builder.build(),
            Err(e) => {
                log::warn!("cannot build DNS resolver for identify sections: {e}");
                return;
            }
        };

        for identify in core.identifies.all() {
            let mut addrs = Vec::new();

            for host in &identify.hostnames {
                let mut names = vec![host.clone()];

                if identify.srv_lookups {
                    for service in ["_sip._udp", "_sip._tcp", "_sips._tcp"] {
                        if let Ok(srv) = resolver.srv_lookup(format!("{service}.{host}.")).await {
                            names.extend(srv.iter().map(|r| r.target().to_utf8()));
                        }
                    }
                }

                for name in names {
                    match resolver.lookup_ip(name.as_str()).await {
                        Ok(lookup) => addrs.extend(lookup.iter()),
                        Err(e) => {
                            log::warn!("identify {}: cannot resolve {name}: {e}", identify.id)
                        }
                    }
                }
            }

            self.resolved.lock().insert(identify.id.clone(), addrs);
        }
    }
}

impl EndpointIdentifier for IpIdentifier {
    fn name(&self) -> &'static str {
        "ip"
    }

    fn identify(
        &self,
        core: &Core,
        request: &rsip::Request,
        source: SocketAddr,
    ) -> Option<Arc<EndpointConfig>> {
        let mut identifies = core.identifies.all();
        identifies.sort_by(|a, b| a.id.cmp(&b.id));

        for identify in identifies {
            let mut matched = identify.matches.iter().any(|net| net.contains(source.ip()));

            if !matched
                && let Some(resolved) = self.resolved.lock().get(&identify.id)
            {
                matched = resolved.contains(&source.ip());
            }

            if !matched
                && let Some((name, value)) = &identify.match_header
            {
                let wanted = format!("{name}: {value}");
                matched = request
                    .headers
                    .iter()
                    .any(|h| h.to_string().eq_ignore_ascii_case(&wanted));
            }

            if matched {
                let endpoint = core.endpoints.get(&identify.endpoint);
                if endpoint.is_none() {
                    log::warn!(
                        "identify {} matched but endpoint {} does not exist",
                        identify.id,
                        identify.endpoint
                    );
                }
                return endpoint;
            }
        }

        None
    }
}

/// Matches a `;line=<token>` URI parameter against the outbound
/// registration line bindings.
pub struct LineIdentifier;

impl LineIdentifier {
    fn line_of(uri: &rsip::Uri) -> Option<String> {
        uri.params.iter().find_map(|p| match p {
            Param::Other(name, Some(value)) if name.value().eq_ignore_ascii_case("line") => {
                Some(value.value().to_string())
            }
            _ => None,
        })
    }
}

impl EndpointIdentifier for LineIdentifier {
    fn name(&self) -> &'static str {
        "line"
    }

    fn identify(
        &self,
        core: &Core,
        request: &rsip::Request,
        _source: SocketAddr,
    ) -> Option<Arc<EndpointConfig>> {
        let token = Self::line_of(&request.uri).or_else(|| {
            let to = request.to_header().ok()?.typed().ok()?;
            Self::line_of(&to.uri)
        })?;

        let binding = core.lines.lookup(&token)?;
        core.endpoints.get(&binding.endpoint)
    }
}

/// The default identifier chain: line bindings first (most specific),
/// then source address rules, then the username based strategies.
pub fn default_identifiers() -> Vec<Arc<dyn EndpointIdentifier>> {
    vec![
        Arc::new(LineIdentifier),
        Arc::new(IpIdentifier::new()),
        Arc::new(UsernameIdentifier),
        Arc::new(AuthUsernameIdentifier),
    ]
}
