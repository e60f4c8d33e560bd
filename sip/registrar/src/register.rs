//! Inbound REGISTER handling.
//!
//! All mutations for one REGISTER happen on the `registrar:<aor>`
//! serializer, making the whole apply atomic with respect to concurrent
//! REGISTERs for the same AOR.

use chrono::{DateTime, Utc};
use rsip::prelude::*;
use rsip::{Header, Param, Scheme, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;

use tandem_core::Core;
use tandem_core::config::{AorConfig, Contact, EndpointConfig};
use tandem_core::events::CoreEvent;
use tandem_core::msg::{self, response_for};

use crate::location::{BindingSource, Locator};

/// The inbound registrar.
#[derive(Clone)]
pub struct Registrar {
    core: Core,
    locator: Locator,
}

/// One Contact header of a REGISTER, pre-parsed.
enum ContactHeader {
    Star { expiration: u32 },
    Uri { uri: String, expiration: u32 },
}

impl Registrar {
    pub fn new(core: Core) -> Self {
        let locator = Locator::new(core.clone());
        Self { core, locator }
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// Apply a REGISTER on behalf of `endpoint` and produce the response.
    pub async fn handle_register(
        &self,
        request: &rsip::Request,
        endpoint: &Arc<EndpointConfig>,
        source: Option<SocketAddr>,
    ) -> rsip::Response {
        if endpoint.aors.is_empty() {
            log::warn!("endpoint {} has no configured AORs", endpoint.id);
            return response_for(request, StatusCode::Forbidden, true);
        }

        let Ok(to) = request.to_header().and_then(|h| h.typed()) else {
            return response_for(request, StatusCode::BadRequest, true);
        };

        if !matches!(to.uri.scheme, Some(Scheme::Sip) | Some(Scheme::Sips)) {
            log::warn!(
                "endpoint {} attempted to register a non-SIP To-URI",
                endpoint.id
            );
            return response_for(request, StatusCode::UnsupportedUriScheme, true);
        }

        let to_user = to.uri.auth.as_ref().map(|a| a.user.as_str()).unwrap_or("");
        let to_domain = to.uri.host_with_port.host.to_string();

        let Some(aor) = self.locator.resolve_aor(endpoint, to_user, &to_domain) else {
            log::warn!("AOR {to_user} not found for endpoint {}", endpoint.id);
            return response_for(request, StatusCode::NotFound, true);
        };

        if aor.max_contacts == 0 {
            log::warn!(
                "AOR {} has no max_contacts, endpoint {} cannot register",
                aor.id,
                endpoint.id
            );
            return response_for(request, StatusCode::Forbidden, true);
        }

        let serializer = self.core.registrar_serializer(&aor.id);

        let this = self.clone();
        let request = request.clone();
        let endpoint = endpoint.clone();

        match serializer
            .send_wait(async move { this.apply(&request, &endpoint, &aor, source) })
            .await
        {
            Ok(response) => response,
            Err(_) => {
                // Shutting down; no state was touched
                rsip::Response {
                    status_code: StatusCode::ServiceUnavailable,
                    version: rsip::Version::V2,
                    headers: Default::default(),
                    body: vec![],
                }
            }
        }
    }

    /// The serialized part of the apply.
    fn apply(
        &self,
        request: &rsip::Request,
        endpoint: &EndpointConfig,
        aor: &AorConfig,
        source: Option<SocketAddr>,
    ) -> rsip::Response {
        let now = Utc::now();

        // Permanent contacts are unaffected by REGISTER; the working set
        // holds only the dynamic bindings
        let mut working = self.locator.dynamic_contacts(&aor.id);

        let headers = match self.validate_contacts(request, aor) {
            Ok(headers) => headers,
            Err(()) => {
                log::warn!(
                    "failed to validate contacts in REGISTER from {}",
                    endpoint.id
                );
                return response_for(request, StatusCode::BadRequest, true);
            }
        };

        let path = match self.validate_path(request, aor) {
            Ok(path) => path,
            Err(()) => {
                log::warn!(
                    "REGISTER from {} carries Path without advertised support",
                    endpoint.id
                );
                return response_for(request, StatusCode::BadExtension, true);
            }
        };

        // Quota check before any mutation
        let (mut added, mut deleted) = (0i64, 0i64);
        for header in &headers {
            if let ContactHeader::Uri { uri, expiration } = header {
                let exists = working.iter().any(|c| c.uri == *uri);
                match (exists, *expiration) {
                    (false, e) if e > 0 => added += 1,
                    (true, 0) => deleted += 1,
                    _ => {}
                }
            }
        }

        // Permanent contacts occupy quota slots even though REGISTER
        // cannot touch them
        let existing = if aor.remove_existing {
            0
        } else {
            (aor.permanent_contacts.len() + working.len()) as i64
        };

        if (added - deleted).max(0) + existing > aor.max_contacts as i64 {
            log::warn!(
                "registration from endpoint {} would exceed max_contacts {} of AOR {}",
                endpoint.id,
                aor.max_contacts,
                aor.id
            );
            return response_for(request, StatusCode::Forbidden, true);
        }

        let source_info = self.binding_source(request, endpoint, source, path);

        for header in headers {
            match header {
                ContactHeader::Star { .. } => {
                    for contact in working.drain(..) {
                        self.remove_binding(&contact);
                    }
                    break;
                }
                ContactHeader::Uri { uri, expiration } => {
                    let position = working.iter().position(|c| c.uri == uri);

                    match (position, expiration) {
                        (None, 0) => {
                            log::info!(
                                "attempt to remove non-existent contact {uri} from AOR {}",
                                aor.id
                            );
                        }
                        (None, expiration) => {
                            let expires_at = now + chrono::Duration::seconds(expiration as i64);
                            self.locator.add_contact(aor, &uri, expires_at, &source_info);

                            log::info!(
                                "added contact {uri} to AOR {} with expiration of {expiration} seconds",
                                aor.id
                            );
                            self.core.events.publish(CoreEvent::ContactAdded {
                                contact: uri,
                                aor: aor.id.clone(),
                                expiration,
                                user_agent: source_info.user_agent.clone(),
                            });
                        }
                        (Some(position), 0) => {
                            let contact = working.remove(position);
                            self.remove_binding(&contact);
                        }
                        (Some(position), expiration) => {
                            let contact = working.remove(position);
                            let expires_at = now + chrono::Duration::seconds(expiration as i64);
                            let updated = self.locator.update_contact(
                                &contact,
                                aor,
                                expires_at,
                                &source_info,
                            );

                            log::debug!(
                                "refreshed contact {uri} on AOR {} with new expiration of {expiration} seconds",
                                aor.id
                            );
                            self.core.events.publish(CoreEvent::ContactRefreshed {
                                contact: uri,
                                aor: aor.id.clone(),
                                expiration,
                                user_agent: updated.user_agent.clone(),
                            });
                        }
                    }
                }
            }
        }

        // Anything not touched by this REGISTER goes away in
        // replace mode
        if aor.remove_existing {
            for contact in working.drain(..) {
                self.remove_binding(&contact);
            }
        }

        self.build_ok(request, aor, now)
    }

    fn remove_binding(&self, contact: &Contact) {
        self.locator.delete_contact(contact);

        log::info!(
            "removed contact {} from AOR {} due to request",
            contact.uri,
            contact.aor
        );
        self.core.events.publish(CoreEvent::ContactRemoved {
            contact: contact.uri.clone(),
            aor: contact.aor.clone(),
        });
    }

    /// Parse and police the Contact headers.
    ///
    /// A `*` contact must be the only one and must come with expiration 0;
    /// contacts with unsupported URI schemes are skipped.
    fn validate_contacts(
        &self,
        request: &rsip::Request,
        aor: &AorConfig,
    ) -> Result<Vec<ContactHeader>, ()> {
        let mut parsed = Vec::new();

        for contact in msg::contact_headers(&request.headers) {
            let value = contact.value().trim().to_string();

            if value == "*" {
                let expiration = msg::expires_header(&request.headers)
                    .unwrap_or(aor.default_expiration);

                if expiration != 0 || !parsed.is_empty() {
                    return Err(());
                }

                parsed.push(ContactHeader::Star { expiration });
                continue;
            }

            if matches!(parsed.last(), Some(ContactHeader::Star { .. })) {
                return Err(());
            }

            let Ok(typed) = contact.typed() else {
                return Err(());
            };

            if !matches!(typed.uri.scheme, Some(Scheme::Sip) | Some(Scheme::Sips)) {
                continue;
            }

            let expiration = self.select_expiration(request, aor, &typed);

            parsed.push(ContactHeader::Uri {
                uri: typed.uri.to_string(),
                expiration,
            });
        }

        Ok(parsed)
    }

    /// Per-contact expiration: contact `expires` param, else Expires
    /// header, else AOR default; non-zero values clamped into the AOR
    /// bounds.
    fn select_expiration(
        &self,
        request: &rsip::Request,
        aor: &AorConfig,
        contact: &rsip::typed::Contact,
    ) -> u32 {
        let from_contact = contact.params.iter().find_map(|p| match p {
            Param::Expires(e) => e.value().parse::<u32>().ok(),
            Param::Other(k, Some(v)) if k.value().eq_ignore_ascii_case("expires") => {
                v.value().parse::<u32>().ok()
            }
            _ => None,
        });

        let expiration = from_contact
            .or_else(|| msg::expires_header(&request.headers))
            .unwrap_or(aor.default_expiration);

        if expiration == 0 {
            return 0;
        }

        expiration.clamp(aor.minimum_expiration, aor.maximum_expiration)
    }

    /// Comma-join the Path headers, enforcing advertised support.
    fn validate_path(&self, request: &rsip::Request, aor: &AorConfig) -> Result<Option<String>, ()> {
        if !aor.support_path {
            return Ok(None);
        }

        let paths = msg::other_headers(&request.headers, "Path");
        if paths.is_empty() {
            return Ok(None);
        }

        let supported = msg::supported_tokens(&request.headers);
        if !supported.iter().any(|t| t == "path") {
            return Err(());
        }

        Ok(Some(paths.join(",")))
    }

    fn binding_source(
        &self,
        request: &rsip::Request,
        endpoint: &EndpointConfig,
        source: Option<SocketAddr>,
        path: Option<String>,
    ) -> BindingSource {
        let user_agent = request.headers.iter().find_map(|h| match h {
            Header::UserAgent(ua) => Some(ua.value().to_string()),
            _ => None,
        });

        let call_id = request
            .call_id_header()
            .ok()
            .map(|call_id| call_id.value().to_string());

        let (via_addr, via_port) = request
            .via_header()
            .ok()
            .and_then(|via| via.typed().ok())
            .map(|via| {
                (
                    Some(via.uri.host_with_port.host.to_string()),
                    via.uri
                        .host_with_port
                        .port
                        .as_ref()
                        .map(|p| *p.value())
                        .unwrap_or(0),
                )
            })
            .unwrap_or_else(|| {
                (
                    source.map(|s| s.ip().to_string()),
                    source.map(|s| s.port()).unwrap_or(0),
                )
            });

        BindingSource {
            user_agent,
            path,
            via_addr,
            via_port,
            call_id,
            endpoint: Some(endpoint.id.clone()),
        }
    }

    /// 200 OK enumerating the current binding set.
    fn build_ok(&self, request: &rsip::Request, aor: &AorConfig, now: DateTime<Utc>) -> rsip::Response {
        let mut response = response_for(request, StatusCode::OK, true);

        // Some UAs set their clock from this
        response.headers.push(Header::Date(
            now.format("%a, %d %b %Y %H:%M:%S GMT").to_string().into(),
        ));

        for contact in self.locator.aor_contacts(aor) {
            let value = match contact.expiration_time {
                Some(_) => format!("<{}>;expires={}", contact.uri, contact.expires_in(now)),
                None => format!("<{}>", contact.uri),
            };
            response.headers.push(Header::Contact(value.into()));
        }

        response
    }
}
