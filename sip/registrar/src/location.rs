//! The location store: AOR resolution and contact persistence.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use tandem_core::Core;
use tandem_core::config::{AorConfig, Contact, EndpointConfig};
use tandem_core::events::CoreEvent;
use tandem_core::scheduler::RunPolicy;
use tandem_core::status::{ContactStatus, ContactStatusKind};

/// Facade over the contact store adding the AOR level view.
#[derive(Clone)]
pub struct Locator {
    core: Core,
}

/// Data captured from the REGISTER that created a binding.
#[derive(Debug, Default, Clone)]
pub struct BindingSource {
    pub user_agent: Option<String>,
    pub path: Option<String>,
    pub via_addr: Option<String>,
    pub via_port: u16,
    pub call_id: Option<String>,
    pub endpoint: Option<String>,
}

impl Locator {
    pub fn new(core: Core) -> Self {
        Self { core }
    }

    /// Find the AOR a REGISTER addresses: the To-URI user directly, or
    /// `user@domain` (after domain alias translation) against the
    /// endpoint's configured AOR list, first match wins.
    pub fn resolve_aor(
        &self,
        endpoint: &EndpointConfig,
        to_user: &str,
        to_domain: &str,
    ) -> Option<Arc<AorConfig>> {
        let domain = self
            .core
            .domain_aliases
            .get(to_domain)
            .map(|alias| alias.domain.clone())
            .unwrap_or_else(|| to_domain.to_string());

        let user_at_domain = format!("{to_user}@{domain}");

        for aor_name in &endpoint.aors {
            if aor_name == to_user || *aor_name == user_at_domain {
                return self.core.aors.get(aor_name);
            }
        }

        None
    }

    /// All bindings of `aor`: the configured permanent contacts plus every
    /// dynamic contact that has not expired.
    pub fn aor_contacts(&self, aor: &AorConfig) -> Vec<Arc<Contact>> {
        let now = Utc::now();

        let mut contacts: Vec<Arc<Contact>> = aor
            .permanent_contacts
            .iter()
            .map(|uri| self.permanent_contact(aor, uri))
            .collect();

        contacts.extend(
            self.core
                .contacts
                .find(|c| c.aor == aor.id && !c.is_permanent() && !c.is_expired(now)),
        );

        contacts
    }

    /// Dynamic, unexpired contacts of `aor`.
    pub fn dynamic_contacts(&self, aor_name: &str) -> Vec<Arc<Contact>> {
        let now = Utc::now();
        self.core
            .contacts
            .find(|c| c.aor == aor_name && !c.is_permanent() && !c.is_expired(now))
    }

    fn permanent_contact(&self, aor: &AorConfig, uri: &str) -> Arc<Contact> {
        let id = Contact::permanent_id(&aor.id, uri);

        // Keep the store as the single source so status tracking sees
        // permanent contacts too
        if let Some(existing) = self.core.contacts.get(&id) {
            return existing;
        }

        let contact = Contact {
            id: id.clone(),
            aor: aor.id.clone(),
            uri: uri.to_string(),
            expiration_time: None,
            path: None,
            user_agent: None,
            via_addr: None,
            via_port: 0,
            call_id: None,
            endpoint_name: None,
            reg_server: None,
            prune_on_boot: false,
            qualify_frequency: aor.qualify_frequency,
            qualify_timeout: aor.qualify_timeout,
            authenticate_qualify: aor.authenticate_qualify,
        };

        let stored = self.core.contacts.apply(contact);
        self.track_status(&stored);
        stored
    }

    /// Create a dynamic binding.
    pub fn add_contact(
        &self,
        aor: &AorConfig,
        uri: &str,
        expires_at: DateTime<Utc>,
        source: &BindingSource,
    ) -> Arc<Contact> {
        let contact = Contact {
            id: Contact::dynamic_id(&aor.id, uri),
            aor: aor.id.clone(),
            uri: uri.to_string(),
            expiration_time: Some(expires_at),
            path: source.path.clone(),
            user_agent: source.user_agent.clone(),
            via_addr: source.via_addr.clone(),
            via_port: source.via_port,
            call_id: source.call_id.clone(),
            endpoint_name: source.endpoint.clone(),
            reg_server: {
                let reg_server = self.core.global.read().reg_server.clone();
                (!reg_server.is_empty()).then_some(reg_server)
            },
            prune_on_boot: false,
            qualify_frequency: aor.qualify_frequency,
            qualify_timeout: aor.qualify_timeout,
            authenticate_qualify: aor.authenticate_qualify,
        };

        let stored = self.core.contacts.apply(contact);
        self.track_status(&stored);
        stored
    }

    /// Refresh an existing binding with the data of a new REGISTER.
    pub fn update_contact(
        &self,
        existing: &Contact,
        aor: &AorConfig,
        expires_at: DateTime<Utc>,
        source: &BindingSource,
    ) -> Arc<Contact> {
        let mut updated = existing.clone();
        updated.expiration_time = Some(expires_at);
        updated.qualify_frequency = aor.qualify_frequency;
        updated.qualify_timeout = aor.qualify_timeout;
        updated.authenticate_qualify = aor.authenticate_qualify;
        if source.path.is_some() {
            updated.path = source.path.clone();
        }
        if source.user_agent.is_some() {
            updated.user_agent = source.user_agent.clone();
        }
        updated.via_addr = source.via_addr.clone();
        updated.via_port = source.via_port;
        updated.call_id = source.call_id.clone();

        self.core.contacts.apply(updated)
    }

    /// Remove a binding and its status snapshot.
    pub fn delete_contact(&self, contact: &Contact) {
        self.core.contacts.delete(&contact.id);
        self.core.contact_status.remove(&contact.id);
    }

    fn track_status(&self, contact: &Contact) {
        let mut status = ContactStatus::new(&contact.id, &contact.uri, &contact.aor);
        if contact.qualify_frequency == 0 {
            status.status = ContactStatusKind::Unknown;
            status.last_status = ContactStatusKind::Unknown;
        }
        self.core.contact_status.insert(status);
    }

    /// Boot cleanup: drop contacts flagged `prune_on_boot` and contacts
    /// this instance accepted in a previous life that have since expired.
    pub fn prune_on_boot(&self) {
        let reg_server = self.core.global.read().reg_server.clone();
        let now = Utc::now();

        self.core.contacts.retain_silently(|contact| {
            if contact.prune_on_boot
                && (reg_server.is_empty() || contact.reg_server.as_deref() == Some(&reg_server))
            {
                log::info!("pruning contact {} on boot", contact.id);
                return false;
            }

            if contact.is_expired(now) && contact.reg_server.as_deref() == Some(reg_server.as_str())
            {
                log::info!("pruning expired contact {} on boot", contact.id);
                return false;
            }

            true
        });
    }

    /// Start the periodic reaper that deletes expired dynamic contacts and
    /// publishes their removal.
    pub fn spawn_expiration_reaper(&self) {
        let interval = self
            .core
            .global
            .read()
            .contact_expiration_check_interval;

        if interval == Duration::ZERO {
            return;
        }

        let this = self.clone();
        self.core.scheduler.schedule(
            "registrar/expire",
            interval,
            RunPolicy::FixedInterval,
            None,
            &self.core.shutdown_group,
            move || {
                let this = this.clone();
                async move {
                    this.reap_expired();
                }
            },
        );
    }

    fn reap_expired(&self) {
        let now = Utc::now();
        let expired = self.core.contacts.find(|c| c.is_expired(now));

        for contact in expired {
            log::info!(
                "contact {} of AOR {} expired, removing",
                contact.uri,
                contact.aor
            );

            self.delete_contact(&contact);
            self.core.events.publish(CoreEvent::ContactRemoved {
                contact: contact.uri.clone(),
                aor: contact.aor.clone(),
            });
        }
    }
}
