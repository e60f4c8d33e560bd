//! Outbound registration configuration.

use tandem_core::store::StoreObject;
use tandem_core::{Error, Result};

/// How RFC 3329 security agreement is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityNegotiation {
    #[default]
    No,
    Mediasec,
}

/// One configured outgoing REGISTER client.
#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    pub id: String,
    /// URI of the remote registrar.
    pub server_uri: String,
    /// Address-of-record we bind, used in From/To.
    pub client_uri: String,
    /// Overrides the user part of the Contact URI.
    pub contact_user: Option<String>,
    /// Extra params appended to the Contact URI.
    pub contact_header_params: Vec<(String, String)>,
    pub transport: Option<String>,
    pub outbound_proxy: Option<String>,
    /// Requested binding lifetime in seconds.
    pub expiration: u32,
    /// Upper bound of the random delay before the first REGISTER.
    pub max_random_initial_delay: u32,
    pub retry_interval: u32,
    pub forbidden_retry_interval: u32,
    pub fatal_retry_interval: u32,
    pub max_retries: u32,
    /// A 401/407 counts as fatal instead of temporal.
    pub auth_rejection_permanent: bool,
    pub outbound_auth: Vec<String>,
    pub support_path: bool,
    pub support_outbound: bool,
    pub security_negotiation: SecurityNegotiation,
    /// Mechanisms offered in Security-Client when negotiating.
    pub security_mechanisms: Vec<String>,
    /// Tag the Contact with a line token for inbound association.
    pub line: bool,
    /// Endpoint incoming calls on this registration are attributed to.
    pub endpoint: Option<String>,
}

impl RegistrationConfig {
    pub fn new(
        id: impl Into<String>,
        server_uri: impl Into<String>,
        client_uri: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            server_uri: server_uri.into(),
            client_uri: client_uri.into(),
            contact_user: None,
            contact_header_params: Vec::new(),
            transport: None,
            outbound_proxy: None,
            expiration: 3600,
            max_random_initial_delay: 10,
            retry_interval: 60,
            forbidden_retry_interval: 0,
            fatal_retry_interval: 0,
            max_retries: 10,
            auth_rejection_permanent: true,
            outbound_auth: Vec::new(),
            support_path: false,
            support_outbound: false,
            security_negotiation: SecurityNegotiation::default(),
            security_mechanisms: Vec::new(),
            line: false,
            endpoint: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("registration requires an id"));
        }

        rsip::Uri::try_from(self.server_uri.as_str()).map_err(|e| {
            Error::config(format!(
                "registration {}: invalid server_uri {}: {e}",
                self.id, self.server_uri
            ))
        })?;
        rsip::Uri::try_from(self.client_uri.as_str()).map_err(|e| {
            Error::config(format!(
                "registration {}: invalid client_uri {}: {e}",
                self.id, self.client_uri
            ))
        })?;

        if let Some(proxy) = &self.outbound_proxy {
            rsip::Uri::try_from(proxy.as_str()).map_err(|e| {
                Error::config(format!(
                    "registration {}: invalid outbound_proxy {proxy}: {e}",
                    self.id
                ))
            })?;
        }

        if self.expiration == 0 {
            return Err(Error::config(format!(
                "registration {}: expiration must be non-zero",
                self.id
            )));
        }

        if self.line && self.endpoint.is_none() {
            return Err(Error::config(format!(
                "registration {}: line mode requires an endpoint",
                self.id
            )));
        }

        if self.security_negotiation == SecurityNegotiation::Mediasec
            && self.security_mechanisms.is_empty()
        {
            return Err(Error::config(format!(
                "registration {}: mediasec negotiation requires security_mechanisms",
                self.id
            )));
        }

        Ok(())
    }
}

impl StoreObject for RegistrationConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_mode_requires_endpoint() {
        let mut config =
            RegistrationConfig::new("trunk", "sip:registrar.example.com", "sip:100@example.com");
        assert!(config.validate().is_ok());

        config.line = true;
        assert!(config.validate().is_err());

        config.endpoint = Some("trunk-endpoint".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn uris_must_parse() {
        let config = RegistrationConfig::new("broken", "not a uri", "sip:100@example.com");
        assert!(config.validate().is_err());
    }
}
