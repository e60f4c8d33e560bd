//! Configuration record types.
//!
//! These are the objects the typed data store manages. They mirror the
//! option dictionaries of the platform configuration: every option has a
//! fixed default, apply-time validation rejects an invalid object without
//! touching the previously applied version.

use chrono::{DateTime, Utc};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::store::StoreObject;
use crate::{Error, Result};

/// Maximum accepted length of a digest realm.
pub const MAX_REALM_LEN: usize = 40;

/// DTMF transport mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DtmfMode {
    #[default]
    Rfc4733,
    Inband,
    Info,
    Auto,
}

/// SRTP policy of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaEncryption {
    #[default]
    None,
    Sdes,
    Dtls,
}

/// Whether reliable provisional responses are offered or required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rel100 {
    No,
    #[default]
    Yes,
    Required,
}

/// Session timer behavior of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionTimers {
    No,
    #[default]
    Yes,
    Required,
    Always,
}

/// Source used to identify the endpoint of an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifyMethod {
    /// Match the From-URI user part against endpoint ids.
    Username,
    /// Match the first inbound auth username against endpoint ids.
    AuthUsername,
    /// Match the source address against `identify` sections.
    Ip,
}

/// Configuration of a remote user agent.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub id: String,
    /// Dialplan context incoming calls are routed to.
    pub context: String,
    /// Ordered AOR names this endpoint serves.
    pub aors: Vec<String>,
    /// Ordered identification methods.
    pub identify_by: Vec<IdentifyMethod>,
    /// Inbound authentication object names.
    pub auth: Vec<String>,
    /// Outbound authentication object names.
    pub outbound_auth: Vec<String>,
    /// Preferred transport name, `None` picks per request.
    pub transport: Option<String>,

    pub dtmf_mode: DtmfMode,
    pub media_encryption: MediaEncryption,
    pub rel_100: Rel100,
    pub session_timers: SessionTimers,
    pub call_group: String,
    pub pickup_group: String,
    pub tos_audio: u8,
    pub cos_audio: u8,
}

impl EndpointConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            context: "default".into(),
            aors: Vec::new(),
            identify_by: vec![IdentifyMethod::Username],
            auth: Vec::new(),
            outbound_auth: Vec::new(),
            transport: None,
            dtmf_mode: DtmfMode::default(),
            media_encryption: MediaEncryption::default(),
            rel_100: Rel100::default(),
            session_timers: SessionTimers::default(),
            call_group: String::new(),
            pickup_group: String::new(),
            tos_audio: 0,
            cos_audio: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("endpoint requires an id"));
        }
        if self.context.is_empty() {
            return Err(Error::config(format!(
                "endpoint {}: context must not be empty",
                self.id
            )));
        }
        if self.identify_by.is_empty() {
            return Err(Error::config(format!(
                "endpoint {}: at least one identify method is required",
                self.id
            )));
        }
        Ok(())
    }
}

impl StoreObject for EndpointConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Externally visible runtime state of an endpoint.
///
/// Survives configuration reloads: the record is keyed by endpoint id and
/// kept across different configuration versions with the same id.
#[derive(Debug, Clone)]
pub struct PersistentEndpoint {
    pub id: String,
    pub online: bool,
    pub channel_count: u32,
}

impl PersistentEndpoint {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            online: false,
            channel_count: 0,
        }
    }
}

impl StoreObject for PersistentEndpoint {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A named collection of contact bindings.
#[derive(Debug, Clone)]
pub struct AorConfig {
    pub id: String,
    /// 0 disables dynamic registration entirely.
    pub max_contacts: u32,
    pub minimum_expiration: u32,
    pub default_expiration: u32,
    pub maximum_expiration: u32,
    /// 0 disables OPTIONS probing.
    pub qualify_frequency: u32,
    pub qualify_timeout: Duration,
    pub authenticate_qualify: bool,
    /// REGISTER replaces rather than augments the contact set.
    pub remove_existing: bool,
    pub support_path: bool,
    /// Statically configured contact URIs.
    pub permanent_contacts: Vec<String>,
}

impl AorConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            max_contacts: 0,
            minimum_expiration: 60,
            default_expiration: 3600,
            maximum_expiration: 7200,
            qualify_frequency: 0,
            qualify_timeout: Duration::from_secs(3),
            authenticate_qualify: false,
            remove_existing: false,
            support_path: false,
            permanent_contacts: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("aor requires an id"));
        }
        if self.minimum_expiration > self.maximum_expiration {
            return Err(Error::config(format!(
                "aor {}: minimum_expiration exceeds maximum_expiration",
                self.id
            )));
        }
        for uri in &self.permanent_contacts {
            rsip::Uri::try_from(uri.as_str()).map_err(|e| {
                Error::config(format!("aor {}: invalid permanent contact {uri}: {e}", self.id))
            })?;
        }
        Ok(())
    }
}

impl StoreObject for AorConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

/// A reachable address bound to an AOR.
#[derive(Debug, Clone)]
pub struct Contact {
    /// `<aor>;@<md5(uri)>` for dynamic, `<aor>@@<md5(uri)>` for permanent
    /// contacts.
    pub id: String,
    pub aor: String,
    pub uri: String,
    /// `None` marks a permanent contact that never expires.
    pub expiration_time: Option<DateTime<Utc>>,
    /// Comma joined Path header set, outermost first.
    pub path: Option<String>,
    pub user_agent: Option<String>,
    pub via_addr: Option<String>,
    pub via_port: u16,
    pub call_id: Option<String>,
    /// Endpoint that created the binding, used to address qualifies.
    pub endpoint_name: Option<String>,
    /// Server instance that accepted the registration.
    pub reg_server: Option<String>,
    pub prune_on_boot: bool,

    // Copied from the AOR at creation time
    pub qualify_frequency: u32,
    pub qualify_timeout: Duration,
    pub authenticate_qualify: bool,
}

/// Separator distinguishing dynamic from permanent contact ids.
const DYNAMIC_SEP: &str = ";@";
const PERMANENT_SEP: &str = "@@";

impl Contact {
    pub fn dynamic_id(aor: &str, uri: &str) -> String {
        format!("{aor}{DYNAMIC_SEP}{:x}", md5::compute(uri))
    }

    pub fn permanent_id(aor: &str, uri: &str) -> String {
        format!("{aor}{PERMANENT_SEP}{:x}", md5::compute(uri))
    }

    pub fn is_permanent(&self) -> bool {
        !self.id.contains(DYNAMIC_SEP) && self.id.contains(PERMANENT_SEP)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expiration_time {
            Some(at) => at <= now,
            None => false,
        }
    }

    /// Seconds until expiry, 0 when already expired or permanent.
    pub fn expires_in(&self, now: DateTime<Utc>) -> u32 {
        self.expiration_time
            .map(|at| (at - now).num_seconds().max(0) as u32)
            .unwrap_or(0)
    }
}

impl StoreObject for Contact {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Kind of credential carried by an auth section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthType {
    #[default]
    UserPass,
    Md5,
    /// OAuth bearer towards Google; the token is fetched out of band.
    GoogleOauth,
}

/// Credentials used to challenge inbound or answer outbound challenges.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub id: String,
    pub auth_type: AuthType,
    pub username: String,
    pub password: String,
    /// Pre-computed MD5 hash of `user:realm:password`, only for
    /// [`AuthType::Md5`].
    pub md5_cred: String,
    /// `None` uses the global default realm.
    pub realm: Option<String>,
    pub nonce_lifetime: Duration,
    pub oauth_clientid: String,
    pub oauth_secret: String,
    pub refresh_token: String,
}

impl AuthConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            auth_type: AuthType::default(),
            username: String::new(),
            password: String::new(),
            md5_cred: String::new(),
            realm: None,
            nonce_lifetime: Duration::from_secs(32),
            oauth_clientid: String::new(),
            oauth_secret: String::new(),
            refresh_token: String::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::config("auth requires an id"));
        }
        if let Some(realm) = &self.realm
            && realm.len() > MAX_REALM_LEN
        {
            return Err(Error::config(format!(
                "auth {}: realm exceeds {MAX_REALM_LEN} characters",
                self.id
            )));
        }
        match self.auth_type {
            AuthType::UserPass if self.username.is_empty() => Err(Error::config(format!(
                "auth {}: username required",
                self.id
            ))),
            AuthType::Md5 if self.md5_cred.len() != 32 => Err(Error::config(format!(
                "auth {}: md5_cred must be a 32 character digest",
                self.id
            ))),
            AuthType::GoogleOauth
                if self.oauth_clientid.is_empty()
                    || self.oauth_secret.is_empty()
                    || self.refresh_token.is_empty() =>
            {
                Err(Error::config(format!(
                    "auth {}: oauth_clientid, oauth_secret and refresh_token required",
                    self.id
                )))
            }
            _ => Ok(()),
        }
    }
}

impl StoreObject for AuthConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Wire protocol of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl TransportProtocol {
    pub fn reliable(&self) -> bool {
        !matches!(self, TransportProtocol::Udp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Tls => "TLS",
            TransportProtocol::Ws => "WS",
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration of a listening transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub id: String,
    pub protocol: TransportProtocol,
    pub bind: std::net::SocketAddr,
    /// Address advertised in signaling towards non-local peers.
    pub external_signaling_address: Option<IpAddr>,
    pub external_signaling_port: u16,
    /// Address written into SDP towards non-local peers.
    pub external_media_address: Option<IpAddr>,
    /// Networks considered local, exempt from external rewriting.
    pub local_net: Vec<Cidr>,
}

impl TransportConfig {
    pub fn new(id: impl Into<String>, protocol: TransportProtocol, bind: std::net::SocketAddr) -> Self {
        Self {
            id: id.into(),
            protocol,
            bind,
            external_signaling_address: None,
            external_signaling_port: 0,
            external_media_address: None,
            local_net: Vec::new(),
        }
    }
}

impl StoreObject for TransportConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Source-address based endpoint identification rules.
#[derive(Debug, Clone)]
pub struct IdentifyConfig {
    pub id: String,
    /// Endpoint that matching requests resolve to.
    pub endpoint: String,
    /// Permitted source networks.
    pub matches: Vec<Cidr>,
    /// Permitted hosts, resolved at apply time.
    pub hostnames: Vec<String>,
    /// Also consult `_sip._udp`/`_sip._tcp`/`_sips._tcp` SRV records when
    /// resolving `hostnames`.
    pub srv_lookups: bool,
    /// `Header: value` pair that identifies the endpoint regardless of the
    /// source address.
    pub match_header: Option<(String, String)>,
}

impl IdentifyConfig {
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            matches: Vec::new(),
            hostnames: Vec::new(),
            srv_lookups: true,
            match_header: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::config(format!(
                "identify {}: endpoint required",
                self.id
            )));
        }
        if self.matches.is_empty() && self.hostnames.is_empty() && self.match_header.is_none() {
            return Err(Error::config(format!(
                "identify {}: no match, hostname or match_header rule",
                self.id
            )));
        }
        if let Some((name, _)) = &self.match_header
            && name.is_empty()
        {
            return Err(Error::config(format!(
                "identify {}: match_header requires a header name",
                self.id
            )));
        }
        Ok(())
    }
}

impl StoreObject for IdentifyConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Maps an alias domain onto a configured one for AOR lookup.
#[derive(Debug, Clone)]
pub struct DomainAliasConfig {
    pub id: String,
    pub domain: String,
}

impl StoreObject for DomainAliasConfig {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Process wide options.
#[derive(Debug, Clone)]
pub struct GlobalConfig {
    /// Upper bound for the random startup delay of qualifies and outbound
    /// registrations, 0 means no bound.
    pub max_initial_qualify_time: u32,
    pub unidentified_request_count: u32,
    pub unidentified_request_period: Duration,
    pub unidentified_request_prune_interval: Duration,
    pub contact_expiration_check_interval: Duration,
    pub default_realm: String,
    pub user_agent: String,
    /// Identifier of this server instance, recorded on dynamic contacts.
    pub reg_server: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_initial_qualify_time: 0,
            unidentified_request_count: 5,
            unidentified_request_period: Duration::from_secs(5),
            unidentified_request_prune_interval: Duration::from_secs(30),
            contact_expiration_check_interval: Duration::from_secs(30),
            default_realm: "tandem".into(),
            user_agent: "tandem".into(),
            reg_server: String::new(),
        }
    }
}

/// Runtime tuning that requires a restart to change.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Size of the serializer pool messages without a dialog are
    /// distributed over.
    pub threadpool_size: usize,
    /// Queue length per pool past which overload protection engages.
    pub threadpool_queue_high_water: usize,
    pub timer_t1: Duration,
    /// Transaction timeout, SIP timer B.
    pub timer_b: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        let timer_t1 = Duration::from_millis(500);
        Self {
            threadpool_size: 16,
            threadpool_queue_high_water: 500,
            timer_t1,
            timer_b: 64 * timer_t1,
        }
    }
}

/// An IPv4/IPv6 network in CIDR or dotted-netmask notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cidr {
    pub network: IpAddr,
    pub prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> Result<Self> {
        let (addr, mask) = match s.split_once('/') {
            Some((addr, mask)) => (addr, Some(mask)),
            None => (s, None),
        };

        let network: IpAddr = addr
            .parse()
            .map_err(|_| Error::config(format!("invalid network address {addr}")))?;

        let max = if network.is_ipv4() { 32 } else { 128 };

        let prefix = match mask {
            None => max,
            Some(mask) => {
                if let Ok(len) = mask.parse::<u8>() {
                    len
                } else {
                    // Dotted netmask form, IPv4 only
                    let mask_addr: std::net::Ipv4Addr = mask
                        .parse()
                        .map_err(|_| Error::config(format!("invalid netmask {mask}")))?;
                    let bits = u32::from(mask_addr);
                    if bits.count_ones() != bits.leading_ones() {
                        return Err(Error::config(format!("non contiguous netmask {mask}")));
                    }
                    bits.count_ones() as u8
                }
            }
        };

        if prefix > max {
            return Err(Error::config(format!("prefix /{prefix} out of range for {addr}")));
        }

        Ok(Self { network, prefix })
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.network, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - self.prefix as u32)
                };
                u32::from(net) & mask == u32::from(addr) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - self.prefix as u32)
                };
                u128::from(net) & mask == u128::from(addr) & mask
            }
            _ => false,
        }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contact_id_separators() {
        let dynamic = Contact::dynamic_id("alice", "sip:alice@1.2.3.4");
        let permanent = Contact::permanent_id("alice", "sip:alice@1.2.3.4");

        assert!(dynamic.starts_with("alice;@"));
        assert!(permanent.starts_with("alice@@"));
        assert_ne!(dynamic, permanent);

        // Same uri must hash identically so refreshes find the binding
        assert_eq!(dynamic, Contact::dynamic_id("alice", "sip:alice@1.2.3.4"));
    }

    #[test]
    fn cidr_matching() {
        let net = Cidr::parse("10.0.0.0/24").unwrap();
        assert!(net.contains("10.0.0.7".parse().unwrap()));
        assert!(!net.contains("10.0.1.1".parse().unwrap()));

        let masked = Cidr::parse("192.168.0.0/255.255.0.0").unwrap();
        assert_eq!(masked.prefix, 16);
        assert!(masked.contains("192.168.44.5".parse().unwrap()));

        let host = Cidr::parse("203.0.113.9").unwrap();
        assert!(host.contains("203.0.113.9".parse().unwrap()));
        assert!(!host.contains("203.0.113.10".parse().unwrap()));

        assert!(Cidr::parse("10.0.0.0/255.0.255.0").is_err());
        assert!(Cidr::parse("10.0.0.0/33").is_err());
    }

    #[test]
    fn realm_length_is_capped() {
        let mut auth = AuthConfig::new("a1");
        auth.username = "alice".into();
        auth.realm = Some("r".repeat(MAX_REALM_LEN + 1));
        assert!(auth.validate().is_err());

        auth.realm = Some("r".repeat(MAX_REALM_LEN));
        assert!(auth.validate().is_ok());
    }

    #[test]
    fn aor_expiration_bounds_are_checked() {
        let mut aor = AorConfig::new("alice");
        aor.minimum_expiration = 7300;
        assert!(aor.validate().is_err());
    }
}
