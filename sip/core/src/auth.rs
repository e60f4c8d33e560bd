//! Digest authentication.
//!
//! Covers both directions: answering challenges on outgoing requests
//! (outbound registration, authenticated qualifies) and challenging
//! incoming requests on behalf of the distributor's auth gate. The
//! credential parameter list is parsed here; only RFC 7616 `MD5` and
//! `SHA-256` (non-session) algorithms are supported.

use parking_lot::Mutex;
use rsip::prelude::*;
use rsip::{Header, Headers, Method, StatusCode};
use sha2::Digest;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::{AuthConfig, AuthType};
use crate::msg::response_for;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no credentials for realm {0}")]
    MissingCredentials(String),
    #[error("already answered challenge for realm {0}")]
    AlreadyAnswered(String),
    #[error("challenge uses unsupported algorithm {0}")]
    UnsupportedAlgorithm(String),
    #[error("response carries no usable challenge")]
    NoChallenge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum DigestAlgorithm {
    #[default]
    Md5,
    Sha256,
}

impl DigestAlgorithm {
    fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Sha256 => "SHA-256",
        }
    }
}

/// Username/password pair used to answer challenges.
#[derive(Debug, Clone)]
pub struct DigestUser {
    user: String,
    password: String,
}

impl DigestUser {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl From<&AuthConfig> for DigestUser {
    fn from(auth: &AuthConfig) -> Self {
        DigestUser::new(auth.username.clone(), auth.password.clone())
    }
}

/// Credentials per realm, with an optional fallback for unknown realms.
#[derive(Debug, Clone, Default)]
pub struct DigestCredentials {
    default: Option<DigestUser>,
    map: HashMap<String, DigestUser>,
}

impl DigestCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_default(&mut self, credentials: DigestUser) {
        self.default = Some(credentials);
    }

    pub fn add_for_realm(&mut self, realm: impl Into<String>, credentials: DigestUser) {
        self.map.insert(realm.into(), credentials);
    }

    pub fn get_for_realm(&self, realm: &str) -> Option<&DigestUser> {
        self.map.get(realm).or(self.default.as_ref())
    }
}

/// The `name=value` parameters of a `Digest ...` header value.
///
/// Returns `None` for other authentication schemes.
fn parse_digest_params(value: &str) -> Option<HashMap<String, String>> {
    let rest = value.trim();
    let (scheme, rest) = rest.split_once(char::is_whitespace)?;
    if !scheme.eq_ignore_ascii_case("digest") {
        return None;
    }

    let mut params = HashMap::new();

    // Split on commas outside of quoted strings
    let mut depth_quoted = false;
    let mut current = String::new();
    let mut parts = Vec::new();

    for c in rest.chars() {
        match c {
            '"' => {
                depth_quoted = !depth_quoted;
                current.push(c);
            }
            ',' if !depth_quoted => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);

    for part in parts {
        let Some((name, value)) = part.split_once('=') else {
            continue;
        };

        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().trim_matches('"').to_string();
        params.insert(name, value);
    }

    Some(params)
}

fn parse_algorithm(params: &HashMap<String, String>) -> Result<DigestAlgorithm, AuthError> {
    match params.get("algorithm").map(String::as_str) {
        None => Ok(DigestAlgorithm::Md5),
        Some(a) if a.eq_ignore_ascii_case("md5") => Ok(DigestAlgorithm::Md5),
        Some(a) if a.eq_ignore_ascii_case("sha-256") => Ok(DigestAlgorithm::Sha256),
        Some(other) => Err(AuthError::UnsupportedAlgorithm(other.to_string())),
    }
}

fn hash(algorithm: DigestAlgorithm, input: &str) -> String {
    match algorithm {
        DigestAlgorithm::Sha256 => {
            let mut hasher = sha2::Sha256::new();
            hasher.update(input.as_bytes());
            hex(&hasher.finalize())
        }
        DigestAlgorithm::Md5 => format!("{:x}", md5::compute(input)),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The digest over one request. `qop` carries the cnonce and the already
/// formatted 8 digit nonce count.
fn digest_response(
    algorithm: DigestAlgorithm,
    ha1: &str,
    nonce: &str,
    method: &Method,
    uri: &str,
    qop: Option<(&str, &str)>,
) -> String {
    let ha2 = hash(algorithm, &format!("{method}:{uri}"));

    match qop {
        Some((cnonce, nc)) => hash(
            algorithm,
            &format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"),
        ),
        None => hash(algorithm, &format!("{ha1}:{nonce}:{ha2}")),
    }
}

struct CachedChallenge {
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
    use_qop: bool,
    cnonce: String,
    nc: u32,
}

/// Answers digest challenges on behalf of one request/refresh cycle.
///
/// The cached challenge is reused for subsequent requests of the same
/// client (the nonce count increments), matching how a registration keeps
/// authenticating its refreshes without a new 401 round trip.
#[derive(Default)]
pub struct DigestAuthenticator {
    credentials: DigestCredentials,
    challenges: Vec<CachedChallenge>,
}

impl DigestAuthenticator {
    pub fn new(credentials: DigestCredentials) -> Self {
        Self {
            credentials,
            challenges: Vec::new(),
        }
    }

    /// True once at least one challenge has been cached.
    pub fn has_challenge(&self) -> bool {
        !self.challenges.is_empty()
    }

    /// Forget every cached challenge.
    pub fn reset(&mut self) {
        self.challenges.clear();
    }

    /// Swap the credential set while keeping cached challenges, so a
    /// configuration reload takes effect on the next request.
    pub fn set_credentials(&mut self, credentials: DigestCredentials) {
        self.credentials = credentials;
    }

    /// Add Authorization headers for every cached challenge.
    pub fn authorize_request(&mut self, headers: &mut Headers, method: &Method, uri: &rsip::Uri) {
        let uri_string = uri.to_string();

        for challenge in &mut self.challenges {
            let Some(user) = self.credentials.get_for_realm(&challenge.realm) else {
                continue;
            };

            challenge.nc += 1;

            let ha1 = hash(
                challenge.algorithm,
                &format!("{}:{}:{}", user.user, challenge.realm, user.password),
            );

            let nc_hex = format!("{:08x}", challenge.nc);
            let qop = challenge
                .use_qop
                .then_some((challenge.cnonce.as_str(), nc_hex.as_str()));

            let response = digest_response(
                challenge.algorithm,
                &ha1,
                &challenge.nonce,
                method,
                &uri_string,
                qop,
            );

            let mut value = format!(
                "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\", algorithm={}",
                user.user,
                challenge.realm,
                challenge.nonce,
                uri_string,
                response,
                challenge.algorithm.as_str(),
            );

            if challenge.use_qop {
                value.push_str(&format!(
                    ", qop=auth, cnonce=\"{}\", nc={nc_hex}",
                    challenge.cnonce
                ));
            }

            if let Some(opaque) = &challenge.opaque {
                value.push_str(&format!(", opaque=\"{opaque}\""));
            }

            headers.push(Header::Authorization(value.into()));
        }
    }

    /// Digest the 401/407 challenge of `response`.
    ///
    /// Returns an error when the challenge cannot be answered; retrying
    /// would only repeat the rejection.
    pub fn handle_rejection(&mut self, response: &rsip::Response) -> Result<(), AuthError> {
        let mut found = false;

        for header in response.headers.iter() {
            let value = match header {
                Header::WwwAuthenticate(h) => h.value(),
                Header::ProxyAuthenticate(h) => h.value(),
                _ => continue,
            };

            let Some(params) = parse_digest_params(value) else {
                continue;
            };

            let (Some(realm), Some(nonce)) = (params.get("realm"), params.get("nonce")) else {
                continue;
            };

            let algorithm = parse_algorithm(&params)?;

            if self.credentials.get_for_realm(realm).is_none() {
                return Err(AuthError::MissingCredentials(realm.clone()));
            }

            let stale = params
                .get("stale")
                .is_some_and(|s| s.eq_ignore_ascii_case("true"));

            let use_qop = params
                .get("qop")
                .is_some_and(|q| q.split(',').any(|t| t.trim().eq_ignore_ascii_case("auth")));

            if let Some(existing) = self.challenges.iter_mut().find(|c| &c.realm == realm) {
                if &existing.nonce == nonce && !stale {
                    // Same nonce rejected again: wrong credentials
                    return Err(AuthError::AlreadyAnswered(realm.clone()));
                }

                existing.nonce = nonce.clone();
                existing.opaque = params.get("opaque").cloned();
                existing.algorithm = algorithm;
                existing.use_qop = use_qop;
                existing.nc = 0;
            } else {
                self.challenges.push(CachedChallenge {
                    realm: realm.clone(),
                    nonce: nonce.clone(),
                    opaque: params.get("opaque").cloned(),
                    algorithm,
                    use_qop,
                    cnonce: crate::msg::make_tag(),
                    nc: 0,
                });
            }

            found = true;
        }

        if found { Ok(()) } else { Err(AuthError::NoChallenge) }
    }
}

/// Username carried in a digest `Authorization` header value, for
/// identification purposes.
pub fn authorization_username(value: &str) -> Option<String> {
    parse_digest_params(value)?.remove("username")
}

/// Outcome of the inbound authentication gate.
#[derive(Debug)]
pub enum CheckAuthResult {
    /// Credentials matched; processing continues up the stack.
    Success,
    /// The request carried no (usable) credentials; `response` is the 401
    /// to send.
    Challenge(rsip::Response),
    /// The request carried credentials that failed verification.
    Failed(rsip::Response),
    /// The verifier itself failed; respond 500.
    Error,
}

/// Challenges and verifies incoming requests.
pub struct DigestVerifier {
    default_realm: String,
    nonce_lifetime: Duration,
    issued: Mutex<HashMap<String, Instant>>,
}

impl DigestVerifier {
    pub fn new(default_realm: impl Into<String>, nonce_lifetime: Duration) -> Self {
        Self {
            default_realm: default_realm.into(),
            nonce_lifetime,
            issued: Mutex::new(HashMap::new()),
        }
    }

    fn realm_of<'a>(&'a self, auth: &'a AuthConfig) -> &'a str {
        auth.realm.as_deref().unwrap_or(&self.default_realm)
    }

    fn fresh_nonce(&self) -> String {
        let nonce = uuid::Uuid::new_v4().simple().to_string();

        let mut issued = self.issued.lock();
        let now = Instant::now();
        issued.retain(|_, at| now.duration_since(*at) < self.nonce_lifetime);
        issued.insert(nonce.clone(), now);

        nonce
    }

    fn nonce_is_fresh(&self, nonce: &str) -> bool {
        let issued = self.issued.lock();
        issued
            .get(nonce)
            .is_some_and(|at| at.elapsed() < self.nonce_lifetime)
    }

    /// Build the 401 challenge for `request`.
    pub fn challenge(
        &self,
        request: &rsip::Request,
        auths: &[&AuthConfig],
        stale: bool,
    ) -> rsip::Response {
        let realm = auths
            .first()
            .map(|a| self.realm_of(a))
            .unwrap_or(&self.default_realm);

        let mut response = response_for(request, StatusCode::Unauthorized, true);

        let mut value = format!(
            "Digest realm=\"{realm}\", nonce=\"{}\", algorithm=MD5, qop=\"auth\"",
            self.fresh_nonce()
        );
        if stale {
            value.push_str(", stale=true");
        }

        response.headers.push(Header::WwwAuthenticate(value.into()));

        response
    }

    /// Run the gate for `request` against the endpoint's auth sections.
    ///
    /// An empty `auths` list means the endpoint does not require
    /// authentication and the request passes.
    pub fn verify(&self, request: &rsip::Request, auths: &[&AuthConfig]) -> CheckAuthResult {
        if auths.is_empty() {
            return CheckAuthResult::Success;
        }

        let mut saw_credentials = false;

        for header in request.headers.iter() {
            let Header::Authorization(authorization) = header else {
                continue;
            };

            let Some(params) = parse_digest_params(authorization.value()) else {
                continue;
            };

            let (Some(username), Some(realm), Some(nonce), Some(uri), Some(response)) = (
                params.get("username"),
                params.get("realm"),
                params.get("nonce"),
                params.get("uri"),
                params.get("response"),
            ) else {
                continue;
            };

            saw_credentials = true;

            let Ok(algorithm) = parse_algorithm(&params) else {
                continue;
            };

            let qop = match params.get("qop").map(String::as_str) {
                Some("auth") => {
                    let (Some(cnonce), Some(nc)) = (params.get("cnonce"), params.get("nc"))
                    else {
                        continue;
                    };
                    Some((cnonce.as_str(), nc.as_str()))
                }
                Some(_) => continue,
                None => None,
            };

            for auth in auths {
                if realm != self.realm_of(auth) || username != &auth.username {
                    continue;
                }

                let ha1 = if auth.auth_type == AuthType::Md5 {
                    auth.md5_cred.clone()
                } else {
                    hash(
                        algorithm,
                        &format!("{username}:{realm}:{}", auth.password),
                    )
                };

                let expected =
                    digest_response(algorithm, &ha1, nonce, &request.method, uri, qop);

                if &expected == response {
                    if !self.nonce_is_fresh(nonce) {
                        // Correct credentials on an expired nonce get a
                        // fresh challenge instead of a failure
                        return CheckAuthResult::Challenge(self.challenge(request, auths, true));
                    }

                    return CheckAuthResult::Success;
                }
            }
        }

        if saw_credentials {
            CheckAuthResult::Failed(self.challenge(request, auths, false))
        } else {
            CheckAuthResult::Challenge(self.challenge(request, auths, false))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::msg::{RequestParts, build_request, make_call_id, make_tag};
    use crate::transport::TpHandle;

    fn register_request() -> rsip::Request {
        let transport = TpHandle::new(crate::msg::test::NullTransport);
        build_request(
            RequestParts {
                method: Method::Register,
                target: rsip::Uri::try_from("sip:example.com").unwrap(),
                from: rsip::Uri::try_from("sip:alice@example.com").unwrap(),
                to: rsip::Uri::try_from("sip:alice@example.com").unwrap(),
                cseq: 1,
                call_id: make_call_id(),
                from_tag: make_tag(),
                user_agent: None,
            },
            &transport,
        )
        .0
    }

    fn alice_auth() -> AuthConfig {
        let mut auth = AuthConfig::new("alice-auth");
        auth.username = "alice".into();
        auth.password = "hunter2".into();
        auth
    }

    #[test]
    fn digest_params_split_respects_quotes() {
        let params = parse_digest_params(
            "Digest realm=\"sip, land\", nonce=\"abc\", qop=\"auth\", algorithm=MD5",
        )
        .unwrap();

        assert_eq!(params.get("realm").unwrap(), "sip, land");
        assert_eq!(params.get("nonce").unwrap(), "abc");
        assert_eq!(params.get("qop").unwrap(), "auth");

        assert!(parse_digest_params("Bearer abc").is_none());
    }

    #[test]
    fn challenge_then_success_round_trip() {
        let verifier = DigestVerifier::new("tandem", Duration::from_secs(32));
        let auth = alice_auth();

        let mut request = register_request();

        // First pass: no credentials, expect a challenge
        let challenge = match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Challenge(response) => response,
            other => panic!("expected challenge, got {other:?}"),
        };
        assert_eq!(challenge.status_code, StatusCode::Unauthorized);

        // Answer it
        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("tandem", DigestUser::new("alice", "hunter2"));
        let mut authenticator = DigestAuthenticator::new(credentials);

        authenticator.handle_rejection(&challenge).unwrap();

        let uri = request.uri.clone();
        authenticator.authorize_request(&mut request.headers, &Method::Register, &uri);

        match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Success => {}
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn wrong_password_fails() {
        let verifier = DigestVerifier::new("tandem", Duration::from_secs(32));
        let auth = alice_auth();

        let mut request = register_request();
        let challenge = match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Challenge(response) => response,
            other => panic!("expected challenge, got {other:?}"),
        };

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("tandem", DigestUser::new("alice", "wrong"));
        let mut authenticator = DigestAuthenticator::new(credentials);
        authenticator.handle_rejection(&challenge).unwrap();

        let uri = request.uri.clone();
        authenticator.authorize_request(&mut request.headers, &Method::Register, &uri);

        match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Failed(response) => {
                assert_eq!(response.status_code, StatusCode::Unauthorized)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn repeated_rejection_with_same_nonce_errors() {
        let verifier = DigestVerifier::new("tandem", Duration::from_secs(32));
        let auth = alice_auth();

        let request = register_request();
        let challenge = match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Challenge(response) => response,
            other => panic!("expected challenge, got {other:?}"),
        };

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("tandem", DigestUser::new("alice", "hunter2"));
        let mut authenticator = DigestAuthenticator::new(credentials);

        authenticator.handle_rejection(&challenge).unwrap();
        let err = authenticator.handle_rejection(&challenge).unwrap_err();
        assert!(matches!(err, AuthError::AlreadyAnswered(_)));
    }

    #[test]
    fn md5_cred_sections_verify_without_plaintext() {
        let verifier = DigestVerifier::new("tandem", Duration::from_secs(32));

        let mut auth = AuthConfig::new("alice-md5");
        auth.auth_type = AuthType::Md5;
        auth.username = "alice".into();
        // md5("alice:tandem:hunter2")
        auth.md5_cred = format!("{:x}", md5::compute("alice:tandem:hunter2"));

        let mut request = register_request();
        let challenge = match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Challenge(response) => response,
            other => panic!("expected challenge, got {other:?}"),
        };

        let mut credentials = DigestCredentials::new();
        credentials.add_for_realm("tandem", DigestUser::new("alice", "hunter2"));
        let mut authenticator = DigestAuthenticator::new(credentials);
        authenticator.handle_rejection(&challenge).unwrap();

        let uri = request.uri.clone();
        authenticator.authorize_request(&mut request.headers, &Method::Register, &uri);

        match verifier.verify(&request, &[&auth]) {
            CheckAuthResult::Success => {}
            other => panic!("expected success, got {other:?}"),
        }
    }
}
