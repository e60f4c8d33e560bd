//! OAuth bearer tokens for registrars that take `Authorization: Bearer`.
//!
//! The actual token exchange is an external concern; the engine only sees
//! the [`BearerTokenProvider`] trait. Tokens are cached and refreshed ahead
//! of expiry by a background task, the send path never blocks on a fetch: a
//! cold cache fails the attempt as a temporal error and the retry picks up
//! the refreshed token.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use tandem_core::Core;
use tandem_core::config::AuthConfig;

/// A fetched access token.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub access_token: String,
    pub expires_in: Duration,
}

/// Exchanges a refresh token for an access token.
#[async_trait]
pub trait BearerTokenProvider: Send + Sync + 'static {
    async fn fetch(&self, auth: &AuthConfig) -> Result<BearerToken, String>;
}

struct CacheEntry {
    access_token: String,
    expires_at: Instant,
    refreshing: bool,
}

/// Cache of access tokens keyed by auth section id.
pub struct TokenCache {
    provider: Arc<dyn BearerTokenProvider>,
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Refresh this much before the token expires.
    margin: Duration,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn BearerTokenProvider>) -> Arc<Self> {
        Arc::new(Self {
            provider,
            entries: Mutex::new(HashMap::new()),
            margin: Duration::from_secs(60),
        })
    }

    /// Currently valid token for `auth`, if any.
    ///
    /// A missing or stale token kicks off an asynchronous refresh and
    /// returns `None`.
    pub fn get(self: &Arc<Self>, core: &Core, auth: &Arc<AuthConfig>) -> Option<String> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(&auth.id) {
            let now = Instant::now();

            if entry.expires_at > now {
                let token = entry.access_token.clone();

                // Kick a refresh when we are inside the margin
                if entry.expires_at - now < self.margin && !entry.refreshing {
                    self.spawn_refresh(core, auth, &mut entries);
                }

                return Some(token);
            }
        }

        let refreshing = entries.get(&auth.id).map(|e| e.refreshing).unwrap_or(false);
        if !refreshing {
            self.spawn_refresh(core, auth, &mut entries);
        }

        None
    }

    fn spawn_refresh(
        self: &Arc<Self>,
        core: &Core,
        auth: &Arc<AuthConfig>,
        entries: &mut HashMap<String, CacheEntry>,
    ) {
        if let Some(entry) = entries.get_mut(&auth.id) {
            entry.refreshing = true;
        } else {
            entries.insert(
                auth.id.clone(),
                CacheEntry {
                    access_token: String::new(),
                    expires_at: Instant::now(),
                    refreshing: true,
                },
            );
        }

        let this = self.clone();
        let auth = auth.clone();

        core.shutdown_group.spawn(async move {
            match this.provider.fetch(&auth).await {
                Ok(token) => {
                    let mut entries = this.entries.lock();
                    entries.insert(
                        auth.id.clone(),
                        CacheEntry {
                            access_token: token.access_token,
                            expires_at: Instant::now() + token.expires_in,
                            refreshing: false,
                        },
                    );
                }
                Err(e) => {
                    log::warn!("bearer token fetch for auth {} failed: {e}", auth.id);
                    if let Some(entry) = this.entries.lock().get_mut(&auth.id) {
                        entry.refreshing = false;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tandem_core::config::{AuthType, GlobalConfig, SystemConfig};

    struct StaticProvider;

    #[async_trait]
    impl BearerTokenProvider for StaticProvider {
        async fn fetch(&self, _auth: &AuthConfig) -> Result<BearerToken, String> {
            Ok(BearerToken {
                access_token: "tok-123".into(),
                expires_in: Duration::from_secs(300),
            })
        }
    }

    #[tokio::test]
    async fn cold_cache_misses_then_fills() {
        let core = Core::new(GlobalConfig::default(), SystemConfig::default());
        let cache = TokenCache::new(Arc::new(StaticProvider));

        let mut auth = AuthConfig::new("goog");
        auth.auth_type = AuthType::GoogleOauth;
        auth.oauth_clientid = "id".into();
        auth.oauth_secret = "secret".into();
        auth.refresh_token = "refresh".into();
        let auth = Arc::new(auth);

        // First access is a miss that triggers the refresh
        assert!(cache.get(&core, &auth).is_none());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get(&core, &auth).as_deref(), Some("tok-123"));
    }
}
