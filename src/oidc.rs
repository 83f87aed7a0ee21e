//! # OpenID Connect Login
//!
//! Browser-based registration for machines that present no pre-auth key.
//!
//! ## Flow
//!
//! 1. `GET /oidc/register/{mkey}`: a random `state` is stored in the
//!    [`StateCache`] against the machine key and the browser is redirected to
//!    the provider's authorization endpoint.
//! 2. `GET /oidc/callback?code=..&state=..`: the state is consumed, the code is
//!    exchanged at the token endpoint, and the e-mail address is read from the
//!    userinfo endpoint.
//! 3. The e-mail is mapped to a namespace with [`NamespaceMatcher`]. The first
//!    matching rule wins.
//!
//! ID-token signatures are not validated here; the claims come from the
//! userinfo endpoint over the provider's TLS connection.

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use lru::LruCache;
use rand::RngCore;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::OidcSettings;
use crate::error::StartupError;
use crate::identity::MachineKey;
use crate::protocols::{IdentityClaims, IdentityProvider};

/// How long a login may take between redirect and callback.
pub const STATE_TTL: Duration = Duration::from_secs(5 * 60);

/// Outstanding logins kept before the oldest are evicted.
pub const MAX_PENDING_LOGINS: usize = 4096;

const STATE_BYTES: usize = 16;

const DISCOVERY_PATH: &str = "/.well-known/openid-configuration";

const PROVIDER_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Provider
// ============================================================================

#[derive(Debug, Deserialize)]
struct Discovery {
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    sub: String,
    #[serde(default)]
    email: Option<String>,
}

/// An OIDC issuer resolved through its discovery document.
pub struct OidcProvider {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    redirect_url: String,
    authorization_endpoint: String,
    token_endpoint: String,
    userinfo_endpoint: String,
}

impl OidcProvider {
    /// Fetch the issuer's discovery document. Callbacks land on `{server_url}/oidc/callback`.
    pub async fn discover(settings: &OidcSettings, server_url: &str) -> Result<Self, StartupError> {
        let client = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .map_err(|e| StartupError::Oidc(e.to_string()))?;

        let url = format!("{}{DISCOVERY_PATH}", settings.issuer.trim_end_matches('/'));
        let discovery: Discovery = async {
            client
                .get(&url)
                .send()
                .await?
                .error_for_status()?
                .json::<Discovery>()
                .await
        }
        .await
        .map_err(|e: reqwest::Error| StartupError::Oidc(format!("discovery at {url}: {e}")))?;

        info!(issuer = %settings.issuer, "OIDC provider discovered");
        Ok(Self {
            client,
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            redirect_url: format!("{}/oidc/callback", server_url.trim_end_matches('/')),
            authorization_endpoint: discovery.authorization_endpoint,
            token_endpoint: discovery.token_endpoint,
            userinfo_endpoint: discovery.userinfo_endpoint,
        })
    }
}

impl std::fmt::Debug for OidcProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OidcProvider")
            .field("client_id", &self.client_id)
            .field("authorization_endpoint", &self.authorization_endpoint)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl IdentityProvider for OidcProvider {
    fn authorize_url(&self, state: &str) -> String {
        let params = [
            ("response_type", "code"),
            ("client_id", self.client_id.as_str()),
            ("redirect_uri", self.redirect_url.as_str()),
            ("scope", "openid profile email"),
            ("state", state),
        ];
        match reqwest::Url::parse_with_params(&self.authorization_endpoint, &params) {
            Ok(url) => url.into(),
            Err(_) => self.authorization_endpoint.clone(),
        }
    }

    async fn exchange(&self, code: &str) -> Result<IdentityClaims> {
        let token: TokenResponse = self
            .client
            .post(&self.token_endpoint)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .send()
            .await
            .context("token request failed")?
            .error_for_status()
            .context("token endpoint refused the code")?
            .json()
            .await
            .context("malformed token response")?;

        let info: UserInfo = self
            .client
            .get(&self.userinfo_endpoint)
            .bearer_auth(&token.access_token)
            .send()
            .await
            .context("userinfo request failed")?
            .error_for_status()
            .context("userinfo endpoint refused the token")?
            .json()
            .await
            .context("malformed userinfo response")?;

        let Some(email) = info.email.filter(|e| !e.is_empty()) else {
            bail!("identity {} has no e-mail address", info.sub);
        };
        debug!(subject = %info.sub, "OIDC code exchanged");
        Ok(IdentityClaims {
            subject: info.sub,
            email,
        })
    }
}

// ============================================================================
// Login State
// ============================================================================

/// Short-lived `state -> machine key` map correlating callbacks with logins.
pub struct StateCache {
    entries: Mutex<LruCache<String, (MachineKey, Instant)>>,
    ttl: Duration,
}

impl StateCache {
    pub fn new(capacity: NonZeroUsize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Start a login for `machine_key` and return its fresh state value.
    pub fn begin(&self, machine_key: MachineKey) -> String {
        let mut bytes = [0u8; STATE_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let state = hex::encode(bytes);
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(state.clone(), (machine_key, Instant::now()));
        state
    }

    /// Consume `state`. Unknown, expired and already-used values yield `None`.
    pub fn take(&self, state: &str) -> Option<MachineKey> {
        let (key, started) = self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop(state)?;
        (started.elapsed() <= self.ttl).then_some(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(MAX_PENDING_LOGINS).unwrap_or(NonZeroUsize::MIN),
            STATE_TTL,
        )
    }
}

impl std::fmt::Debug for StateCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateCache")
            .field("pending", &self.len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

// ============================================================================
// Namespace Matching
// ============================================================================

/// Ordered `regex -> namespace` rules applied to login e-mail addresses.
#[derive(Debug, Clone, Default)]
pub struct NamespaceMatcher {
    rules: Vec<(Regex, String)>,
}

impl NamespaceMatcher {
    pub fn new(rules: &[(String, String)]) -> Result<Self, StartupError> {
        let rules = rules
            .iter()
            .map(|(pattern, namespace)| {
                Regex::new(pattern)
                    .map(|re| (re, namespace.clone()))
                    .map_err(|source| StartupError::MatchRule {
                        pattern: pattern.clone(),
                        source,
                    })
            })
            .collect::<Result<_, _>>()?;
        Ok(Self { rules })
    }

    /// Namespace of the first rule matching `email`.
    pub fn resolve(&self, email: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|(re, _)| re.is_match(email))
            .map(|(_, namespace)| namespace.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(p, n)| (p.to_string(), n.to_string()))
            .collect()
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let matcher = NamespaceMatcher::new(&rules(&[
            (r"^admin@example\.com$", "ops"),
            (r"@example\.com$", "staff"),
            (r".*", "guests"),
        ]))
        .unwrap();

        assert_eq!(matcher.resolve("admin@example.com"), Some("ops"));
        assert_eq!(matcher.resolve("dev@example.com"), Some("staff"));
        assert_eq!(matcher.resolve("someone@else.org"), Some("guests"));
    }

    #[test]
    fn test_no_rule_matches() {
        let matcher = NamespaceMatcher::new(&rules(&[(r"@corp\.io$", "corp")])).unwrap();
        assert_eq!(matcher.resolve("me@home.net"), None);
        assert!(NamespaceMatcher::default().resolve("me@home.net").is_none());
    }

    #[test]
    fn test_invalid_pattern_is_startup_error() {
        let err = NamespaceMatcher::new(&rules(&[("(unclosed", "x")])).unwrap_err();
        assert!(matches!(err, StartupError::MatchRule { ref pattern, .. } if pattern == "(unclosed"));
    }

    #[test]
    fn test_state_is_single_use() {
        let cache = StateCache::default();
        let key = MachineKey::from_bytes([7; 32]);
        let state = cache.begin(key);
        assert_eq!(state.len(), STATE_BYTES * 2);

        assert_eq!(cache.take(&state), Some(key));
        assert_eq!(cache.take(&state), None);
        assert_eq!(cache.take("unknown"), None);
    }

    #[test]
    fn test_expired_state_is_rejected() {
        let cache = StateCache::new(NonZeroUsize::new(4).unwrap(), Duration::ZERO);
        let state = cache.begin(MachineKey::from_bytes([1; 32]));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.take(&state), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_is_bounded() {
        let cache = StateCache::new(NonZeroUsize::new(2).unwrap(), STATE_TTL);
        let first = cache.begin(MachineKey::from_bytes([1; 32]));
        cache.begin(MachineKey::from_bytes([2; 32]));
        cache.begin(MachineKey::from_bytes([3; 32]));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.take(&first), None);
    }

    #[test]
    fn test_authorize_url_carries_state() {
        let provider = OidcProvider {
            client: reqwest::Client::new(),
            client_id: "mesh".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "https://mesh.example.com/oidc/callback".to_string(),
            authorization_endpoint: "https://id.example.com/authorize".to_string(),
            token_endpoint: "https://id.example.com/token".to_string(),
            userinfo_endpoint: "https://id.example.com/userinfo".to_string(),
        };
        let url = provider.authorize_url("abc123");
        assert!(url.starts_with("https://id.example.com/authorize?"));
        assert!(url.contains("state=abc123"));
        assert!(url.contains("client_id=mesh"));
        assert!(url.contains("redirect_uri=https%3A%2F%2Fmesh.example.com%2Foidc%2Fcallback"));
    }
}
