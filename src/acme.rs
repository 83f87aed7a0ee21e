//! # Automatic Certificates
//!
//! [`CertManager`] obtains and renews a certificate for exactly one hostname
//! from an ACME directory (Let's Encrypt by default) and serves it to rustls
//! as a [`ResolvesServerCert`].
//!
//! ## Challenges
//!
//! - **TLS-ALPN-01**: the CA connects to the public listener offering ALPN
//!   `acme-tls/1`; [`CertManager`] answers that handshake with a short-lived
//!   self-signed certificate carrying the `acmeIdentifier` extension.
//! - **HTTP-01**: the CA fetches `/.well-known/acme-challenge/{token}` from the
//!   secondary plaintext listener ([`serve_http_challenge`]). Every other path
//!   on that listener is redirected (302) to `server_url` + request URI.
//!
//! ## Cache Layout
//!
//! | File | Content |
//! |------|---------|
//! | `{cache}/account.json` | ACME account credentials |
//! | `{cache}/{hostname}.pem` | private key PEM followed by the certificate chain |
//!
//! ## Renewal
//!
//! [`CertManager::run_renewal`] checks the certificate every
//! [`RENEWAL_CHECK_INTERVAL`] and orders a new one once it is within
//! [`RENEWAL_MARGIN`] of expiry. Failed attempts are logged and retried after
//! [`RENEWAL_RETRY_DELAY`]; the previous certificate stays in service.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, Identifier, NewAccount, NewOrder,
    OrderStatus,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::StartupError;
use crate::tls::{AcmePlan, ChallengeType, ALPN_ACME_TLS};

/// Renew once the certificate expires within this window.
pub const RENEWAL_MARGIN: TimeDelta = TimeDelta::days(30);

pub const RENEWAL_CHECK_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

pub const RENEWAL_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Order status polls before giving up on a single attempt.
const ORDER_POLL_ATTEMPTS: u32 = 10;

const ORDER_POLL_INITIAL_DELAY: Duration = Duration::from_millis(250);

const ACCOUNT_FILE: &str = "account.json";

struct Installed {
    key: Arc<CertifiedKey>,
    not_after: DateTime<Utc>,
}

pub struct CertManager {
    plan: AcmePlan,
    current: RwLock<Option<Installed>>,
    alpn_challenge: RwLock<Option<Arc<CertifiedKey>>>,
    http_tokens: DashMap<String, String>,
}

impl CertManager {
    /// Prepare the cache directory and load a cached certificate if one exists.
    pub fn new(plan: &AcmePlan) -> Result<Self, StartupError> {
        std::fs::create_dir_all(&plan.cache_dir).map_err(|e| StartupError::Certificate {
            path: plan.cache_dir.clone(),
            reason: e.to_string(),
        })?;

        let manager = Self {
            plan: plan.clone(),
            current: RwLock::new(None),
            alpn_challenge: RwLock::new(None),
            http_tokens: DashMap::new(),
        };

        let cached = manager.cert_path();
        if cached.exists() {
            match std::fs::read(&cached)
                .map_err(anyhow::Error::from)
                .and_then(|pem| manager.install(&pem))
            {
                Ok(not_after) => info!(host = %plan.hostname, %not_after, "loaded cached certificate"),
                Err(e) => warn!(path = %cached.display(), error = %e, "ignoring unusable cached certificate"),
            }
        }
        Ok(manager)
    }

    pub fn hostname(&self) -> &str {
        &self.plan.hostname
    }

    fn cert_path(&self) -> PathBuf {
        self.plan.cache_dir.join(format!("{}.pem", self.plan.hostname))
    }

    pub fn not_after(&self) -> Option<DateTime<Utc>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|installed| installed.not_after)
    }

    pub fn needs_renewal(&self, now: DateTime<Utc>) -> bool {
        match self.not_after() {
            Some(not_after) => not_after - now < RENEWAL_MARGIN,
            None => true,
        }
    }

    /// Key authorization for an outstanding HTTP-01 token.
    pub fn http01_response(&self, token: &str) -> Option<String> {
        self.http_tokens.get(token).map(|entry| entry.value().clone())
    }

    /// Parse a key + chain PEM bundle and make it the served certificate.
    fn install(&self, pem: &[u8]) -> Result<DateTime<Utc>> {
        let key = PrivateKeyDer::from_pem_slice(pem).context("no private key in bundle")?;
        let chain = CertificateDer::pem_slice_iter(pem)
            .collect::<Result<Vec<_>, _>>()
            .context("malformed certificate in bundle")?;
        let leaf = chain.first().context("no certificate in bundle")?;
        let not_after = leaf_not_after(leaf)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
            .context("unsupported private key type")?;
        let certified = Arc::new(CertifiedKey::new(chain, signing_key));

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Installed {
            key: certified,
            not_after,
        });
        Ok(not_after)
    }

    /// Pick the certificate for a handshake. Unknown or missing SNI is refused.
    fn select_cert(&self, server_name: Option<&str>, offers_acme_alpn: bool) -> Option<Arc<CertifiedKey>> {
        let name = server_name?;
        if !name.eq_ignore_ascii_case(&self.plan.hostname) {
            debug!(sni = name, "refusing handshake for foreign hostname");
            return None;
        }
        if offers_acme_alpn {
            return self
                .alpn_challenge
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
        }
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|installed| installed.key.clone())
    }

    // ------------------------------------------------------------------------
    // Ordering
    // ------------------------------------------------------------------------

    async fn account(&self) -> Result<Account> {
        let path = self.plan.cache_dir.join(ACCOUNT_FILE);
        if let Ok(raw) = tokio::fs::read(&path).await {
            let credentials: AccountCredentials =
                serde_json::from_slice(&raw).context("decoding cached ACME account")?;
            return Account::from_credentials(credentials)
                .await
                .context("restoring ACME account");
        }

        let contact = self.plan.email.as_ref().map(|email| format!("mailto:{email}"));
        let contact: Vec<&str> = contact.iter().map(String::as_str).collect();
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &contact,
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.plan.directory_url,
            None,
        )
        .await
        .context("creating ACME account")?;

        tokio::fs::write(&path, serde_json::to_vec(&credentials)?)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(directory = %self.plan.directory_url, "registered ACME account");
        Ok(account)
    }

    /// Run one complete order and install the result.
    pub async fn obtain(&self) -> Result<DateTime<Utc>> {
        let account = self.account().await?;
        let host = self.plan.hostname.clone();
        let identifiers = [Identifier::Dns(host.clone())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .context("creating order")?;

        let wanted = match self.plan.challenge {
            ChallengeType::TlsAlpn01 => instant_acme::ChallengeType::TlsAlpn01,
            ChallengeType::Http01 => instant_acme::ChallengeType::Http01,
        };

        let mut tokens = Vec::new();
        let authorizations = order.authorizations().await.context("fetching authorizations")?;
        for authz in &authorizations {
            match &authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                other => bail!("authorization for {host} is {other:?}"),
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .with_context(|| format!("CA offered no {wanted:?} challenge"))?;
            let key_auth = order.key_authorization(challenge);

            match self.plan.challenge {
                ChallengeType::Http01 => {
                    self.http_tokens
                        .insert(challenge.token.clone(), key_auth.as_str().to_string());
                    tokens.push(challenge.token.clone());
                }
                ChallengeType::TlsAlpn01 => {
                    let cert = alpn_challenge_cert(&host, key_auth.digest().as_ref())?;
                    *self.alpn_challenge.write().unwrap_or_else(PoisonError::into_inner) = Some(cert);
                }
            }
            order
                .set_challenge_ready(&challenge.url)
                .await
                .context("marking challenge ready")?;
        }

        let status = self.poll_order(&mut order).await;
        for token in &tokens {
            self.http_tokens.remove(token);
        }
        *self.alpn_challenge.write().unwrap_or_else(PoisonError::into_inner) = None;

        match status? {
            OrderStatus::Ready | OrderStatus::Valid => {}
            other => bail!("order for {host} ended {other:?}"),
        }

        let key_pair = rcgen::KeyPair::generate()?;
        let mut params = rcgen::CertificateParams::new(vec![host.clone()])?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await.context("finalizing order")?;

        let mut chain = None;
        for _ in 0..ORDER_POLL_ATTEMPTS {
            if let Some(pem) = order.certificate().await.context("downloading certificate")? {
                chain = Some(pem);
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        let chain = chain.context("certificate was not issued in time")?;

        let bundle = format!("{}{}", key_pair.serialize_pem(), chain);
        let not_after = self.install(bundle.as_bytes())?;
        let path = self.cert_path();
        tokio::fs::write(&path, &bundle)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        info!(host = %host, %not_after, "certificate issued");
        Ok(not_after)
    }

    async fn poll_order(&self, order: &mut instant_acme::Order) -> Result<OrderStatus> {
        let mut delay = ORDER_POLL_INITIAL_DELAY;
        for _ in 0..ORDER_POLL_ATTEMPTS {
            tokio::time::sleep(delay).await;
            let state = order.refresh().await.context("polling order")?;
            match &state.status {
                OrderStatus::Pending | OrderStatus::Processing => delay *= 2,
                status => return Ok(status.clone()),
            }
        }
        bail!("order still pending after {ORDER_POLL_ATTEMPTS} polls")
    }

    /// Keep the certificate fresh until `token` is cancelled.
    pub async fn run_renewal(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        loop {
            let wait = if self.needs_renewal(Utc::now()) {
                match self.obtain().await {
                    Ok(_) => RENEWAL_CHECK_INTERVAL,
                    Err(e) => {
                        warn!(host = %self.plan.hostname, error = %format!("{e:#}"), "certificate order failed");
                        RENEWAL_RETRY_DELAY
                    }
                }
            } else {
                RENEWAL_CHECK_INTERVAL
            };

            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

impl std::fmt::Debug for CertManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertManager")
            .field("hostname", &self.plan.hostname)
            .field("challenge", &self.plan.challenge)
            .field("not_after", &self.not_after())
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for CertManager {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let offers_acme = client_hello
            .alpn()
            .is_some_and(|mut protocols| protocols.any(|p| p == ALPN_ACME_TLS));
        self.select_cert(client_hello.server_name(), offers_acme)
    }
}

fn leaf_not_after(leaf: &CertificateDer<'_>) -> Result<DateTime<Utc>> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(leaf.as_ref()).context("parsing leaf certificate")?;
    DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .context("certificate expiry out of range")
}

/// Self-signed certificate answering a TLS-ALPN-01 challenge (RFC 8737).
fn alpn_challenge_cert(host: &str, key_auth_digest: &[u8]) -> Result<Arc<CertifiedKey>> {
    let key_pair = rcgen::KeyPair::generate()?;
    let mut params = rcgen::CertificateParams::new(vec![host.to_string()])?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(key_auth_digest)];
    let cert = params.self_signed(&key_pair)?;

    let key = PrivateKeyDer::Pkcs8(key_pair.serialize_der().into());
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
    Ok(Arc::new(CertifiedKey::new(vec![cert.der().clone()], signing_key)))
}

// ============================================================================
// HTTP-01 Challenge Listener
// ============================================================================

#[derive(Clone)]
struct ChallengeState {
    manager: Arc<CertManager>,
    server_url: String,
}

/// Challenge responder plus redirect-everything-else fallback.
pub fn challenge_router(manager: Arc<CertManager>, server_url: String) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/{token}", get(challenge_token))
        .fallback(redirect_to_server_url)
        .with_state(ChallengeState {
            manager,
            server_url: server_url.trim_end_matches('/').to_string(),
        })
}

async fn challenge_token(State(state): State<ChallengeState>, Path(token): Path<String>) -> Response {
    match state.manager.http01_response(&token) {
        Some(key_auth) => key_auth.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn redirect_to_server_url(State(state): State<ChallengeState>, uri: Uri) -> Response {
    let target = match uri.path_and_query() {
        Some(pq) => format!("{}{}", state.server_url, pq),
        None => state.server_url.clone(),
    };
    (StatusCode::FOUND, [(header::LOCATION, target)]).into_response()
}

/// Serve the HTTP-01 listener until `token` is cancelled.
pub async fn serve_http_challenge(
    listener: TcpListener,
    manager: Arc<CertManager>,
    server_url: String,
    token: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "HTTP-01 challenge listener started");
    axum::serve(listener, challenge_router(manager, server_url))
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .context("HTTP-01 challenge listener failed")
}
