//! # TLS Provisioning
//!
//! TLS setup is split into a pure decision and a build step:
//!
//! 1. [`resolve_tls`] maps the configured inputs to exactly one [`TlsPlan`]:
//!    automatic certificates (TLS-ALPN-01 or HTTP-01), a static
//!    certificate, or plaintext. An unknown challenge type is a startup error.
//! 2. [`TlsPlan::build`] turns the plan into a [`TlsSetup`]: the acceptor the
//!    multiplexer uses plus, for automatic certificates, the
//!    [`CertManager`] whose renewal loop and optional HTTP challenge listener
//!    the server runs as supervised members. Nothing is spawned here.
//!
//! ## Modes
//!
//! | Inputs | Plan | ALPN |
//! |--------|------|------|
//! | hostname + `TLS-ALPN-01` | [`TlsPlan::Acme`] | `h2`, `http/1.1`, `acme-tls/1` |
//! | hostname + `HTTP-01` | [`TlsPlan::Acme`] + challenge listener | `h2`, `http/1.1` |
//! | cert + key paths | [`TlsPlan::Static`], client certificate required | `http/1.1` |
//! | none | [`TlsPlan::Plaintext`] | |
//!
//! In static mode every client must present a certificate, but any
//! certificate is accepted; identity is established at the application layer.
//! RPC framing is detected after decryption by the multiplexer, not through
//! ALPN.
//!
//! ## SECURITY WARNING
//!
//! [`AnyClientCertVerifier`] uses the `dangerous()` verifier surface on
//! purpose: it checks handshake signatures but not certificate chains.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;
use tracing::warn;

use crate::acme::CertManager;
use crate::config::TlsSettings;
use crate::error::StartupError;

/// Lazily-initialized crypto provider for rustls.
/// Uses ring as the underlying cryptographic implementation.
pub(crate) static CRYPTO_PROVIDER: std::sync::LazyLock<Arc<rustls::crypto::CryptoProvider>> =
    std::sync::LazyLock::new(|| Arc::new(rustls::crypto::ring::default_provider()));

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";
/// RFC 8737 challenge protocol.
pub const ALPN_ACME_TLS: &[u8] = b"acme-tls/1";

// ============================================================================
// Decision
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChallengeType {
    TlsAlpn01,
    Http01,
}

impl FromStr for ChallengeType {
    type Err = StartupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TLS-ALPN-01" => Ok(Self::TlsAlpn01),
            "HTTP-01" => Ok(Self::Http01),
            other => Err(StartupError::UnknownChallengeType(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcmePlan {
    pub hostname: String,
    pub cache_dir: PathBuf,
    pub challenge: ChallengeType,
    pub directory_url: String,
    pub email: Option<String>,
    /// Secondary plaintext listener; set only for [`ChallengeType::Http01`].
    pub http_listen: Option<SocketAddr>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsPlan {
    Plaintext,
    Static { cert_path: PathBuf, key_path: PathBuf },
    Acme(AcmePlan),
}

impl TlsPlan {
    pub fn is_tls(&self) -> bool {
        !matches!(self, TlsPlan::Plaintext)
    }
}

/// Decide the TLS mode from configuration. Performs no I/O.
pub fn resolve_tls(settings: &TlsSettings) -> Result<TlsPlan, StartupError> {
    if let Some(hostname) = &settings.letsencrypt_hostname {
        let challenge: ChallengeType = settings.letsencrypt_challenge_type.parse()?;
        let http_listen = match challenge {
            ChallengeType::TlsAlpn01 => None,
            ChallengeType::Http01 => Some(
                settings
                    .letsencrypt_listen
                    .ok_or(StartupError::MissingChallengeListener)?,
            ),
        };
        return Ok(TlsPlan::Acme(AcmePlan {
            hostname: hostname.clone(),
            cache_dir: settings.letsencrypt_cache_dir.clone(),
            challenge,
            directory_url: settings.acme_url.clone(),
            email: settings.acme_email.clone(),
            http_listen,
        }));
    }

    match (&settings.tls_cert_path, &settings.tls_key_path) {
        (Some(cert_path), Some(key_path)) => Ok(TlsPlan::Static {
            cert_path: cert_path.clone(),
            key_path: key_path.clone(),
        }),
        (Some(cert_path), None) => Err(StartupError::Certificate {
            path: cert_path.clone(),
            reason: "certificate configured without a key path".to_string(),
        }),
        _ => Ok(TlsPlan::Plaintext),
    }
}

/// Advisory text when the advertised URL scheme disagrees with the transport.
pub fn scheme_advisory(server_url: &str, tls: bool) -> Option<&'static str> {
    if tls && !server_url.starts_with("https://") {
        Some("listening with TLS but server_url does not start with https://")
    } else if !tls && !server_url.starts_with("http://") {
        Some("listening without TLS but server_url does not start with http://")
    } else {
        None
    }
}

// ============================================================================
// Build
// ============================================================================

/// Materialized TLS state handed to the multiplexer and the supervisor.
pub struct TlsSetup {
    pub acceptor: Option<TlsAcceptor>,
    pub cert_manager: Option<Arc<CertManager>>,
    /// Address for the HTTP-01 challenge listener, when that strategy is active.
    pub challenge_listen: Option<SocketAddr>,
}

impl std::fmt::Debug for TlsSetup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSetup")
            .field("tls", &self.acceptor.is_some())
            .field("acme", &self.cert_manager.is_some())
            .field("challenge_listen", &self.challenge_listen)
            .finish()
    }
}

impl TlsPlan {
    /// Load material and construct the acceptor. Logs the scheme advisory.
    pub fn build(&self, server_url: &str) -> Result<TlsSetup, StartupError> {
        if let Some(advice) = scheme_advisory(server_url, self.is_tls()) {
            warn!(server_url, "{advice}");
        }

        match self {
            TlsPlan::Plaintext => Ok(TlsSetup {
                acceptor: None,
                cert_manager: None,
                challenge_listen: None,
            }),
            TlsPlan::Static { cert_path, key_path } => {
                let certs = load_certs(cert_path)?;
                let key = load_key(key_path)?;
                let config = static_server_config(certs, key).map_err(|e| StartupError::Certificate {
                    path: cert_path.clone(),
                    reason: e.to_string(),
                })?;
                Ok(TlsSetup {
                    acceptor: Some(TlsAcceptor::from(Arc::new(config))),
                    cert_manager: None,
                    challenge_listen: None,
                })
            }
            TlsPlan::Acme(plan) => {
                let manager = Arc::new(CertManager::new(plan)?);
                let config = acme_server_config(manager.clone(), plan.challenge).map_err(|e| {
                    StartupError::Certificate {
                        path: plan.cache_dir.clone(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(TlsSetup {
                    acceptor: Some(TlsAcceptor::from(Arc::new(config))),
                    cert_manager: Some(manager),
                    challenge_listen: plan.http_listen,
                })
            }
        }
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, StartupError> {
    let fail = |reason: String| StartupError::Certificate {
        path: path.to_path_buf(),
        reason,
    };
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| fail(e.to_string()))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| fail(e.to_string()))?;
    if certs.is_empty() {
        return Err(fail("no certificates found".to_string()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, StartupError> {
    PrivateKeyDer::from_pem_file(path).map_err(|e| StartupError::Certificate {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

fn static_server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig, rustls::Error> {
    let mut config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(Arc::new(AnyClientCertVerifier))
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
    Ok(config)
}

fn acme_server_config(
    manager: Arc<CertManager>,
    challenge: ChallengeType,
) -> Result<rustls::ServerConfig, rustls::Error> {
    let mut config = rustls::ServerConfig::builder_with_provider(CRYPTO_PROVIDER.clone())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(manager);
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    if challenge == ChallengeType::TlsAlpn01 {
        config.alpn_protocols.push(ALPN_ACME_TLS.to_vec());
    }
    Ok(config)
}

// ============================================================================
// Client Certificate Verification
// ============================================================================

/// Requires a client certificate and a valid handshake signature; accepts any chain.
#[derive(Debug)]
pub struct AnyClientCertVerifier;

impl rustls::server::danger::ClientCertVerifier for AnyClientCertVerifier {
    fn root_hint_subjects(&self) -> &[rustls::DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::server::danger::ClientCertVerified, rustls::Error> {
        use x509_parser::prelude::*;

        X509Certificate::from_der(end_entity.as_ref()).map_err(|_| {
            rustls::Error::InvalidCertificate(rustls::CertificateError::BadEncoding)
        })?;
        Ok(rustls::server::danger::ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &CRYPTO_PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        CRYPTO_PROVIDER
            .signature_verification_algorithms
            .supported_schemes()
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }
}
