//! # Server Configuration
//!
//! [`ServerConfig`] is the immutable snapshot of every operational setting.
//! It is produced once at startup from the command-line / environment surface
//! ([`Args`]) and then shared read-only for the lifetime of the process.
//!
//! Every flag can also be given as a `MESHWARD_*` environment variable.
//! Durations are integer seconds.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Let's Encrypt production directory.
pub const DEFAULT_ACME_DIRECTORY: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Interval shared by the background schedulers and the long-poll change check.
pub const DEFAULT_SCHEDULER_INTERVAL: Duration = Duration::from_secs(5);

/// Bounded read timeout for the HTTP server. Writes are unbounded for long-poll.
pub const DEFAULT_HTTP_READ_TIMEOUT: Duration = Duration::from_secs(30);

pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Configuration Snapshot
// ============================================================================

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Externally visible base URL. Its scheme is checked against the TLS mode.
    pub server_url: String,
    pub private_key_path: PathBuf,
    pub ephemeral_node_inactivity_timeout: Duration,
    pub store_backend: String,
    /// DNS suffix handed to nodes in map responses.
    pub base_domain: String,
    pub tls: TlsSettings,
    pub relay: RelaySettings,
    pub oidc: Option<OidcSettings>,
    pub registration: RegistrationSettings,
    pub scheduler_interval: Duration,
    pub http_read_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl ServerConfig {
    /// A plaintext, in-memory configuration with default timings.
    pub fn new(listen_addr: SocketAddr, server_url: impl Into<String>, private_key_path: PathBuf) -> Self {
        Self {
            listen_addr,
            server_url: server_url.into(),
            private_key_path,
            ephemeral_node_inactivity_timeout: Duration::from_secs(30 * 60),
            store_backend: "memory".to_string(),
            base_domain: "mesh.local".to_string(),
            tls: TlsSettings::default(),
            relay: RelaySettings::default(),
            oidc: None,
            registration: RegistrationSettings::default(),
            scheduler_interval: DEFAULT_SCHEDULER_INTERVAL,
            http_read_timeout: DEFAULT_HTTP_READ_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

/// Inputs to the TLS decision in [`crate::tls::resolve_tls`].
#[derive(Clone, Debug)]
pub struct TlsSettings {
    pub letsencrypt_hostname: Option<String>,
    pub letsencrypt_cache_dir: PathBuf,
    /// `TLS-ALPN-01` or `HTTP-01`; validated at resolution time.
    pub letsencrypt_challenge_type: String,
    /// Secondary plaintext listener for the HTTP-01 challenge.
    pub letsencrypt_listen: Option<SocketAddr>,
    pub acme_url: String,
    pub acme_email: Option<String>,
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            letsencrypt_hostname: None,
            letsencrypt_cache_dir: PathBuf::from("/var/lib/meshward/cache"),
            letsencrypt_challenge_type: "HTTP-01".to_string(),
            letsencrypt_listen: Some(SocketAddr::from(([0, 0, 0, 0], 80))),
            acme_url: DEFAULT_ACME_DIRECTORY.to_string(),
            acme_email: None,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RelaySettings {
    pub urls: Vec<String>,
    pub paths: Vec<PathBuf>,
    pub auto_update: bool,
    pub update_frequency: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            paths: Vec::new(),
            auto_update: false,
            update_frequency: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Clone, Debug)]
pub struct OidcSettings {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    /// Ordered `(regex, namespace)` pairs; the first matching e-mail rule wins.
    pub match_map: Vec<(String, String)>,
}

#[derive(Clone, Copy, Debug)]
pub struct RegistrationSettings {
    pub default_duration: Duration,
    pub max_duration: Duration,
}

impl Default for RegistrationSettings {
    fn default() -> Self {
        Self {
            default_duration: Duration::from_secs(8 * 60 * 60),
            max_duration: Duration::from_secs(10_000 * 60 * 60),
        }
    }
}

// ============================================================================
// Command-Line Surface
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "meshward")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, env = "MESHWARD_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    #[arg(long, env = "MESHWARD_SERVER_URL", default_value = "http://127.0.0.1:8080")]
    pub server_url: String,

    #[arg(long, env = "MESHWARD_PRIVATE_KEY_PATH", default_value = "private.key")]
    pub private_key_path: PathBuf,

    #[arg(long, env = "MESHWARD_EPHEMERAL_NODE_INACTIVITY_TIMEOUT", default_value = "1800")]
    pub ephemeral_node_inactivity_timeout: u64,

    #[arg(long, env = "MESHWARD_STORE_BACKEND", default_value = "memory")]
    pub store_backend: String,

    #[arg(long, env = "MESHWARD_BASE_DOMAIN", default_value = "mesh.local")]
    pub base_domain: String,

    #[arg(long, env = "MESHWARD_LETSENCRYPT_HOSTNAME")]
    pub letsencrypt_hostname: Option<String>,

    #[arg(long, env = "MESHWARD_LETSENCRYPT_CACHE_DIR", default_value = "/var/lib/meshward/cache")]
    pub letsencrypt_cache_dir: PathBuf,

    #[arg(long, env = "MESHWARD_LETSENCRYPT_CHALLENGE_TYPE", default_value = "HTTP-01")]
    pub letsencrypt_challenge_type: String,

    #[arg(long, env = "MESHWARD_LETSENCRYPT_LISTEN", default_value = "0.0.0.0:80")]
    pub letsencrypt_listen: SocketAddr,

    #[arg(long, env = "MESHWARD_ACME_URL", default_value = DEFAULT_ACME_DIRECTORY)]
    pub acme_url: String,

    #[arg(long, env = "MESHWARD_ACME_EMAIL")]
    pub acme_email: Option<String>,

    #[arg(long, env = "MESHWARD_TLS_CERT_PATH")]
    pub tls_cert_path: Option<PathBuf>,

    #[arg(long, env = "MESHWARD_TLS_KEY_PATH")]
    pub tls_key_path: Option<PathBuf>,

    #[arg(long = "relay-url", env = "MESHWARD_RELAY_URLS", value_delimiter = ',')]
    pub relay_urls: Vec<String>,

    #[arg(long = "relay-path", env = "MESHWARD_RELAY_PATHS", value_delimiter = ',')]
    pub relay_paths: Vec<PathBuf>,

    #[arg(long, env = "MESHWARD_RELAY_AUTO_UPDATE")]
    pub relay_auto_update: bool,

    #[arg(long, env = "MESHWARD_RELAY_UPDATE_FREQUENCY", default_value = "86400")]
    pub relay_update_frequency: u64,

    #[arg(long, env = "MESHWARD_OIDC_ISSUER")]
    pub oidc_issuer: Option<String>,

    #[arg(long, env = "MESHWARD_OIDC_CLIENT_ID", default_value = "")]
    pub oidc_client_id: String,

    #[arg(long, env = "MESHWARD_OIDC_CLIENT_SECRET", default_value = "")]
    pub oidc_client_secret: String,

    /// `REGEX=NAMESPACE`, repeatable; evaluated in order.
    #[arg(long = "oidc-match", env = "MESHWARD_OIDC_MATCH_MAP", value_delimiter = ',', value_parser = parse_match_rule)]
    pub oidc_match_map: Vec<(String, String)>,

    #[arg(long, env = "MESHWARD_DEFAULT_MACHINE_REGISTRATION_DURATION", default_value = "28800")]
    pub default_machine_registration_duration: u64,

    #[arg(long, env = "MESHWARD_MAX_MACHINE_REGISTRATION_DURATION", default_value = "36000000")]
    pub max_machine_registration_duration: u64,

    #[arg(long, env = "MESHWARD_SCHEDULER_INTERVAL", default_value = "5")]
    pub scheduler_interval: u64,

    #[arg(long, env = "MESHWARD_HTTP_READ_TIMEOUT", default_value = "30")]
    pub http_read_timeout: u64,

    #[arg(long, env = "MESHWARD_KEEPALIVE_INTERVAL", default_value = "60")]
    pub keepalive_interval: u64,
}

impl Args {
    pub fn into_config(self) -> ServerConfig {
        let oidc = self.oidc_issuer.map(|issuer| OidcSettings {
            issuer,
            client_id: self.oidc_client_id,
            client_secret: self.oidc_client_secret,
            match_map: self.oidc_match_map,
        });

        ServerConfig {
            listen_addr: self.listen_addr,
            server_url: self.server_url,
            private_key_path: self.private_key_path,
            ephemeral_node_inactivity_timeout: Duration::from_secs(self.ephemeral_node_inactivity_timeout),
            store_backend: self.store_backend,
            base_domain: self.base_domain,
            tls: TlsSettings {
                letsencrypt_hostname: self.letsencrypt_hostname.filter(|h| !h.is_empty()),
                letsencrypt_cache_dir: self.letsencrypt_cache_dir,
                letsencrypt_challenge_type: self.letsencrypt_challenge_type,
                letsencrypt_listen: Some(self.letsencrypt_listen),
                acme_url: self.acme_url,
                acme_email: self.acme_email,
                tls_cert_path: self.tls_cert_path,
                tls_key_path: self.tls_key_path,
            },
            relay: RelaySettings {
                urls: self.relay_urls,
                paths: self.relay_paths,
                auto_update: self.relay_auto_update,
                update_frequency: Duration::from_secs(self.relay_update_frequency.max(1)),
            },
            oidc,
            registration: RegistrationSettings {
                default_duration: Duration::from_secs(self.default_machine_registration_duration),
                max_duration: Duration::from_secs(self.max_machine_registration_duration),
            },
            scheduler_interval: Duration::from_secs(self.scheduler_interval.max(1)),
            http_read_timeout: Duration::from_secs(self.http_read_timeout),
            keepalive_interval: Duration::from_secs(self.keepalive_interval.max(1)),
        }
    }
}

fn parse_match_rule(s: &str) -> Result<(String, String), String> {
    let (pattern, namespace) = s
        .rsplit_once('=')
        .ok_or_else(|| format!("expected REGEX=NAMESPACE, got {s:?}"))?;
    if pattern.is_empty() || namespace.is_empty() {
        return Err(format!("expected REGEX=NAMESPACE, got {s:?}"));
    }
    Ok((pattern.to_string(), namespace.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_plaintext_memory() {
        let config = Args::parse_from(["meshward"]).into_config();
        assert_eq!(config.store_backend, "memory");
        assert_eq!(config.scheduler_interval, DEFAULT_SCHEDULER_INTERVAL);
        assert_eq!(config.http_read_timeout, DEFAULT_HTTP_READ_TIMEOUT);
        assert!(config.tls.letsencrypt_hostname.is_none());
        assert!(config.tls.tls_cert_path.is_none());
        assert!(config.oidc.is_none());
    }

    #[test]
    fn test_oidc_enabled_by_issuer() {
        let config = Args::parse_from([
            "meshward",
            "--oidc-issuer",
            "https://id.example.com",
            "--oidc-client-id",
            "meshward",
            "--oidc-match",
            ".*@example\\.com=staff",
            "--oidc-match",
            ".*=guests",
        ])
        .into_config();

        let oidc = config.oidc.expect("oidc configured");
        assert_eq!(oidc.client_id, "meshward");
        assert_eq!(
            oidc.match_map,
            vec![
                (".*@example\\.com".to_string(), "staff".to_string()),
                (".*".to_string(), "guests".to_string()),
            ]
        );
    }

    #[test]
    fn test_relay_sources_split_on_commas() {
        let config = Args::parse_from([
            "meshward",
            "--relay-url",
            "https://a.example/derp.json,https://b.example/derp.json",
            "--relay-auto-update",
            "--relay-update-frequency",
            "60",
        ])
        .into_config();
        assert_eq!(config.relay.urls.len(), 2);
        assert!(config.relay.auto_update);
        assert_eq!(config.relay.update_frequency, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config = Args::parse_from([
            "meshward",
            "--relay-auto-update",
            "--relay-update-frequency",
            "0",
            "--scheduler-interval",
            "0",
            "--keepalive-interval",
            "0",
        ])
        .into_config();
        assert_eq!(config.relay.update_frequency, Duration::from_secs(1));
        assert_eq!(config.scheduler_interval, Duration::from_secs(1));
        assert_eq!(config.keepalive_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_match_rule_requires_both_sides() {
        assert!(parse_match_rule("nope").is_err());
        assert!(parse_match_rule("=ns").is_err());
        assert!(parse_match_rule("a=b=c").is_ok());
        assert_eq!(parse_match_rule("a=b=c").unwrap(), ("a=b".to_string(), "c".to_string()));
    }

    #[test]
    fn test_empty_hostname_means_no_acme() {
        let config = Args::parse_from(["meshward", "--letsencrypt-hostname", ""]).into_config();
        assert!(config.tls.letsencrypt_hostname.is_none());
    }
}
