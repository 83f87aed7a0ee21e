//! # Startup Error Taxonomy
//!
//! Conditions that abort process startup before anything is served. Runtime
//! paths use `anyhow` with context; once the supervised group is running, the
//! only terminal condition is a member task exiting (see [`crate::supervisor`]).

use std::net::SocketAddr;
use std::path::PathBuf;

/// Fatal-at-startup conditions.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    /// The signing key file exists but could not be read.
    #[error("cannot read signing key {path}: {source}")]
    SigningKeyUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The signing key file does not hold a valid key.
    #[error("cannot parse signing key {path}: {reason}")]
    SigningKeyInvalid { path: PathBuf, reason: String },

    /// The configured storage backend selector is not supported.
    #[error("unsupported storage backend {0:?} (supported: memory)")]
    UnsupportedStore(String),

    /// The automatic-certificate challenge type is not one of the known values.
    #[error("unknown value for automatic certificate challenge type: {0:?} (expected TLS-ALPN-01 or HTTP-01)")]
    UnknownChallengeType(String),

    /// The HTTP-01 challenge strategy was selected without a listen address.
    #[error("HTTP-01 challenge requires a challenge listen address")]
    MissingChallengeListener,

    /// The static certificate or key could not be loaded.
    #[error("cannot load TLS material from {path}: {reason}")]
    Certificate { path: PathBuf, reason: String },

    /// A listening socket could not be bound.
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The identity provider could not be discovered.
    #[error("identity provider setup failed: {0}")]
    Oidc(String),

    /// An OIDC namespace match rule is not a valid regular expression.
    #[error("invalid namespace match rule {pattern:?}: {source}")]
    MatchRule {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}
