//! # Server and Machine Identity
//!
//! - [`ServerKey`]: the Ed25519 signing key that identifies this coordination
//!   server to nodes. The public half is served at `GET /key`.
//! - [`MachineKey`]: the 32-byte public key a node presents in `/machine/{id}`
//!   paths, used as the stable identifier of a machine record.
//!
//! ## Key File Format
//!
//! The signing key is persisted as 64 lowercase hex characters (the 32-byte
//! secret scalar), optionally followed by a newline. A missing file is
//! generated on first start; a present but unreadable or malformed file is a
//! fatal startup condition.

use std::path::Path;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::info;

use crate::error::StartupError;

// ============================================================================
// Server Signing Key
// ============================================================================

#[derive(Clone)]
pub struct ServerKey {
    signing_key: SigningKey,
}

impl ServerKey {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret),
        }
    }

    /// Load the key at `path`, creating it if the file does not exist.
    pub fn load_or_generate(path: &Path) -> Result<Self, StartupError> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse(path, &contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let key = Self::generate();
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent).map_err(|source| {
                        StartupError::SigningKeyUnreadable {
                            path: path.to_path_buf(),
                            source,
                        }
                    })?;
                }
                std::fs::write(path, format!("{}\n", key.secret_hex())).map_err(|source| {
                    StartupError::SigningKeyUnreadable {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                info!(path = %path.display(), public_key = %key.public_hex(), "generated new server key");
                Ok(key)
            }
            Err(source) => Err(StartupError::SigningKeyUnreadable {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn parse(path: &Path, contents: &str) -> Result<Self, StartupError> {
        let invalid = |reason: String| StartupError::SigningKeyInvalid {
            path: path.to_path_buf(),
            reason,
        };
        let bytes = hex::decode(contents.trim()).map_err(|e| invalid(e.to_string()))?;
        let secret: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| invalid(format!("expected 32 bytes, found {}", b.len())))?;
        Ok(Self::from_secret_bytes(&secret))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.verifying_key().as_bytes())
    }

    fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Machine Key
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MachineKey([u8; 32]);

impl MachineKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for MachineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MachineKey({})", self.short())
    }
}

impl std::fmt::Display for MachineKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for MachineKey {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for MachineKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MachineKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
