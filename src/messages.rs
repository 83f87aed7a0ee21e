//! # Node-Facing Wire Messages
//!
//! JSON bodies exchanged with node agents on the HTTP surface.
//!
//! | Endpoint | Request | Response |
//! |----------|---------|----------|
//! | `POST /machine/{id}` | [`RegisterRequest`] | [`RegisterResponse`] |
//! | `POST /machine/{id}/map` | [`MapRequest`] | [`MapResponse`] (one body, or a frame stream) |
//!
//! ## Map Stream Framing
//!
//! When a [`MapRequest`] asks to `stream`, the response body is a sequence of
//! frames, each a little-endian `u32` byte length followed by that many bytes
//! of JSON-encoded [`MapResponse`]. Keep-alive frames carry only
//! `keep_alive: true`.
//!
//! ## Limits
//!
//! - `MAX_FRAME_SIZE`: largest frame accepted by [`decode_frame`] (4 MiB)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::MachineKey;
use crate::relay_map::RelayMap;
use crate::store::Machine;

/// Largest map frame accepted when decoding.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const FRAME_LEN_PREFIX: usize = 4;

// ============================================================================
// Registration
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(default)]
    pub hostname: String,
    /// A past value asks the server to log the machine out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub machine_authorized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

// ============================================================================
// Map
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapRequest {
    pub node_key: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub omit_peers: bool,
    /// Report nothing back to the server; only fetch.
    #[serde(default)]
    pub read_only: bool,
}

/// One machine as presented to itself or to its peers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeView {
    pub id: u64,
    pub name: String,
    pub machine_key: MachineKey,
    pub node_key: String,
    pub addresses: Vec<String>,
    pub endpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry: Option<DateTime<Utc>>,
}

impl NodeView {
    pub fn from_machine(machine: &Machine, base_domain: &str) -> Self {
        Self {
            id: machine.id,
            name: machine.fqdn(base_domain),
            machine_key: machine.machine_key,
            node_key: machine.node_key.clone(),
            addresses: machine
                .ip_address
                .iter()
                .map(|ip| format!("{ip}/32"))
                .collect(),
            endpoints: machine.endpoints.clone(),
            last_seen: machine.last_seen,
            expiry: machine.expiry,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<NodeView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_map: Option<RelayMap>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub keep_alive: bool,
}

impl MapResponse {
    pub fn keep_alive() -> Self {
        Self {
            keep_alive: true,
            ..Self::default()
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

pub fn encode_frame(response: &MapResponse) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(response)?;
    let mut frame = Vec::with_capacity(FRAME_LEN_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds limit")]
    TooLarge(usize),
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Decode the first complete frame in `buf`.
///
/// Returns `Ok(None)` if more bytes are needed, otherwise the message and
/// the number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(MapResponse, usize)>, FrameError> {
    let Some(prefix) = buf.get(..FRAME_LEN_PREFIX) else {
        return Ok(None);
    };
    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let Some(body) = buf.get(FRAME_LEN_PREFIX..FRAME_LEN_PREFIX + len) else {
        return Ok(None);
    };
    let response = serde_json::from_slice(body)?;
    Ok(Some((response, FRAME_LEN_PREFIX + len)))
}
