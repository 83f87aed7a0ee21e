//! # Relay Map
//!
//! The relay map tells nodes which relay servers they can fall back to when a
//! direct tunnel cannot be established. It is assembled from one or more
//! sources (HTTP URLs and local JSON files) in the Tailscale DERP map format:
//!
//! ```json
//! { "Regions": { "900": { "RegionID": 900, "RegionCode": "home", "Nodes": [ ... ] } } }
//! ```
//!
//! ## Merge Order
//!
//! Sources are read URLs first, then files, each in configured order. A region
//! from a later source replaces an earlier region with the same id.
//!
//! ## Snapshot Semantics
//!
//! [`RelayMapHandle`] holds the current map behind an `Arc`. A refresh builds
//! a complete new map and swaps the pointer; readers keep whichever snapshot
//! they already cloned. A refresh in which any source fails replaces nothing.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use prometheus::IntGauge;
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayMap {
    #[serde(default)]
    pub regions: BTreeMap<u32, RelayRegion>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub omit_default_regions: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayRegion {
    #[serde(rename = "RegionID")]
    pub region_id: u32,
    #[serde(default)]
    pub region_code: String,
    #[serde(default)]
    pub region_name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub avoid: bool,
    #[serde(default)]
    pub nodes: Vec<RelayNode>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RelayNode {
    pub name: String,
    #[serde(rename = "RegionID")]
    pub region_id: u32,
    pub host_name: String,
    #[serde(rename = "IPv4", default, skip_serializing_if = "String::is_empty")]
    pub ipv4: String,
    #[serde(rename = "IPv6", default, skip_serializing_if = "String::is_empty")]
    pub ipv6: String,
    #[serde(rename = "STUNPort", default)]
    pub stun_port: i32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stun_only: bool,
    #[serde(rename = "DERPPort", default)]
    pub derp_port: u16,
}

impl RelayMap {
    /// Overlay `other` onto `self`; regions in `other` win on id collision.
    pub fn merge(&mut self, other: RelayMap) {
        self.regions.extend(other.regions);
        self.omit_default_regions |= other.omit_default_regions;
    }
}

// ============================================================================
// Sources
// ============================================================================

#[derive(Clone, Debug, Default)]
pub struct RelayMapSources {
    pub urls: Vec<String>,
    pub paths: Vec<PathBuf>,
}

impl RelayMapSources {
    pub fn is_empty(&self) -> bool {
        self.urls.is_empty() && self.paths.is_empty()
    }

    /// Fetch and merge every source. Fails if any single source fails.
    pub async fn fetch(&self, client: &reqwest::Client) -> Result<RelayMap> {
        let mut map = RelayMap::default();

        for url in &self.urls {
            let part: RelayMap = client
                .get(url)
                .send()
                .await
                .with_context(|| format!("fetching relay map from {url}"))?
                .error_for_status()
                .with_context(|| format!("fetching relay map from {url}"))?
                .json()
                .await
                .with_context(|| format!("decoding relay map from {url}"))?;
            debug!(url = %url, regions = part.regions.len(), "relay map source fetched");
            map.merge(part);
        }

        for path in &self.paths {
            let raw = tokio::fs::read(path)
                .await
                .with_context(|| format!("reading relay map {}", path.display()))?;
            let part: RelayMap = serde_json::from_slice(&raw)
                .with_context(|| format!("decoding relay map {}", path.display()))?;
            debug!(path = %path.display(), regions = part.regions.len(), "relay map source loaded");
            map.merge(part);
        }

        Ok(map)
    }
}

// ============================================================================
// Snapshot Handle
// ============================================================================

pub struct RelayMapHandle {
    current: RwLock<Arc<RelayMap>>,
    regions_gauge: Option<IntGauge>,
}

impl RelayMapHandle {
    pub fn new(initial: RelayMap, regions_gauge: Option<IntGauge>) -> Self {
        if let Some(gauge) = &regions_gauge {
            gauge.set(initial.regions.len() as i64);
        }
        Self {
            current: RwLock::new(Arc::new(initial)),
            regions_gauge,
        }
    }

    /// The current map. Later replacements do not affect the returned value.
    pub fn snapshot(&self) -> Arc<RelayMap> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in `map` as a whole. Returns `true` if it differs from the previous map.
    pub fn replace(&self, map: RelayMap) -> bool {
        let regions = map.regions.len();
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let changed = **current != map;
        *current = Arc::new(map);
        drop(current);

        if let Some(gauge) = &self.regions_gauge {
            gauge.set(regions as i64);
        }
        changed
    }
}

impl std::fmt::Debug for RelayMapHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayMapHandle")
            .field("regions", &self.snapshot().regions.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "Regions": {
            "900": {
                "RegionID": 900,
                "RegionCode": "home",
                "RegionName": "Home Lab",
                "Nodes": [
                    {
                        "Name": "900a",
                        "RegionID": 900,
                        "HostName": "relay.example.com",
                        "IPv4": "203.0.113.7",
                        "STUNPort": 3478,
                        "DERPPort": 443
                    }
                ]
            }
        }
    }"#;

    fn region(id: u32, code: &str) -> RelayRegion {
        RelayRegion {
            region_id: id,
            region_code: code.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_decode_derp_map_format() {
        let map: RelayMap = serde_json::from_str(SAMPLE).unwrap();
        let region = &map.regions[&900];
        assert_eq!(region.region_code, "home");
        assert_eq!(region.nodes[0].ipv4, "203.0.113.7");
        assert_eq!(region.nodes[0].stun_port, 3478);

        let encoded = serde_json::to_value(&map).unwrap();
        assert_eq!(encoded["Regions"]["900"]["Nodes"][0]["HostName"], "relay.example.com");
        assert!(encoded["Regions"]["900"]["Nodes"][0].get("IPv6").is_none());
    }

    #[test]
    fn test_merge_later_source_wins() {
        let mut base = RelayMap::default();
        base.regions.insert(1, region(1, "old"));
        base.regions.insert(2, region(2, "keep"));

        let mut overlay = RelayMap::default();
        overlay.regions.insert(1, region(1, "new"));
        base.merge(overlay);

        assert_eq!(base.regions[&1].region_code, "new");
        assert_eq!(base.regions[&2].region_code, "keep");
    }

    #[test]
    fn test_snapshot_unaffected_by_replace() {
        let metrics = crate::metrics::Metrics::new().unwrap();
        let handle = RelayMapHandle::new(RelayMap::default(), Some(metrics.relay_map_regions.clone()));
        let before = handle.snapshot();

        let mut next = RelayMap::default();
        next.regions.insert(7, region(7, "x"));
        assert!(handle.replace(next.clone()));
        assert!(!handle.replace(next));

        assert!(before.regions.is_empty());
        assert_eq!(handle.snapshot().regions.len(), 1);
        assert_eq!(metrics.relay_map_regions.get(), 1);
    }

    #[tokio::test]
    async fn test_fetch_from_files_merges_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.json");
        let second = dir.path().join("b.json");
        std::fs::write(&first, SAMPLE).unwrap();
        std::fs::write(
            &second,
            r#"{"Regions":{"900":{"RegionID":900,"RegionCode":"override","Nodes":[]}}}"#,
        )
        .unwrap();

        let sources = RelayMapSources {
            urls: Vec::new(),
            paths: vec![first, second],
        };
        let map = sources.fetch(&reqwest::Client::new()).await.unwrap();
        assert_eq!(map.regions[&900].region_code, "override");
    }

    #[tokio::test]
    async fn test_fetch_fails_if_any_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.json");
        std::fs::write(&good, SAMPLE).unwrap();

        let sources = RelayMapSources {
            urls: Vec::new(),
            paths: vec![good, dir.path().join("missing.json")],
        };
        assert!(sources.fetch(&reqwest::Client::new()).await.is_err());
    }
}
