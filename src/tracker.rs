//! # Topology Version Tracker
//!
//! Maps each namespace to the UTC instant at which something a node in that
//! namespace can see last changed (a machine added or removed, endpoints
//! moved, the relay map or access policy replaced).
//!
//! Long-poll handlers compare the value they last delivered against the
//! current one to decide whether to push a fresh map; the background
//! schedulers and request handlers are the writers.
//!
//! ## Concurrency
//!
//! Entries live in a [`DashMap`], so readers and writers never need external
//! locking. Writes are last-write-wins per namespace. Every write also wakes
//! all tasks parked in [`TopologyVersionTracker::wait_for_change`].
//!
//! ## Read Semantics
//!
//! [`TopologyVersionTracker::latest_change`] never fails: a set of namespaces
//! with no recorded entries yields the call-time `now`, so a first-time caller
//! is treated as already up to date.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use prometheus::GaugeVec;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
pub struct TopologyVersionTracker {
    entries: DashMap<String, DateTime<Utc>>,
    changed: Notify,
    gauge: Option<GaugeVec>,
}

impl std::fmt::Debug for TopologyVersionTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyVersionTracker")
            .field("namespaces", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl TopologyVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that exports every write to `gauge` (label: `namespace`).
    pub fn with_gauge(gauge: GaugeVec) -> Self {
        Self {
            gauge: Some(gauge),
            ..Self::default()
        }
    }

    /// Record `now` against `namespace`, overwriting any prior value.
    pub fn mark_changed(&self, namespace: &str) -> DateTime<Utc> {
        self.mark_changed_at(namespace, Utc::now())
    }

    pub(crate) fn mark_changed_at(&self, namespace: &str, at: DateTime<Utc>) -> DateTime<Utc> {
        self.entries.insert(namespace.to_string(), at);
        if let Some(gauge) = &self.gauge {
            gauge
                .with_label_values(&[namespace])
                .set(at.timestamp_millis() as f64 / 1000.0);
        }
        trace!(namespace, at = %at, "topology changed");
        self.changed.notify_waiters();
        at
    }

    /// Latest recorded change among `namespaces`, or `now` if none was ever marked.
    pub fn latest_change<S: AsRef<str>>(&self, namespaces: &[S]) -> DateTime<Utc> {
        self.latest_marked(namespaces).unwrap_or_else(Utc::now)
    }

    /// Latest recorded change among `namespaces`; unmarked namespaces are skipped.
    pub fn latest_marked<S: AsRef<str>>(&self, namespaces: &[S]) -> Option<DateTime<Utc>> {
        let mut found: Vec<DateTime<Utc>> = namespaces
            .iter()
            .filter_map(|ns| self.entries.get(ns.as_ref()).map(|entry| *entry.value()))
            .collect();
        found.sort_unstable_by(|a, b| b.cmp(a));
        found.first().copied()
    }

    /// Every namespace that has ever been marked.
    pub fn namespaces(&self) -> Vec<String> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Park until `namespace` holds a value different from `since`, or `timeout` elapses.
    ///
    /// Returns the new value, or `None` on timeout.
    pub async fn wait_for_change(
        &self,
        namespace: &str,
        since: Option<DateTime<Utc>>,
        timeout: Duration,
    ) -> Option<DateTime<Utc>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            // Register before reading so a write between the read and the await is not lost.
            notified.as_mut().enable();

            if let Some(current) = self.latest_marked(&[namespace])
                && Some(current) != since
            {
                return Some(current);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::sync::Arc;

    #[test]
    fn test_unmarked_namespace_returns_now() {
        let tracker = TopologyVersionTracker::new();
        let before = Utc::now();
        let latest = tracker.latest_change(&["acme"]);
        let after = Utc::now();
        assert!(latest >= before && latest <= after);
        assert!(after - latest < TimeDelta::seconds(1));
        assert!(tracker.latest_marked(&["acme"]).is_none());
    }

    #[test]
    fn test_marked_value_is_stable_across_reads() {
        let tracker = TopologyVersionTracker::new();
        let marked = tracker.mark_changed("acme");
        assert_eq!(tracker.latest_change(&["acme"]), marked);
        assert_eq!(tracker.latest_change(&["acme"]), marked);
    }

    #[test]
    fn test_latest_is_maximum_of_subset() {
        let tracker = TopologyVersionTracker::new();
        let base = Utc::now();
        tracker.mark_changed_at("a", base);
        tracker.mark_changed_at("b", base + TimeDelta::seconds(10));
        tracker.mark_changed_at("c", base + TimeDelta::seconds(5));

        assert_eq!(tracker.latest_change(&["a", "c"]), base + TimeDelta::seconds(5));
        assert_eq!(tracker.latest_change(&["a", "b", "c"]), base + TimeDelta::seconds(10));
        assert_eq!(tracker.latest_change(&["a", "missing"]), base);
    }

    #[test]
    fn test_overwrite_is_unconditional() {
        let tracker = TopologyVersionTracker::new();
        let base = Utc::now();
        tracker.mark_changed_at("a", base);
        tracker.mark_changed_at("a", base - TimeDelta::seconds(30));
        assert_eq!(tracker.latest_change(&["a"]), base - TimeDelta::seconds(30));
    }

    #[test]
    fn test_gauge_exports_writes() {
        let metrics = crate::metrics::Metrics::new().unwrap();
        let tracker = TopologyVersionTracker::with_gauge(metrics.last_update.clone());
        let at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        tracker.mark_changed_at("acme", at);
        assert_eq!(
            metrics.last_update.with_label_values(&["acme"]).get(),
            1_700_000_000.0
        );
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_different() {
        let tracker = TopologyVersionTracker::new();
        let marked = tracker.mark_changed("acme");
        let got = tracker
            .wait_for_change("acme", None, Duration::from_millis(10))
            .await;
        assert_eq!(got, Some(marked));
    }

    #[tokio::test]
    async fn test_wait_times_out_without_change() {
        let tracker = TopologyVersionTracker::new();
        let marked = tracker.mark_changed("acme");
        tracker.mark_changed("other");
        let got = tracker
            .wait_for_change("acme", Some(marked), Duration::from_millis(50))
            .await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_mark() {
        let tracker = Arc::new(TopologyVersionTracker::new());
        let first = tracker.mark_changed_at("acme", Utc::now() - TimeDelta::seconds(1));

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_for_change("acme", Some(first), Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = tracker.mark_changed("acme");
        assert_eq!(waiter.await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_concurrent_writers() {
        let tracker = Arc::new(TopologyVersionTracker::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    tracker.mark_changed(&format!("ns-{}", i % 4));
                    let _ = tracker.latest_change(&["ns-0", "ns-1"]);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let mut namespaces = tracker.namespaces();
        namespaces.sort();
        assert_eq!(namespaces, vec!["ns-0", "ns-1", "ns-2", "ns-3"]);
    }
}
