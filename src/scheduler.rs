//! # Background Schedulers
//!
//! Three periodic maintenance loops run beside the protocol servers:
//!
//! | Loop | Interval | Effect |
//! |------|----------|--------|
//! | ephemeral expiry | `scheduler_interval` | hard-deletes inactive ephemeral machines, marks each namespace |
//! | relay map refresh | `relay.update_frequency` | refetches the relay map, swaps it in if it changed |
//! | pending updates | `scheduler_interval` | drains out-of-band change markers into the tracker |
//!
//! A failed iteration is logged and the loop waits for its next tick. Loops
//! end only when their [`CancellationToken`] is cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::server::CoordinationServer;

/// Shortest period a loop will run at.
pub const MIN_PERIOD: Duration = Duration::from_secs(1);

/// Run `tick` every `period` (at least [`MIN_PERIOD`]) until `token` is
/// cancelled. The first tick is immediate.
pub async fn run_periodic<F, Fut>(name: &'static str, period: Duration, token: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let period = period.max(MIN_PERIOD);
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(scheduler = name, period = ?period, "scheduler started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick() => {}
        }
    }
    debug!(scheduler = name, "scheduler stopped");
}

/// Start every enabled loop on `token`.
pub fn spawn_all(server: Arc<CoordinationServer>, token: CancellationToken) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    let interval = server.config().scheduler_interval;

    {
        let server = server.clone();
        let token = token.clone();
        tasks.spawn(async move {
            run_periodic("ephemeral expiry", interval, token, || {
                let server = server.clone();
                async move {
                    server.expire_ephemeral_nodes().await;
                }
            })
            .await
        });
    }

    {
        let server = server.clone();
        let token = token.clone();
        tasks.spawn(async move {
            run_periodic("pending updates", interval, token, || {
                let server = server.clone();
                async move {
                    server.process_pending_updates().await;
                }
            })
            .await
        });
    }

    let relay = &server.config().relay;
    if relay.auto_update && !server.relay_sources().is_empty() {
        let period = relay.update_frequency;
        let server = server.clone();
        tasks.spawn(async move {
            run_periodic("relay map refresh", period, token, || {
                let server = server.clone();
                async move {
                    if let Err(e) = server.refresh_relay_map().await {
                        warn!(error = %format!("{e:#}"), "relay map refresh failed, keeping previous map");
                    }
                }
            })
            .await
        });
    }

    tasks
}

impl CoordinationServer {
    pub async fn expire_ephemeral_nodes(&self) -> usize {
        self.expire_ephemeral_nodes_at(Utc::now()).await
    }

    /// One expiry sweep evaluated at `now`. Returns the number of machines deleted.
    ///
    /// Every namespace whose machines were listed is marked changed once,
    /// whether or not anything was deleted.
    pub async fn expire_ephemeral_nodes_at(&self, now: DateTime<Utc>) -> usize {
        let timeout = TimeDelta::from_std(self.config().ephemeral_node_inactivity_timeout)
            .unwrap_or(TimeDelta::MAX);

        let namespaces = match self.store().list_namespaces().await {
            Ok(namespaces) => namespaces,
            Err(e) => {
                warn!(error = %e, "ephemeral expiry: cannot list namespaces");
                return 0;
            }
        };

        let mut deleted = 0;
        for namespace in namespaces {
            let machines = match self.store().list_machines_in_namespace(&namespace.name).await {
                Ok(machines) => machines,
                Err(e) => {
                    warn!(namespace = %namespace.name, error = %e, "ephemeral expiry: cannot list machines");
                    continue;
                }
            };

            for machine in machines.iter().filter(|m| m.is_inactive_ephemeral(now, timeout)) {
                match self.store().delete_machine(machine.id, true).await {
                    Ok(()) => {
                        deleted += 1;
                        self.metrics().ephemeral_nodes_expired.inc();
                        info!(
                            namespace = %namespace.name,
                            machine = %machine.hostname,
                            last_seen = ?machine.last_seen,
                            "ephemeral machine expired"
                        );
                    }
                    Err(e) => {
                        warn!(namespace = %namespace.name, machine = %machine.hostname, error = %e, "ephemeral expiry: delete failed");
                    }
                }
            }

            // Never earlier than the clock, so a mark made during the sweep is not rolled back.
            self.tracker().mark_changed_at(&namespace.name, now.max(Utc::now()));
        }
        trace!(deleted, "ephemeral expiry sweep done");
        deleted
    }

    /// Refetch the relay map. Returns whether the snapshot changed.
    ///
    /// A fetch failure leaves the current snapshot in place.
    pub async fn refresh_relay_map(&self) -> Result<bool> {
        let map = self
            .relay_sources()
            .fetch(self.http_client())
            .await
            .context("fetching relay map")?;
        if !self.relay_map().replace(map) {
            trace!("relay map unchanged");
            return Ok(false);
        }

        info!(regions = self.relay_map().snapshot().regions.len(), "relay map updated");
        let namespaces = self
            .store()
            .list_namespaces()
            .await
            .context("listing namespaces after relay map change")?;
        for namespace in namespaces {
            self.tracker().mark_changed(&namespace.name);
        }
        Ok(true)
    }

    /// Publish every outstanding out-of-band change marker. Returns how many were drained.
    pub async fn process_pending_updates(&self) -> usize {
        let pending = match self.store().take_pending_updates().await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "cannot read pending namespace updates");
                return 0;
            }
        };
        for namespace in &pending {
            debug!(namespace = %namespace, "publishing external namespace update");
            self.tracker().mark_changed(namespace);
        }
        pending.len()
    }
}
