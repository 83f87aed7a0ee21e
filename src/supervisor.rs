//! # Fan-In Task Group
//!
//! [`TaskGroup`] runs a set of long-lived members (the accept loop, both
//! protocol servers, the optional certificate-challenge listener) and resolves
//! as soon as **any** member exits. That member's outcome becomes the group's
//! outcome; the shared [`CancellationToken`] is then cancelled, the remaining
//! members get [`SHUTDOWN_GRACE`] to wind down, and any still running after
//! that are aborted.
//!
//! There is no restart policy. A member exiting, cleanly or not, ends the
//! group.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long remaining members may take to stop once the group is cancelled.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct TaskGroup {
    tasks: JoinSet<Result<()>>,
    names: HashMap<Id, String>,
    token: CancellationToken,
    grace: Duration,
}

impl TaskGroup {
    /// Group whose members observe `token` (or a child of it).
    pub fn new(token: CancellationToken) -> Self {
        Self {
            tasks: JoinSet::new(),
            names: HashMap::new(),
            token,
            grace: SHUTDOWN_GRACE,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn spawn<F>(&mut self, name: impl Into<String>, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.tasks.spawn(task);
        debug!(member = %name, "group member started");
        self.names.insert(handle.id(), name);
    }

    /// Block until the first member exits, then stop the rest.
    ///
    /// Returns the first member's result. A panic or abort is reported as an
    /// error naming the member.
    pub async fn wait(mut self) -> Result<()> {
        let Some(first) = self.tasks.join_next_with_id().await else {
            return Ok(());
        };

        let outcome = match first {
            Ok((id, result)) => {
                let name = self.member_name(id);
                match &result {
                    Ok(()) => info!(member = %name, "group member exited"),
                    Err(e) => error!(member = %name, error = %e, "group member failed"),
                }
                result.map_err(|e| e.context(format!("{name} failed")))
            }
            Err(join_error) => {
                let name = self.member_name(join_error.id());
                error!(member = %name, error = %join_error, "group member panicked");
                Err(anyhow!("{name} did not complete: {join_error}"))
            }
        };

        self.token.cancel();
        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = self.tasks.join_next_with_id().await {
                if let Ok((id, _)) = joined {
                    debug!(member = %self.member_name(id), "group member stopped");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = self.tasks.len(), "group members did not stop in time, aborting");
            self.tasks.shutdown().await;
        }
        outcome
    }

    fn member_name(&self, id: Id) -> String {
        self.names
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("task {id}"))
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("members", &self.names.values().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_error_is_group_result() {
        let mut group = TaskGroup::new(CancellationToken::new()).with_shutdown_grace(Duration::ZERO);
        group.spawn("forever", std::future::pending());
        group.spawn("broken", async { Err(anyhow!("listener closed")) });

        let err = tokio::time::timeout(Duration::from_secs(1), group.wait())
            .await
            .expect("group resolves")
            .unwrap_err();
        let text = format!("{err:#}");
        assert!(text.contains("broken failed"));
        assert!(text.contains("listener closed"));
    }

    #[tokio::test]
    async fn test_clean_exit_also_ends_group() {
        let token = CancellationToken::new();
        let mut group = TaskGroup::new(token.clone()).with_shutdown_grace(Duration::ZERO);
        group.spawn("forever", std::future::pending());
        group.spawn("done", async { Ok(()) });

        group.wait().await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_siblings_observe_cancellation() {
        let token = CancellationToken::new();
        let observed = Arc::new(AtomicBool::new(false));
        let mut group = TaskGroup::new(token.clone());

        {
            let token = token.clone();
            let observed = observed.clone();
            group.spawn("watcher", async move {
                token.cancelled().await;
                observed.store(true, Ordering::SeqCst);
                Ok(())
            });
        }
        group.spawn("trigger", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Err(anyhow!("boom"))
        });

        assert!(group.wait().await.is_err());
        assert!(token.is_cancelled());
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_member_aborted_after_grace() {
        let mut group = TaskGroup::new(CancellationToken::new());
        group.spawn("stuck", std::future::pending());
        group.spawn("done", async { Ok(()) });

        let started = tokio::time::Instant::now();
        assert!(group.wait().await.is_ok());
        assert!(started.elapsed() >= SHUTDOWN_GRACE);
    }

    #[tokio::test]
    async fn test_panic_reported_with_member_name() {
        let mut group = TaskGroup::new(CancellationToken::new()).with_shutdown_grace(Duration::ZERO);
        group.spawn("forever", std::future::pending());
        group.spawn("crashy", async {
            let state: Option<()> = None;
            state.expect("bad state");
            Ok(())
        });

        let err = group.wait().await.unwrap_err();
        assert!(err.to_string().contains("crashy"));
    }

    #[tokio::test]
    async fn test_external_cancel_resolves_group() {
        let token = CancellationToken::new();
        let mut group = TaskGroup::new(token.clone());
        {
            let token = token.clone();
            group.spawn("accept", async move {
                token.cancelled().await;
                Ok(())
            });
        }
        token.cancel();
        group.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_group_resolves() {
        let group = TaskGroup::new(CancellationToken::new());
        assert!(group.is_empty());
        group.wait().await.unwrap();
    }
}
