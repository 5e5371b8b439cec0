//! Lifecycle (C10): owns the root cancellation context and the wait-group,
//! and runs the five-step shutdown sequence spec.md §4.10 specifies for
//! C4 (history pipeline), C5 (backup engine), C6/C7 (git mirror and its
//! debounce notifier), and C9 (stats aggregator).
//!
//! One [`CancellationToken`] is created at construction and never replaced;
//! every background task derives its own token from it, so cancelling the
//! root cancels all of them at once (spec.md §4.10 step 1).

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::engine::Engine;
use crate::error::{NoteSyncError, Result};
use crate::history::HistoryWorker;
use crate::notifier::Notifier;
use crate::stats::StatsAggregator;

/// Holds the root context, wait-group, and the long-running components
/// started against them. Built once per process.
pub struct Lifecycle {
    tracker: TaskTracker,
    root: CancellationToken,
    notifier: Arc<Notifier>,
    stats: Arc<StatsAggregator>,
}

impl Lifecycle {
    /// Spawns the three standing background loops (history worker, backup
    /// tick loop, stats flush ticker) on a shared [`TaskTracker`] and
    /// returns the handle shutdown is driven through. C6/C7 have no
    /// standing loop of their own — their work is spawned on-demand onto
    /// this same tracker as debounce timers fire, so draining the tracker
    /// still waits for any in-flight git sync.
    pub fn start(
        engine: Arc<Engine>,
        history_worker: HistoryWorker,
        notifier: Arc<Notifier>,
        stats: Arc<StatsAggregator>,
        backup_tick_interval: Duration,
        stats_flush_interval: Duration,
    ) -> Self {
        let tracker = TaskTracker::new();
        let root = CancellationToken::new();

        let history_cancel = root.child_token();
        tracker.spawn(history_worker.run(history_cancel));

        let engine_tracker = tracker.clone();
        let engine_cancel = root.child_token();
        tracker.spawn(async move { engine.run(engine_tracker, engine_cancel, backup_tick_interval).await });

        let stats_clone = stats.clone();
        let stats_cancel = root.child_token();
        tracker.spawn(async move { stats_clone.run(stats_cancel, stats_flush_interval).await });

        Self { tracker, root, notifier, stats }
    }

    /// The shared token and tracker new work should be spawned against
    /// (notifier timers, git-sync triggers, per-request history enqueues).
    pub fn root_token(&self) -> CancellationToken {
        self.root.clone()
    }

    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Runs spec.md §4.10's shutdown sequence. `timeout` bounds step 3
    /// (waiting for the wait-group to drain); every other step is
    /// unconditional and runs regardless of whether the drain finished.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        self.root.cancel();
        self.notifier.stop_all();

        self.tracker.close();
        let drained = tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok();

        self.stats.flush().await;

        if drained { Ok(()) } else { Err(NoteSyncError::ShutdownTimedOut) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryPipeline;
    use crate::repo::InMemoryRepo;

    fn make_engine(repo: Arc<InMemoryRepo>) -> Arc<Engine> {
        Arc::new(Engine::new(
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            repo.clone(),
            Arc::new(crate::repo::DefaultDestinationFactory),
            std::env::temp_dir(),
        ))
    }

    #[tokio::test]
    async fn shutdown_drains_within_timeout_and_flushes_stats() {
        let repo = Arc::new(InMemoryRepo::new());
        let engine = make_engine(repo.clone());
        let (_pipeline, worker) = HistoryPipeline::new(repo.clone(), repo.clone(), 10);
        let git = Arc::new(crate::git::GitEngine::new(repo.clone(), repo.clone(), repo.clone(), std::env::temp_dir()));
        let notifier = Arc::new(Notifier::new(engine.clone(), git, repo.clone()));
        let stats = Arc::new(StatsAggregator::new(repo.clone()));

        let lifecycle = Lifecycle::start(
            engine,
            worker,
            notifier,
            stats,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        let result = lifecycle.shutdown(Duration::from_secs(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn shutdown_reports_timeout_when_work_does_not_drain_in_time() {
        let repo = Arc::new(InMemoryRepo::new());
        let engine = make_engine(repo.clone());
        let (_pipeline, worker) = HistoryPipeline::new(repo.clone(), repo.clone(), 10);
        let git = Arc::new(crate::git::GitEngine::new(repo.clone(), repo.clone(), repo.clone(), std::env::temp_dir()));
        let notifier = Arc::new(Notifier::new(engine.clone(), git, repo.clone()));
        let stats = Arc::new(StatsAggregator::new(repo.clone()));

        let lifecycle = Lifecycle::start(
            engine,
            worker,
            notifier,
            stats,
            Duration::from_secs(3600),
            Duration::from_secs(3600),
        );

        let tracker = lifecycle.tracker();
        tracker.spawn(async move {
            // Never completes, regardless of cancellation — stands in for a
            // task that ignores its token, so the drain can't finish.
            std::future::pending::<()>().await
        });

        let result = lifecycle.shutdown(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(NoteSyncError::ShutdownTimedOut)));
    }
}
