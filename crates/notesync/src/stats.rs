//! Stats aggregator (C9): batches share-view counts in memory and flushes
//! them to the repository on a ticker, rather than writing on every view
//! (spec.md §4.9).
//!
//! The buffer is swapped out wholesale under the lock and written outside
//! it, the same "never mutate concurrently with the flusher" rule
//! `DESIGN.md` calls out for this structure — a view arriving mid-flush
//! goes into the fresh map the swap left behind, not the one being written.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notesync_types::Id;
use tokio_util::sync::CancellationToken;

use crate::repo::ShareRepo;

struct PendingView {
    owner: Id,
    count: u64,
    last_viewed_at: DateTime<Utc>,
}

/// In-memory `stats[share_id] = (owner, count, last_viewed_at)` buffer plus
/// the ticker that periodically drains it.
pub struct StatsAggregator {
    share_repo: std::sync::Arc<dyn ShareRepo>,
    buffer: Mutex<HashMap<Id, PendingView>>,
}

impl StatsAggregator {
    pub fn new(share_repo: std::sync::Arc<dyn ShareRepo>) -> Self {
        Self { share_repo, buffer: Mutex::new(HashMap::new()) }
    }

    /// Records one view. Cheap and synchronous — callers on the read path
    /// should never have to await the stats subsystem.
    pub fn record_view(&self, owner: Id, share_id: Id, at: DateTime<Utc>) {
        let mut buffer = self.buffer.lock().expect("stats buffer lock poisoned");
        buffer
            .entry(share_id)
            .and_modify(|entry| {
                entry.count += 1;
                entry.last_viewed_at = at;
            })
            .or_insert(PendingView { owner, count: 1, last_viewed_at: at });
    }

    /// Runs the flush ticker until `lifecycle` is cancelled. Stopping the
    /// ticker is the entirety of this task's shutdown responsibility — the
    /// final flush (spec.md §4.10 step 4) is a separate, explicit call made
    /// by the lifecycle only after the wait-group has drained.
    pub async fn run(&self, lifecycle: CancellationToken, flush_interval: Duration) {
        let mut interval = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = lifecycle.cancelled() => return,
                _ = interval.tick() => self.flush().await,
            }
        }
    }

    /// Swaps the buffer out under the lock and writes each entry via
    /// [`ShareRepo::update_view_stats`]. A write failure is logged and the
    /// entry dropped — views lost to a failed flush are not retried, same
    /// as every other best-effort write in this crate.
    pub async fn flush(&self) {
        let drained: HashMap<Id, PendingView> = {
            let mut buffer = self.buffer.lock().expect("stats buffer lock poisoned");
            std::mem::take(&mut *buffer)
        };
        for (share_id, entry) in drained {
            if let Err(e) = self.share_repo.update_view_stats(entry.owner, share_id, entry.count, entry.last_viewed_at).await {
                tracing::warn!(error = %e, share_id, "failed to flush view stats");
            }
        }
    }
}
