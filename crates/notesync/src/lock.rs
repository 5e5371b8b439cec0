//! In-process per-config concurrency guard for the backup (C5) and git-mirror
//! (C6) orchestrators.
//!
//! This tracks one cancellation handle per running config id. A plain run
//! (full/incremental backup, or a git sync) is rejected while a run for the
//! same config is already in flight. A sync-type run is "sync-replace":
//! arriving while a run for that config is already in flight cancels the
//! old run and takes the slot, since a sync must always converge to the
//! latest state rather than queue behind a stale one.

use std::collections::HashMap;
use std::sync::Mutex;

use notesync_types::Id;
use tokio_util::sync::CancellationToken;

/// Whether a newly-arriving run should replace one already in flight for the
/// same config, or be rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// Reject if a run for this config is already in flight.
    RejectIfRunning,
    /// Cancel any in-flight run for this config and take the slot.
    ReplaceRunning,
}

struct Slot {
    token: CancellationToken,
    generation: u64,
}

/// Tracks which config ids currently have a run in flight, keyed to that
/// run's cancellation token.
#[derive(Default)]
pub struct ConcurrencyGuard {
    running: Mutex<HashMap<Id, Slot>>,
    next_generation: Mutex<u64>,
}

/// RAII handle for a config's run slot. Releases the slot on drop so a
/// panicking or early-returning task never leaves the config permanently
/// locked.
pub struct RunSlot<'a> {
    guard: &'a ConcurrencyGuard,
    config_id: Id,
    generation: u64,
    pub token: CancellationToken,
}

impl ConcurrencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempts to take the run slot for `config_id`. Under
    /// [`AcquirePolicy::RejectIfRunning`] returns `None` if a run is already
    /// in flight. Under [`AcquirePolicy::ReplaceRunning`] an in-flight run is
    /// cancelled and its slot is reassigned to the caller.
    pub fn acquire(&self, config_id: Id, parent: &CancellationToken, policy: AcquirePolicy) -> Option<RunSlot<'_>> {
        let mut running = self.running.lock().expect("concurrency guard lock poisoned");

        if let Some(existing) = running.get(&config_id) {
            match policy {
                AcquirePolicy::RejectIfRunning => return None,
                AcquirePolicy::ReplaceRunning => existing.token.cancel(),
            }
        }

        let mut next_generation = self.next_generation.lock().expect("generation counter lock poisoned");
        let generation = *next_generation;
        *next_generation += 1;
        drop(next_generation);

        let token = parent.child_token();
        running.insert(
            config_id,
            Slot {
                token: token.clone(),
                generation,
            },
        );
        Some(RunSlot {
            guard: self,
            config_id,
            generation,
            token,
        })
    }

    /// Whether `config_id` currently has a run in flight.
    pub fn is_running(&self, config_id: Id) -> bool {
        self.running
            .lock()
            .expect("concurrency guard lock poisoned")
            .contains_key(&config_id)
    }

    fn release(&self, config_id: Id, generation: u64) {
        let mut running = self.running.lock().expect("concurrency guard lock poisoned");
        // Only clear the slot if it's still ours; a replace may have already
        // installed a newer generation for this config.
        if running.get(&config_id).is_some_and(|slot| slot.generation == generation) {
            running.remove(&config_id);
        }
    }
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        self.guard.release(self.config_id, self.generation);
    }
}
