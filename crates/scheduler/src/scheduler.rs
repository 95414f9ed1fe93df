//! Keyed delayed-task scheduler.
//!
//! At most one pending task exists per key: arming a key that already has a
//! pending task cancels the old one first. A firing task's bookkeeping entry
//! is removed before its callback runs, so a callback that re-arms its own
//! key does not cancel itself.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{Error, Result};

/// Maximum representable timer delay (2^31 − 1 milliseconds, ~24.8 days).
/// Scheduling beyond it fails loudly rather than silently truncating.
pub const MAX_TIMER_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

/// Family of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    /// The single periodic full-reconciliation timer.
    Reconcile,
    /// Per-room session regroup timer.
    Regroup,
    /// Per-(space, user) invite nudge timer.
    Nudge,
}

/// Identifies one timer slot: at most one pending task per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    kind: TaskKind,
    id: String,
}

impl TaskKey {
    /// The global periodic-reconcile slot.
    pub fn reconcile() -> Self {
        Self {
            kind: TaskKind::Reconcile,
            id: String::new(),
        }
    }

    /// The regroup slot for one room.
    pub fn regroup(room_id: impl fmt::Display) -> Self {
        Self {
            kind: TaskKind::Regroup,
            id: room_id.to_string(),
        }
    }

    /// The nudge slot for one user in one space.
    pub fn nudge(space_id: impl fmt::Display, user_id: impl fmt::Display) -> Self {
        Self {
            kind: TaskKind::Nudge,
            id: format!("{space_id}/{user_id}"),
        }
    }

    /// The family this key belongs to.
    pub const fn kind(&self) -> TaskKind {
        self.kind
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

struct Entry {
    generation: u64,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Generic "run this at time T" primitive. No domain knowledge.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<TaskKey, Entry>>>,
    generation: AtomicU64,
}

impl Scheduler {
    /// Create a scheduler driven by the given clock.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm a timer for `key` at `when`, cancelling any pending task under
    /// the same key first. A firing time in the past fires immediately.
    pub fn schedule_at<F, Fut>(&self, key: TaskKey, when: DateTime<Utc>, task: F) -> Result<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let now = self.clock.now();
        let delay = (when - now).to_std().unwrap_or(Duration::ZERO);
        if delay > MAX_TIMER_DELAY {
            return Err(Error::DelayTooLong {
                requested_ms: (when - now).num_milliseconds(),
                max_ms: MAX_TIMER_DELAY.as_millis() as u64,
            });
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let entries = Arc::clone(&self.entries);
        let fire_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Drop the bookkeeping entry before running the task, and only
            // if it is still ours: a replacement may have raced the abort.
            let still_armed = {
                let mut map = lock(&entries);
                match map.get(&fire_key) {
                    Some(entry) if entry.generation == generation => {
                        map.remove(&fire_key);
                        true
                    }
                    _ => false,
                }
            };
            if !still_armed {
                return;
            }

            debug!(key = %fire_key, "timer fired");
            task().await;
        });

        let mut map = lock(&self.entries);
        if let Some(old) = map.insert(
            key.clone(),
            Entry {
                generation,
                fire_at: when,
                handle,
            },
        ) {
            debug!(key = %key, "replacing pending timer");
            old.handle.abort();
        }
        Ok(())
    }

    /// Cancel the pending task under `key`, if any. Returns whether one
    /// was cancelled.
    pub fn cancel(&self, key: &TaskKey) -> bool {
        let mut map = lock(&self.entries);
        match map.remove(key) {
            Some(entry) => {
                entry.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a task is currently armed under `key`.
    pub fn is_armed(&self, key: &TaskKey) -> bool {
        lock(&self.entries).contains_key(key)
    }

    /// The firing time of the pending task under `key`, if armed.
    pub fn next_fire_time(&self, key: &TaskKey) -> Option<DateTime<Utc>> {
        lock(&self.entries).get(key).map(|e| e.fire_at)
    }

    /// The clock this scheduler runs on.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of armed timers.
    pub fn armed_count(&self) -> usize {
        lock(&self.entries).len()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let map = lock(&self.entries);
        for entry in map.values() {
            entry.handle.abort();
        }
        if !map.is_empty() {
            warn!(pending = map.len(), "scheduler dropped with pending timers");
        }
    }
}

fn lock(entries: &Mutex<HashMap<TaskKey, Entry>>) -> MutexGuard<'_, HashMap<TaskKey, Entry>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}
