//! Per-batch concurrency limiter and progress counters.
//!
//! One registry is owned by the orchestrator and shared by `Arc`. Every batch
//! is created with [`BatchRegistry::init`] (or [`BatchRegistry::begin`]) and
//! must be torn down with [`BatchRegistry::clear`]; nothing is collected
//! implicitly.

use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_BATCH_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct BatchId(String);

impl BatchId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let seq = SEQ.fetch_add(1, Ordering::Relaxed);
        Self(format!("batch-{}-{}", Utc::now().timestamp_millis(), seq))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressSnapshot {
    pub completed: usize,
    pub total: usize,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.completed == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterState {
    pub count: usize,
    pub limit: usize,
    pub waiting: usize,
}

struct BatchEntry {
    total: usize,
    completed: usize,
    semaphore: Arc<Semaphore>,
    waiting: Arc<AtomicUsize>,
}

impl BatchEntry {
    fn limiter_state(&self, limit: usize) -> LimiterState {
        LimiterState {
            count: limit.saturating_sub(self.semaphore.available_permits()),
            limit,
            waiting: self.waiting.load(Ordering::SeqCst),
        }
    }
}

pub struct BatchRegistry {
    limit: usize,
    batches: Mutex<HashMap<BatchId, BatchEntry>>,
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchRegistry {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_BATCH_CONCURRENCY)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            batches: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<BatchId, BatchEntry>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a batch. Re-initialising an existing id resets it.
    pub fn init(&self, id: &BatchId, total: usize) {
        let previous = self.lock().insert(
            id.clone(),
            BatchEntry {
                total,
                completed: 0,
                semaphore: Arc::new(Semaphore::new(self.limit)),
                waiting: Arc::new(AtomicUsize::new(0)),
            },
        );
        if let Some(old) = previous {
            old.semaphore.close();
            tracing::warn!(event = "batch.reinit", batch_id = %id, "batch re-initialised");
        }
        tracing::debug!(event = "batch.init", batch_id = %id, total, limit = self.limit);
    }

    /// Creates a batch with a fresh id that is cleared when the guard drops.
    pub fn begin(self: &Arc<Self>, total: usize) -> BatchGuard {
        let id = BatchId::generate();
        self.init(&id, total);
        BatchGuard {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Waits for a slot, first come first served. Unknown batches are not
    /// throttled, and neither are waiters of a batch cleared under them.
    pub async fn acquire(&self, id: &BatchId) -> LimiterPermit {
        let entry = {
            let batches = self.lock();
            batches
                .get(id)
                .map(|e| (Arc::clone(&e.semaphore), Arc::clone(&e.waiting)))
        };
        let Some((semaphore, waiting)) = entry else {
            return LimiterPermit::unthrottled();
        };

        if let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() {
            return LimiterPermit::held(permit);
        }

        let _queued = Queued::enter(waiting);
        match semaphore.acquire_owned().await {
            Ok(permit) => LimiterPermit::held(permit),
            Err(_) => LimiterPermit::unthrottled(),
        }
    }

    /// Bumps the completed counter. `None` when the batch is unknown.
    pub fn increment_completed(&self, id: &BatchId) -> Option<ProgressSnapshot> {
        let mut batches = self.lock();
        let entry = batches.get_mut(id)?;
        if entry.completed < entry.total {
            entry.completed += 1;
        } else {
            tracing::warn!(
                event = "batch.overcount",
                batch_id = %id,
                total = entry.total,
                "completion reported past batch total"
            );
        }
        Some(ProgressSnapshot {
            completed: entry.completed,
            total: entry.total,
        })
    }

    pub fn progress(&self, id: &BatchId) -> Option<ProgressSnapshot> {
        self.lock().get(id).map(|e| ProgressSnapshot {
            completed: e.completed,
            total: e.total,
        })
    }

    pub fn limiter_state(&self, id: &BatchId) -> Option<LimiterState> {
        self.lock().get(id).map(|e| e.limiter_state(self.limit))
    }

    /// Drops limiter and progress state. Queued waiters proceed unthrottled.
    pub fn clear(&self, id: &BatchId) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(entry) => {
                let state = entry.limiter_state(self.limit);
                entry.semaphore.close();
                tracing::debug!(
                    event = "batch.clear",
                    batch_id = %id,
                    completed = entry.completed,
                    total = entry.total,
                    in_use = state.count
                );
                true
            }
            None => false,
        }
    }

    pub fn batch_count(&self) -> usize {
        self.lock().len()
    }
}

/// Counts a caller queued on the semaphore until its acquire settles or is dropped.
struct Queued(Arc<AtomicUsize>);

impl Queued {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Queued {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A held limiter slot. Dropping it (or calling [`LimiterPermit::release`])
/// returns the slot to the batch exactly once.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct LimiterPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl LimiterPermit {
    fn held(permit: OwnedSemaphorePermit) -> Self {
        Self {
            permit: Some(permit),
        }
    }

    fn unthrottled() -> Self {
        Self { permit: None }
    }

    pub fn is_throttled(&self) -> bool {
        self.permit.is_some()
    }

    /// Gives the slot back to the oldest waiter, or frees it.
    pub fn release(self) {
        drop(self);
    }
}

/// Owns a batch for its lifetime and clears it on drop.
pub struct BatchGuard {
    registry: Arc<BatchRegistry>,
    id: BatchId,
}

impl BatchGuard {
    pub fn id(&self) -> &BatchId {
        &self.id
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        self.registry.clear(&self.id);
    }
}
