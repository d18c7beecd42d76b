// 周期守卫
// At most one cycle at a time, never the same time bucket twice

use crate::types::TimeBucket;
use log::{debug, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Process-wide cycle bookkeeping, owned by a [`TickGuard`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleState {
    /// Bucket of the last cycle that was allowed to start
    pub last_bucket: Option<TimeBucket>,
    pub running: bool,
}

/// Why a tick was not allowed to start a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// A previous cycle is still in progress
    Busy,
    /// This bucket was already started
    Duplicate,
}

/// Idle/Running state machine guarding the pipeline.
///
/// Cloning shares the same state.
#[derive(Debug, Clone, Default)]
pub struct TickGuard {
    state: Arc<Mutex<CycleState>>,
}

impl TickGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CycleState> {
        // CycleState is plain data, a poisoned lock still holds a usable value
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CycleState {
        *self.lock()
    }

    /// Try to move `Idle -> Running` for `bucket`.
    ///
    /// The returned ticket moves the guard back to `Idle` when dropped, whatever
    /// way the cycle ends.
    pub fn try_begin(&self, bucket: TimeBucket) -> Result<CycleTicket, Rejection> {
        let mut state = self.lock();
        if state.running {
            warn!("Tick for {} skipped: previous cycle still running", bucket);
            return Err(Rejection::Busy);
        }
        if state.last_bucket == Some(bucket) {
            debug!("Bucket {} already processed, skipping", bucket);
            return Err(Rejection::Duplicate);
        }
        state.running = true;
        state.last_bucket = Some(bucket);
        Ok(CycleTicket {
            guard: self.clone(),
            bucket,
        })
    }
}

/// Proof that a cycle is running; releases the guard on drop.
#[derive(Debug)]
pub struct CycleTicket {
    guard: TickGuard,
    bucket: TimeBucket,
}

impl CycleTicket {
    pub fn bucket(&self) -> TimeBucket {
        self.bucket
    }
}

impl Drop for CycleTicket {
    fn drop(&mut self) {
        self.guard.lock().running = false;
    }
}
