//! Shared-memory synchronization: the cell allocator and the classic
//! primitives (mutex, binary semaphore, barrier, manual-reset event) built
//! directly on atomic compare-and-swap plus wait/notify.
//!
//! Primitives never take locks on each other; every one of them is a thin
//! stateful wrapper over its own allocated cells, and composition relies
//! solely on the ordering of the atomic operations.

pub mod allocator;
pub mod barrier;
pub mod buffer;
pub mod event;
pub mod mutex;
pub mod semaphore;

pub use allocator::{CellAllocator, PrimitiveKind};
pub use barrier::Barrier;
pub use buffer::{SyncBuffer, WaitOutcome};
pub use event::{EventState, ManualResetEvent};
pub use mutex::{Mutex, MutexState};
pub use semaphore::{BinarySemaphore, SemaphoreState};

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::errors::{Result, WeftError};

pub(crate) const UNLOCKED: i32 = 0;
pub(crate) const LOCKED: i32 = 1;

/// Thread id the coordinator records when it acquires a mutex. Workers use
/// their pool-assigned ids, starting at 1.
pub const COORDINATOR_THREAD: i32 = 0;

/// Explicit handle to the shared synchronization domain, replacing the
/// process-global singletons of classic worker-pool designs. Each thread of
/// control holds its own clone carrying its thread id; the allocator and
/// buffer behind it are genuinely shared.
#[derive(Clone)]
pub struct SyncContext {
    allocator: Arc<CellAllocator>,
    thread_id: i32,
}

impl SyncContext {
    pub fn new(allocator: Arc<CellAllocator>, thread_id: i32) -> Self {
        Self {
            allocator,
            thread_id,
        }
    }

    pub fn allocator(&self) -> &Arc<CellAllocator> {
        &self.allocator
    }

    pub fn buffer(&self) -> &Arc<SyncBuffer> {
        self.allocator.buffer()
    }

    pub fn thread_id(&self) -> i32 {
        self.thread_id
    }

    /// Same shared domain, seen from another thread of control.
    pub fn for_thread(&self, thread_id: i32) -> Self {
        Self {
            allocator: Arc::clone(&self.allocator),
            thread_id,
        }
    }
}

/// Common acquire loop for mutex and binary semaphore: wait while locked,
/// then try to swap the state cell from unlocked to locked, charging elapsed
/// time against the remaining budget on every failed attempt.
///
/// `Ok(false)` means the budget ran out. A state value outside {0, 1} means
/// some thread already got released against a corrupted lock, which nothing
/// can repair; it surfaces as a fatal error.
pub(crate) fn acquire(
    buffer: &SyncBuffer,
    index: usize,
    key: i32,
    timeout: Option<Duration>,
) -> Result<bool> {
    let mut remaining = timeout;
    loop {
        let start = Instant::now();
        // The wait outcome itself does not matter, the swap below decides
        buffer.wait(index, LOCKED, remaining);
        let previous = buffer.compare_exchange(index, UNLOCKED, LOCKED);
        if previous == UNLOCKED {
            return Ok(true);
        }
        if previous != LOCKED {
            return Err(WeftError::InvalidPrimitiveState {
                key,
                value: previous,
            });
        }
        // Somebody else beat us to the lock; charge the time spent
        if let Some(budget) = remaining {
            let elapsed = start.elapsed();
            if elapsed >= budget {
                return Ok(false);
            }
            remaining = Some(budget - elapsed);
        }
    }
}

/// Common release: store unlocked, then wake every waiter. Over-waking is
/// acceptable, the losers go back to waiting.
pub(crate) fn release(buffer: &SyncBuffer, index: usize) {
    buffer.store(index, UNLOCKED);
    buffer.notify_all(index);
}
