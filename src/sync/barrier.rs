use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{Result, WeftError};

use super::allocator::PrimitiveKind;
use super::buffer::{SyncBuffer, WaitOutcome};
use super::{SyncContext, LOCKED, UNLOCKED};

/// One-shot release gate: waiters block while the cell holds the locked
/// state until some thread calls [`notify`](Barrier::notify).
///
/// `reset` re-arms the gate for subsequent waiters only; threads already
/// released stay released.
pub struct Barrier {
    key: i32,
    index: usize,
    buffer: Arc<SyncBuffer>,
}

impl Barrier {
    /// Resolve the barrier for `key`. A freshly allocated barrier starts
    /// locked, so waiters block until the first `notify`.
    pub fn create_or_get(ctx: &SyncContext, key: i32) -> Result<Self> {
        let index = ctx
            .allocator()
            .get_or_create(key, PrimitiveKind::Barrier, Some([LOCKED, LOCKED]))?;
        Ok(Self {
            key,
            index,
            buffer: Arc::clone(ctx.buffer()),
        })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    /// Block until the barrier is notified, up to `timeout` (`None` blocks
    /// indefinitely). Returns `Ok(true)` when the barrier is open,
    /// `Ok(false)` on timeout.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<bool> {
        let value = self.buffer.load(self.index);
        if value != LOCKED && value != UNLOCKED {
            return Err(WeftError::InvalidPrimitiveState {
                key: self.key,
                value,
            });
        }
        debug!(key = self.key, "barrier wait");
        match self.buffer.wait(self.index, LOCKED, timeout) {
            WaitOutcome::TimedOut => Ok(false),
            WaitOutcome::ValueMismatch | WaitOutcome::Woken => Ok(true),
        }
    }

    /// Open the barrier and wake every waiter.
    pub fn notify(&self) {
        debug!(key = self.key, "barrier notify");
        self.buffer.store(self.index, UNLOCKED);
        self.buffer.notify_all(self.index);
    }

    /// Re-arm the barrier. Only affects waiters arriving after this call.
    pub fn reset(&self) {
        debug!(key = self.key, "barrier reset");
        self.buffer.store(self.index, LOCKED);
    }
}
