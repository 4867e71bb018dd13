use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{Result, WeftError};

use super::allocator::PrimitiveKind;
use super::buffer::{SyncBuffer, WaitOutcome};
use super::{SyncContext, LOCKED, UNLOCKED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EventState {
    Unlocked = 0,
    Locked = 1,
}

/// Manual-reset event: `wait_one` blocks while the event is unset, `set`
/// releases every waiter and lets later waiters pass until `reset` re-arms
/// it.
///
/// Same gate protocol as [`Barrier`](super::Barrier), allocated under its
/// own type tag so the same key can name both a barrier and an event.
pub struct ManualResetEvent {
    key: i32,
    index: usize,
    buffer: Arc<SyncBuffer>,
}

impl ManualResetEvent {
    /// Resolve the event for `key`. A freshly allocated event starts unset
    /// (locked).
    pub fn create_or_get(ctx: &SyncContext, key: i32) -> Result<Self> {
        Self::create_or_get_with(ctx, key, EventState::Locked)
    }

    pub fn create_or_get_with(ctx: &SyncContext, key: i32, state: EventState) -> Result<Self> {
        let index = ctx.allocator().get_or_create(
            key,
            PrimitiveKind::ManualResetEvent,
            Some([state as i32, LOCKED]),
        )?;
        Ok(Self {
            key,
            index,
            buffer: Arc::clone(ctx.buffer()),
        })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn state(&self) -> EventState {
        if self.buffer.load(self.index) == LOCKED {
            EventState::Locked
        } else {
            EventState::Unlocked
        }
    }

    /// Block until the event is set, up to `timeout` (`None` blocks
    /// indefinitely). Returns `Ok(true)` when the event is or became set,
    /// `Ok(false)` on timeout.
    pub fn wait_one(&self, timeout: Option<Duration>) -> Result<bool> {
        let value = self.buffer.load(self.index);
        if value != LOCKED && value != UNLOCKED {
            return Err(WeftError::InvalidPrimitiveState {
                key: self.key,
                value,
            });
        }
        debug!(key = self.key, "event wait");
        match self.buffer.wait(self.index, LOCKED, timeout) {
            WaitOutcome::TimedOut => Ok(false),
            WaitOutcome::ValueMismatch | WaitOutcome::Woken => Ok(true),
        }
    }

    /// Set the event and wake every waiter.
    pub fn set(&self) {
        debug!(key = self.key, "event set");
        self.buffer.store(self.index, UNLOCKED);
        self.buffer.notify_all(self.index);
    }

    /// Clear the event. Only affects waiters arriving after this call.
    pub fn reset(&self) {
        debug!(key = self.key, "event reset");
        self.buffer.store(self.index, LOCKED);
    }
}
