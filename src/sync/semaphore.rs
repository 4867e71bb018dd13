use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::Result;

use super::allocator::PrimitiveKind;
use super::buffer::SyncBuffer;
use super::{acquire, release, SyncContext, LOCKED, UNLOCKED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SemaphoreState {
    Unlocked = 0,
    Locked = 1,
}

/// Binary semaphore over a single shared state cell.
///
/// Same acquire/release protocol as [`Mutex`](super::Mutex) but without
/// ownership tracking: any thread may `give`, regardless of who took it.
pub struct BinarySemaphore {
    key: i32,
    index: usize,
    buffer: Arc<SyncBuffer>,
}

impl BinarySemaphore {
    pub fn create_or_get(ctx: &SyncContext, key: i32) -> Result<Self> {
        Self::create_or_get_with(ctx, key, SemaphoreState::Unlocked)
    }

    pub fn create_or_get_with(
        ctx: &SyncContext,
        key: i32,
        state: SemaphoreState,
    ) -> Result<Self> {
        let index = ctx.allocator().get_or_create(
            key,
            PrimitiveKind::Semaphore,
            Some([state as i32, UNLOCKED]),
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

    pub fn state(&self) -> SemaphoreState {
        if self.buffer.load(self.index) == LOCKED {
            SemaphoreState::Locked
        } else {
            SemaphoreState::Unlocked
        }
    }

    /// Take the semaphore, blocking up to `timeout` (`None` blocks
    /// indefinitely). Returns `Ok(false)` when the budget ran out.
    pub fn take(&self, timeout: Option<Duration>) -> Result<bool> {
        debug!(key = self.key, "semaphore wait");
        let taken = acquire(&self.buffer, self.index, self.key, timeout)?;
        if taken {
            debug!(key = self.key, "semaphore taken");
        }
        Ok(taken)
    }

    /// Release the semaphore and wake all waiters.
    pub fn give(&self) {
        release(&self.buffer, self.index);
        debug!(key = self.key, "semaphore given");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CellAllocator;
    use std::thread;

    fn context() -> SyncContext {
        SyncContext::new(Arc::new(CellAllocator::new(16)), 0)
    }

    #[test]
    fn take_and_give_flip_the_state() {
        let ctx = context();
        let sem = BinarySemaphore::create_or_get(&ctx, 1).unwrap();
        assert_eq!(sem.state(), SemaphoreState::Unlocked);
        assert!(sem.take(None).unwrap());
        assert_eq!(sem.state(), SemaphoreState::Locked);
        sem.give();
        assert_eq!(sem.state(), SemaphoreState::Unlocked);
    }

    #[test]
    fn take_times_out_when_held() {
        let ctx = context();
        let sem =
            BinarySemaphore::create_or_get_with(&ctx, 2, SemaphoreState::Locked).unwrap();
        assert!(!sem.take(Some(Duration::from_millis(30))).unwrap());
        assert_eq!(sem.state(), SemaphoreState::Locked);
    }

    #[test]
    fn any_thread_may_give() {
        let ctx = context();
        let sem =
            BinarySemaphore::create_or_get_with(&ctx, 3, SemaphoreState::Locked).unwrap();

        let giver = {
            let ctx = ctx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                let sem = BinarySemaphore::create_or_get(&ctx, 3).unwrap();
                sem.give();
            })
        };

        assert!(sem.take(Some(Duration::from_secs(5))).unwrap());
        giver.join().unwrap();
    }

    #[test]
    fn corrupted_state_is_fatal() {
        use crate::core::errors::WeftError;

        let ctx = context();
        let sem = BinarySemaphore::create_or_get(&ctx, 5).unwrap();
        ctx.buffer().store(sem.index, 3);
        assert!(matches!(
            sem.take(Some(Duration::from_millis(10))),
            Err(WeftError::InvalidPrimitiveState { key: 5, value: 3 })
        ));
    }
}
