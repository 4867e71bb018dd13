use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::core::errors::{Result, WeftError};

use super::allocator::PrimitiveKind;
use super::buffer::SyncBuffer;
use super::{acquire, release, SyncContext, LOCKED};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MutexState {
    Unlocked = 0,
    Locked = 1,
}

const STATE_OFFSET: usize = 0;
const OWNER_OFFSET: usize = 1;

/// Thread id meaning "nobody holds this mutex"
const NO_OWNING_THREAD: i32 = -1;

/// Cross-thread mutual exclusion over a shared cell pair
/// `[lock state, owning thread id]`.
///
/// Can be acquired from the coordinator or any worker; the owning thread id
/// is recorded on acquisition and checked on release, so a thread can never
/// unlock a mutex it does not hold.
pub struct Mutex {
    key: i32,
    index: usize,
    buffer: Arc<SyncBuffer>,
    thread_id: i32,
}

impl Mutex {
    /// Resolve the mutex for `key`, allocating its cells on first use.
    /// A freshly allocated mutex starts unlocked.
    pub fn create_or_get(ctx: &SyncContext, key: i32) -> Result<Self> {
        Self::create_or_get_with(ctx, key, MutexState::Unlocked)
    }

    /// Same as [`create_or_get`](Self::create_or_get), but a freshly
    /// allocated mutex starts in `state` (locked means owned by the calling
    /// thread). An existing mutex keeps its current state.
    pub fn create_or_get_with(ctx: &SyncContext, key: i32, state: MutexState) -> Result<Self> {
        let owner = if state == MutexState::Locked {
            ctx.thread_id()
        } else {
            NO_OWNING_THREAD
        };
        let index =
            ctx.allocator()
                .get_or_create(key, PrimitiveKind::Mutex, Some([state as i32, owner]))?;
        Ok(Self {
            key,
            index,
            buffer: Arc::clone(ctx.buffer()),
            thread_id: ctx.thread_id(),
        })
    }

    pub fn key(&self) -> i32 {
        self.key
    }

    pub fn state(&self) -> MutexState {
        if self.buffer.load(self.index + STATE_OFFSET) == LOCKED {
            MutexState::Locked
        } else {
            MutexState::Unlocked
        }
    }

    pub fn owning_thread(&self) -> i32 {
        self.buffer.load(self.index + OWNER_OFFSET)
    }

    /// Acquire the mutex, blocking up to `timeout` (`None` blocks
    /// indefinitely). Returns `Ok(false)` when the budget ran out.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<bool> {
        debug!(key = self.key, thread = self.thread_id, "mutex wait");
        if !acquire(
            &self.buffer,
            self.index + STATE_OFFSET,
            self.key,
            timeout,
        )? {
            return Ok(false);
        }
        // Between the swap and this store the owner cell still reads -1;
        // nobody can release on our behalf because -1 matches no thread.
        self.buffer
            .store(self.index + OWNER_OFFSET, self.thread_id);
        debug!(key = self.key, thread = self.thread_id, "mutex locked");
        Ok(true)
    }

    /// Release the mutex and wake all waiters. Fails with an ownership
    /// violation, leaving the state untouched, when the calling thread is
    /// not the recorded owner.
    pub fn unlock(&self) -> Result<()> {
        let owner = self.owning_thread();
        if owner != self.thread_id {
            return Err(WeftError::OwnershipViolation {
                key: self.key,
                owner,
                caller: self.thread_id,
            });
        }
        self.buffer
            .store(self.index + OWNER_OFFSET, NO_OWNING_THREAD);
        release(&self.buffer, self.index + STATE_OFFSET);
        debug!(key = self.key, thread = self.thread_id, "mutex unlocked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::CellAllocator;
    use std::thread;

    fn context(thread_id: i32) -> SyncContext {
        SyncContext::new(Arc::new(CellAllocator::new(16)), thread_id)
    }

    #[test]
    fn lock_records_the_owner() {
        let ctx = context(3);
        let mutex = Mutex::create_or_get(&ctx, 1).unwrap();
        assert_eq!(mutex.state(), MutexState::Unlocked);
        assert!(mutex.lock(None).unwrap());
        assert_eq!(mutex.state(), MutexState::Locked);
        assert_eq!(mutex.owning_thread(), 3);
        mutex.unlock().unwrap();
        assert_eq!(mutex.owning_thread(), -1);
    }

    #[test]
    fn unlock_by_non_owner_fails_and_leaves_state() {
        let ctx = context(1);
        let mutex = Mutex::create_or_get(&ctx, 5).unwrap();
        assert!(mutex.lock(None).unwrap());

        let intruder = Mutex::create_or_get(&ctx.for_thread(2), 5).unwrap();
        assert!(matches!(
            intruder.unlock(),
            Err(WeftError::OwnershipViolation {
                key: 5,
                owner: 1,
                caller: 2
            })
        ));
        assert_eq!(mutex.state(), MutexState::Locked);
        assert_eq!(mutex.owning_thread(), 1);
        mutex.unlock().unwrap();
    }

    #[test]
    fn lock_times_out_while_held_elsewhere() {
        let ctx = context(1);
        let mutex = Mutex::create_or_get(&ctx, 9).unwrap();
        assert!(mutex.lock(None).unwrap());

        let other = Mutex::create_or_get(&ctx.for_thread(2), 9).unwrap();
        assert!(!other.lock(Some(Duration::from_millis(40))).unwrap());
        assert_eq!(mutex.owning_thread(), 1);
        mutex.unlock().unwrap();
    }

    #[test]
    fn contended_lock_admits_one_holder_at_a_time() {
        let ctx = context(0);
        // Allocate up front so every thread resolves the same slot
        Mutex::create_or_get(&ctx, 11).unwrap();

        let counter = Arc::new(std::sync::atomic::AtomicI32::new(0));
        let mut handles = Vec::new();
        for thread_id in 1..=4 {
            let ctx = ctx.for_thread(thread_id);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                let mutex = Mutex::create_or_get(&ctx, 11).unwrap();
                for _ in 0..50 {
                    assert!(mutex.lock(None).unwrap());
                    assert_eq!(mutex.owning_thread(), thread_id);
                    let inside =
                        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    assert_eq!(inside, 0, "two threads inside the critical section");
                    counter.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    mutex.unlock().unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn corrupted_state_is_fatal() {
        let ctx = context(0);
        let mutex = Mutex::create_or_get(&ctx, 13).unwrap();
        ctx.buffer().store(mutex.index + STATE_OFFSET, 7);
        assert!(matches!(
            mutex.lock(Some(Duration::from_millis(10))),
            Err(WeftError::InvalidPrimitiveState { key: 13, value: 7 })
        ));
    }
}
