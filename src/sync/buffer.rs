use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Result of a blocking wait on a buffer cell, mirroring the three outcomes
/// of a futex wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The cell did not hold the expected value, no suspension happened
    ValueMismatch,
    /// Another thread notified the cell and its value moved off `expected`
    Woken,
    /// The timeout budget ran out while the cell still held `expected`
    TimedOut,
}

/// Number of wait lanes the cell index hashes into. Collisions only cause
/// spurious wakeups; waiters re-check their cell before returning.
const WAIT_LANES: usize = 64;

struct WaitLane {
    guard: Mutex<()>,
    cond: Condvar,
}

/// Fixed buffer of `i32` cells shared by the coordinator and every worker
/// thread, with wait/notify suspension at the OS level.
///
/// This is the process-wide memory all synchronization primitives operate
/// on. Cells are plain atomics; `wait` parks the calling thread on a
/// Condvar lane hashed from the cell index until `notify_all` on the same
/// index wakes it (the standard futex-emulation scheme).
pub struct SyncBuffer {
    cells: Box<[AtomicI32]>,
    lanes: Box<[WaitLane]>,
}

impl SyncBuffer {
    pub fn new(len: usize) -> Self {
        let cells = (0..len).map(|_| AtomicI32::new(0)).collect();
        let lanes = (0..WAIT_LANES)
            .map(|_| WaitLane {
                guard: Mutex::new(()),
                cond: Condvar::new(),
            })
            .collect();
        Self { cells, lanes }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn load(&self, index: usize) -> i32 {
        self.cells[index].load(Ordering::SeqCst)
    }

    pub fn store(&self, index: usize, value: i32) {
        self.cells[index].store(value, Ordering::SeqCst);
    }

    /// Atomic compare-and-swap, returning the value previously held in the
    /// cell. The swap happened exactly when the returned value equals
    /// `expected`.
    pub fn compare_exchange(&self, index: usize, expected: i32, new: i32) -> i32 {
        match self.cells[index].compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(previous) => previous,
            Err(previous) => previous,
        }
    }

    fn lane(&self, index: usize) -> &WaitLane {
        &self.lanes[index % WAIT_LANES]
    }

    /// Suspend the calling thread while the cell holds `expected`, up to
    /// `timeout` (`None` waits indefinitely).
    ///
    /// The value is re-checked under the lane lock before sleeping and after
    /// every wakeup, so a `notify_all` that races with the initial check is
    /// never lost.
    pub fn wait(&self, index: usize, expected: i32, timeout: Option<Duration>) -> WaitOutcome {
        let lane = self.lane(index);
        let mut held = lane.guard.lock().unwrap();
        if self.load(index) != expected {
            return WaitOutcome::ValueMismatch;
        }
        match timeout {
            None => loop {
                held = lane.cond.wait(held).unwrap();
                if self.load(index) != expected {
                    return WaitOutcome::Woken;
                }
            },
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    let (guard, _) = lane.cond.wait_timeout(held, deadline - now).unwrap();
                    held = guard;
                    if self.load(index) != expected {
                        return WaitOutcome::Woken;
                    }
                }
            }
        }
    }

    /// Wake every thread currently waiting on `index`. Over-waking is fine,
    /// waiters re-check their cell.
    pub fn notify_all(&self, index: usize) {
        let lane = self.lane(index);
        let _held = lane.guard.lock().unwrap();
        lane.cond.notify_all();
    }
}
