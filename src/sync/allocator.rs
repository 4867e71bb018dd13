use std::sync::Arc;
use tracing::debug;

use crate::core::errors::{Result, WeftError};

use super::buffer::SyncBuffer;
use super::{LOCKED, UNLOCKED};

/// Type tag stored in a slot's first cell. `NotSet` marks a free slot, so a
/// real primitive kind can never be zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum PrimitiveKind {
    NotSet = 0,
    Mutex = 1,
    Semaphore = 2,
    Barrier = 3,
    ManualResetEvent = 4,
}

/// Cell 0 of the buffer is the allocator's own spinlock.
const CONTROL_CELL: usize = 0;

/// Each slot is `[type, id, data0, data1]`.
const SLOT_CELLS: usize = 4;
const TYPE_OFFSET: usize = 0;
const ID_OFFSET: usize = 1;
const DATA_OFFSET: usize = 2;

/// Allocates fixed-size slots in the shared synchronization buffer.
///
/// Lookup by `(id, kind)` is idempotent and stable for the process
/// lifetime: a slot, once claimed, is never freed or reused, so an index
/// handed out to one thread stays valid in every other thread. All metadata
/// traffic is serialized by the single spinlock in the control cell.
pub struct CellAllocator {
    buffer: Arc<SyncBuffer>,
    capacity: usize,
}

impl CellAllocator {
    /// Reserve `capacity` slots. The buffer is sized up front and never
    /// grows.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(SyncBuffer::new(1 + capacity * SLOT_CELLS)),
            capacity,
        }
    }

    pub fn buffer(&self) -> &Arc<SyncBuffer> {
        &self.buffer
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Find or claim the slot for `(id, kind)` and return the index of its
    /// first data cell.
    ///
    /// A freshly claimed slot gets `initial` written into its two data
    /// cells; an existing slot keeps its current state untouched.
    pub fn get_or_create(
        &self,
        id: i32,
        kind: PrimitiveKind,
        initial: Option<[i32; 2]>,
    ) -> Result<usize> {
        if id < 0 {
            return Err(WeftError::configuration(format!(
                "Primitive key must be non-negative. Got {}",
                id
            )));
        }

        self.acquire_control();
        let found = self.scan(id, kind, initial);
        self.release_control();

        match found {
            Some(data_index) => Ok(data_index),
            None => Err(WeftError::AllocationExhausted {
                capacity: self.capacity,
            }),
        }
    }

    /// Linear scan over the slots, caller must hold the control lock.
    fn scan(&self, id: i32, kind: PrimitiveKind, initial: Option<[i32; 2]>) -> Option<usize> {
        let mut slot = 1;
        while slot + SLOT_CELLS <= self.buffer.len() {
            let slot_kind = self.buffer.load(slot + TYPE_OFFSET);
            if slot_kind == PrimitiveKind::NotSet as i32 {
                // End of the allocated region, claim this slot
                self.buffer.store(slot + TYPE_OFFSET, kind as i32);
                self.buffer.store(slot + ID_OFFSET, id);
                if let Some(initial) = initial {
                    self.buffer.store(slot + DATA_OFFSET, initial[0]);
                    self.buffer.store(slot + DATA_OFFSET + 1, initial[1]);
                }
                debug!(id, kind = kind as i32, index = slot, "allocated sync slot");
                return Some(slot + DATA_OFFSET);
            }
            if slot_kind == kind as i32 && self.buffer.load(slot + ID_OFFSET) == id {
                return Some(slot + DATA_OFFSET);
            }
            slot += SLOT_CELLS;
        }
        None
    }

    fn acquire_control(&self) {
        loop {
            self.buffer.wait(CONTROL_CELL, LOCKED, None);
            if self.buffer.compare_exchange(CONTROL_CELL, UNLOCKED, LOCKED) == UNLOCKED {
                return;
            }
        }
    }

    fn release_control(&self) {
        self.buffer.store(CONTROL_CELL, UNLOCKED);
        self.buffer.notify_all(CONTROL_CELL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn repeated_lookup_returns_the_same_index() {
        let allocator = CellAllocator::new(16);
        let first = allocator
            .get_or_create(42, PrimitiveKind::Mutex, Some([0, -1]))
            .unwrap();
        let second = allocator
            .get_or_create(42, PrimitiveKind::Mutex, Some([1, 3]))
            .unwrap();
        assert_eq!(first, second);
        // Existing slot keeps its state, the second initial is ignored
        assert_eq!(allocator.buffer().load(first), 0);
        assert_eq!(allocator.buffer().load(first + 1), -1);
    }

    #[test]
    fn same_key_different_kind_gets_a_distinct_slot() {
        let allocator = CellAllocator::new(16);
        let mutex = allocator
            .get_or_create(7, PrimitiveKind::Mutex, None)
            .unwrap();
        let barrier = allocator
            .get_or_create(7, PrimitiveKind::Barrier, None)
            .unwrap();
        assert_ne!(mutex, barrier);
    }

    #[test]
    fn negative_key_is_a_configuration_error() {
        let allocator = CellAllocator::new(4);
        assert!(matches!(
            allocator.get_or_create(-1, PrimitiveKind::Semaphore, None),
            Err(WeftError::Configuration { .. })
        ));
    }

    #[test]
    fn exhaustion_reports_without_corrupting_existing_slots() {
        let allocator = CellAllocator::new(2);
        let a = allocator
            .get_or_create(1, PrimitiveKind::Mutex, Some([0, -1]))
            .unwrap();
        let b = allocator
            .get_or_create(2, PrimitiveKind::Mutex, Some([1, 5]))
            .unwrap();
        assert!(matches!(
            allocator.get_or_create(3, PrimitiveKind::Mutex, None),
            Err(WeftError::AllocationExhausted { capacity: 2 })
        ));
        // Existing slots still resolve and keep their data
        assert_eq!(
            allocator.get_or_create(1, PrimitiveKind::Mutex, None).unwrap(),
            a
        );
        assert_eq!(allocator.buffer().load(b), 1);
        assert_eq!(allocator.buffer().load(b + 1), 5);
    }

    #[test]
    fn concurrent_lookups_agree_on_the_index() {
        let allocator = std::sync::Arc::new(CellAllocator::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let allocator = std::sync::Arc::clone(&allocator);
            handles.push(thread::spawn(move || {
                (0..32)
                    .map(|key| {
                        allocator
                            .get_or_create(key, PrimitiveKind::Semaphore, Some([0, 0]))
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            }));
        }
        let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for other in &results[1..] {
            assert_eq!(&results[0], other);
        }
    }
}
