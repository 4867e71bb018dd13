//! Weft: a single-process concurrent execution runtime.
//!
//! One coordinator plus a pool of OS-thread workers, stitched together by
//! two layers:
//!
//! - a shared-memory synchronization layer ([`sync`]): a cell allocator over
//!   one atomic buffer plus blocking primitives (mutex, binary semaphore,
//!   barrier, manual-reset event) usable from any thread in the process;
//! - an execution layer ([`pool`]): a JSON packet transport, a scheduler
//!   with shared and per-worker queues, a worker-side method dispatcher, and
//!   memoized call proxies for registered worker classes.

// Core infrastructure modules
pub mod core {
    pub mod config;
    pub mod errors;
}

// The two runtime layers
pub mod sync; // shared-memory cells and blocking primitives
pub mod pool; // transport, scheduler, workers, proxies
pub mod wire; // packet kinds and wire reconstruction

// Re-exports for convenience
pub use core::config::{PoolConfig, WireMode};
pub use core::errors::{RemoteError, Result, WeftError};
pub use pool::{
    ClassRegistry, PacketEvent, PacketHandler, PendingReply, PoolHandle, ProxyFactory, Target,
    WorkerClass, WorkerContext, WorkerPool, WorkerProxy,
};
pub use sync::{
    Barrier, BinarySemaphore, CellAllocator, ManualResetEvent, Mutex, SyncContext,
};
pub use wire::{Packet, PacketIds, WireRegistry};

// Implementors of [`WorkerClass`] need the same macro
pub use async_trait::async_trait;
