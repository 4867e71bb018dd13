//! Worker pool: packet transport, scheduler, worker dispatch, and proxies.

pub mod proxy;
pub mod registry;
pub mod scheduler;
pub mod transport;
pub(crate) mod worker;

pub use proxy::{ProxyFactory, WorkerProxy};
pub use registry::{ClassEntry, ClassRegistry, WorkerClass, WorkerContext};
pub use scheduler::Target;
pub use transport::{PacketEvent, PacketHandler, PendingReply};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::info;

use crate::core::config::PoolConfig;
use crate::core::errors::{Result, WeftError};
use crate::sync::{CellAllocator, SyncContext, COORDINATOR_THREAD};
use crate::wire::{Packet, PacketIds, WireRegistry};

use scheduler::{Command, Scheduler, WorkerLink};
use transport::{PendingCall, Transport};
use worker::WorkerBoot;

/// Cloneable submission handle into a running pool's scheduler.
#[derive(Clone)]
pub struct PoolHandle {
    commands: UnboundedSender<Command>,
    ids: PacketIds,
}

impl PoolHandle {
    /// Build an Execute packet for `class.method(args)` and hand it to the
    /// scheduler. The returned reply settles with the correlated response,
    /// or immediately with an error once the pool is shut down.
    pub fn submit(
        &self,
        target: Target,
        class: &str,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> PendingReply {
        let packet = Packet::Execute {
            id: self.ids.next(),
            target: class.to_string(),
            method: method.to_string(),
            args,
        };
        let (pending, reply) = PendingCall::new();
        let command = Command::Submit {
            packet,
            target,
            pending: pending.clone(),
        };
        if self.commands.send(command).is_err() {
            pending.settle(Err(WeftError::channel_closed("worker pool is shut down")));
        }
        reply
    }
}

/// A pool of OS-thread workers driven by one scheduler task.
///
/// Workers are spawned at initialization and live for the pool's lifetime;
/// each runs a current-thread runtime and dispatches Execute packets against
/// the shared [`ClassRegistry`]. The coordinator side keeps the scheduler on
/// a spawned task, so `initialize` must be called from within a runtime.
pub struct WorkerPool {
    handle: PoolHandle,
    scheduler: Option<tokio::task::JoinHandle<()>>,
    live_count: Arc<AtomicUsize>,
    sync: SyncContext,
    classes: Arc<ClassRegistry>,
    proxies: ProxyFactory,
}

impl WorkerPool {
    pub fn initialize(config: PoolConfig, classes: ClassRegistry) -> Result<Self> {
        Self::initialize_with(config, classes, Vec::new())
    }

    /// Initialize with coordinator-side packet handlers, which observe every
    /// inbound packet before the default settlement.
    pub fn initialize_with(
        config: PoolConfig,
        classes: ClassRegistry,
        handlers: Vec<Box<dyn PacketHandler>>,
    ) -> Result<Self> {
        config.validate()?;
        let worker_count = config.resolve_workers()?;
        info!(
            workers = worker_count,
            sync_slots = config.sync_slots,
            "initializing worker pool"
        );

        let classes = Arc::new(classes);
        let wire = Arc::new(WireRegistry::new(config.wire_mode));
        let ids = PacketIds::new();
        let allocator = Arc::new(CellAllocator::new(config.sync_slots));
        let sync = SyncContext::new(allocator, COORDINATOR_THREAD);

        let (event_tx, event_rx) = unbounded_channel();
        let (command_tx, command_rx) = unbounded_channel();

        let mut links = Vec::with_capacity(worker_count);
        let mut joins = Vec::with_capacity(worker_count);
        for worker_id in 1..=worker_count as u32 {
            let (to_worker, inbound) = std::sync::mpsc::channel();
            let boot = WorkerBoot {
                id: worker_id,
                inbound,
                outbound: event_tx.clone(),
                classes: Arc::clone(&classes),
                wire: Arc::clone(&wire),
                ids: ids.clone(),
                sync: sync.for_thread(worker_id as i32),
                preload: config.preload.clone(),
            };
            let join = std::thread::Builder::new()
                .name(format!("weft-worker-{}", worker_id))
                .spawn(move || worker::run(boot))
                .map_err(|err| {
                    WeftError::configuration(format!("Failed to spawn worker thread: {}", err))
                })?;
            links.push(WorkerLink {
                id: worker_id,
                channel: to_worker,
            });
            joins.push(join);
        }
        // Workers hold the only remaining clones; the event stream ends when
        // the last worker thread is gone
        drop(event_tx);

        let live_count = Arc::new(AtomicUsize::new(worker_count));
        let transport = Transport::new(wire, ids.clone(), handlers);
        let scheduler = Scheduler::new(links, joins, transport, ids.clone(), Arc::clone(&live_count));
        let task = tokio::spawn(scheduler.run(command_rx, event_rx));

        let handle = PoolHandle {
            commands: command_tx,
            ids,
        };
        let proxies = ProxyFactory::new(Arc::clone(&classes), handle.clone());
        Ok(Self {
            handle,
            scheduler: Some(task),
            live_count,
            sync,
            classes,
            proxies,
        })
    }

    /// Workers currently alive. Decreases as workers exit or are removed.
    pub fn workers_count(&self) -> usize {
        self.live_count.load(Ordering::SeqCst)
    }

    pub fn handle(&self) -> &PoolHandle {
        &self.handle
    }

    /// Coordinator-side view of the shared synchronization domain
    pub fn sync_context(&self) -> &SyncContext {
        &self.sync
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    /// Memoized proxy for a registered class
    pub fn proxy(&self, class: &str) -> Result<Arc<WorkerProxy>> {
        self.proxies.create(class)
    }

    pub fn submit(
        &self,
        target: Target,
        class: &str,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> PendingReply {
        self.handle.submit(target, class, method, args)
    }

    /// Stop the pool: every worker receives Exit ahead of queued work, queued
    /// and in-flight calls are rejected, and worker threads are joined before
    /// this returns.
    pub async fn shutdown(mut self) {
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(task) = self.scheduler.take() {
            let _ = task.await;
        }
    }
}
