use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};

use crate::core::errors::{Result, WeftError};
use crate::wire::{Packet, PacketIds, VOID_PACKET_ID};

use super::transport::{PacketEvent, PendingCall, Transport};

/// Where a dispatched packet may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Whichever worker becomes free first
    Any,
    /// Every worker, fanned out within a single scheduling pass
    All,
    /// Exactly this worker
    Worker(u32),
}

pub(crate) enum Command {
    Submit {
        packet: Packet,
        target: Target,
        pending: PendingCall,
    },
    Shutdown,
}

/// Coordinator-side connection to one spawned worker
pub(crate) struct WorkerLink {
    pub id: u32,
    pub channel: std::sync::mpsc::Sender<Value>,
}

/// Per-worker scheduler state: `Spawned -> Ready -> Busy -> Ready -> Removed`
struct WorkerHandle {
    id: u32,
    ready: bool,
    free: bool,
    channel: std::sync::mpsc::Sender<Value>,
}

#[derive(Clone)]
struct QueuedCall {
    packet: Packet,
    pending: PendingCall,
}

/// Work-dispatch scheduler owning the worker pool state: the shared Any
/// queue, one pinned queue per worker, and the per-worker in-flight maps
/// used to correlate responses back to pending calls.
///
/// Runs as a single task; every mutation happens on its loop, so the queue
/// and worker state need no further locking.
pub(crate) struct Scheduler {
    workers: Vec<WorkerHandle>,
    any_queue: VecDeque<QueuedCall>,
    pinned: HashMap<u32, VecDeque<QueuedCall>>,
    in_flight: HashMap<u32, HashMap<u32, PendingCall>>,
    transport: Transport,
    ids: PacketIds,
    live_count: Arc<AtomicUsize>,
    joins: Vec<std::thread::JoinHandle<()>>,
    shutting_down: bool,
}

impl Scheduler {
    pub(crate) fn new(
        links: Vec<WorkerLink>,
        joins: Vec<std::thread::JoinHandle<()>>,
        transport: Transport,
        ids: PacketIds,
        live_count: Arc<AtomicUsize>,
    ) -> Self {
        let mut pinned = HashMap::new();
        let mut in_flight = HashMap::new();
        let workers = links
            .into_iter()
            .map(|link| {
                pinned.insert(link.id, VecDeque::new());
                in_flight.insert(link.id, HashMap::new());
                WorkerHandle {
                    id: link.id,
                    ready: false,
                    free: true,
                    channel: link.channel,
                }
            })
            .collect();
        Self {
            workers,
            any_queue: VecDeque::new(),
            pinned,
            in_flight,
            transport,
            ids,
            live_count,
            joins,
            shutting_down: false,
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: UnboundedReceiver<Command>,
        mut events: UnboundedReceiver<(u32, Value)>,
    ) {
        let mut commands_open = true;
        loop {
            if self.shutting_down && self.workers.is_empty() {
                break;
            }
            tokio::select! {
                command = commands.recv(), if commands_open => match command {
                    Some(Command::Submit { packet, target, pending }) => {
                        self.submit(packet, target, pending);
                    }
                    Some(Command::Shutdown) => self.begin_shutdown(),
                    None => {
                        // Pool handle dropped without an explicit shutdown
                        commands_open = false;
                        self.begin_shutdown();
                    }
                },
                event = events.recv() => match event {
                    Some((worker_id, payload)) => {
                        if let Err(err) = self.on_worker_payload(worker_id, payload) {
                            error!(%err, "unrecoverable transport failure, stopping scheduler");
                            break;
                        }
                    }
                    // All worker threads gone and their senders dropped
                    None => break,
                },
            }
        }
        self.drain();
        for join in self.joins.drain(..) {
            let _ = join.join();
        }
        info!("scheduler stopped");
    }

    /// Queue a dispatch request and try to place it immediately.
    fn submit(&mut self, packet: Packet, target: Target, pending: PendingCall) {
        match target {
            Target::Any => {
                debug!(packet = %packet.describe(), "queue packet for any worker");
                self.any_queue.push_back(QueuedCall { packet, pending });
            }
            Target::All => {
                if self.workers.is_empty() {
                    pending.settle(Err(WeftError::channel_closed(
                        "no live workers for broadcast",
                    )));
                    return;
                }
                debug!(packet = %packet.describe(), "queue packet for all workers");
                let call = QueuedCall { packet, pending };
                for worker in &self.workers {
                    if let Some(queue) = self.pinned.get_mut(&worker.id) {
                        queue.push_back(call.clone());
                    }
                }
            }
            Target::Worker(worker_id) => {
                if !self.workers.iter().any(|w| w.id == worker_id) {
                    pending.settle(Err(WeftError::configuration(format!(
                        "Invalid worker id for pinned message: W-{}",
                        worker_id
                    ))));
                    return;
                }
                debug!(worker_id, packet = %packet.describe(), "queue pinned packet");
                if let Some(queue) = self.pinned.get_mut(&worker_id) {
                    queue.push_back(QueuedCall { packet, pending });
                }
            }
        }
        self.schedule();
    }

    /// Handle one raw payload from a worker: reconstruct, update the state
    /// machine, correlate, dispatch through the handlers, then run another
    /// scheduling pass.
    fn on_worker_payload(&mut self, worker_id: u32, payload: Value) -> Result<()> {
        let packet = self.transport.reconstruct(worker_id, &payload);
        match &packet {
            Packet::Online { .. } => {
                if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
                    worker.ready = true;
                    info!(worker_id, "worker ready");
                }
            }
            Packet::Exit { .. } => {
                self.remove_worker(worker_id);
            }
            _ => {}
        }

        let correlation_id = packet.correlation_id();
        let pending = if correlation_id == VOID_PACKET_ID {
            None
        } else {
            self.in_flight
                .get_mut(&worker_id)
                .and_then(|map| map.remove(&correlation_id))
        };
        if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
            worker.free = self
                .in_flight
                .get(&worker_id)
                .map_or(true, HashMap::is_empty);
        }
        debug!(
            worker_id,
            packet = %packet.describe(),
            correlated = pending.is_some(),
            "handling worker packet"
        );

        let channel = self
            .workers
            .iter()
            .find(|w| w.id == worker_id)
            .map(|w| w.channel.clone());
        let mut event = PacketEvent::new(worker_id, packet, pending);
        let mut reply = |packet: Packet| -> Result<()> {
            match &channel {
                Some(tx) => tx
                    .send(packet.to_wire())
                    .map_err(|_| WeftError::channel_closed(format!("worker W-{}", worker_id))),
                None => Err(WeftError::ClosedWorker { worker_id }),
            }
        };
        self.transport.dispatch(&mut event, &mut reply)?;

        self.schedule();
        Ok(())
    }

    /// One scheduling pass: give every free and ready worker its next
    /// packet, pinned queue first, then the shared Any queue.
    fn schedule(&mut self) {
        let candidates: Vec<u32> = self
            .workers
            .iter()
            .filter(|w| w.free && w.ready)
            .map(|w| w.id)
            .collect();
        if candidates.is_empty() {
            debug!("no available worker to schedule");
            return;
        }

        for worker_id in candidates {
            // A failed send earlier in this pass triggers removal and a
            // nested pass, either of which can invalidate the snapshot;
            // re-check the live state before handing this worker a packet
            let still_available = self
                .workers
                .iter()
                .any(|w| w.id == worker_id && w.free && w.ready);
            if !still_available {
                continue;
            }
            let queued = self
                .pinned
                .get_mut(&worker_id)
                .and_then(VecDeque::pop_front)
                .or_else(|| self.any_queue.pop_front());
            let Some(queued) = queued else {
                continue;
            };
            debug!(worker_id, packet = %queued.packet.describe(), "scheduled work");

            if let Some(worker) = self.workers.iter_mut().find(|w| w.id == worker_id) {
                worker.free = false;
            }
            if let Some(map) = self.in_flight.get_mut(&worker_id) {
                map.insert(queued.packet.id(), queued.pending.clone());
            }

            let sent = self
                .workers
                .iter()
                .find(|w| w.id == worker_id)
                .map(|w| w.channel.send(queued.packet.to_wire()));
            if !matches!(sent, Some(Ok(()))) {
                warn!(worker_id, "worker channel closed during dispatch");
                // Rejects the packet we just put in flight as well
                self.remove_worker(worker_id);
            }
        }
    }

    /// Drop a worker from the pool and reject everything pinned to it or in
    /// flight with it. No resubmission: a closed worker surfaces once.
    fn remove_worker(&mut self, worker_id: u32) {
        let Some(position) = self.workers.iter().position(|w| w.id == worker_id) else {
            return;
        };
        self.workers.remove(position);
        self.live_count.fetch_sub(1, Ordering::SeqCst);
        info!(worker_id, "removed worker from pool");

        if let Some(queue) = self.pinned.remove(&worker_id) {
            for queued in queue {
                queued
                    .pending
                    .settle(Err(WeftError::ClosedWorker { worker_id }));
            }
        }
        if let Some(map) = self.in_flight.remove(&worker_id) {
            for (_, pending) in map {
                pending.settle(Err(WeftError::ClosedWorker { worker_id }));
            }
        }
        self.schedule();
    }

    /// Deliver Exit to every worker directly, jumping the dispatch queues.
    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!(workers = self.workers.len(), "shutting worker pool down");
        self.shutting_down = true;
        for worker in &self.workers {
            let packet = Packet::Exit {
                id: self.ids.next(),
            };
            let _ = worker.channel.send(packet.to_wire());
        }
    }

    /// Reject whatever is still queued once the loop stops.
    fn drain(&mut self) {
        for queued in self.any_queue.drain(..) {
            queued
                .pending
                .settle(Err(WeftError::channel_closed("scheduler stopped")));
        }
        for (_, queue) in self.pinned.drain() {
            for queued in queue {
                queued
                    .pending
                    .settle(Err(WeftError::channel_closed("scheduler stopped")));
            }
        }
        for (worker_id, map) in self.in_flight.drain() {
            for (_, pending) in map {
                pending.settle(Err(WeftError::ClosedWorker { worker_id }));
            }
        }
    }
}
