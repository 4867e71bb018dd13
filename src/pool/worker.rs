use serde_json::Value;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, warn};

use crate::core::errors::RemoteError;
use crate::sync::SyncContext;
use crate::wire::{Packet, PacketIds, WireRegistry, VOID_PACKET_ID};

use super::registry::{ClassRegistry, WorkerContext};

/// Everything a worker thread receives at spawn: its identity, both channel
/// ends, the shared registries and id counter, its view of the sync domain,
/// and the class names it must resolve before coming online.
pub(crate) struct WorkerBoot {
    pub id: u32,
    pub inbound: Receiver<Value>,
    pub outbound: UnboundedSender<(u32, Value)>,
    pub classes: Arc<ClassRegistry>,
    pub wire: Arc<WireRegistry>,
    pub ids: PacketIds,
    pub sync: SyncContext,
    pub preload: Vec<String>,
}

/// Emits the Exit packet on every way out of the worker, including panics
/// in user code, so the coordinator always observes the removal.
struct ExitGuard {
    id: u32,
    outbound: UnboundedSender<(u32, Value)>,
    ids: PacketIds,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let packet = Packet::Exit {
            id: self.ids.next(),
        };
        let _ = self.outbound.send((self.id, packet.to_wire()));
    }
}

/// Worker main loop. Runs on a dedicated OS thread, internally
/// single-threaded, with a current-thread runtime for awaiting async
/// invocations.
pub(crate) fn run(boot: WorkerBoot) {
    let WorkerBoot {
        id,
        inbound,
        outbound,
        classes,
        wire,
        ids,
        sync,
        preload,
    } = boot;
    let _exit = ExitGuard {
        id,
        outbound: outbound.clone(),
        ids: ids.clone(),
    };
    let send = |packet: Packet| {
        let _ = outbound.send((id, packet.to_wire()));
    };

    // Every preload name must resolve before we signal online
    for name in &preload {
        if !classes.contains(name) {
            error!(
                worker_id = id,
                class = %name,
                "preload failed: class not registered, aborting bootstrap"
            );
            return;
        }
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(rt) => rt,
        Err(err) => {
            error!(worker_id = id, %err, "failed to build worker runtime");
            return;
        }
    };

    let ctx = WorkerContext::new(id, sync);
    send(Packet::Online { id: ids.next() });
    info!(worker_id = id, "worker online");

    while let Ok(payload) = inbound.recv() {
        let packet = match wire.reconstruct(&payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(worker_id = id, %err, "unreconstructable payload from coordinator");
                let correlation_id = payload
                    .get("id")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32)
                    .unwrap_or(VOID_PACKET_ID);
                send(Packet::Error {
                    id: ids.next(),
                    correlation_id,
                    payload: RemoteError::named("DeserializationError", err.to_string()),
                });
                continue;
            }
        };
        match packet {
            Packet::Exit { .. } => {
                info!(worker_id = id, "worker shutting down");
                break;
            }
            Packet::Execute {
                id: packet_id,
                target,
                method,
                args,
            } => {
                let reply =
                    rt.block_on(execute(&ctx, &classes, &ids, packet_id, target, method, args));
                debug!(worker_id = id, packet = %reply.describe(), "sending reply");
                send(reply);
            }
            other => {
                debug!(worker_id = id, packet = %other.describe(), "ignoring packet");
            }
        }
    }
}

/// Run one Execute request against the class registry. Every failure mode
/// becomes an Error packet carrying the original correlation id.
async fn execute(
    ctx: &WorkerContext,
    classes: &ClassRegistry,
    ids: &PacketIds,
    correlation_id: u32,
    target: String,
    method: String,
    args: Vec<Value>,
) -> Packet {
    let entry = match classes.get(&target) {
        Some(entry) => entry,
        None => {
            return Packet::Error {
                id: ids.next(),
                correlation_id,
                payload: RemoteError::named("TargetNotFound", target),
            }
        }
    };
    if !entry.has_method(&method) {
        return Packet::Error {
            id: ids.next(),
            correlation_id,
            payload: RemoteError::named("MethodNotFound", format!("{}.{}", target, method)),
        };
    }
    // Fresh instance per call, no state survives between invocations
    let mut instance = entry.instantiate();
    match instance.invoke(ctx, &method, args).await {
        Ok(value) => Packet::Result {
            id: ids.next(),
            correlation_id,
            value,
        },
        Err(err) => Packet::Error {
            id: ids.next(),
            correlation_id,
            payload: RemoteError::from(&err),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WireMode;
    use crate::pool::registry::WorkerClass;
    use crate::sync::CellAllocator;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct Doubler;

    #[async_trait]
    impl WorkerClass for Doubler {
        fn methods(&self) -> &'static [&'static str] {
            &["double", "fail"]
        }

        async fn invoke(
            &mut self,
            _ctx: &WorkerContext,
            method: &str,
            args: Vec<Value>,
        ) -> anyhow::Result<Value> {
            match method {
                "double" => {
                    let n = args[0].as_i64().unwrap_or(0);
                    Ok(json!(n * 2))
                }
                _ => anyhow::bail!("requested failure"),
            }
        }
    }

    struct Harness {
        to_worker: Option<mpsc::Sender<Value>>,
        from_worker: tokio::sync::mpsc::UnboundedReceiver<(u32, Value)>,
        wire: Arc<WireRegistry>,
        ids: PacketIds,
        join: thread::JoinHandle<()>,
    }

    fn spawn_worker(preload: Vec<String>) -> Harness {
        let classes = Arc::new(ClassRegistry::new());
        classes.register::<Doubler>("Doubler").unwrap();
        let wire = Arc::new(WireRegistry::new(WireMode::Strict));
        let ids = PacketIds::new();
        let (to_worker, inbound) = mpsc::channel();
        let (outbound, from_worker) = tokio::sync::mpsc::unbounded_channel();
        let sync = SyncContext::new(Arc::new(CellAllocator::new(8)), 1);
        let boot = WorkerBoot {
            id: 1,
            inbound,
            outbound,
            classes,
            wire: Arc::clone(&wire),
            ids: ids.clone(),
            sync,
            preload,
        };
        let join = thread::spawn(move || run(boot));
        Harness {
            to_worker: Some(to_worker),
            from_worker,
            wire,
            ids,
            join,
        }
    }

    async fn next_packet(harness: &mut Harness) -> Packet {
        let (worker_id, payload) = harness.from_worker.recv().await.unwrap();
        assert_eq!(worker_id, 1);
        harness.wire.reconstruct(&payload).unwrap()
    }

    #[tokio::test]
    async fn executes_and_replies_with_the_correlation_id() {
        let mut harness = spawn_worker(vec!["Doubler".to_string()]);
        assert!(matches!(next_packet(&mut harness).await, Packet::Online { .. }));

        let request = Packet::Execute {
            id: harness.ids.next(),
            target: "Doubler".to_string(),
            method: "double".to_string(),
            args: vec![json!(21)],
        };
        let request_id = request.id();
        harness.to_worker.as_ref().unwrap().send(request.to_wire()).unwrap();

        match next_packet(&mut harness).await {
            Packet::Result {
                correlation_id,
                value,
                ..
            } => {
                assert_eq!(correlation_id, request_id);
                assert_eq!(value, json!(42));
            }
            other => panic!("expected result, got {:?}", other),
        }

        harness
            .to_worker
            .as_ref()
            .unwrap()
            .send(Packet::Exit { id: harness.ids.next() }.to_wire())
            .unwrap();
        assert!(matches!(next_packet(&mut harness).await, Packet::Exit { .. }));
        harness.join.join().unwrap();
    }

    #[tokio::test]
    async fn unknown_target_and_method_map_to_dispatch_errors() {
        let mut harness = spawn_worker(Vec::new());
        assert!(matches!(next_packet(&mut harness).await, Packet::Online { .. }));

        let request = Packet::Execute {
            id: harness.ids.next(),
            target: "Ghost".to_string(),
            method: "spook".to_string(),
            args: vec![],
        };
        harness.to_worker.as_ref().unwrap().send(request.to_wire()).unwrap();
        match next_packet(&mut harness).await {
            Packet::Error { payload, .. } => {
                assert_eq!(payload.name, "TargetNotFound");
                assert_eq!(payload.message, "Ghost");
            }
            other => panic!("expected error, got {:?}", other),
        }

        let request = Packet::Execute {
            id: harness.ids.next(),
            target: "Doubler".to_string(),
            method: "shrink".to_string(),
            args: vec![],
        };
        harness.to_worker.as_ref().unwrap().send(request.to_wire()).unwrap();
        match next_packet(&mut harness).await {
            Packet::Error { payload, .. } => {
                assert_eq!(payload.name, "MethodNotFound");
                assert_eq!(payload.message, "Doubler.shrink");
            }
            other => panic!("expected error, got {:?}", other),
        }

        drop(harness.to_worker.take());
        assert!(matches!(next_packet(&mut harness).await, Packet::Exit { .. }));
        harness.join.join().unwrap();
    }

    #[tokio::test]
    async fn missing_preload_is_fatal_before_online() {
        let mut harness = spawn_worker(vec!["NotRegistered".to_string()]);
        // No Online packet, the worker exits straight away
        assert!(matches!(next_packet(&mut harness).await, Packet::Exit { .. }));
        harness.join.join().unwrap();
    }

    #[tokio::test]
    async fn invocation_failure_carries_reconstructable_identity() {
        let mut harness = spawn_worker(Vec::new());
        assert!(matches!(next_packet(&mut harness).await, Packet::Online { .. }));

        let request = Packet::Execute {
            id: harness.ids.next(),
            target: "Doubler".to_string(),
            method: "fail".to_string(),
            args: vec![],
        };
        let request_id = request.id();
        harness.to_worker.as_ref().unwrap().send(request.to_wire()).unwrap();
        match next_packet(&mut harness).await {
            Packet::Error {
                correlation_id,
                payload,
                ..
            } => {
                assert_eq!(correlation_id, request_id);
                assert!(payload.message.contains("requested failure"));
                assert!(payload.stack.is_some());
            }
            other => panic!("expected error, got {:?}", other),
        }

        drop(harness.to_worker.take());
        assert!(matches!(next_packet(&mut harness).await, Packet::Exit { .. }));
        harness.join.join().unwrap();
    }
}
