use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::core::errors::{RemoteError, Result, WeftError};
use crate::wire::{Packet, PacketIds, WireRegistry};

/// Future half of a dispatched call, settled exactly once by the matching
/// response or by worker teardown.
pub struct PendingReply {
    rx: oneshot::Receiver<Result<serde_json::Value>>,
}

impl PendingReply {
    /// Wait for the call to settle.
    pub async fn recv(self) -> Result<serde_json::Value> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(WeftError::channel_closed(
                "pending call dropped before settling",
            )),
        }
    }

    /// A reply that settles immediately, for failures detected before
    /// anything reaches the scheduler.
    pub(crate) fn settled(outcome: Result<serde_json::Value>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(outcome);
        Self { rx }
    }
}

struct PendingShared {
    tx: Mutex<Option<oneshot::Sender<Result<serde_json::Value>>>>,
}

/// Scheduler-side half of a dispatched call. Clones share the same
/// settle-once state; an All broadcast enqueues one clone per worker and
/// only the first response wins.
#[derive(Clone)]
pub(crate) struct PendingCall {
    shared: Arc<PendingShared>,
}

impl PendingCall {
    pub(crate) fn new() -> (Self, PendingReply) {
        let (tx, rx) = oneshot::channel();
        let call = Self {
            shared: Arc::new(PendingShared {
                tx: Mutex::new(Some(tx)),
            }),
        };
        (call, PendingReply { rx })
    }

    /// Settle the call. Returns false when it was already settled.
    pub(crate) fn settle(&self, outcome: Result<serde_json::Value>) -> bool {
        let mut tx = self.shared.tx.lock().unwrap();
        match tx.take() {
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.shared.tx.lock().unwrap().is_none()
    }
}

/// One reconstructed packet travelling through handler dispatch, together
/// with the pending call it correlates to (when any).
pub struct PacketEvent {
    worker_id: u32,
    packet: Packet,
    pending: Option<PendingCall>,
}

impl PacketEvent {
    pub(crate) fn new(worker_id: u32, packet: Packet, pending: Option<PendingCall>) -> Self {
        Self {
            worker_id,
            packet,
            pending,
        }
    }

    /// Worker the packet arrived from
    pub fn worker_id(&self) -> u32 {
        self.worker_id
    }

    pub fn packet(&self) -> &Packet {
        &self.packet
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Resolve the correlated pending call. Returns false when there is no
    /// pending call or it already settled.
    pub fn resolve(&mut self, value: serde_json::Value) -> bool {
        match &self.pending {
            Some(pending) => pending.settle(Ok(value)),
            None => false,
        }
    }

    /// Reject the correlated pending call.
    pub fn reject(&mut self, err: WeftError) -> bool {
        match &self.pending {
            Some(pending) => pending.settle(Err(err)),
            None => false,
        }
    }

    fn is_settled(&self) -> bool {
        self.pending.as_ref().map_or(true, PendingCall::is_settled)
    }
}

/// Coordinator-side packet handler. All registered handlers see every
/// packet; dispatch is non-exclusive.
pub trait PacketHandler: Send {
    fn handle(&mut self, event: &mut PacketEvent) -> anyhow::Result<()>;
}

/// Handler dispatch layer sitting between the transport channels and the
/// scheduler.
pub(crate) struct Transport {
    wire: Arc<WireRegistry>,
    ids: PacketIds,
    handlers: Vec<Box<dyn PacketHandler>>,
}

impl Transport {
    pub(crate) fn new(
        wire: Arc<WireRegistry>,
        ids: PacketIds,
        handlers: Vec<Box<dyn PacketHandler>>,
    ) -> Self {
        Self {
            wire,
            ids,
            handlers,
        }
    }

    /// Reconstruct an inbound payload from `worker_id`. On failure a
    /// synthesized Error packet referencing the sender's packet id takes
    /// its place, so downstream dispatch can still settle whatever was
    /// waiting on it.
    pub(crate) fn reconstruct(&self, worker_id: u32, payload: &serde_json::Value) -> Packet {
        match self.wire.reconstruct(payload) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(worker_id, %err, "failed to reconstruct inbound payload");
                // Reply-direction payloads carry the request id in
                // correlationId; the raw id is only the sender's own packet
                let correlation_id = payload
                    .get("correlationId")
                    .or_else(|| payload.get("id"))
                    .and_then(serde_json::Value::as_u64)
                    .map(|id| id as u32)
                    .unwrap_or(crate::wire::VOID_PACKET_ID);
                Packet::Error {
                    id: self.ids.next(),
                    correlation_id,
                    payload: RemoteError::named("DeserializationError", err.to_string()),
                }
            }
        }
    }

    /// Run every registered handler over the event, then the default
    /// handler for the correlated pending call.
    ///
    /// A handler failure is converted into an Error packet sent back to the
    /// originating worker through `reply` -- a fallback that is only
    /// partially safe. If that send fails too there is nothing left to
    /// recover with, and the error propagates to tear the scheduler down.
    pub(crate) fn dispatch(
        &mut self,
        event: &mut PacketEvent,
        reply: &mut dyn FnMut(Packet) -> Result<()>,
    ) -> Result<()> {
        debug!(
            worker_id = event.worker_id(),
            packet = %event.packet().describe(),
            "dispatching packet"
        );
        for handler in self.handlers.iter_mut() {
            if let Err(err) = handler.handle(event) {
                error!(
                    worker_id = event.worker_id(),
                    %err,
                    "packet handler failed, reporting back to sender"
                );
                let error_packet = Packet::Error {
                    id: self.ids.next(),
                    correlation_id: event.packet().id(),
                    payload: RemoteError::from(&err),
                };
                reply(error_packet)?;
            }
        }

        // Default handler: settle the pending call if nobody else did
        if !event.is_settled() {
            match event.packet() {
                Packet::Error { payload, .. } => {
                    let err = payload.clone().into_weft();
                    event.reject(err);
                }
                Packet::Result { value, .. } => {
                    let value = value.clone();
                    event.resolve(value);
                }
                other => {
                    let value = other.to_wire();
                    event.resolve(value);
                }
            }
        }
        Ok(())
    }
}

impl RemoteError {
    /// Rebuild the strongest-typed error this payload encodes. Dispatcher
    /// failures travel with well-known names and a structured message; any
    /// other payload stays a remote error.
    pub(crate) fn into_weft(self) -> WeftError {
        match self.name.as_str() {
            "TargetNotFound" => WeftError::TargetNotFound {
                target: self.message,
            },
            "MethodNotFound" => match self.message.rsplit_once('.') {
                Some((target, method)) => WeftError::MethodNotFound {
                    target: target.to_string(),
                    method: method.to_string(),
                },
                None => WeftError::Remote(self),
            },
            _ => WeftError::Remote(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::WireMode;
    use serde_json::json;

    fn transport(handlers: Vec<Box<dyn PacketHandler>>) -> Transport {
        Transport::new(
            Arc::new(WireRegistry::new(WireMode::Strict)),
            PacketIds::new(),
            handlers,
        )
    }

    #[tokio::test]
    async fn default_handler_resolves_results() {
        let mut transport = transport(Vec::new());
        let (pending, reply) = PendingCall::new();
        let packet = Packet::Result {
            id: 2,
            correlation_id: 1,
            value: json!(42),
        };
        let mut event = PacketEvent::new(1, packet, Some(pending));
        transport.dispatch(&mut event, &mut |_| Ok(())).unwrap();
        assert_eq!(reply.recv().await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn default_handler_rejects_errors_with_reconstructed_identity() {
        let mut transport = transport(Vec::new());
        let (pending, reply) = PendingCall::new();
        let packet = Packet::Error {
            id: 2,
            correlation_id: 1,
            payload: RemoteError::named("TargetNotFound", "Ghost"),
        };
        let mut event = PacketEvent::new(1, packet, Some(pending));
        transport.dispatch(&mut event, &mut |_| Ok(())).unwrap();
        assert!(matches!(
            reply.recv().await,
            Err(WeftError::TargetNotFound { target }) if target == "Ghost"
        ));
    }

    #[tokio::test]
    async fn handler_settlement_preempts_the_default() {
        struct Interceptor;
        impl PacketHandler for Interceptor {
            fn handle(&mut self, event: &mut PacketEvent) -> anyhow::Result<()> {
                event.resolve(json!("intercepted"));
                Ok(())
            }
        }
        let mut transport = transport(vec![Box::new(Interceptor)]);
        let (pending, reply) = PendingCall::new();
        let packet = Packet::Result {
            id: 2,
            correlation_id: 1,
            value: json!(42),
        };
        let mut event = PacketEvent::new(1, packet, Some(pending));
        transport.dispatch(&mut event, &mut |_| Ok(())).unwrap();
        assert_eq!(reply.recv().await.unwrap(), json!("intercepted"));
    }

    #[tokio::test]
    async fn failing_handler_reports_back_to_the_sender() {
        struct Exploder;
        impl PacketHandler for Exploder {
            fn handle(&mut self, _event: &mut PacketEvent) -> anyhow::Result<()> {
                anyhow::bail!("handler blew up")
            }
        }
        let mut transport = transport(vec![Box::new(Exploder)]);
        let packet = Packet::Online { id: 9 };
        let mut event = PacketEvent::new(3, packet, None);

        let mut sent = Vec::new();
        transport
            .dispatch(&mut event, &mut |packet| {
                sent.push(packet);
                Ok(())
            })
            .unwrap();

        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Packet::Error {
                correlation_id,
                payload,
                ..
            } => {
                assert_eq!(*correlation_id, 9);
                assert!(payload.message.contains("handler blew up"));
            }
            other => panic!("expected error packet, got {:?}", other),
        }
    }

    #[test]
    fn secondary_failure_in_the_fallback_is_fatal() {
        struct Exploder;
        impl PacketHandler for Exploder {
            fn handle(&mut self, _event: &mut PacketEvent) -> anyhow::Result<()> {
                anyhow::bail!("handler blew up")
            }
        }
        let mut transport = transport(vec![Box::new(Exploder)]);
        let mut event = PacketEvent::new(3, Packet::Online { id: 9 }, None);
        let outcome = transport.dispatch(&mut event, &mut |_| {
            Err(WeftError::channel_closed("worker channel gone"))
        });
        assert!(outcome.is_err());
    }

    #[test]
    fn settle_is_exactly_once() {
        let (pending, _reply) = PendingCall::new();
        assert!(pending.settle(Ok(json!(1))));
        assert!(!pending.settle(Ok(json!(2))));
        assert!(pending.is_settled());
    }

    #[tokio::test]
    async fn garbled_reply_correlates_by_its_correlation_id() {
        let mut transport = transport(Vec::new());
        let packet = transport.reconstruct(
            2,
            &json!({ "___typeTag": "Mystery", "id": 88, "correlationId": 42 }),
        );
        match &packet {
            Packet::Error { correlation_id, .. } => assert_eq!(*correlation_id, 42),
            other => panic!("expected error packet, got {:?}", other),
        }

        // The synthesized packet settles the call that was waiting on id 42
        let (pending, reply) = PendingCall::new();
        let mut event = PacketEvent::new(2, packet, Some(pending));
        transport.dispatch(&mut event, &mut |_| Ok(())).unwrap();
        assert!(matches!(
            reply.recv().await,
            Err(WeftError::Remote(payload)) if payload.name == "DeserializationError"
        ));
    }

    #[test]
    fn unreconstructable_payload_becomes_an_error_packet() {
        let transport = transport(Vec::new());
        let packet = transport.reconstruct(2, &json!({ "___typeTag": "Mystery", "id": 77 }));
        match packet {
            Packet::Error {
                correlation_id,
                payload,
                ..
            } => {
                assert_eq!(correlation_id, 77);
                assert_eq!(payload.name, "DeserializationError");
            }
            other => panic!("expected error packet, got {:?}", other),
        }
    }
}
