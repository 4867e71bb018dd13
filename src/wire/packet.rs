use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::core::errors::RemoteError;

/// Packet id meaning "no correlation". Never handed out by the generator.
pub const VOID_PACKET_ID: u32 = 0;

/// Typed message crossing the transport between coordinator and workers.
///
/// Every packet carries its own unique id; response kinds additionally carry
/// the id of the packet they answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Run `target.method(args)` on a worker
    Execute {
        id: u32,
        target: String,
        method: String,
        args: Vec<Value>,
    },
    /// Successful completion of the Execute with id `correlation_id`
    Result {
        id: u32,
        correlation_id: u32,
        value: Value,
    },
    /// Failed completion, or a transport-level failure report
    Error {
        id: u32,
        correlation_id: u32,
        payload: RemoteError,
    },
    /// Worker finished bootstrap and accepts Execute packets
    Online { id: u32 },
    /// Worker is going away; the coordinator must remove it
    Exit { id: u32 },
    /// Untyped payload admitted by lenient wire mode
    Raw { id: u32, value: Value },
}

impl Packet {
    pub fn id(&self) -> u32 {
        match self {
            Packet::Execute { id, .. }
            | Packet::Result { id, .. }
            | Packet::Error { id, .. }
            | Packet::Online { id }
            | Packet::Exit { id }
            | Packet::Raw { id, .. } => *id,
        }
    }

    /// Id of the packet this one answers, or the void sentinel for packets
    /// that answer nothing.
    pub fn correlation_id(&self) -> u32 {
        match self {
            Packet::Result { correlation_id, .. } | Packet::Error { correlation_id, .. } => {
                *correlation_id
            }
            _ => VOID_PACKET_ID,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Packet::Execute { .. } => "Execute",
            Packet::Result { .. } => "Result",
            Packet::Error { .. } => "Error",
            Packet::Online { .. } => "Online",
            Packet::Exit { .. } => "Exit",
            Packet::Raw { .. } => "Raw",
        }
    }

    /// Short description for log lines
    pub fn describe(&self) -> String {
        match self {
            Packet::Execute {
                id,
                target,
                method,
                ..
            } => format!("Execute#{} {}.{}", id, target, method),
            Packet::Result {
                id, correlation_id, ..
            } => format!("Result#{} -> #{}", id, correlation_id),
            Packet::Error {
                id,
                correlation_id,
                payload,
            } => format!("Error#{} -> #{} ({})", id, correlation_id, payload.name),
            other => format!("{}#{}", other.tag(), other.id()),
        }
    }

    /// Encode as the tagged plain-data wire object
    /// `{___typeTag, id, ...fields}`.
    pub fn to_wire(&self) -> Value {
        match self {
            Packet::Execute {
                id,
                target,
                method,
                args,
            } => json!({
                "___typeTag": "Execute",
                "id": id,
                "target": target,
                "method": method,
                "args": args,
            }),
            Packet::Result {
                id,
                correlation_id,
                value,
            } => json!({
                "___typeTag": "Result",
                "id": id,
                "correlationId": correlation_id,
                "value": value,
            }),
            Packet::Error {
                id,
                correlation_id,
                payload,
            } => json!({
                "___typeTag": "Error",
                "id": id,
                "correlationId": correlation_id,
                "payload": payload,
            }),
            Packet::Online { id } => json!({ "___typeTag": "Online", "id": id }),
            Packet::Exit { id } => json!({ "___typeTag": "Exit", "id": id }),
            Packet::Raw { value, .. } => value.clone(),
        }
    }
}

/// Packet id generator backed by a single counter shared between the
/// coordinator and every worker, so ids are unique per coordinator lifetime
/// no matter which side allocates them. Skips the void sentinel when the
/// counter wraps.
#[derive(Clone)]
pub struct PacketIds {
    counter: Arc<AtomicU32>,
}

impl PacketIds {
    pub fn new() -> Self {
        Self {
            counter: Arc::new(AtomicU32::new(1)),
        }
    }

    pub fn next(&self) -> u32 {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        if id == VOID_PACKET_ID {
            // Wrapped around a u32, we have been busy
            return self.counter.fetch_add(1, Ordering::SeqCst);
        }
        id
    }
}

impl Default for PacketIds {
    fn default() -> Self {
        Self::new()
    }
}
