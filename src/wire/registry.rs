use dashmap::DashMap;
use serde_json::Value;
use tracing::warn;

use crate::core::config::WireMode;
use crate::core::errors::{RemoteError, Result, WeftError};

use super::packet::{Packet, VOID_PACKET_ID};

/// Reconstruction function turning a tagged wire object back into a packet.
pub type DecodeFn = fn(&Value) -> Result<Packet>;

/// Process-wide registry mapping `___typeTag` values to reconstruction
/// functions. The core packet kinds are registered at construction;
/// collaborators may register further tags explicitly.
pub struct WireRegistry {
    decoders: DashMap<String, DecodeFn>,
    mode: WireMode,
}

impl WireRegistry {
    pub fn new(mode: WireMode) -> Self {
        let registry = Self {
            decoders: DashMap::new(),
            mode,
        };
        registry.register("Execute", decode_execute);
        registry.register("Result", decode_result);
        registry.register("Error", decode_error);
        registry.register("Online", decode_online);
        registry.register("Exit", decode_exit);
        registry
    }

    pub fn mode(&self) -> WireMode {
        self.mode
    }

    pub fn register(&self, tag: impl Into<String>, decode: DecodeFn) {
        self.decoders.insert(tag.into(), decode);
    }

    /// Reconstruct an inbound payload. An unregistered or missing tag fails
    /// in strict mode and degrades to [`Packet::Raw`] in lenient mode.
    pub fn reconstruct(&self, value: &Value) -> Result<Packet> {
        let tag = match value.get("___typeTag").and_then(Value::as_str) {
            Some(tag) => tag,
            None => return self.unknown("<untagged>", value),
        };
        match self.decoders.get(tag) {
            Some(decode) => decode(value),
            None => self.unknown(tag, value),
        }
    }

    fn unknown(&self, tag: &str, value: &Value) -> Result<Packet> {
        match self.mode {
            WireMode::Strict => Err(WeftError::deserialization(
                tag,
                "no reconstruction function registered",
            )),
            WireMode::Lenient => {
                warn!(tag, "admitting unregistered wire tag as raw packet");
                Ok(Packet::Raw {
                    id: field_u32(value, "id").unwrap_or(VOID_PACKET_ID),
                    value: value.clone(),
                })
            }
        }
    }
}

fn field_u32(value: &Value, field: &str) -> Option<u32> {
    value.get(field).and_then(Value::as_u64).map(|v| v as u32)
}

fn require_u32(value: &Value, tag: &str, field: &str) -> Result<u32> {
    field_u32(value, field)
        .ok_or_else(|| WeftError::deserialization(tag, format!("missing field '{}'", field)))
}

fn require_str(value: &Value, tag: &str, field: &str) -> Result<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| WeftError::deserialization(tag, format!("missing field '{}'", field)))
}

fn decode_execute(value: &Value) -> Result<Packet> {
    let args = match value.get("args") {
        Some(Value::Array(args)) => args.clone(),
        Some(other) => {
            return Err(WeftError::deserialization(
                "Execute",
                format!("'args' must be an array, got {}", other),
            ))
        }
        None => Vec::new(),
    };
    Ok(Packet::Execute {
        id: require_u32(value, "Execute", "id")?,
        target: require_str(value, "Execute", "target")?,
        method: require_str(value, "Execute", "method")?,
        args,
    })
}

fn decode_result(value: &Value) -> Result<Packet> {
    Ok(Packet::Result {
        id: require_u32(value, "Result", "id")?,
        correlation_id: require_u32(value, "Result", "correlationId")?,
        value: value.get("value").cloned().unwrap_or(Value::Null),
    })
}

fn decode_error(value: &Value) -> Result<Packet> {
    let payload = value
        .get("payload")
        .cloned()
        .ok_or_else(|| WeftError::deserialization("Error", "missing field 'payload'"))?;
    let payload: RemoteError = serde_json::from_value(payload)
        .map_err(|err| WeftError::deserialization("Error", err.to_string()))?;
    Ok(Packet::Error {
        id: require_u32(value, "Error", "id")?,
        correlation_id: require_u32(value, "Error", "correlationId")?,
        payload,
    })
}

fn decode_online(value: &Value) -> Result<Packet> {
    Ok(Packet::Online {
        id: require_u32(value, "Online", "id")?,
    })
}

fn decode_exit(value: &Value) -> Result<Packet> {
    Ok(Packet::Exit {
        id: require_u32(value, "Exit", "id")?,
    })
}
