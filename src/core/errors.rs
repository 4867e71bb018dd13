use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for the entire weft library
#[derive(Debug, Error)]
pub enum WeftError {
    /// Invalid configuration (worker count, primitive keys, registration)
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The fixed synchronization cell buffer has no free slot left
    #[error("Synchronization buffer exhausted: all {capacity} slots allocated")]
    AllocationExhausted { capacity: usize },

    /// A packet could not be encoded for the transport
    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    /// An inbound payload could not be reconstructed into a packet
    #[error("Deserialization failed for tag '{tag}': {message}")]
    Deserialization { tag: String, message: String },

    /// Execute request named a class that is not registered on the worker
    #[error("Cannot find execution target '{target}'")]
    TargetNotFound { target: String },

    /// Execute request named a method the target class does not expose
    #[error("Cannot find method '{target}.{method}'")]
    MethodNotFound { target: String, method: String },

    /// The worker holding a pending call exited before responding
    #[error("Worker W-{worker_id} closed before the call completed")]
    ClosedWorker { worker_id: u32 },

    /// A primitive cell held a value outside its valid domain. Fatal: the
    /// waiters on this cell may already have been released spuriously, there
    /// is no state to recover to.
    #[error("Invalid primitive state for key {key}: {value}. Cannot continue.")]
    InvalidPrimitiveState { key: i32, value: i32 },

    /// unlock() called by a thread that does not hold the mutex
    #[error("Mutex {key} is owned by thread {owner}, not by caller {caller}")]
    OwnershipViolation { key: i32, owner: i32, caller: i32 },

    /// Failure reconstructed from a worker-side Error packet
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    /// An internal channel was torn down while a message was outstanding
    #[error("Channel closed: {context}")]
    ChannelClosed { context: String },
}

/// Reconstructable identity of an error raised on the other side of the
/// transport. Travels inside Error packets so the caller can rebuild what
/// actually went wrong in the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteError {
    pub message: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: "Error".to_string(),
            stack: None,
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            name: name.into(),
            stack: None,
        }
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl From<&anyhow::Error> for RemoteError {
    fn from(err: &anyhow::Error) -> Self {
        Self {
            message: err.to_string(),
            name: "Error".to_string(),
            stack: Some(format!("{:?}", err)),
        }
    }
}

impl WeftError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn deserialization(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Deserialization {
            tag: tag.into(),
            message: message.into(),
        }
    }

    pub fn channel_closed(context: impl Into<String>) -> Self {
        Self::ChannelClosed {
            context: context.into(),
        }
    }
}

/// Result type alias for weft operations
pub type Result<T> = std::result::Result<T, WeftError>;
