use serde::{Deserialize, Serialize};

use super::errors::{Result, WeftError};

/// How the wire layer treats an inbound payload whose `___typeTag` has no
/// registered reconstruction function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMode {
    /// Fail the reconstruction with a deserialization error (default).
    /// An unsettleable pending call is worse than a loud failure.
    Strict,
    /// Degrade to a raw packet carrying the untyped payload.
    Lenient,
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of workers to spawn. `None` uses available parallelism minus
    /// one (the coordinator), with a floor of 1.
    pub workers: Option<usize>,
    /// Class names every worker must resolve during bootstrap, before it
    /// signals online. A name missing from the registry is fatal to that
    /// worker.
    pub preload: Vec<String>,
    /// Number of synchronization cell slots to reserve. The buffer never
    /// grows past this.
    pub sync_slots: usize,
    /// Unregistered-tag policy for the wire layer
    pub wire_mode: WireMode,
}

/// 4k primitives has been plenty; the buffer is 16 bytes per slot.
pub const DEFAULT_SYNC_SLOTS: usize = 4 * 1024;

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: None,
            preload: Vec::new(),
            sync_slots: DEFAULT_SYNC_SLOTS,
            wire_mode: WireMode::Strict,
        }
    }
}

impl PoolConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: Some(workers),
            ..Self::default()
        }
    }

    /// Resolve the effective worker count, validating the configuration.
    pub fn resolve_workers(&self) -> Result<usize> {
        match self.workers {
            Some(0) => Err(WeftError::configuration("Invalid number of workers: 0")),
            Some(n) => Ok(n),
            None => {
                let available = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(2);
                Ok((available - 1).max(1))
            }
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.sync_slots == 0 {
            return Err(WeftError::configuration(
                "sync_slots must be at least 1".to_string(),
            ));
        }
        self.resolve_workers().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_workers_is_rejected() {
        let config = PoolConfig::with_workers(0);
        assert!(matches!(
            config.resolve_workers(),
            Err(WeftError::Configuration { .. })
        ));
    }

    #[test]
    fn default_worker_count_is_positive() {
        let config = PoolConfig::default();
        assert!(config.resolve_workers().unwrap() >= 1);
    }
}
