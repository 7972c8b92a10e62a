//! Execution policy — the capability and resource-limit contract attached
//! to a compilation.
//!
//! A `Policy` is immutable once attached to a compiled node. Capability
//! flags gate what the host API exposes inside the sandbox; the resource
//! limits size the isolate and bound its wall-clock time.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declarative capability/resource grant for one compilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Whether scripts may reach the network. The sandbox currently exposes
    /// no network API at all, so this gates nothing yet.
    pub allow_network_access: bool,
    /// Whether scripts may touch the filesystem. Same situation as above.
    pub allow_file_system: bool,
    /// Whether `geometry.invoke(...)` is reachable from inside the script.
    pub allow_geometry_api: bool,
    /// Whether scripts may spawn worker threads (never exposed).
    pub allow_worker_threads: bool,
    /// Hard heap ceiling for the isolate, in megabytes.
    pub memory_limit_mb: u32,
    /// Hard wall-clock timeout for one execution, in milliseconds.
    pub timeout_ms: u64,
    /// External package names the script is allowed to `import`.
    pub allowed_imports: BTreeSet<String>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            allow_network_access: false,
            allow_file_system: false,
            allow_geometry_api: true,
            allow_worker_threads: false,
            memory_limit_mb: 64,
            timeout_ms: 5_000,
            allowed_imports: BTreeSet::new(),
        }
    }
}

/// A policy that cannot be enforced as written.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// `memory_limit_mb` must be strictly positive.
    #[error("memory limit must be greater than zero")]
    ZeroMemoryLimit,

    /// `timeout_ms` must be strictly positive.
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
}

impl Policy {
    /// Check the invariants that must hold at execution time.
    ///
    /// # Errors
    /// Returns a [`PolicyError`] if either resource limit is zero.
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.memory_limit_mb == 0 {
            return Err(PolicyError::ZeroMemoryLimit);
        }
        if self.timeout_ms == 0 {
            return Err(PolicyError::ZeroTimeout);
        }
        Ok(())
    }
}
