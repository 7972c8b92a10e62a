//! Sandbox-level error types.
//!
//! Every execution failure is attributed to the owning node identifier and
//! carries the underlying message for diagnostics. These errors are
//! reported *inside* [`crate::ExecutionResult`] — the engine never throws
//! raw exceptions across the host/sandbox boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why an execution failed.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionError {
    /// The final pre-execution security gate matched a forbidden construct.
    #[error("node '{node_id}' rejected by security gate [{code}]: {message}")]
    SecurityRejected {
        node_id: String,
        code: String,
        message: String,
    },

    /// The script attempted a capability its policy did not grant.
    #[error("node '{node_id}' permission denied: {message}")]
    PermissionDenied { node_id: String, message: String },

    /// The hard wall-clock timeout fired and the isolate was killed.
    #[error("node '{node_id}' timed out after {timeout_ms}ms")]
    Timeout { node_id: String, timeout_ms: u64 },

    /// The isolate hit its memory ceiling mid-execution.
    #[error("node '{node_id}' exceeded its memory ceiling: {message}")]
    MemoryExceeded { node_id: String, message: String },

    /// An uncaught script exception; the original message is preserved.
    #[error("node '{node_id}' script error: {message}")]
    ScriptException { node_id: String, message: String },

    /// The policy itself was unenforceable (zero limits).
    #[error("node '{node_id}' has an invalid policy: {message}")]
    InvalidPolicy { node_id: String, message: String },
}

impl ExecutionError {
    /// The identifier of the node this failure is attributed to.
    pub fn node_id(&self) -> &str {
        match self {
            Self::SecurityRejected { node_id, .. }
            | Self::PermissionDenied { node_id, .. }
            | Self::Timeout { node_id, .. }
            | Self::MemoryExceeded { node_id, .. }
            | Self::ScriptException { node_id, .. }
            | Self::InvalidPolicy { node_id, .. } => node_id,
        }
    }

    /// True for the resource-limit classes that always poison the isolate.
    pub fn is_resource_violation(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::MemoryExceeded { .. })
    }
}
