//! `sandbox` crate — compiles and runs untrusted node scripts with enforced
//! resource limits and strong isolation.
//!
//! The pieces, leaves first:
//! - [`policy`] — capability/resource grant attached to a compilation.
//! - [`validator`] — pattern- and size-based pre-execution gate.
//! - [`isolate`] — memory-capped script environments and the warm pool.
//! - [`executor`] — runs a script inside an isolate under a hard timeout
//!   and marshals results back as value copies.
//! - [`geometry`] — the external geometry-kernel collaborator trait.
//! - [`metrics`] — bounded per-node execution samples.
//!
//! Nothing in this crate ever lets a script touch the host process: no
//! filesystem, no network, no process handles, no shared mutable state
//! between two executions.

pub mod error;
pub mod executor;
pub mod geometry;
pub mod isolate;
pub mod metrics;
pub mod policy;
pub mod validator;

pub use error::ExecutionError;
pub use executor::{
    ExecutionContext, ExecutionResult, ExecutorConfig, LogEntry, LogLevel, Metric,
    ScriptExecutor,
};
pub use geometry::{GeometryBackend, MockGeometry, NullGeometry};
pub use isolate::{Isolate, IsolatePool, PoolConfig};
pub use metrics::{ExecutionSample, MetricsStore, MetricsSummary};
pub use policy::{Policy, PolicyError};
pub use validator::{validate, Diagnostic, Severity, ValidationReport};
