//! Errors raised while turning scripts into nodes.

use sandbox::policy::PolicyError;
use sandbox::validator::ValidationReport;
use thiserror::Error;

/// Why a script could not be compiled into a node.
#[derive(Debug, Error)]
pub enum CompileError {
    /// The static validator found at least one error-severity diagnostic.
    #[error("script failed validation: {}", .report.first_error().map(|d| d.message.as_str()).unwrap_or("unknown"))]
    Validation { report: ValidationReport },

    /// The policy attached to the node is not enforceable.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// Recompilation targeted a node id that is not registered.
    #[error("no registered node with id {0}")]
    UnknownNode(uuid::Uuid),
}

impl CompileError {
    /// The full diagnostic report, when validation was what failed.
    pub fn report(&self) -> Option<&ValidationReport> {
        match self {
            Self::Validation { report } => Some(report),
            _ => None,
        }
    }
}

/// Why a template could not be instantiated.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unknown template '{0}'")]
    UnknownTemplate(String),

    #[error("template '{name}' is missing a value for placeholder '{placeholder}'")]
    MissingPlaceholder { name: String, placeholder: String },
}
