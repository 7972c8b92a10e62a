//! `nodes` crate — turns user scripts into graph nodes.
//!
//! Sits on top of the `sandbox` crate:
//! - [`schema`] — declared and inferred port schemas.
//! - [`compiler`] — validation, fingerprinting, and [`compiler::CompiledNode`].
//! - [`templates`] — reusable script skeletons.
//! - [`engine`] — the [`engine::ScriptEngine`] façade applications hold.

pub mod compiler;
pub mod engine;
pub mod error;
pub mod schema;
pub mod templates;

pub use compiler::{CompiledNode, NodeCompiler, ScriptLanguage, ScriptMetadata};
pub use engine::ScriptEngine;
pub use error::{CompileError, TemplateError};
pub use schema::{NodeSchema, PortSpec, SchemaSet, ValueKind};
pub use templates::{ScriptTemplate, TemplateRegistry};

#[cfg(test)]
mod engine_tests;
