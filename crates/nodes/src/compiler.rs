//! Compiles scripts into evaluable graph nodes.
//!
//! Compilation is cheap and synchronous: validate, fingerprint, work out
//! the port schema. The expensive part (actually running the script) is
//! deferred to [`CompiledNode::evaluate`].

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use sandbox::error::ExecutionError;
use sandbox::executor::{ExecutionContext, ExecutionResult, ScriptExecutor};
use sandbox::policy::Policy;
use sandbox::validator;

use crate::error::CompileError;
use crate::schema::{self, NodeSchema, SchemaSet};

/// Extra wall-clock budget granted on top of the policy timeout before the
/// node-level watchdog gives up on the engine itself.
const EVALUATE_GRACE: Duration = Duration::from_millis(500);

/// Languages a node script can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptLanguage {
    Rhai,
}

/// Author-facing description of a script node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptMetadata {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl ScriptMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            author: String::new(),
            version: "1.0.0".to_string(),
            category: "custom".to_string(),
            tags: Vec::new(),
        }
    }
}

/// A script that passed validation and is ready to evaluate inside a graph.
///
/// Immutable once built; editing a script produces a fresh instance via
/// [`NodeCompiler::recompile`].
pub struct CompiledNode {
    id: Uuid,
    node_type: String,
    script: String,
    language: ScriptLanguage,
    metadata: ScriptMetadata,
    policy: Policy,
    content_hash: String,
    compiled_at: DateTime<Utc>,
    schema: NodeSchema,
    executor: Arc<ScriptExecutor>,
}

impl CompiledNode {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Graph-facing type tag, `Script::<name>`.
    pub fn node_type(&self) -> &str {
        &self.node_type
    }

    pub fn script(&self) -> &str {
        &self.script
    }

    pub fn language(&self) -> ScriptLanguage {
        self.language
    }

    pub fn metadata(&self) -> &ScriptMetadata {
        &self.metadata
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Hex SHA-256 of the script text. Two nodes with the same hash run
    /// the same code.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn compiled_at(&self) -> DateTime<Utc> {
        self.compiled_at
    }

    pub fn schema(&self) -> &NodeSchema {
        &self.schema
    }

    /// Run the node against concrete port values and return the full
    /// execution record, logs and metrics included.
    ///
    /// A node-level watchdog wraps the engine call so a stuck engine can
    /// never wedge graph evaluation: if even the engine's own timeout
    /// fails to fire, this returns a timeout error after the policy
    /// budget plus a grace period.
    #[instrument(skip(self, inputs, params), fields(node_type = %self.node_type))]
    pub async fn run(&self, inputs: Value, params: Value) -> ExecutionResult {
        let ctx = ExecutionContext::new(&self.node_type)
            .with_inputs(inputs)
            .with_params(params);
        let budget = Duration::from_millis(self.policy.timeout_ms) + EVALUATE_GRACE;

        match tokio::time::timeout(budget, self.executor.execute(&self.script, ctx, &self.policy))
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(node_type = %self.node_type, "engine missed its own deadline");
                ExecutionResult {
                    success: false,
                    outputs: Map::new(),
                    logs: Vec::new(),
                    metrics: Vec::new(),
                    execution_time_ms: budget.as_millis() as u64,
                    memory_used_bytes: 0,
                    error: Some(ExecutionError::Timeout {
                        node_id: self.node_type.clone(),
                        timeout_ms: self.policy.timeout_ms,
                    }),
                }
            }
        }
    }

    /// Like [`run`](Self::run), reduced to the graph's view: the output
    /// map on success, the attributed error otherwise.
    pub async fn evaluate(
        &self,
        inputs: Value,
        params: Value,
    ) -> Result<Map<String, Value>, ExecutionError> {
        let result = self.run(inputs, params).await;
        match result.error {
            Some(err) => Err(err),
            None => Ok(result.outputs),
        }
    }
}

impl std::fmt::Debug for CompiledNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledNode")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("content_hash", &self.content_hash)
            .field("compiled_at", &self.compiled_at)
            .finish_non_exhaustive()
    }
}

/// Turns script text into [`CompiledNode`]s bound to one execution engine.
pub struct NodeCompiler {
    executor: Arc<ScriptExecutor>,
}

impl NodeCompiler {
    pub fn new(executor: Arc<ScriptExecutor>) -> Self {
        Self { executor }
    }

    /// Compile with the port schema inferred from the script text.
    pub fn compile(
        &self,
        script: &str,
        metadata: ScriptMetadata,
        policy: Policy,
    ) -> Result<CompiledNode, CompileError> {
        self.compile_with_schema(script, metadata, policy, None)
    }

    /// Compile, preferring an author-declared schema when one is given.
    #[instrument(skip_all, fields(name = %metadata.name))]
    pub fn compile_with_schema(
        &self,
        script: &str,
        metadata: ScriptMetadata,
        policy: Policy,
        declared: Option<SchemaSet>,
    ) -> Result<CompiledNode, CompileError> {
        policy.validate()?;

        let report = validator::validate(script);
        if !report.valid {
            return Err(CompileError::Validation { report });
        }

        let schema = match declared {
            Some(set) => NodeSchema::Declared(set),
            None => NodeSchema::Inferred(schema::infer(script)),
        };
        let content_hash = hex::encode(Sha256::digest(script.as_bytes()));
        let node_type = format!("Script::{}", metadata.name);
        info!(%node_type, hash = %&content_hash[..12], "compiled script node");

        Ok(CompiledNode {
            id: Uuid::new_v4(),
            node_type,
            script: script.to_string(),
            language: ScriptLanguage::Rhai,
            metadata,
            policy,
            content_hash,
            compiled_at: Utc::now(),
            schema,
            executor: Arc::clone(&self.executor),
        })
    }

    /// Rebuild a node with new script text. Metadata and policy carry
    /// over; a declared schema survives, an inferred one is re-inferred.
    pub fn recompile(
        &self,
        node: &CompiledNode,
        script: &str,
    ) -> Result<CompiledNode, CompileError> {
        let declared = match node.schema() {
            NodeSchema::Declared(set) => Some(set.clone()),
            NodeSchema::Inferred(_) => None,
        };
        self.compile_with_schema(script, node.metadata().clone(), node.policy().clone(), declared)
    }
}
