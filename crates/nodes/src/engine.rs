//! The application-facing façade.
//!
//! One [`ScriptEngine`] per application instance owns the executor, the
//! compiler, the template registry, and the live node table. Graph code
//! holds `Arc<CompiledNode>` handles it gets back from compilation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use sandbox::executor::ScriptExecutor;
use sandbox::geometry::GeometryBackend;
use sandbox::metrics::MetricsStore;
use sandbox::policy::Policy;
use sandbox::validator::{self, ValidationReport};

use crate::compiler::{CompiledNode, NodeCompiler, ScriptMetadata};
use crate::error::CompileError;
use crate::schema::SchemaSet;
use crate::templates::TemplateRegistry;

/// Owns everything needed to compile and run script nodes.
pub struct ScriptEngine {
    executor: Arc<ScriptExecutor>,
    compiler: NodeCompiler,
    templates: TemplateRegistry,
    nodes: Mutex<HashMap<Uuid, Arc<CompiledNode>>>,
}

impl ScriptEngine {
    /// Build an engine wired to the given geometry backend, with the stock
    /// templates registered.
    pub fn new(geometry: Arc<dyn GeometryBackend>) -> Self {
        let executor = Arc::new(ScriptExecutor::new(geometry));
        let compiler = NodeCompiler::new(Arc::clone(&executor));
        Self {
            executor,
            compiler,
            templates: TemplateRegistry::with_builtins(),
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Validate a script without compiling or registering anything.
    pub fn validate(&self, script: &str) -> ValidationReport {
        validator::validate(script)
    }

    /// Compile a script and register the node. Schema is inferred from
    /// the script text.
    pub fn compile_node(
        &self,
        script: &str,
        metadata: ScriptMetadata,
        policy: Policy,
    ) -> Result<Arc<CompiledNode>, CompileError> {
        self.compile_node_with_schema(script, metadata, policy, None)
    }

    pub fn compile_node_with_schema(
        &self,
        script: &str,
        metadata: ScriptMetadata,
        policy: Policy,
        declared: Option<SchemaSet>,
    ) -> Result<Arc<CompiledNode>, CompileError> {
        let node = Arc::new(
            self.compiler
                .compile_with_schema(script, metadata, policy, declared)?,
        );
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.id(), Arc::clone(&node));
        Ok(node)
    }

    /// Replace a registered node's script. The old instance is dropped
    /// from the table; callers still holding its `Arc` keep a node that
    /// runs the old code.
    pub fn recompile_node(
        &self,
        id: Uuid,
        script: &str,
    ) -> Result<Arc<CompiledNode>, CompileError> {
        let old = self.node(id).ok_or(CompileError::UnknownNode(id))?;
        let node = Arc::new(self.compiler.recompile(&old, script)?);

        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.remove(&id);
        nodes.insert(node.id(), Arc::clone(&node));
        Ok(node)
    }

    pub fn node(&self, id: Uuid) -> Option<Arc<CompiledNode>> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.get(&id).cloned()
    }

    /// Drop a node and its retained metric samples. Returns whether the
    /// node was registered.
    pub fn remove_node(&self, id: Uuid) -> bool {
        let removed = {
            let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
            nodes.remove(&id)
        };
        match removed {
            Some(node) => {
                self.metrics().forget(node.node_type());
                info!(node_type = %node.node_type(), "script node removed");
                true
            }
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.len()
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    pub fn metrics(&self) -> &Arc<MetricsStore> {
        self.executor.metrics()
    }

    pub fn executor(&self) -> &Arc<ScriptExecutor> {
        &self.executor
    }
}

/// Convenience for callers that want to run an unregistered script once.
impl ScriptEngine {
    pub async fn run_script(
        &self,
        script: &str,
        node_id: &str,
        inputs: Value,
        params: Value,
        policy: &Policy,
    ) -> sandbox::executor::ExecutionResult {
        let ctx = sandbox::executor::ExecutionContext::new(node_id)
            .with_inputs(inputs)
            .with_params(params);
        self.executor.execute(script, ctx, policy).await
    }
}
