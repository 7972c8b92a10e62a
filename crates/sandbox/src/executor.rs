//! Script execution engine.
//!
//! `ScriptExecutor` is the central orchestrator:
//! 1. Re-runs the dangerous-construct scan as a final pre-execution gate.
//! 2. Acquires an isolate sized to the policy's memory ceiling.
//! 3. Wires the narrow host API into the isolate — input/output/parameter
//!    accessors, logging, vector helper, the gated geometry proxy — and
//!    nothing else.
//! 4. Evaluates the script under a hard wall-clock timeout (an in-engine
//!    progress hook kills it mid-run; `tokio::time::timeout` guards the
//!    blocking task as a second line).
//! 5. Marshals outputs and logs back as plain value copies, records
//!    metrics, and releases or disposes the isolate.
//!
//! `execute` never returns `Err`: every failure is reported inside the
//! [`ExecutionResult`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rhai::{Dynamic, ImmutableString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::error::ExecutionError;
use crate::geometry::GeometryBackend;
use crate::isolate::{Isolate, IsolatePool, PoolConfig};
use crate::metrics::{ExecutionSample, MetricsStore};
use crate::policy::Policy;
use crate::validator;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Log entries retained per execution; further calls are dropped.
    pub max_log_entries: usize,
    /// Each log message is truncated to this many characters.
    pub max_log_message_len: usize,
    /// Extra headroom granted to the outer task timeout beyond the
    /// policy's deadline, so the in-engine kill normally fires first.
    pub timeout_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_log_entries: 256,
            max_log_message_len: 1_000,
            timeout_grace: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Execution context and result
// ---------------------------------------------------------------------------

/// Per-call context supplied by the graph evaluator.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Identifier of the owning graph node; failures are attributed to it.
    pub node_id: String,
    /// Values present on the node's input sockets.
    pub inputs: serde_json::Map<String, Value>,
    /// The node's parameter values.
    pub params: serde_json::Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            inputs: serde_json::Map::new(),
            params: serde_json::Map::new(),
        }
    }

    /// Replace the inputs with the entries of a JSON object.
    pub fn with_inputs(mut self, inputs: Value) -> Self {
        if let Value::Object(map) = inputs {
            self.inputs = map;
        }
        self
    }

    /// Replace the params with the entries of a JSON object.
    pub fn with_params(mut self, params: Value) -> Self {
        if let Value::Object(map) = params {
            self.params = map;
        }
        self
    }
}

/// Severity attached to a sandbox log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(label: &str) -> Self {
        match label {
            "debug" => Self::Debug,
            "warn" | "warning" => Self::Warn,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// One message emitted by the script, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub logged_at: DateTime<Utc>,
}

/// A named measurement attached to one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: f64,
}

/// The outcome of one script execution. Produced fresh per run and never
/// mutated after return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub outputs: serde_json::Map<String, Value>,
    pub logs: Vec<LogEntry>,
    pub metrics: Vec<Metric>,
    pub execution_time_ms: u64,
    pub memory_used_bytes: u64,
    pub error: Option<ExecutionError>,
}

// ---------------------------------------------------------------------------
// Host-side state shared with the registered host functions
// ---------------------------------------------------------------------------

struct HostState {
    outputs: Arc<Mutex<serde_json::Map<String, Value>>>,
    logs: Arc<Mutex<Vec<LogEntry>>>,
    operations: Arc<AtomicU64>,
}

impl HostState {
    fn new() -> Self {
        Self {
            outputs: Arc::new(Mutex::new(serde_json::Map::new())),
            logs: Arc::new(Mutex::new(Vec::new())),
            operations: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// The capability object scripts see as `geometry`.
#[derive(Clone)]
struct GeometryApi {
    granted: bool,
    backend: Arc<dyn GeometryBackend>,
    runtime: tokio::runtime::Handle,
}

fn push_log(
    logs: &Mutex<Vec<LogEntry>>,
    max_entries: usize,
    max_len: usize,
    level: LogLevel,
    message: &str,
) {
    let mut logs = logs.lock().unwrap_or_else(|e| e.into_inner());
    if logs.len() >= max_entries {
        return;
    }
    logs.push(LogEntry {
        level,
        message: truncate_chars(message, max_len),
        logged_at: Utc::now(),
    });
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

// ---------------------------------------------------------------------------
// ScriptExecutor
// ---------------------------------------------------------------------------

/// Runs validated scripts inside pooled isolates.
pub struct ScriptExecutor {
    pool: Arc<IsolatePool>,
    metrics: Arc<MetricsStore>,
    geometry: Arc<dyn GeometryBackend>,
    config: ExecutorConfig,
}

impl ScriptExecutor {
    /// Create an executor with default pool and executor configuration.
    pub fn new(geometry: Arc<dyn GeometryBackend>) -> Self {
        Self::with_config(geometry, ExecutorConfig::default(), PoolConfig::default())
    }

    pub fn with_config(
        geometry: Arc<dyn GeometryBackend>,
        config: ExecutorConfig,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            pool: Arc::new(IsolatePool::new(pool_config)),
            metrics: Arc::new(MetricsStore::default()),
            geometry,
            config,
        }
    }

    /// The per-node metrics store fed by this executor.
    pub fn metrics(&self) -> &Arc<MetricsStore> {
        &self.metrics
    }

    /// The isolate pool. Exposed for observability and tests.
    pub fn pool(&self) -> &Arc<IsolatePool> {
        &self.pool
    }

    /// Execute `script` under `policy`. Never returns an error to the
    /// caller; all failures are inside the result.
    #[instrument(skip(self, script, ctx, policy), fields(node_id = %ctx.node_id))]
    pub async fn execute(
        &self,
        script: &str,
        ctx: ExecutionContext,
        policy: &Policy,
    ) -> ExecutionResult {
        let started = Instant::now();
        let node_id = ctx.node_id.clone();
        let state = HostState::new();

        // ------------------------------------------------------------------
        // Invariant guard: limits must be positive at execution time.
        // ------------------------------------------------------------------
        if let Err(e) = policy.validate() {
            let error = ExecutionError::InvalidPolicy {
                node_id: node_id.clone(),
                message: e.to_string(),
            };
            return self.finish(&node_id, started, &state, Some(error));
        }

        // ------------------------------------------------------------------
        // Final security gate — defense in depth even if the script was
        // validated at compile time.
        // ------------------------------------------------------------------
        let findings = validator::scan_dangerous_constructs(script);
        if let Some(first) = findings.first() {
            let error = ExecutionError::SecurityRejected {
                node_id: node_id.clone(),
                code: first.code.clone(),
                message: first.message.clone(),
            };
            return self.finish(&node_id, started, &state, Some(error));
        }
        if let Some(denied) = first_disallowed_import(script, policy) {
            let error = ExecutionError::PermissionDenied {
                node_id: node_id.clone(),
                message: format!("import \"{denied}\" is not in the policy's allowed imports"),
            };
            return self.finish(&node_id, started, &state, Some(error));
        }

        // ------------------------------------------------------------------
        // Marshal inputs/params into the isolate as value copies.
        // ------------------------------------------------------------------
        let (inputs_map, params_map) = match (
            json_object_to_map(&ctx.inputs),
            json_object_to_map(&ctx.params),
        ) {
            (Ok(i), Ok(p)) => (i, p),
            (Err(e), _) | (_, Err(e)) => {
                let error = ExecutionError::ScriptException {
                    node_id: node_id.clone(),
                    message: format!("failed to marshal node values into the sandbox: {e}"),
                };
                return self.finish(&node_id, started, &state, Some(error));
            }
        };

        let mut isolate = self.pool.acquire(policy.memory_limit_mb);
        debug!(isolate_id = %isolate.id(), "isolate acquired");

        let geometry_api = GeometryApi {
            granted: policy.allow_geometry_api,
            backend: Arc::clone(&self.geometry),
            runtime: tokio::runtime::Handle::current(),
        };

        let deadline = started + Duration::from_millis(policy.timeout_ms);
        let outer_budget = Duration::from_millis(policy.timeout_ms) + self.config.timeout_grace;

        let script_owned = script.to_string();
        let run_outputs = Arc::clone(&state.outputs);
        let run_logs = Arc::clone(&state.logs);
        let run_ops = Arc::clone(&state.operations);
        let run_config = self.config.clone();

        let task = tokio::task::spawn_blocking(move || {
            wire_host_api(
                &mut isolate,
                inputs_map.clone(),
                params_map.clone(),
                &run_outputs,
                &run_logs,
                &run_ops,
                &run_config,
                deadline,
            );
            let outcome = run_script(&isolate, &script_owned, inputs_map, params_map, geometry_api);
            (isolate, outcome)
        });

        let error = match tokio::time::timeout(outer_budget, task).await {
            // Outer guard fired. The isolate is still owned by the running
            // blocking task and is dropped with it — it never re-enters
            // the pool.
            Err(_elapsed) => {
                warn!("outer timeout fired; isolate abandoned");
                Some(ExecutionError::Timeout {
                    node_id: node_id.clone(),
                    timeout_ms: policy.timeout_ms,
                })
            }
            // The blocking task panicked; nothing to reclaim.
            Ok(Err(join_err)) => Some(ExecutionError::ScriptException {
                node_id: node_id.clone(),
                message: format!("script task failed: {join_err}"),
            }),
            Ok(Ok((mut isolate, outcome))) => {
                let error = match outcome {
                    RunOutcome::Parse(parse_err) => Some(ExecutionError::ScriptException {
                        node_id: node_id.clone(),
                        message: format!("syntax error: {parse_err}"),
                    }),
                    RunOutcome::Eval(Ok(returned)) => {
                        merge_returned_map(returned, &state.outputs);
                        None
                    }
                    RunOutcome::Eval(Err(eval_err)) => {
                        Some(classify_eval_error(&eval_err, &node_id, policy.timeout_ms))
                    }
                };

                // Any failure poisons the isolate; only clean runs pool it.
                if error.is_some() {
                    isolate.poison();
                }
                self.pool.release(isolate);
                error
            }
        };

        self.finish(&node_id, started, &state, error)
    }

    /// Assemble the result, record metrics, and log the outcome.
    fn finish(
        &self,
        node_id: &str,
        started: Instant,
        state: &HostState,
        error: Option<ExecutionError>,
    ) -> ExecutionResult {
        let execution_time_ms = started.elapsed().as_millis() as u64;

        let outputs = std::mem::take(
            &mut *state.outputs.lock().unwrap_or_else(|e| e.into_inner()),
        );
        let logs = std::mem::take(&mut *state.logs.lock().unwrap_or_else(|e| e.into_inner()));
        let operations = state.operations.load(Ordering::Relaxed);

        let memory_used_bytes = estimate_object_bytes(&outputs)
            + logs.iter().map(|l| l.message.len() as u64).sum::<u64>();

        self.metrics.record(
            node_id,
            ExecutionSample {
                duration_ms: execution_time_ms,
                memory_bytes: memory_used_bytes,
                success: error.is_none(),
                recorded_at: Utc::now(),
            },
        );

        match &error {
            None => debug!(execution_time_ms, "script execution succeeded"),
            Some(e) => warn!(execution_time_ms, error = %e, "script execution failed"),
        }

        ExecutionResult {
            success: error.is_none(),
            outputs,
            logs,
            metrics: vec![Metric {
                name: "operations".to_string(),
                value: operations as f64,
            }],
            execution_time_ms,
            memory_used_bytes,
            error,
        }
    }
}

// ---------------------------------------------------------------------------
// Internals
// ---------------------------------------------------------------------------

enum RunOutcome {
    Parse(rhai::ParseError),
    Eval(Result<Dynamic, Box<rhai::EvalAltResult>>),
}

/// Install the host API for one execution. Re-registering replaces any
/// hooks left over from the isolate's previous run, so pooled isolates
/// never see stale host state.
#[allow(clippy::too_many_arguments)]
fn wire_host_api(
    isolate: &mut Isolate,
    inputs: rhai::Map,
    params: rhai::Map,
    outputs: &Arc<Mutex<serde_json::Map<String, Value>>>,
    logs: &Arc<Mutex<Vec<LogEntry>>>,
    operations: &Arc<AtomicU64>,
    config: &ExecutorConfig,
    deadline: Instant,
) {
    let max_entries = config.max_log_entries;
    let max_len = config.max_log_message_len;
    let engine = isolate.engine_mut();

    // --- input / param accessors (value copies) ---
    let inputs_for_get = inputs;
    engine.register_fn("get_input", move |name: ImmutableString| -> Dynamic {
        inputs_for_get
            .get(name.as_str())
            .cloned()
            .unwrap_or(Dynamic::UNIT)
    });

    let params_for_get = params.clone();
    engine.register_fn("get_param", move |name: ImmutableString| -> Dynamic {
        params_for_get
            .get(name.as_str())
            .cloned()
            .unwrap_or(Dynamic::UNIT)
    });

    let params_for_default = params;
    engine.register_fn(
        "get_param",
        move |name: ImmutableString, default: Dynamic| -> Dynamic {
            params_for_default
                .get(name.as_str())
                .cloned()
                .unwrap_or(default)
        },
    );

    // --- output setter (structural copy at the boundary) ---
    let outputs_for_set = Arc::clone(outputs);
    engine.register_fn(
        "set_output",
        move |name: ImmutableString, value: Dynamic| -> Result<(), Box<rhai::EvalAltResult>> {
            let copied: Value = rhai::serde::from_dynamic(&value)?;
            outputs_for_set
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(name.to_string(), copied);
            Ok(())
        },
    );

    // --- logging ---
    let logs_plain = Arc::clone(logs);
    engine.register_fn("log", move |message: ImmutableString| {
        push_log(&logs_plain, max_entries, max_len, LogLevel::Info, &message);
    });

    let logs_leveled = Arc::clone(logs);
    engine.register_fn(
        "log",
        move |message: ImmutableString, level: ImmutableString| {
            push_log(
                &logs_leveled,
                max_entries,
                max_len,
                LogLevel::parse(&level),
                &message,
            );
        },
    );

    let logs_print = Arc::clone(logs);
    engine.on_print(move |message| {
        push_log(&logs_print, max_entries, max_len, LogLevel::Info, message);
    });

    let logs_debug = Arc::clone(logs);
    engine.on_debug(move |message, _source, _pos| {
        push_log(&logs_debug, max_entries, max_len, LogLevel::Debug, message);
    });

    // --- vector helper ---
    engine.register_fn("create_vector", |x: f64, y: f64, z: f64| -> rhai::Map {
        vector_map(x, y, z)
    });
    engine.register_fn("create_vector", |x: i64, y: i64, z: i64| -> rhai::Map {
        vector_map(x as f64, y as f64, z as f64)
    });

    // --- geometry capability proxy ---
    engine.register_type_with_name::<GeometryApi>("Geometry");
    engine.register_fn(
        "invoke",
        move |api: &mut GeometryApi,
              operation: ImmutableString,
              params: rhai::Map|
              -> Result<Dynamic, Box<rhai::EvalAltResult>> {
            if !api.granted {
                return Err(
                    "permission denied: geometry API not granted by this node's policy".into(),
                );
            }
            let params_json: Value = rhai::serde::from_dynamic(&Dynamic::from(params))?;
            let response = api
                .runtime
                .block_on(api.backend.invoke(operation.as_str(), params_json))
                .map_err(|e| -> Box<rhai::EvalAltResult> {
                    format!("geometry error: {e}").into()
                })?;
            rhai::serde::to_dynamic(&response)
        },
    );

    // --- wall-clock kill switch ---
    let ops = Arc::clone(operations);
    engine.on_progress(move |count| {
        ops.store(count, Ordering::Relaxed);
        if Instant::now() >= deadline {
            Some(Dynamic::from("wall-clock timeout"))
        } else {
            None
        }
    });
}

/// Compile and evaluate the script with a fresh scope. The fresh scope is
/// what guarantees no user state survives between executions of a pooled
/// isolate.
fn run_script(
    isolate: &Isolate,
    script: &str,
    inputs: rhai::Map,
    params: rhai::Map,
    geometry: GeometryApi,
) -> RunOutcome {
    let engine = isolate.engine();

    let ast = match engine.compile(script) {
        Ok(ast) => ast,
        Err(e) => return RunOutcome::Parse(e),
    };

    let mut scope = rhai::Scope::new();
    scope.push_constant("inputs", inputs);
    scope.push_constant("params", params);
    scope.push_constant("geometry", geometry);

    RunOutcome::Eval(engine.eval_ast_with_scope::<Dynamic>(&mut scope, &ast))
}

fn vector_map(x: f64, y: f64, z: f64) -> rhai::Map {
    let mut map = rhai::Map::new();
    map.insert("x".into(), Dynamic::from(x));
    map.insert("y".into(), Dynamic::from(y));
    map.insert("z".into(), Dynamic::from(z));
    map
}

/// Entries of a returned top-level object map become outputs for keys the
/// script did not already `set_output`.
fn merge_returned_map(returned: Dynamic, outputs: &Arc<Mutex<serde_json::Map<String, Value>>>) {
    let Some(map) = returned.try_cast::<rhai::Map>() else {
        return;
    };
    let mut outputs = outputs.lock().unwrap_or_else(|e| e.into_inner());
    for (key, value) in map {
        if outputs.contains_key(key.as_str()) {
            continue;
        }
        match rhai::serde::from_dynamic::<Value>(&value) {
            Ok(copied) => {
                outputs.insert(key.to_string(), copied);
            }
            Err(e) => warn!(key = %key, "returned value could not be marshaled: {e}"),
        }
    }
}

/// Map an engine evaluation error onto the execution-error taxonomy,
/// unwrapping function-call frames to find the root cause.
fn classify_eval_error(
    err: &rhai::EvalAltResult,
    node_id: &str,
    timeout_ms: u64,
) -> ExecutionError {
    use rhai::EvalAltResult as E;

    match err {
        E::ErrorInFunctionCall(_, _, inner, _) => {
            classify_eval_error(inner, node_id, timeout_ms)
        }
        E::ErrorTerminated(_, _) => ExecutionError::Timeout {
            node_id: node_id.to_string(),
            timeout_ms,
        },
        E::ErrorDataTooLarge(_, _) => ExecutionError::MemoryExceeded {
            node_id: node_id.to_string(),
            message: err.to_string(),
        },
        E::ErrorRuntime(token, _)
            if token
                .clone()
                .into_string()
                .map(|s| s.starts_with("permission denied"))
                .unwrap_or(false) =>
        {
            ExecutionError::PermissionDenied {
                node_id: node_id.to_string(),
                message: err.to_string(),
            }
        }
        _ => ExecutionError::ScriptException {
            node_id: node_id.to_string(),
            message: err.to_string(),
        },
    }
}

/// First `import "name"` whose package is not allowlisted by the policy.
fn first_disallowed_import<'a>(script: &'a str, policy: &Policy) -> Option<&'a str> {
    static IMPORT: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
        regex::Regex::new(r#"\bimport\s+"([^"]+)""#).unwrap_or_else(|e| panic!("{e}"))
    });

    IMPORT
        .captures_iter(script)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .find(|name| !policy.allowed_imports.contains(*name))
}

fn json_object_to_map(
    object: &serde_json::Map<String, Value>,
) -> Result<rhai::Map, Box<rhai::EvalAltResult>> {
    let dynamic = rhai::serde::to_dynamic(object)?;
    dynamic
        .try_cast::<rhai::Map>()
        .ok_or_else(|| -> Box<rhai::EvalAltResult> {
            "object did not marshal to a map".into()
        })
}

fn estimate_object_bytes(map: &serde_json::Map<String, Value>) -> u64 {
    24 + map
        .iter()
        .map(|(k, v)| 24 + k.len() as u64 + estimate_value_bytes(v))
        .sum::<u64>()
}

fn estimate_value_bytes(value: &Value) -> u64 {
    match value {
        Value::Null | Value::Bool(_) => 8,
        Value::Number(_) => 16,
        Value::String(s) => 24 + s.len() as u64,
        Value::Array(items) => 24 + items.iter().map(estimate_value_bytes).sum::<u64>(),
        Value::Object(map) => estimate_object_bytes(map),
    }
}
