//! Integration tests for the compile-and-evaluate path.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;

use sandbox::error::ExecutionError;
use sandbox::geometry::{GeometryBackend, MockGeometry, NullGeometry};
use sandbox::policy::Policy;

use crate::compiler::{ScriptLanguage, ScriptMetadata};
use crate::engine::ScriptEngine;
use crate::error::CompileError;
use crate::schema::{NodeSchema, PortSpec, SchemaSet};

fn engine() -> ScriptEngine {
    ScriptEngine::new(Arc::new(NullGeometry))
}

const ADD_SCRIPT: &str =
    r#"set_output("result", inputs.a + inputs.b + get_param("offset", 0));"#;

// ============================================================
// Compilation
// ============================================================

#[tokio::test]
async fn compiled_node_carries_identity_and_fingerprint() {
    let engine = engine();
    let node = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("Add"), Policy::default())
        .unwrap();

    assert_eq!(node.node_type(), "Script::Add");
    assert_eq!(node.language(), ScriptLanguage::Rhai);
    assert_eq!(node.content_hash().len(), 64);
    assert_eq!(node.script(), ADD_SCRIPT);
    assert_eq!(engine.node_count(), 1);
    assert!(engine.node(node.id()).is_some());
}

#[tokio::test]
async fn same_script_yields_the_same_fingerprint() {
    let engine = engine();
    let a = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("A"), Policy::default())
        .unwrap();
    let b = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("B"), Policy::default())
        .unwrap();
    assert_eq!(a.content_hash(), b.content_hash());
    assert_ne!(a.id(), b.id());
}

#[tokio::test]
async fn dangerous_script_fails_compilation_with_a_report() {
    let engine = engine();
    let err = engine
        .compile_node(
            r#"let r = eval("1 + 1");"#,
            ScriptMetadata::new("Evil"),
            Policy::default(),
        )
        .unwrap_err();

    let report = err.report().expect("validation report");
    assert!(!report.valid);
    assert_eq!(report.errors[0].code, "SECURITY_EVAL_FORBIDDEN");
    assert_eq!(engine.node_count(), 0);
}

#[tokio::test]
async fn unenforceable_policy_fails_compilation() {
    let engine = engine();
    let err = engine
        .compile_node(
            ADD_SCRIPT,
            ScriptMetadata::new("Add"),
            Policy {
                memory_limit_mb: 0,
                ..Policy::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, CompileError::Policy(_)));
}

// ============================================================
// Schemas
// ============================================================

#[tokio::test]
async fn schema_is_inferred_when_not_declared() {
    let engine = engine();
    let node = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("Add"), Policy::default())
        .unwrap();

    assert!(node.schema().is_inferred());
    let ports = node.schema().ports();
    assert!(ports.inputs.contains_key("a"));
    assert!(ports.inputs.contains_key("b"));
    assert!(ports.outputs.contains_key("result"));
    assert_eq!(ports.params["offset"].default, Some(json!(0)));
}

#[tokio::test]
async fn declared_schema_wins_over_inference() {
    let engine = engine();
    let mut declared = SchemaSet::default();
    declared.inputs.insert("a".to_string(), PortSpec::default());

    let node = engine
        .compile_node_with_schema(
            ADD_SCRIPT,
            ScriptMetadata::new("Add"),
            Policy::default(),
            Some(declared),
        )
        .unwrap();

    assert!(matches!(node.schema(), NodeSchema::Declared(_)));
    // Inference would also have found "b"; the declaration is taken as-is.
    assert!(!node.schema().ports().inputs.contains_key("b"));
}

// ============================================================
// Evaluation
// ============================================================

#[tokio::test]
async fn evaluate_returns_the_output_map() {
    let engine = engine();
    let node = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("Add"), Policy::default())
        .unwrap();

    let outputs = node
        .evaluate(json!({ "a": 5, "b": 3 }), json!({ "offset": 2 }))
        .await
        .unwrap();
    assert_eq!(outputs.get("result"), Some(&json!(10)));
}

#[tokio::test]
async fn evaluation_errors_are_attributed_to_the_node_type() {
    let engine = engine();
    let node = engine
        .compile_node(
            "loop { }",
            ScriptMetadata::new("Spinner"),
            Policy {
                timeout_ms: 100,
                ..Policy::default()
            },
        )
        .unwrap();

    let err = node.evaluate(json!({}), json!({})).await.unwrap_err();
    assert!(matches!(err, ExecutionError::Timeout { .. }));
    assert_eq!(err.node_id(), "Script::Spinner");
}

#[tokio::test]
async fn geometry_flows_through_a_compiled_node() {
    let geometry = Arc::new(MockGeometry::returning(json!({ "mesh": "m1" })));
    let engine = ScriptEngine::new(Arc::clone(&geometry) as Arc<dyn GeometryBackend>);

    let node = engine
        .compile_node(
            r#"set_output("shape", geometry.invoke("extrude", #{ depth: 2.0 }));"#,
            ScriptMetadata::new("Extrude"),
            Policy::default(),
        )
        .unwrap();

    let outputs = node.evaluate(json!({}), json!({})).await.unwrap();
    assert_eq!(outputs.get("shape"), Some(&json!({ "mesh": "m1" })));
    assert_eq!(geometry.call_count(), 1);
}

#[tokio::test]
async fn evaluations_feed_the_metrics_store_under_the_node_type() {
    let engine = engine();
    let node = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("Add"), Policy::default())
        .unwrap();

    let _ = node.evaluate(json!({ "a": 1, "b": 2 }), json!({})).await;
    let _ = node.evaluate(json!({ "a": 3, "b": 4 }), json!({})).await;

    let summary = engine.metrics().summary("Script::Add").unwrap();
    assert_eq!(summary.executions, 2);
    assert_eq!(summary.failures, 0);
}

// ============================================================
// Lifecycle
// ============================================================

#[tokio::test]
async fn recompile_replaces_the_registered_node() {
    let engine = engine();
    let node = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("Add"), Policy::default())
        .unwrap();
    let old_id = node.id();

    let updated = engine
        .recompile_node(old_id, r#"set_output("result", 99);"#)
        .unwrap();

    assert_ne!(updated.id(), old_id);
    assert_eq!(updated.node_type(), "Script::Add");
    assert!(engine.node(old_id).is_none());
    assert_eq!(engine.node_count(), 1);

    // The old handle still runs the old code.
    let old_out = node
        .evaluate(json!({ "a": 1, "b": 1 }), json!({}))
        .await
        .unwrap();
    assert_eq!(old_out.get("result"), Some(&json!(2)));
    let new_out = updated.evaluate(json!({}), json!({})).await.unwrap();
    assert_eq!(new_out.get("result"), Some(&json!(99)));
}

#[tokio::test]
async fn recompiling_an_unknown_node_fails() {
    let engine = engine();
    let err = engine
        .recompile_node(uuid::Uuid::new_v4(), ADD_SCRIPT)
        .unwrap_err();
    assert!(matches!(err, CompileError::UnknownNode(_)));
}

#[tokio::test]
async fn removing_a_node_clears_its_metrics() {
    let engine = engine();
    let node = engine
        .compile_node(ADD_SCRIPT, ScriptMetadata::new("Add"), Policy::default())
        .unwrap();
    let _ = node.evaluate(json!({ "a": 1, "b": 2 }), json!({})).await;
    assert!(engine.metrics().summary("Script::Add").is_some());

    assert!(engine.remove_node(node.id()));
    assert_eq!(engine.node_count(), 0);
    assert!(engine.metrics().summary("Script::Add").is_none());
    assert!(!engine.remove_node(node.id()));
}

// ============================================================
// Templates end to end
// ============================================================

#[tokio::test]
async fn template_instantiation_compiles_and_runs() {
    let engine = engine();
    let mut values = HashMap::new();
    values.insert("operator".to_string(), "*".to_string());

    let script = engine.templates().instantiate("binary-math", &values).unwrap();
    let node = engine
        .compile_node(&script, ScriptMetadata::new("Multiply"), Policy::default())
        .unwrap();

    let outputs = node
        .evaluate(json!({ "a": 6, "b": 7 }), json!({}))
        .await
        .unwrap();
    assert_eq!(outputs.get("result"), Some(&json!(42)));
}

#[tokio::test]
async fn template_with_a_bad_substitution_fails_validation() {
    let engine = engine();
    let mut values = HashMap::new();
    // A substitution that injects a forbidden construct still goes through
    // the normal compile gate.
    values.insert("operator".to_string(), "+ eval(\"1\") +".to_string());

    let script = engine.templates().instantiate("binary-math", &values).unwrap();
    let err = engine
        .compile_node(&script, ScriptMetadata::new("Bad"), Policy::default())
        .unwrap_err();
    assert!(err.report().is_some());
}
