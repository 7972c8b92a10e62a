//! Node port schemas.
//!
//! A node either declares its ports up front or has them inferred from the
//! script text. The two cases stay distinguishable so a UI can render
//! inferred ports as provisional.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Coarse value classification for a port. Scripts are dynamically typed,
/// so `Any` is the common case.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    #[default]
    Any,
    Number,
    String,
    Boolean,
    Vector,
    Geometry,
}

/// One input, output, or parameter port.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub kind: ValueKind,
    /// Fallback value, when one was declared or could be read off a
    /// `get_param` call site.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// The full port surface of a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSet {
    pub inputs: BTreeMap<String, PortSpec>,
    pub outputs: BTreeMap<String, PortSpec>,
    pub params: BTreeMap<String, PortSpec>,
}

/// A schema tagged with where it came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", content = "ports", rename_all = "lowercase")]
pub enum NodeSchema {
    /// Supplied by the author; trusted as-is.
    Declared(SchemaSet),
    /// Reconstructed from the script text; best effort.
    Inferred(SchemaSet),
}

impl NodeSchema {
    pub fn ports(&self) -> &SchemaSet {
        match self {
            Self::Declared(set) | Self::Inferred(set) => set,
        }
    }

    pub fn is_inferred(&self) -> bool {
        matches!(self, Self::Inferred(_))
    }
}

// ------------------------------------------------------------
// Inference
// ------------------------------------------------------------

static GET_INPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bget_input\(\s*"([^"]+)""#).unwrap_or_else(|e| panic!("{e}")));
static SET_OUTPUT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bset_output\(\s*"([^"]+)""#).unwrap_or_else(|e| panic!("{e}")));
static GET_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bget_param\(\s*"([^"]+)"\s*(?:,\s*([^)]+))?\)"#).unwrap_or_else(|e| panic!("{e}")));
static INPUT_PROP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\binputs\.([A-Za-z_][A-Za-z0-9_]*)").unwrap_or_else(|e| panic!("{e}")));
static PARAM_PROP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bparams\.([A-Za-z_][A-Za-z0-9_]*)").unwrap_or_else(|e| panic!("{e}")));
static MAP_LITERAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"#\{([^{}]*)\}").unwrap_or_else(|e| panic!("{e}")));
static MAP_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[,\s])([A-Za-z_][A-Za-z0-9_]*)\s*:").unwrap_or_else(|e| panic!("{e}")));

/// Reconstruct a [`SchemaSet`] from the script's accessor call sites and
/// property reads. Dynamically computed port names are invisible to this
/// pass; authors who need those must declare the schema instead.
pub fn infer(script: &str) -> SchemaSet {
    let mut set = SchemaSet::default();

    for cap in GET_INPUT.captures_iter(script) {
        set.inputs.entry(cap[1].to_string()).or_default();
    }
    for cap in INPUT_PROP.captures_iter(script) {
        set.inputs.entry(cap[1].to_string()).or_default();
    }

    for cap in SET_OUTPUT.captures_iter(script) {
        set.outputs.entry(cap[1].to_string()).or_default();
    }
    // A trailing `#{ ... }` map also feeds outputs, so its literal keys
    // count. Nested maps are skipped; only flat literals are readable
    // without a real parse.
    for map in MAP_LITERAL.captures_iter(script) {
        for key in MAP_KEY.captures_iter(&map[1]) {
            set.outputs.entry(key[1].to_string()).or_default();
        }
    }

    for cap in GET_PARAM.captures_iter(script) {
        let spec = set.params.entry(cap[1].to_string()).or_default();
        if spec.default.is_none() {
            if let Some(literal) = cap.get(2) {
                // Only literals that happen to be valid JSON are kept;
                // expressions as defaults stay unknown.
                if let Ok(value) = serde_json::from_str::<Value>(literal.as_str().trim()) {
                    spec.default = Some(value);
                }
            }
        }
    }
    for cap in PARAM_PROP.captures_iter(script) {
        set.params.entry(cap[1].to_string()).or_default();
    }

    set
}
