//! Reusable script templates.
//!
//! Templates are script skeletons with `{{placeholder}}` slots. Instantiating
//! one is plain text substitution; the produced script still goes through
//! the normal compile path, so a bad substitution fails validation like any
//! other script.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::TemplateError;

/// One registered template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptTemplate {
    pub name: String,
    pub description: String,
    pub category: String,
    /// Script text with `{{placeholder}}` slots.
    pub script: String,
    /// Placeholder names that must all be supplied at instantiation.
    pub placeholders: Vec<String>,
}

/// Named templates, keyed by name. Registering a name twice replaces the
/// earlier template.
pub struct TemplateRegistry {
    templates: Mutex<HashMap<String, ScriptTemplate>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: Mutex::new(HashMap::new()),
        }
    }

    /// A registry pre-loaded with the stock templates.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for template in builtins() {
            registry.register(template);
        }
        registry
    }

    pub fn register(&self, template: ScriptTemplate) {
        let mut templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        templates.insert(template.name.clone(), template);
    }

    /// All templates, optionally filtered by category, sorted by name.
    pub fn templates(&self, category: Option<&str>) -> Vec<ScriptTemplate> {
        let templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        let mut list: Vec<ScriptTemplate> = templates
            .values()
            .filter(|t| category.map_or(true, |c| t.category == c))
            .cloned()
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn get(&self, name: &str) -> Option<ScriptTemplate> {
        let templates = self.templates.lock().unwrap_or_else(|e| e.into_inner());
        templates.get(name).cloned()
    }

    /// Produce script text from a template by substituting every
    /// placeholder. Values without a matching placeholder are ignored.
    pub fn instantiate(
        &self,
        name: &str,
        values: &HashMap<String, String>,
    ) -> Result<String, TemplateError> {
        let template = self
            .get(name)
            .ok_or_else(|| TemplateError::UnknownTemplate(name.to_string()))?;

        let mut script = template.script.clone();
        for placeholder in &template.placeholders {
            let value = values
                .get(placeholder)
                .ok_or_else(|| TemplateError::MissingPlaceholder {
                    name: name.to_string(),
                    placeholder: placeholder.clone(),
                })?;
            script = script.replace(&format!("{{{{{placeholder}}}}}"), value);
        }
        Ok(script)
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn builtins() -> Vec<ScriptTemplate> {
    vec![
        ScriptTemplate {
            name: "binary-math".to_string(),
            description: "Combine two numeric inputs with an operator".to_string(),
            category: "math".to_string(),
            script: r#"let result = get_input("a") {{operator}} get_input("b");
set_output("result", result);
"#
            .to_string(),
            placeholders: vec!["operator".to_string()],
        },
        ScriptTemplate {
            name: "scale".to_string(),
            description: "Multiply an input by a configurable factor".to_string(),
            category: "math".to_string(),
            script: r#"let factor = get_param("factor", {{factor}});
set_output("scaled", get_input("value") * factor);
"#
            .to_string(),
            placeholders: vec!["factor".to_string()],
        },
        ScriptTemplate {
            name: "geometry-op".to_string(),
            description: "Invoke one geometry operation and expose its result".to_string(),
            category: "geometry".to_string(),
            script: r#"let shape = geometry.invoke("{{operation}}", #{ size: get_param("size", 1.0) });
set_output("shape", shape);
"#
            .to_string(),
            placeholders: vec!["operation".to_string()],
        },
        ScriptTemplate {
            name: "passthrough".to_string(),
            description: "Forward one input to one output unchanged".to_string(),
            category: "util".to_string(),
            script: r#"set_output("{{output}}", get_input("{{input}}"));
"#
            .to_string(),
            placeholders: vec!["input".to_string(), "output".to_string()],
        },
    ]
}
