//! Parameter and notification templating.
//!
//! One fixed Jinja-style dialect with strict-undefined semantics: a missing
//! variable is a render error, never an empty string. The filter set is
//! enumerated in [`filters`] — templates cannot call arbitrary host code.
//! `decrypt_kv` is backed by a snapshot of decrypted key-value pairs taken
//! before rendering, so every filter is a pure function at render time.

pub mod filters;

use std::collections::HashMap;

use minijinja::{Environment, UndefinedBehavior};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("template error: {0}")]
    Render(String),
}

impl From<minijinja::Error> for TemplateError {
    fn from(e: minijinja::Error) -> Self {
        TemplateError::Render(e.to_string())
    }
}

/// A configured template renderer. Cheap to construct; components build one
/// per render batch with the KV snapshot they need.
pub struct Renderer {
    env: Environment<'static>,
}

impl Renderer {
    pub fn new() -> Self {
        Self::with_kv_snapshot(HashMap::new())
    }

    /// `kv` maps key names to already-decrypted values for the `decrypt_kv`
    /// filter and the `st2kv` context namespace.
    pub fn with_kv_snapshot(kv: HashMap<String, String>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        filters::register(&mut env, kv);
        Self { env }
    }

    /// Render one template string against a JSON context.
    pub fn render(&self, template: &str, context: &Value) -> Result<String, TemplateError> {
        let ctx = minijinja::value::Value::from_serialize(context);
        Ok(self.env.render_str(template, ctx)?)
    }

    /// Render every string leaf of a JSON document in place.
    ///
    /// A leaf that is exactly one `{{ … }}` expression keeps its native type
    /// when the rendered text parses as JSON (so `"{{ count }}"` renders to
    /// a number, not the string `"3"`).
    pub fn render_value(&self, value: &Value, context: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(tpl) => {
                let rendered = self.render(tpl, context)?;
                if is_single_expression(tpl) {
                    if let Ok(parsed) = serde_json::from_str::<Value>(&rendered) {
                        return Ok(parsed);
                    }
                }
                Ok(Value::String(rendered))
            }
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, context))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut out = serde_json::Map::new();
                for (k, v) in map {
                    out.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

/// True when the whole template is one `{{ … }}` expression and nothing else.
fn is_single_expression(template: &str) -> bool {
    let t = template.trim();
    t.starts_with("{{") && t.ends_with("}}") && t.matches("{{").count() == 1
}
