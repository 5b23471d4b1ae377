//! Variable scopes and `{{ name }}` substitution.
//!
//! Values are plain JSON values. A string that consists of exactly one
//! reference is replaced by the referenced value itself, so a list default
//! stays a list. References embedded in longer strings are rendered as text.
//! Referenced values are substituted in turn, up to [`MAX_DEPTH`] levels.

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

/// Ordered variable map.
pub type Vars = IndexMap<String, Value>;

/// Maximum nesting of variables referencing other variables.
pub const MAX_DEPTH: usize = 16;

static TEMPLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid template regex"));

static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*$").expect("valid identifier regex"));

/// Layered variable lookup, highest precedence first.
#[derive(Debug, Default, Clone)]
pub struct VarScope<'a> {
    layers: Vec<&'a Vars>,
}

impl<'a> VarScope<'a> {
    /// Create an empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer below every layer added so far.
    pub fn layer(mut self, vars: &'a Vars) -> Self {
        self.layers.push(vars);
        self
    }

    /// Find the highest-precedence value for `name`.
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }

    /// Flatten the scope into a single map.
    pub fn flatten(&self) -> Vars {
        let mut merged = Vars::new();
        for layer in self.layers.iter().rev() {
            for (key, value) in layer.iter() {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

/// Substitute every reference in `value` using `scope`.
///
/// `context` names the place being resolved and ends up in error messages.
pub fn substitute(value: &Value, scope: &VarScope<'_>, context: &str) -> Result<Value> {
    substitute_at(value, scope, context, 0)
}

fn substitute_at(value: &Value, scope: &VarScope<'_>, context: &str, depth: usize) -> Result<Value> {
    match value {
        Value::String(text) => substitute_str(text, scope, context, depth),
        Value::Array(items) => items
            .iter()
            .map(|item| substitute_at(item, scope, context, depth))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), substitute_at(item, scope, context, depth)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str(text: &str, scope: &VarScope<'_>, context: &str, depth: usize) -> Result<Value> {
    if !text.contains("{{") {
        return Ok(Value::String(text.to_string()));
    }

    let mut references = TEMPLATE.captures_iter(text).peekable();
    if references.peek().is_none() {
        return Ok(Value::String(text.to_string()));
    }

    // A lone reference keeps the referenced value's type.
    if let Some(whole) = TEMPLATE.captures(text) {
        if whole.get(0).map(|m| m.as_str().len()) == Some(text.trim().len())
            && text.trim_start().starts_with("{{")
        {
            let name = reference_name(&whole[1], context)?;
            return resolve(name, scope, context, depth);
        }
    }

    let mut rendered = String::with_capacity(text.len());
    let mut last = 0;
    for caps in references {
        let Some(full) = caps.get(0) else { continue };
        let name = reference_name(&caps[1], context)?;
        let value = resolve(name, scope, context, depth)?;
        rendered.push_str(&text[last..full.start()]);
        rendered.push_str(&render_text(&value));
        last = full.end();
    }
    rendered.push_str(&text[last..]);
    Ok(Value::String(rendered))
}

fn reference_name<'t>(inner: &'t str, context: &str) -> Result<&'t str> {
    IDENTIFIER
        .captures(inner)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .ok_or_else(|| {
            Error::parse(
                context,
                format!("unsupported expression '{{{{{}}}}}'", inner),
            )
        })
}

fn resolve(name: &str, scope: &VarScope<'_>, context: &str, depth: usize) -> Result<Value> {
    if depth >= MAX_DEPTH {
        return Err(Error::RecursiveVariable(name.to_string()));
    }
    let value = scope
        .get(name)
        .ok_or_else(|| Error::missing_variable(name, context))?;
    substitute_at(value, scope, context, depth + 1)
}

/// Render a value for embedding in a larger string.
pub fn render_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(items) => items
            .iter()
            .map(render_text)
            .collect::<Vec<_>>()
            .join(" "),
        Value::Object(_) => value.to_string(),
    }
}

/// Names referenced anywhere inside `value`, in order of appearance.
pub fn references(value: &Value) -> Vec<String> {
    let mut names = Vec::new();
    collect_references(value, &mut names);
    names
}

fn collect_references(value: &Value, names: &mut Vec<String>) {
    match value {
        Value::String(text) => {
            for caps in TEMPLATE.captures_iter(text) {
                if let Some(name) = IDENTIFIER.captures(&caps[1]).and_then(|c| c.get(1)) {
                    if !names.iter().any(|n| n == name.as_str()) {
                        names.push(name.as_str().to_string());
                    }
                }
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_references(item, names)),
        Value::Object(map) => map.values().for_each(|item| collect_references(item, names)),
        _ => {}
    }
}
