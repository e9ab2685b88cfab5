//! Parameter interpolation
//!
//! The literal substring `${NAME}` anywhere in a parameter string is a
//! reference into the variable store; `NAME` is the longest run of letters,
//! digits and underscores, and must be immediately closed by `}`. A bare
//! mapping of the shape `{"var": "NAME"}` used as a parameter value is
//! equivalent and yields the raw value, not a stringified one.
//!
//! Missing references are a hard error in arithmetic or sole-token assign
//! position, and a warning plus empty-string substitution everywhere else.

use crate::error::{Result, VmError};
use crate::expr;
use crate::vars::VariableStore;
use serde_json::Value;

/// Outcome of substituting references inside one string
#[derive(Debug, Clone, PartialEq)]
pub struct Substitution {
    /// Template with every reference replaced (missing ones by "")
    pub text: String,
    /// Names that were referenced but not bound, in order of appearance
    pub missing: Vec<String>,
    /// Whether the template contained any reference at all
    pub had_refs: bool,
}

/// Render a value for insertion into a string template
fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// If `template` is exactly `${NAME}` and nothing else, return `NAME`.
pub fn sole_reference(template: &str) -> Option<&str> {
    let inner = template.strip_prefix("${")?.strip_suffix('}')?;
    if crate::vars::is_valid_name(inner) {
        Some(inner)
    } else {
        None
    }
}

/// If `value` is a mapping of the shape `{"var": "NAME"}`, return `NAME`.
pub fn var_shape(value: &Value) -> Option<&str> {
    let map = value.as_object()?;
    if map.len() != 1 {
        return None;
    }
    let name = map.get("var")?.as_str()?;
    if crate::vars::is_valid_name(name) {
        Some(name)
    } else {
        None
    }
}

/// Replace every `${NAME}` in `template`, resolving names through `vars`.
///
/// The `placeholder` closure decides what a reference renders to; the
/// default substitution passes the bound value through [`render`] and maps
/// missing names to the empty string.
fn substitute_with(
    template: &str,
    vars: &VariableStore,
    placeholder: impl Fn(&str, Option<&Value>) -> String,
) -> Substitution {
    let mut text = String::with_capacity(template.len());
    let mut missing = Vec::new();
    let mut had_refs = false;
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        text.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let name_len = after
            .bytes()
            .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
            .count();
        if name_len > 0 && after.as_bytes().get(name_len) == Some(&b'}') {
            let name = &after[..name_len];
            had_refs = true;
            let value = vars.lookup(name);
            if value.is_none() && !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
            text.push_str(&placeholder(name, value));
            rest = &after[name_len + 1..];
        } else {
            // Not a well-formed reference, keep the literal text.
            text.push_str("${");
            rest = after;
        }
    }
    text.push_str(rest);

    Substitution { text, missing, had_refs }
}

/// Standard substitution: bound values rendered, missing names become "".
pub fn substitute(template: &str, vars: &VariableStore) -> Substitution {
    substitute_with(template, vars, |_, value| {
        value.map(render).unwrap_or_default()
    })
}

/// Evaluate one assign right-hand side against the pre-instruction store.
///
/// Returns the value to write plus any warnings recorded on the way.
pub fn eval_assign_rhs(rhs: &Value, vars: &VariableStore) -> Result<(Value, Vec<String>)> {
    // Kind 1: non-string JSON values are stored verbatim, except the
    // {"var": name} shape which dereferences.
    let template = match rhs {
        Value::String(s) => s.as_str(),
        other => {
            if let Some(name) = var_shape(other) {
                return Ok((vars.get(name)?.clone(), Vec::new()));
            }
            return Ok((other.clone(), Vec::new()));
        }
    };

    // Kind 3: a sole `${name}` preserves the referenced value's type.
    if let Some(name) = sole_reference(template) {
        return Ok((vars.get(name)?.clone(), Vec::new()));
    }

    let sub = substitute(template, vars);

    if sub.missing.is_empty() {
        // Kind 4: arithmetic after substitution; kind 2/5 otherwise.
        return match expr::eval(&sub.text) {
            Some(result) => result.map(|v| (v, Vec::new())),
            None => Ok((Value::String(sub.text), Vec::new())),
        };
    }

    // Missing references. Decide from the template's shape whether this
    // would have been arithmetic: with every reference replaced by a number
    // placeholder, does it parse?
    let shape = substitute_with(template, vars, |_, _| "0".to_string());
    if expr::parse(&shape.text).is_some() {
        return Err(VmError::UnresolvedVariable {
            name: sub.missing[0].clone(),
        });
    }

    let warnings = sub
        .missing
        .iter()
        .map(|name| format!("variable '{}' is not bound, substituted empty string", name))
        .collect();
    Ok((Value::String(sub.text), warnings))
}

/// Interpolate one tool parameter value, recursing through arrays and maps.
///
/// Sole references (either syntax) yield the raw value; missing names
/// substitute the empty string and record a warning.
pub fn interpolate_param(value: &Value, vars: &VariableStore, warnings: &mut Vec<String>) -> Value {
    if let Some(name) = var_shape(value) {
        return match vars.lookup(name) {
            Some(v) => v.clone(),
            None => {
                warnings.push(format!(
                    "variable '{}' is not bound, substituted empty string",
                    name
                ));
                Value::String(String::new())
            }
        };
    }

    match value {
        Value::String(s) => {
            if let Some(name) = sole_reference(s) {
                return match vars.lookup(name) {
                    Some(v) => v.clone(),
                    None => {
                        warnings.push(format!(
                            "variable '{}' is not bound, substituted empty string",
                            name
                        ));
                        Value::String(String::new())
                    }
                };
            }
            let sub = substitute(s, vars);
            for name in &sub.missing {
                warnings.push(format!(
                    "variable '{}' is not bound, substituted empty string",
                    name
                ));
            }
            Value::String(sub.text)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_param(item, vars, warnings))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), interpolate_param(v, vars, warnings)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Collect every name referenced by a parameter value, for static validation.
pub fn referenced_names(value: &Value, out: &mut Vec<String>) {
    if let Some(name) = var_shape(value) {
        out.push(name.to_string());
        return;
    }
    match value {
        Value::String(s) => {
            let mut rest = s.as_str();
            while let Some(start) = rest.find("${") {
                let after = &rest[start + 2..];
                let name_len = after
                    .bytes()
                    .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
                    .count();
                if name_len > 0 && after.as_bytes().get(name_len) == Some(&b'}') {
                    out.push(after[..name_len].to_string());
                    rest = &after[name_len + 1..];
                } else {
                    rest = after;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                referenced_names(item, out);
            }
        }
        Value::Object(map) => {
            for v in map.values() {
                referenced_names(v, out);
            }
        }
        _ => {}
    }
}
