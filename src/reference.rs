//! Resolution of `${step_id.field.path}` input references.
//!
//! A string input whose entire value is `${...}` is a reference to a
//! predecessor's output; everything else is a literal. References are
//! parsed once into `(step_id, path)` and evaluated against the outputs
//! map — no textual interpolation ever happens, so a resolved value
//! keeps its JSON type.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

/// A parsed `${step_id[.segment]*}` reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepRef {
    pub step_id: String,
    pub path: Vec<String>,
}

/// Failure to resolve a reference against predecessor outputs.
///
/// All variants classify as `ReferenceError` in the step failure
/// taxonomy; the step fails before its skill is invoked.
#[derive(Debug, Error, Diagnostic)]
pub enum ReferenceError {
    #[error("reference `{reference}` names unknown or unavailable step `{step_id}`")]
    #[diagnostic(
        code(replayweave::reference::unknown_step),
        help("References may only name completed predecessor steps.")
    )]
    UnknownStep { reference: String, step_id: String },

    #[error("reference `{reference}` path segment `{segment}` not found")]
    #[diagnostic(code(replayweave::reference::missing_path))]
    MissingPath { reference: String, segment: String },

    #[error("reference `{reference}` traverses a non-object value at `{segment}`")]
    #[diagnostic(code(replayweave::reference::non_object))]
    NonObjectTraversal { reference: String, segment: String },

    #[error("empty or malformed reference `{reference}`")]
    #[diagnostic(code(replayweave::reference::malformed))]
    Malformed { reference: String },
}

/// Parse a whole-string reference. Returns `None` for literals.
///
/// The accepted shape is `${step_id}` or `${step_id.a.b}`; embedded
/// `${...}` inside a longer string is not a reference (and is the
/// sandbox's business to flag).
#[must_use]
pub fn parse_reference(s: &str) -> Option<StepRef> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains("${") {
        return None;
    }
    let mut segments = inner.split('.');
    let step_id = segments.next()?.to_string();
    if step_id.is_empty() {
        return None;
    }
    let path: Vec<String> = segments.map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return None;
    }
    Some(StepRef { step_id, path })
}

/// Evaluate a parsed reference against the accumulated outputs map.
pub fn resolve_ref(
    reference: &str,
    parsed: &StepRef,
    outputs: &FxHashMap<String, Value>,
) -> Result<Value, ReferenceError> {
    let mut current = outputs
        .get(&parsed.step_id)
        .ok_or_else(|| ReferenceError::UnknownStep {
            reference: reference.to_string(),
            step_id: parsed.step_id.clone(),
        })?;
    for segment in &parsed.path {
        match current {
            Value::Object(map) => {
                current = map.get(segment).ok_or_else(|| ReferenceError::MissingPath {
                    reference: reference.to_string(),
                    segment: segment.clone(),
                })?;
            }
            _ => {
                return Err(ReferenceError::NonObjectTraversal {
                    reference: reference.to_string(),
                    segment: segment.clone(),
                });
            }
        }
    }
    Ok(current.clone())
}

/// Resolve every reference inside an input value, recursively.
///
/// Strings that parse as references are replaced by the referenced
/// value; arrays and objects are walked; all other values pass through
/// untouched.
pub fn resolve_value(
    value: &Value,
    outputs: &FxHashMap<String, Value>,
) -> Result<Value, ReferenceError> {
    match value {
        Value::String(s) => match parse_reference(s) {
            Some(parsed) => resolve_ref(s, &parsed, outputs),
            None => Ok(value.clone()),
        },
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, outputs)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                resolved.insert(k.clone(), resolve_value(v, outputs)?);
            }
            Ok(Value::Object(resolved))
        }
        _ => Ok(value.clone()),
    }
}

/// Resolve a whole inputs map for one step.
pub fn resolve_inputs(
    inputs: &FxHashMap<String, Value>,
    outputs: &FxHashMap<String, Value>,
) -> Result<FxHashMap<String, Value>, ReferenceError> {
    let mut resolved = FxHashMap::default();
    for (name, value) in inputs {
        resolved.insert(name.clone(), resolve_value(value, outputs)?);
    }
    Ok(resolved)
}

/// Step ids referenced anywhere inside a value.
#[must_use]
pub fn referenced_steps(value: &Value) -> Vec<StepRef> {
    let mut refs = Vec::new();
    collect_refs(value, &mut refs);
    refs
}

fn collect_refs(value: &Value, refs: &mut Vec<StepRef>) {
    match value {
        Value::String(s) => {
            if let Some(parsed) = parse_reference(s) {
                refs.push(parsed);
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_refs(v, refs)),
        Value::Object(map) => map.values().for_each(|v| collect_refs(v, refs)),
        _ => {}
    }
}
