//! Skill registry and invocation surface.
//!
//! Skills are the engine's only way of doing work. Each skill is an
//! async unit registered under a string `skill_id` together with
//! [`SkillMetadata`] describing its contract: whether it has external
//! side effects (which triggers the idempotency rule), which failure
//! kinds are worth retrying, and which inputs tolerate a null from a
//! failed-but-continued predecessor.
//!
//! # Design Principles
//!
//! - **Deterministic**: a skill given the same inputs and seed must
//!   produce the same output; external nondeterminism is handled by
//!   replay-mode stubs.
//! - **Focused**: one skill, one capability.
//! - **Declared**: retry and null-tolerance behavior lives in metadata,
//!   not in engine special cases.

pub mod builtin;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::types::SkillErrorKind;

/// Declared contract of a registered skill.
#[derive(Clone, Debug, Default)]
pub struct SkillMetadata {
    pub version: String,
    /// Side-effecting skills require an idempotency key (policy check
    /// and sandbox rule both consult this flag).
    pub side_effecting: bool,
    /// Failure kinds the engine may retry for this skill, in addition
    /// to the kinds that are retryable by taxonomy.
    pub retryable_errors: Vec<SkillErrorKind>,
    /// Inputs that accept a null produced by a failed predecessor
    /// running under `error_mode = continue`.
    pub null_tolerant_inputs: Vec<String>,
    /// Optional JSON-schema-shaped description of the inputs. Only the
    /// top-level `required` list is enforced by the registry.
    pub input_schema: Option<Value>,
    /// Optional output schema, carried for external validators.
    pub output_schema: Option<Value>,
}

impl SkillMetadata {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn side_effecting(mut self) -> Self {
        self.side_effecting = true;
        self
    }

    #[must_use]
    pub fn with_null_tolerant_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.null_tolerant_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    #[must_use]
    pub fn tolerates_null(&self, input_name: &str) -> bool {
        self.null_tolerant_inputs.iter().any(|n| n == input_name)
    }
}

/// Everything a skill sees for one invocation.
#[derive(Clone, Debug)]
pub struct SkillContext {
    /// Fully resolved inputs (no `${...}` references remain).
    pub inputs: FxHashMap<String, Value>,
    /// Deterministic per-step seed.
    pub seed: u64,
    /// True when the engine is reproducing a previous run; skills with
    /// external nondeterminism should answer from recorded fixtures.
    pub replay: bool,
}

/// Successful skill outcome: the output value and the actual cost.
#[derive(Clone, Debug)]
pub struct SkillOutput {
    pub output: Value,
    pub cost_minor: u64,
}

impl SkillOutput {
    #[must_use]
    pub fn new(output: Value) -> Self {
        Self {
            output,
            cost_minor: 0,
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost_minor: u64) -> Self {
        self.cost_minor = cost_minor;
        self
    }
}

/// Failure reported by a skill invocation.
#[derive(Debug, Error, Diagnostic)]
#[error("skill failed ({kind}): {message}")]
#[diagnostic(code(replayweave::skills::failed))]
pub struct SkillError {
    pub kind: SkillErrorKind,
    pub message: String,
}

impl SkillError {
    #[must_use]
    pub fn new(kind: SkillErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(SkillErrorKind::Transient, message)
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(SkillErrorKind::Permanent, message)
    }
}

/// An executable skill.
#[async_trait]
pub trait Skill: Send + Sync {
    fn metadata(&self) -> &SkillMetadata;

    async fn invoke(&self, ctx: SkillContext) -> Result<SkillOutput, SkillError>;
}

/// Errors from registry lookup and input validation.
#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("unknown skill: {skill_id}")]
    #[diagnostic(
        code(replayweave::skills::unknown),
        help("Register the skill before referencing it from a workflow spec.")
    )]
    Unknown { skill_id: String },

    #[error("input `{input}` required by skill `{skill_id}` is missing")]
    #[diagnostic(code(replayweave::skills::missing_input))]
    MissingRequiredInput { skill_id: String, input: String },
}

/// Registry mapping `skill_id` to implementations.
///
/// The registry is populated once at startup and shared read-only with
/// every run; interior mutability is deliberately absent.
#[derive(Default)]
pub struct SkillRegistry {
    skills: FxHashMap<String, Arc<dyn Skill>>,
}

impl SkillRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, skill_id: impl Into<String>, skill: Arc<dyn Skill>) {
        self.skills.insert(skill_id.into(), skill);
    }

    #[must_use]
    pub fn get(&self, skill_id: &str) -> Option<Arc<dyn Skill>> {
        self.skills.get(skill_id).cloned()
    }

    #[must_use]
    pub fn metadata(&self, skill_id: &str) -> Option<SkillMetadata> {
        self.skills.get(skill_id).map(|s| s.metadata().clone())
    }

    #[must_use]
    pub fn contains(&self, skill_id: &str) -> bool {
        self.skills.contains_key(skill_id)
    }

    /// Shallow schema check: every name in the schema's top-level
    /// `required` array must be present in the inputs.
    pub fn check_required_inputs(
        &self,
        skill_id: &str,
        inputs: &FxHashMap<String, Value>,
    ) -> Result<(), RegistryError> {
        let skill = self.skills.get(skill_id).ok_or_else(|| RegistryError::Unknown {
            skill_id: skill_id.to_string(),
        })?;
        let Some(schema) = &skill.metadata().input_schema else {
            return Ok(());
        };
        let Some(required) = schema.get("required").and_then(Value::as_array) else {
            return Ok(());
        };
        for name in required.iter().filter_map(Value::as_str) {
            if !inputs.contains_key(name) {
                return Err(RegistryError::MissingRequiredInput {
                    skill_id: skill_id.to_string(),
                    input: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::builtin::EchoSkill;
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registry_lookup_and_schema_check() {
        let mut registry = SkillRegistry::new();
        registry.register(
            "echo",
            Arc::new(EchoSkill::with_metadata(
                SkillMetadata::new("1.0").with_input_schema(json!({"required": ["v"]})),
            )),
        );

        assert!(registry.contains("echo"));
        assert!(registry.get("missing").is_none());

        let mut inputs = FxHashMap::default();
        inputs.insert("v".to_string(), json!(1));
        registry.check_required_inputs("echo", &inputs).unwrap();

        inputs.clear();
        assert!(matches!(
            registry.check_required_inputs("echo", &inputs),
            Err(RegistryError::MissingRequiredInput { .. })
        ));
    }
}
