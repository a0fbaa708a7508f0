//! Workflow specifications: immutable descriptions of step graphs.
//!
//! A [`WorkflowSpec`] names an ordered sequence of [`StepDescriptor`]s
//! plus the run-level budget ceiling and optional timeout. Two spec
//! serializations describe the same workflow iff their canonical JSON
//! forms are byte-equal; [`WorkflowSpec::fingerprint`] exposes that
//! identity as a short content hash.
//!
//! Validation happens at load: duplicate step ids, dependencies on
//! unknown or later steps, and cycles are all rejected before the
//! engine sees the spec. Scheduling resolves `depends_on` into a
//! topological order with ties broken by lexicographic `step_id`, so
//! the execution order is deterministic for a given spec.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::canonical;

/// How the engine proceeds after a step exhausts its retries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorMode {
    /// Terminate the run with status `failed`.
    #[default]
    Abort,
    /// Mark the step failed and keep executing; dependents see a null
    /// output if they tolerate one, otherwise fail transitively.
    Continue,
    /// Mark the step skipped; dependents treat references to it as
    /// unresolvable.
    Skip,
}

/// One typed skill invocation within a workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepDescriptor {
    /// Unique within the spec.
    pub step_id: String,
    /// Registry identifier of the skill to invoke.
    pub skill_id: String,
    /// Literal values or `${step_id[.path]}` reference strings.
    #[serde(default)]
    pub inputs: FxHashMap<String, Value>,
    /// Step ids this step consumes; must name earlier steps only.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Retry budget for retryable failures.
    #[serde(default)]
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    #[serde(default)]
    pub retry_backoff_base_ms: u64,
    #[serde(default)]
    pub error_mode: ErrorMode,
    /// Declared cost estimate checked against policy ceilings before
    /// the skill runs.
    #[serde(default)]
    pub estimated_cost_minor: u64,
    /// Required for side-effecting skills; also accepted via the
    /// `idempotency_key` input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl StepDescriptor {
    /// Minimal descriptor with defaults for every policy knob.
    pub fn new(step_id: impl Into<String>, skill_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            skill_id: skill_id.into(),
            inputs: FxHashMap::default(),
            depends_on: Vec::new(),
            max_retries: 0,
            retry_backoff_base_ms: 0,
            error_mode: ErrorMode::Abort,
            estimated_cost_minor: 0,
            idempotency_key: None,
        }
    }

    #[must_use]
    pub fn with_input(mut self, name: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retries(mut self, max_retries: u32, backoff_base_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_backoff_base_ms = backoff_base_ms;
        self
    }

    #[must_use]
    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = mode;
        self
    }

    #[must_use]
    pub fn with_estimated_cost(mut self, minor: u64) -> Self {
        self.estimated_cost_minor = minor;
        self
    }

    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// The idempotency key in effect for this step, from the dedicated
    /// field or the `idempotency_key` input.
    #[must_use]
    pub fn effective_idempotency_key(&self) -> Option<&str> {
        if let Some(key) = self.idempotency_key.as_deref() {
            if !key.is_empty() {
                return Some(key);
            }
        }
        match self.inputs.get("idempotency_key") {
            Some(Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

/// Errors raised while validating a workflow spec.
#[derive(Debug, Error, Diagnostic)]
pub enum SpecError {
    #[error("workflow has no steps")]
    #[diagnostic(code(replayweave::spec::empty))]
    Empty,

    #[error("duplicate step id: {step_id}")]
    #[diagnostic(
        code(replayweave::spec::duplicate_step),
        help("Step ids must be unique within a workflow spec.")
    )]
    DuplicateStepId { step_id: String },

    #[error("step `{step_id}` depends on unknown step `{dependency}`")]
    #[diagnostic(code(replayweave::spec::unknown_dependency))]
    UnknownDependency { step_id: String, dependency: String },

    #[error("step `{step_id}` depends on later step `{dependency}`")]
    #[diagnostic(
        code(replayweave::spec::forward_dependency),
        help("`depends_on` may only name steps that appear earlier in the spec.")
    )]
    ForwardDependency { step_id: String, dependency: String },

    #[error("dependency cycle involving step `{step_id}`")]
    #[diagnostic(code(replayweave::spec::cycle))]
    Cycle { step_id: String },

    #[error("spec serialization failed: {0}")]
    #[diagnostic(code(replayweave::spec::serde))]
    Serde(#[from] serde_json::Error),
}

/// Immutable description of a workflow.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub workflow_id: String,
    pub version: u32,
    /// Ceiling on the sum of committed step costs, in a minor currency
    /// unit.
    pub workflow_ceiling_minor: u64,
    /// Optional run deadline; expiry is treated as cancellation with
    /// status `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub steps: Vec<StepDescriptor>,
}

impl WorkflowSpec {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            version: 1,
            workflow_ceiling_minor: u64::MAX,
            timeout_ms: None,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_ceiling_minor(mut self, ceiling: u64) -> Self {
        self.workflow_ceiling_minor = ceiling;
        self
    }

    #[must_use]
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    #[must_use]
    pub fn with_step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Position of a step in the declared order.
    #[must_use]
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }

    /// Reject duplicate ids, unknown/forward dependencies, and cycles.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.steps.is_empty() {
            return Err(SpecError::Empty);
        }
        let mut seen: FxHashSet<&str> = FxHashSet::default();
        for step in &self.steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(SpecError::DuplicateStepId {
                    step_id: step.step_id.clone(),
                });
            }
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    // Either the dependency does not exist at all, or it
                    // appears later in the list. Both are load errors;
                    // distinguishing them keeps diagnostics actionable.
                    if self.steps.iter().any(|s| &s.step_id == dep) {
                        return Err(SpecError::ForwardDependency {
                            step_id: step.step_id.clone(),
                            dependency: dep.clone(),
                        });
                    }
                    return Err(SpecError::UnknownDependency {
                        step_id: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                }
                if dep == &step.step_id {
                    return Err(SpecError::Cycle {
                        step_id: step.step_id.clone(),
                    });
                }
            }
        }
        // Prior-only dependencies already exclude cycles; run Kahn
        // anyway so a relaxation of the ordering rule cannot silently
        // admit one.
        self.schedule().map(|_| ())
    }

    /// Topological schedule over step indices.
    ///
    /// Kahn's algorithm with the ready set ordered by `step_id`
    /// lexicographically, so ties always break the same way.
    pub fn schedule(&self) -> Result<Vec<usize>, SpecError> {
        let index_of: FxHashMap<&str, usize> = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.step_id.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.steps.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];
        for (i, step) in self.steps.iter().enumerate() {
            for dep in &step.depends_on {
                let Some(&d) = index_of.get(dep.as_str()) else {
                    return Err(SpecError::UnknownDependency {
                        step_id: step.step_id.clone(),
                        dependency: dep.clone(),
                    });
                };
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: Vec<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());
        while !ready.is_empty() {
            ready.sort_by(|&a, &b| self.steps[a].step_id.cmp(&self.steps[b].step_id));
            let next = ready.remove(0);
            order.push(next);
            for &dep in &dependents[next] {
                indegree[dep] -= 1;
                if indegree[dep] == 0 {
                    ready.push(dep);
                }
            }
        }
        if order.len() != self.steps.len() {
            let stuck = indegree
                .iter()
                .position(|d| *d > 0)
                .map(|i| self.steps[i].step_id.clone())
                .unwrap_or_default();
            return Err(SpecError::Cycle { step_id: stuck });
        }
        Ok(order)
    }

    /// Canonical JSON form; byte-equality defines spec equivalence.
    pub fn canonical_json(&self) -> Result<String, SpecError> {
        let value = serde_json::to_value(self)?;
        Ok(canonical::to_canonical_json(&value))
    }

    /// Short content hash of the canonical form, used as `spec_id` in
    /// golden records when no external id is supplied.
    pub fn fingerprint(&self) -> Result<String, SpecError> {
        let value = serde_json::to_value(self)?;
        Ok(canonical::content_hash16(&value))
    }
}
