//! Workflow engine: the step driver.
//!
//! [`runner::WorkflowEngine`] executes a validated spec step by step:
//! topological order, reference resolution, policy check, seeded skill
//! invocation with retry, golden event, checkpoint. The types here are
//! the engine's public vocabulary — per-step results, the run result,
//! run options, and the cancellation handle.

pub mod runner;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde_json::Value;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::golden::GoldenError;
use crate::inbox::InboxError;
use crate::spec::SpecError;
use crate::types::{CancelIntent, ErrorKind, RunStatus};

pub use runner::{CROSS_INVOKE_SKILL_ID, InvokeRequest, WorkflowDispatcher, WorkflowEngine};

/// Outcome of one executed (or attempted) step.
#[derive(Clone, Debug)]
pub struct StepResult {
    pub step_id: String,
    pub success: bool,
    /// True when `error_mode = skip` marked the step skipped after its
    /// failure.
    pub skipped: bool,
    /// The skill's output on success, `null` otherwise.
    pub output: Value,
    pub cost_minor: u64,
    /// Retries consumed; never part of the golden record.
    pub retries_used: u32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl StepResult {
    pub(crate) fn succeeded(step_id: &str, output: Value, cost_minor: u64, retries: u32) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: true,
            skipped: false,
            output,
            cost_minor,
            retries_used: retries,
            error_kind: None,
            error_message: None,
        }
    }

    pub(crate) fn failed(
        step_id: &str,
        kind: ErrorKind,
        message: impl Into<String>,
        retries: u32,
    ) -> Self {
        Self {
            step_id: step_id.to_string(),
            success: false,
            skipped: false,
            output: Value::Null,
            cost_minor: 0,
            retries_used: retries,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }

    pub(crate) fn into_skipped(mut self) -> Self {
        self.skipped = true;
        self
    }
}

/// Terminal result of a run. Callers inspect this rather than
/// exceptions; `Err` from the engine means the run never started.
#[derive(Clone, Debug)]
pub struct WorkflowResult {
    pub run_id: String,
    pub status: RunStatus,
    /// Per-step results in execution order.
    pub steps: Vec<StepResult>,
}

impl WorkflowResult {
    #[must_use]
    pub fn step(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Cooperative cancellation flag, checked at every step boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Per-run knobs.
#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Reproduce a previous run byte-for-byte; surfaced to skills so
    /// externally nondeterministic ones answer from fixtures.
    pub replay: bool,
    /// Ledger account charged for the run's steps.
    pub agent_id: Option<String>,
    pub cancel: CancelHandle,
    /// Checkpoint status a cancelled run leaves behind.
    pub cancel_intent: CancelIntent,
}

impl RunOptions {
    #[must_use]
    pub fn replay() -> Self {
        Self {
            replay: true,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_cancel_intent(mut self, intent: CancelIntent) -> Self {
        self.cancel_intent = intent;
        self
    }
}

/// Errors that prevent a run from starting or continuing. A run that
/// started always produces a `WorkflowResult` instead.
#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("plan rejected by sandbox: {}", violations.join("; "))]
    #[diagnostic(
        code(replayweave::engine::plan_rejected),
        help("Fix the listed violations; plans with violations never execute.")
    )]
    PlanRejected { violations: Vec<String> },

    #[error("no checkpoint found for run `{run_id}`")]
    #[diagnostic(code(replayweave::engine::missing_checkpoint))]
    MissingCheckpoint { run_id: String },

    #[error("checkpoint for run `{run_id}` is not resumable (status {status})")]
    #[diagnostic(code(replayweave::engine::not_resumable))]
    NotResumable { run_id: String, status: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Spec(#[from] SpecError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Golden(#[from] GoldenError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Inbox(#[from] InboxError),
}

/// Step outputs accumulated during a run, keyed by step id.
pub type StepOutputs = FxHashMap<String, Value>;
