//! The step driver.
//!
//! One `WorkflowEngine` serves many runs; each run is driven by a
//! single task walking the spec's topological schedule. Per step:
//! resolve references, ask policy, invoke the skill with the derived
//! seed and retry policy, then commit — spend, golden step event,
//! checkpoint — before moving on. Terminal transitions write the final
//! checkpoint and the `run_end` event; a record without `run_end` is
//! the signature of a crashed, resumable run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStatus, CheckpointStore};
use crate::golden::compare::{CompareOptions, CompareReport, compare_events};
use crate::golden::{GoldenError, GoldenRecorder};
use crate::inbox::{InboxError, InboxRouter};
use crate::metrics::{MetricSink, NullSink, names};
use crate::policy::{PolicyDecision, PolicyEnforcer};
use crate::reference::{referenced_steps, resolve_value};
use crate::sandbox::PlanSandbox;
use crate::seed::{backoff_with_jitter, derive_step_seed};
use crate::skills::{SkillContext, SkillError, SkillOutput, SkillRegistry};
use crate::spec::{ErrorMode, StepDescriptor, WorkflowSpec};
use crate::types::{CancelIntent, ErrorKind, RunStatus, SkillErrorKind};

use super::{EngineError, RunOptions, StepOutputs, StepResult, WorkflowResult};

/// Virtual skill id for cross-workflow invocation. Steps using it are
/// executed by the engine itself through the reply inbox.
pub const CROSS_INVOKE_SKILL_ID: &str = "workflow_invoke";

const DEFAULT_INVOKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Request handed to the dispatcher when a step invokes another
/// workflow. The callee must post its result to the caller's inbox
/// under `invoke_id`.
#[derive(Clone, Debug)]
pub struct InvokeRequest {
    pub invoke_id: String,
    pub target_workflow: String,
    pub inputs: FxHashMap<String, Value>,
}

/// Transport that delivers an [`InvokeRequest`] to the callee's
/// engine. External collaborator; tests drive it in-process.
#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    async fn dispatch(&self, request: InvokeRequest) -> Result<(), SkillError>;
}

/// Executes workflow specs. See the module docs for the step loop.
pub struct WorkflowEngine {
    registry: Arc<SkillRegistry>,
    checkpoints: Arc<dyn CheckpointStore>,
    golden: Arc<dyn GoldenRecorder>,
    policy: Arc<PolicyEnforcer>,
    sandbox: PlanSandbox,
    metrics: Arc<dyn MetricSink>,
    inbox: Arc<InboxRouter>,
    dispatcher: Option<Arc<dyn WorkflowDispatcher>>,
    invoke_timeout: Duration,
}

impl WorkflowEngine {
    #[must_use]
    pub fn new(
        registry: Arc<SkillRegistry>,
        checkpoints: Arc<dyn CheckpointStore>,
        golden: Arc<dyn GoldenRecorder>,
    ) -> Self {
        Self {
            registry,
            checkpoints,
            golden,
            policy: Arc::new(PolicyEnforcer::default()),
            sandbox: PlanSandbox::new(),
            metrics: Arc::new(NullSink),
            inbox: Arc::new(InboxRouter::new()),
            dispatcher: None,
            invoke_timeout: DEFAULT_INVOKE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<PolicyEnforcer>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_sandbox(mut self, sandbox: PlanSandbox) -> Self {
        self.sandbox = sandbox;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_inbox(mut self, inbox: Arc<InboxRouter>) -> Self {
        self.inbox = inbox;
        self
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn WorkflowDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    #[must_use]
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = timeout;
        self
    }

    /// The reply inbox; callee engines post cross-workflow results
    /// into it.
    #[must_use]
    pub fn inbox(&self) -> Arc<InboxRouter> {
        Arc::clone(&self.inbox)
    }

    /// The policy enforcer shared by every run on this engine.
    #[must_use]
    pub fn policy(&self) -> Arc<PolicyEnforcer> {
        Arc::clone(&self.policy)
    }

    /// Execute a spec from the beginning.
    #[instrument(skip(self, spec, options), fields(workflow_id = %spec.workflow_id))]
    pub async fn run(
        &self,
        spec: &WorkflowSpec,
        run_id: &str,
        seed: u64,
        options: RunOptions,
    ) -> Result<WorkflowResult, EngineError> {
        self.preflight(spec)?;
        let schedule = spec.schedule()?;
        self.golden
            .record_run_start(run_id, &spec.workflow_id, seed, options.replay)
            .await?;
        self.metrics.counter(
            names::RUNS_STARTED,
            &[("status", if options.replay { "replay" } else { "fresh" })],
            1,
        );
        self.drive(
            spec,
            &schedule,
            run_id,
            seed,
            options,
            0,
            StepOutputs::default(),
            Vec::new(),
        )
        .await
    }

    /// Resume a crashed or paused run from its checkpoint. Steps
    /// before the checkpointed index are never re-invoked; their
    /// outputs come from the stored map.
    #[instrument(skip(self, spec, options), fields(workflow_id = %spec.workflow_id))]
    pub async fn resume(
        &self,
        spec: &WorkflowSpec,
        run_id: &str,
        seed: u64,
        options: RunOptions,
    ) -> Result<WorkflowResult, EngineError> {
        self.preflight(spec)?;
        let schedule = spec.schedule()?;
        let checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::MissingCheckpoint {
                run_id: run_id.to_string(),
            })?;
        if !checkpoint.status.is_resumable() {
            return Err(EngineError::NotResumable {
                run_id: run_id.to_string(),
                status: checkpoint.status.encode().to_string(),
            });
        }
        let start = checkpoint.next_step_index.min(schedule.len());
        let mut prior = Vec::with_capacity(start);
        for &step_idx in schedule.iter().take(start) {
            let step = &spec.steps[step_idx];
            match checkpoint.step_outputs.get(&step.step_id) {
                Some(output) => {
                    prior.push(StepResult::succeeded(&step.step_id, output.clone(), 0, 0));
                }
                None => {
                    prior.push(
                        StepResult::failed(
                            &step.step_id,
                            ErrorKind::Reference,
                            "skipped before resume",
                            0,
                        )
                        .into_skipped(),
                    );
                }
            }
        }
        debug!(run_id, start, "resuming from checkpoint");
        self.drive(
            spec,
            &schedule,
            run_id,
            seed,
            options,
            start,
            checkpoint.step_outputs,
            prior,
        )
        .await
    }

    /// Verify a run's golden signature. Tamper marks the run failed
    /// and bumps the tamper counter before surfacing the error.
    pub async fn verify_golden(&self, run_id: &str) -> Result<(), EngineError> {
        match self.golden.verify(run_id).await {
            Ok(()) => Ok(()),
            Err(GoldenError::Tamper { run_id: id }) => {
                self.metrics.counter(names::GOLDEN_TAMPER, &[], 1);
                if let Some(checkpoint) = self.checkpoints.load(&id).await? {
                    self.checkpoints
                        .save(
                            &id,
                            &checkpoint.workflow_id,
                            checkpoint.next_step_index,
                            &checkpoint.step_outputs,
                            CheckpointStatus::Failed,
                        )
                        .await?;
                }
                Err(GoldenError::Tamper { run_id: id }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Compare a run's golden record against an expected stream,
    /// counting mismatches into `replay_mismatches_total`.
    pub async fn verify_replay(
        &self,
        run_id: &str,
        expected: &[Value],
    ) -> Result<CompareReport, EngineError> {
        let actual = self.golden.events(run_id).await?;
        let report = compare_events(&actual, expected, CompareOptions::default());
        if !report.is_match() {
            self.metrics.counter(names::REPLAY_MISMATCHES, &[], 1);
        }
        Ok(report)
    }

    fn preflight(&self, spec: &WorkflowSpec) -> Result<(), EngineError> {
        spec.validate()?;
        let report = self.sandbox.validate(spec);
        if !report.valid {
            return Err(EngineError::PlanRejected {
                violations: report.violations,
            });
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        spec: &WorkflowSpec,
        schedule: &[usize],
        run_id: &str,
        seed: u64,
        options: RunOptions,
        start_pos: usize,
        mut outputs: StepOutputs,
        mut results: Vec<StepResult>,
    ) -> Result<WorkflowResult, EngineError> {
        let deadline = spec
            .timeout_ms
            .map(|ms| tokio::time::Instant::now() + Duration::from_millis(ms));

        for (pos, &step_idx) in schedule.iter().enumerate().skip(start_pos) {
            if options.cancel.is_cancelled() {
                let checkpoint_status = match options.cancel_intent {
                    CancelIntent::Pause => CheckpointStatus::Paused,
                    CancelIntent::Terminate => CheckpointStatus::Cancelled,
                };
                return self
                    .finish(
                        spec,
                        run_id,
                        pos,
                        &outputs,
                        results,
                        RunStatus::Cancelled,
                        checkpoint_status,
                    )
                    .await;
            }
            if let Some(deadline) = deadline {
                // Deadline expiry is cancellation with status `failed`.
                if tokio::time::Instant::now() >= deadline {
                    return self
                        .finish(
                            spec,
                            run_id,
                            pos,
                            &outputs,
                            results,
                            RunStatus::Failed,
                            CheckpointStatus::Failed,
                        )
                        .await;
                }
            }

            let step = &spec.steps[step_idx];
            let step_seed = derive_step_seed(seed, pos as u64);
            let mut retries_used = 0u32;

            let attempt = match self.resolve_step_inputs(step, &outputs) {
                Err(failure) => Err(failure),
                Ok(resolved) => {
                    match self
                        .policy
                        .check_can_execute(
                            run_id,
                            step,
                            spec.workflow_ceiling_minor,
                            &self.registry,
                            options.agent_id.as_deref(),
                        )
                        .await
                    {
                        PolicyDecision::Deny { kind, reason } => {
                            warn!(run_id, step_id = %step.step_id, kind = kind.as_str(), %reason, "policy denial");
                            self.metrics
                                .counter(names::POLICY_DENIALS, &[("kind", kind.as_str())], 1);
                            let status = if kind.is_budget() {
                                RunStatus::BudgetExceeded
                            } else {
                                RunStatus::PolicyViolation
                            };
                            return self
                                .finish(
                                    spec,
                                    run_id,
                                    pos,
                                    &outputs,
                                    results,
                                    status,
                                    CheckpointStatus::Failed,
                                )
                                .await;
                        }
                        PolicyDecision::Allow { reservation } => {
                            let started = std::time::Instant::now();
                            let invoked = self
                                .invoke_with_retry(
                                    step,
                                    resolved,
                                    step_seed,
                                    options.replay,
                                    &mut retries_used,
                                )
                                .await;
                            self.metrics.histogram(
                                names::STEP_DURATION_SECONDS,
                                &[("skill_id", step.skill_id.as_str())],
                                started.elapsed().as_secs_f64(),
                            );
                            match invoked {
                                Ok(output) => {
                                    self.policy.record_spend(run_id, output.cost_minor);
                                    if let Some((agent, reservation_id)) = reservation {
                                        if let Err(e) = self
                                            .policy
                                            .settle_reservation(
                                                &agent,
                                                &reservation_id,
                                                output.cost_minor,
                                            )
                                            .await
                                        {
                                            warn!(run_id, %agent, error = %e, "reservation settle failed");
                                        }
                                    }
                                    Ok(output)
                                }
                                Err(failure) => {
                                    if let Some((agent, reservation_id)) = reservation {
                                        if let Err(e) = self
                                            .policy
                                            .refund_reservation(&agent, &reservation_id)
                                            .await
                                        {
                                            warn!(run_id, %agent, error = %e, "reservation refund failed");
                                        }
                                    }
                                    Err(failure)
                                }
                            }
                        }
                    }
                }
            };

            match attempt {
                Ok(output) => {
                    self.golden
                        .record_step(run_id, pos as u64, &step.step_id, step_seed, output.output.clone())
                        .await?;
                    outputs.insert(step.step_id.clone(), output.output.clone());
                    self.save_checkpoint(spec, run_id, pos + 1, &outputs, CheckpointStatus::Running)
                        .await?;
                    results.push(StepResult::succeeded(
                        &step.step_id,
                        output.output,
                        output.cost_minor,
                        retries_used,
                    ));
                }
                Err((kind, message)) => {
                    // Attempted steps always leave exactly one step
                    // event; failures record a null output.
                    self.golden
                        .record_step(run_id, pos as u64, &step.step_id, step_seed, Value::Null)
                        .await?;
                    debug!(run_id, step_id = %step.step_id, %kind, %message, "step failed");
                    match step.error_mode {
                        ErrorMode::Abort => {
                            results.push(StepResult::failed(
                                &step.step_id,
                                kind,
                                message,
                                retries_used,
                            ));
                            return self
                                .finish(
                                    spec,
                                    run_id,
                                    pos + 1,
                                    &outputs,
                                    results,
                                    RunStatus::Failed,
                                    CheckpointStatus::Failed,
                                )
                                .await;
                        }
                        ErrorMode::Continue => {
                            // The failed step propagates a null output;
                            // dependents decide via null tolerance.
                            outputs.insert(step.step_id.clone(), Value::Null);
                            self.save_checkpoint(
                                spec,
                                run_id,
                                pos + 1,
                                &outputs,
                                CheckpointStatus::Running,
                            )
                            .await?;
                            results.push(StepResult::failed(
                                &step.step_id,
                                kind,
                                message,
                                retries_used,
                            ));
                        }
                        ErrorMode::Skip => {
                            self.save_checkpoint(
                                spec,
                                run_id,
                                pos + 1,
                                &outputs,
                                CheckpointStatus::Running,
                            )
                            .await?;
                            results.push(
                                StepResult::failed(&step.step_id, kind, message, retries_used)
                                    .into_skipped(),
                            );
                        }
                    }
                }
            }
        }

        self.finish(
            spec,
            run_id,
            schedule.len(),
            &outputs,
            results,
            RunStatus::Completed,
            CheckpointStatus::Completed,
        )
        .await
    }

    /// Resolve one step's inputs against accumulated outputs.
    ///
    /// A predecessor that finished with a null output (the
    /// `error_mode = continue` marker) poisons every input referencing
    /// it unless the skill declares that input null-tolerant.
    fn resolve_step_inputs(
        &self,
        step: &StepDescriptor,
        outputs: &StepOutputs,
    ) -> Result<FxHashMap<String, Value>, (ErrorKind, String)> {
        let metadata = self.registry.metadata(&step.skill_id);
        let mut resolved = FxHashMap::default();
        for (name, value) in &step.inputs {
            let refs = referenced_steps(value);
            let null_predecessor = refs
                .iter()
                .find(|r| matches!(outputs.get(&r.step_id), Some(Value::Null)));
            if let Some(pred) = null_predecessor {
                let tolerant = metadata
                    .as_ref()
                    .map(|m| m.tolerates_null(name))
                    .unwrap_or(false);
                if tolerant {
                    resolved.insert(name.clone(), Value::Null);
                    continue;
                }
                return Err((
                    ErrorKind::UpstreamFailed,
                    format!(
                        "input `{name}` references step `{}` which failed upstream",
                        pred.step_id
                    ),
                ));
            }
            match resolve_value(value, outputs) {
                Ok(v) => {
                    resolved.insert(name.clone(), v);
                }
                Err(e) => return Err((ErrorKind::Reference, e.to_string())),
            }
        }
        Ok(resolved)
    }

    async fn invoke_with_retry(
        &self,
        step: &StepDescriptor,
        inputs: FxHashMap<String, Value>,
        step_seed: u64,
        replay: bool,
        retries_used: &mut u32,
    ) -> Result<SkillOutput, (ErrorKind, String)> {
        let mut attempt = 0u32;
        loop {
            match self.invoke_once(step, inputs.clone(), step_seed, replay).await {
                Ok(output) => return Ok(output),
                Err((kind, message)) => {
                    let declared_retryable = matches!(kind, ErrorKind::Skill(k) if self
                        .registry
                        .metadata(&step.skill_id)
                        .map(|m| m.retryable_errors.contains(&k))
                        .unwrap_or(false));
                    if (kind.is_retryable() || declared_retryable) && attempt < step.max_retries {
                        if let ErrorKind::Skill(skill_kind) = kind {
                            let kind_label = skill_kind.to_string();
                            self.metrics.counter(
                                names::STEP_RETRIES,
                                &[
                                    ("skill_id", step.skill_id.as_str()),
                                    ("error_kind", kind_label.as_str()),
                                ],
                                1,
                            );
                        }
                        let delay =
                            backoff_with_jitter(step.retry_backoff_base_ms, attempt, step_seed);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        *retries_used = attempt;
                        continue;
                    }
                    return Err((kind, message));
                }
            }
        }
    }

    async fn invoke_once(
        &self,
        step: &StepDescriptor,
        inputs: FxHashMap<String, Value>,
        seed: u64,
        replay: bool,
    ) -> Result<SkillOutput, (ErrorKind, String)> {
        if step.skill_id == CROSS_INVOKE_SKILL_ID {
            return self.invoke_subworkflow(&inputs).await;
        }
        let Some(skill) = self.registry.get(&step.skill_id) else {
            return Err((
                ErrorKind::Schema,
                format!("unknown skill `{}`", step.skill_id),
            ));
        };
        if let Err(e) = self.registry.check_required_inputs(&step.skill_id, &inputs) {
            return Err((ErrorKind::Schema, e.to_string()));
        }
        let ctx = SkillContext {
            inputs,
            seed,
            replay,
        };
        skill
            .invoke(ctx)
            .await
            .map_err(|e| (ErrorKind::Skill(e.kind), e.message))
    }

    /// Cross-workflow invoke: register a fresh inbox slot, dispatch,
    /// suspend on the reply.
    async fn invoke_subworkflow(
        &self,
        inputs: &FxHashMap<String, Value>,
    ) -> Result<SkillOutput, (ErrorKind, String)> {
        let Some(dispatcher) = &self.dispatcher else {
            return Err((
                ErrorKind::Schema,
                "no workflow dispatcher configured".to_string(),
            ));
        };
        let Some(Value::String(target)) = inputs.get("workflow") else {
            return Err((
                ErrorKind::Schema,
                "workflow_invoke requires a string `workflow` input".to_string(),
            ));
        };
        let timeout = inputs
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis)
            .unwrap_or(self.invoke_timeout);

        let invoke_id = Uuid::new_v4().to_string();
        let waiter = self
            .inbox
            .register(&invoke_id)
            .map_err(|e| (ErrorKind::Schema, e.to_string()))?;
        let request = InvokeRequest {
            invoke_id: invoke_id.clone(),
            target_workflow: target.clone(),
            inputs: inputs.clone(),
        };
        if let Err(e) = dispatcher.dispatch(request).await {
            waiter.abandon();
            return Err((ErrorKind::Skill(e.kind), e.message));
        }
        match waiter.wait(timeout).await {
            Ok(value) => Ok(SkillOutput::new(value)),
            Err(InboxError::Timeout { .. }) => {
                self.metrics.counter(names::INBOX_TIMEOUTS, &[], 1);
                Err((
                    ErrorKind::InboxTimeout,
                    format!("no reply within {} ms", timeout.as_millis()),
                ))
            }
            Err(e) => Err((
                ErrorKind::Skill(SkillErrorKind::UpstreamUnavailable),
                e.to_string(),
            )),
        }
    }

    async fn save_checkpoint(
        &self,
        spec: &WorkflowSpec,
        run_id: &str,
        next_step_index: usize,
        outputs: &StepOutputs,
        status: CheckpointStatus,
    ) -> Result<(), EngineError> {
        let started = std::time::Instant::now();
        self.checkpoints
            .save(run_id, &spec.workflow_id, next_step_index, outputs, status)
            .await?;
        self.metrics.histogram(
            names::CHECKPOINT_SAVE_SECONDS,
            &[],
            started.elapsed().as_secs_f64(),
        );
        Ok(())
    }

    /// Terminal transition: final checkpoint, then `run_end`. A crash
    /// between the two leaves a record without `run_end`, which resume
    /// tooling treats as an unclosed run.
    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        spec: &WorkflowSpec,
        run_id: &str,
        next_step_index: usize,
        outputs: &StepOutputs,
        results: Vec<StepResult>,
        status: RunStatus,
        checkpoint_status: CheckpointStatus,
    ) -> Result<WorkflowResult, EngineError> {
        self.save_checkpoint(spec, run_id, next_step_index, outputs, checkpoint_status)
            .await?;
        self.golden.record_run_end(run_id, status).await?;
        self.metrics
            .counter(names::RUNS_COMPLETED, &[("status", status.as_str())], 1);
        self.policy.forget_run(run_id);
        debug!(run_id, status = status.as_str(), "run finished");
        Ok(WorkflowResult {
            run_id: run_id.to_string(),
            status,
            steps: results,
        })
    }
}
