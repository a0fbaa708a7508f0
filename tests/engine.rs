//! Engine step-loop behavior: ordering, seeds, error modes, policy
//! interaction, cancellation.

mod common;

use std::sync::Arc;

use common::{echo_registry, harness_with, harness_with_limits, linear_spec};
use replayweave::checkpoint::CheckpointStore;
use replayweave::engine::{CancelHandle, RunOptions};
use replayweave::golden::GoldenRecorder;
use replayweave::policy::PolicyLimits;
use replayweave::seed::derive_step_seed;
use replayweave::skills::builtin::{EchoSkill, FailingSkill, FlakySkill};
use replayweave::skills::{SkillMetadata, SkillRegistry};
use replayweave::spec::{ErrorMode, StepDescriptor, WorkflowSpec};
use replayweave::types::{CancelIntent, ErrorKind, RunStatus, SkillErrorKind};
use serde_json::json;

#[tokio::test]
async fn two_step_linear_workflow_completes() {
    let h = harness_with(echo_registry());
    let result = h
        .engine
        .run(&linear_spec(), "run-1", 42, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.step("a").unwrap().output, json!({"v": 1}));
    assert_eq!(result.step("b").unwrap().output, json!({"v": 1}));

    let events = h.golden.events("run-1").await.unwrap();
    assert_eq!(events.len(), 4);
    assert_eq!(events[0]["event"], "run_start");
    assert_eq!(events[1]["event"], "step");
    assert_eq!(events[2]["event"], "step");
    assert_eq!(events[3]["event"], "run_end");
    assert_eq!(events[3]["status"], "completed");

    assert_eq!(events[1]["seed"].as_u64().unwrap(), derive_step_seed(42, 0));
    assert_eq!(events[2]["seed"].as_u64().unwrap(), derive_step_seed(42, 1));
    assert_eq!(events[1]["step_id"], "a");
    assert_eq!(events[2]["step_id"], "b");
}

#[tokio::test]
async fn missing_skill_fails_the_run() {
    let h = harness_with(echo_registry());
    let spec = WorkflowSpec::new("wf").with_step(StepDescriptor::new("a", "nonexistent"));
    let result = h
        .engine
        .run(&spec, "run-2", 1, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.step("a").unwrap().error_kind, Some(ErrorKind::Schema));

    let events = h.golden.events("run-2").await.unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1]["event"], "step");
    assert_eq!(events[2]["status"], "failed");
}

#[tokio::test]
async fn budget_exceeded_before_any_invocation() {
    let h = harness_with(echo_registry());
    let spec = WorkflowSpec::new("wf")
        .with_ceiling_minor(10)
        .with_step(StepDescriptor::new("a", "echo").with_estimated_cost(12));
    let result = h
        .engine
        .run(&spec, "run-3", 1, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::BudgetExceeded);
    assert!(result.steps.is_empty());

    // No step event: the skill was never invoked.
    let events = h.golden.events("run-3").await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["event"], "run_start");
    assert_eq!(events[1]["event"], "run_end");
    assert_eq!(h.metrics.counter_total("policy_denials_total"), 1);
}

#[tokio::test]
async fn committed_spend_trips_workflow_ceiling() {
    let mut registry = SkillRegistry::new();
    registry.register("echo", Arc::new(EchoSkill::new().with_cost(6)));
    let h = harness_with(registry);
    let spec = WorkflowSpec::new("wf")
        .with_ceiling_minor(10)
        .with_step(StepDescriptor::new("a", "echo").with_estimated_cost(6))
        .with_step(
            StepDescriptor::new("b", "echo")
                .with_estimated_cost(6)
                .with_depends_on(["a"]),
        );
    let result = h
        .engine
        .run(&spec, "run-4", 1, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::BudgetExceeded);
    // First step committed, second denied, nothing further spent.
    assert_eq!(result.steps.len(), 1);
    assert!(result.step("a").unwrap().success);
    assert_eq!(result.step("a").unwrap().cost_minor, 6);
}

#[tokio::test]
async fn emergency_stop_denies_runs() {
    let h = harness_with(echo_registry());
    h.policy.set_emergency_stop(true);
    let result = h
        .engine
        .run(&linear_spec(), "run-5", 1, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::PolicyViolation);

    // Hot reload: clearing the switch lets the next run through.
    h.policy.set_emergency_stop(false);
    let result = h
        .engine
        .run(&linear_spec(), "run-6", 1, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::Completed);
}

#[tokio::test]
async fn transient_failures_retry_and_recover() {
    let mut registry = echo_registry();
    let flaky = Arc::new(FlakySkill::new(2));
    registry.register("flaky", Arc::clone(&flaky) as _);
    let h = harness_with(registry);

    let spec = WorkflowSpec::new("wf").with_step(
        StepDescriptor::new("a", "flaky")
            .with_input("v", json!(7))
            .with_retries(3, 1),
    );
    let result = h
        .engine
        .run(&spec, "run-7", 9, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(result.step("a").unwrap().retries_used, 2);
    assert_eq!(flaky.invocations(), 3);
    assert_eq!(h.metrics.counter_total("step_retries_total"), 2);
}

#[tokio::test]
async fn permanent_failures_do_not_retry() {
    let mut registry = echo_registry();
    let failing = Arc::new(FailingSkill::new(SkillErrorKind::Permanent));
    registry.register("broken", Arc::clone(&failing) as _);
    let h = harness_with(registry);

    let spec = WorkflowSpec::new("wf")
        .with_step(StepDescriptor::new("a", "broken").with_retries(5, 1));
    let result = h
        .engine
        .run(&spec, "run-8", 9, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(result.step("a").unwrap().retries_used, 0);
    assert_eq!(failing.invocations(), 1);
}

#[tokio::test]
async fn continue_mode_poisons_intolerant_dependents() {
    let mut registry = echo_registry();
    registry.register(
        "broken",
        Arc::new(FailingSkill::new(SkillErrorKind::Permanent)),
    );
    let h = harness_with(registry);

    let spec = WorkflowSpec::new("wf")
        .with_step(StepDescriptor::new("a", "broken").with_error_mode(ErrorMode::Continue))
        .with_step(
            StepDescriptor::new("b", "echo")
                .with_input("v", json!("${a}"))
                .with_depends_on(["a"])
                .with_error_mode(ErrorMode::Continue),
        )
        .with_step(StepDescriptor::new("c", "echo").with_input("v", json!(3)));
    let result = h
        .engine
        .run(&spec, "run-9", 9, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    assert!(!result.step("a").unwrap().success);
    let b = result.step("b").unwrap();
    assert!(!b.success);
    assert_eq!(b.error_kind, Some(ErrorKind::UpstreamFailed));
    // Independent step still ran.
    assert!(result.step("c").unwrap().success);
}

#[tokio::test]
async fn continue_mode_feeds_null_to_tolerant_dependents() {
    let mut registry = SkillRegistry::new();
    registry.register(
        "broken",
        Arc::new(FailingSkill::new(SkillErrorKind::Permanent)),
    );
    registry.register(
        "echo",
        Arc::new(EchoSkill::with_metadata(
            SkillMetadata::new("1.0").with_null_tolerant_inputs(["v"]),
        )),
    );
    let h = harness_with(registry);

    let spec = WorkflowSpec::new("wf")
        .with_step(StepDescriptor::new("a", "broken").with_error_mode(ErrorMode::Continue))
        .with_step(
            StepDescriptor::new("b", "echo")
                .with_input("v", json!("${a}"))
                .with_depends_on(["a"]),
        );
    let result = h
        .engine
        .run(&spec, "run-10", 9, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Completed);
    let b = result.step("b").unwrap();
    assert!(b.success);
    assert_eq!(b.output, json!({"v": null}));
}

#[tokio::test]
async fn skip_mode_makes_references_unresolvable() {
    let mut registry = echo_registry();
    registry.register(
        "broken",
        Arc::new(FailingSkill::new(SkillErrorKind::Permanent)),
    );
    let h = harness_with(registry);

    let spec = WorkflowSpec::new("wf")
        .with_step(StepDescriptor::new("a", "broken").with_error_mode(ErrorMode::Skip))
        .with_step(
            StepDescriptor::new("b", "echo")
                .with_input("v", json!("${a}"))
                .with_depends_on(["a"]),
        );
    let result = h
        .engine
        .run(&spec, "run-11", 9, RunOptions::default())
        .await
        .unwrap();

    // The dependent fails on the unresolvable reference and aborts.
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result.step("a").unwrap().skipped);
    let b = result.step("b").unwrap();
    assert!(!b.success);
    assert_eq!(b.error_kind, Some(ErrorKind::Reference));
}

#[tokio::test]
async fn unresolved_reference_fails_before_invocation() {
    let h = harness_with(echo_registry());
    let spec = WorkflowSpec::new("wf")
        .with_step(StepDescriptor::new("a", "echo").with_input("v", json!("${ghost.field}")));
    let result = h
        .engine
        .run(&spec, "run-12", 9, RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Failed);
    assert_eq!(
        result.step("a").unwrap().error_kind,
        Some(ErrorKind::Reference)
    );
}

#[tokio::test]
async fn cancellation_stops_at_step_boundary() {
    let h = harness_with(echo_registry());
    let cancel = CancelHandle::new();
    cancel.cancel();
    let options = RunOptions::default()
        .with_cancel(cancel)
        .with_cancel_intent(CancelIntent::Pause);
    let result = h
        .engine
        .run(&linear_spec(), "run-13", 9, options)
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::Cancelled);
    assert!(result.steps.is_empty());

    let events = h.golden.events("run-13").await.unwrap();
    assert_eq!(events.last().unwrap()["status"], "cancelled");
    // Pause intent keeps the checkpoint resumable.
    let checkpoint = h.checkpoints.load("run-13").await.unwrap().unwrap();
    assert!(checkpoint.status.is_resumable());
}

#[tokio::test]
async fn step_ceiling_denies_expensive_steps() {
    let h = harness_with_limits(
        echo_registry(),
        PolicyLimits {
            step_ceiling_minor: 5,
        },
    );
    let spec = WorkflowSpec::new("wf")
        .with_step(StepDescriptor::new("a", "echo").with_estimated_cost(9));
    let result = h
        .engine
        .run(&spec, "run-14", 9, RunOptions::default())
        .await
        .unwrap();
    assert_eq!(result.status, RunStatus::BudgetExceeded);
}
