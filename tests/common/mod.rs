//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use replayweave::checkpoint::InMemoryCheckpointStore;
use replayweave::engine::WorkflowEngine;
use replayweave::golden::{MemoryGoldenRecorder, SigningSecret};
use replayweave::metrics::MemorySink;
use replayweave::policy::{PolicyEnforcer, PolicyLimits};
use replayweave::skills::builtin::EchoSkill;
use replayweave::skills::SkillRegistry;
use replayweave::spec::{StepDescriptor, WorkflowSpec};
use serde_json::json;

/// Engine plus handles on its observable surfaces.
pub struct TestHarness {
    pub engine: WorkflowEngine,
    pub golden: Arc<MemoryGoldenRecorder>,
    pub checkpoints: Arc<InMemoryCheckpointStore>,
    pub metrics: MemorySink,
    pub policy: Arc<PolicyEnforcer>,
}

/// Harness over the given registry with in-memory stores.
pub fn harness_with(registry: SkillRegistry) -> TestHarness {
    harness_with_limits(registry, PolicyLimits::default())
}

pub fn harness_with_limits(registry: SkillRegistry, limits: PolicyLimits) -> TestHarness {
    let golden = Arc::new(MemoryGoldenRecorder::with_secret(SigningSecret::new(
        b"test-secret".to_vec(),
    )));
    let checkpoints = Arc::new(InMemoryCheckpointStore::new());
    let metrics = MemorySink::new();
    let policy = Arc::new(PolicyEnforcer::new(limits));
    let engine = WorkflowEngine::new(
        Arc::new(registry),
        Arc::clone(&checkpoints) as _,
        Arc::clone(&golden) as _,
    )
    .with_policy(Arc::clone(&policy))
    .with_metrics(Arc::new(metrics.clone()));
    TestHarness {
        engine,
        golden,
        checkpoints,
        metrics,
        policy,
    }
}

/// Registry with the stock `echo` skill.
pub fn echo_registry() -> SkillRegistry {
    let mut registry = SkillRegistry::new();
    registry.register("echo", Arc::new(EchoSkill::new()));
    registry
}

/// The two-step linear spec used across determinism tests.
pub fn linear_spec() -> WorkflowSpec {
    WorkflowSpec::new("linear")
        .with_step(StepDescriptor::new("a", "echo").with_input("v", json!(1)))
        .with_step(
            StepDescriptor::new("b", "echo")
                .with_input("v", json!("${a.v}"))
                .with_depends_on(["a"]),
        )
}
