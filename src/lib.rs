//! # Replayweave: Deterministic Workflow Orchestration
//!
//! Replayweave executes directed, ordered graphs of typed skill
//! invocations under strict budget, rate, and policy constraints,
//! producing an append-only, HMAC-signed audit trail (the *golden
//! record*) of every semantic event. Re-running the same workflow with
//! the same seed and inputs produces a byte-identical record, modulo
//! explicitly excluded timing fields.
//!
//! ## Core Concepts
//!
//! - **Specs**: Immutable workflow descriptions; a DAG of steps with
//!   budgets, retries, and error modes
//! - **Skills**: Async units of work registered under string ids with
//!   declared metadata
//! - **Seeds**: Per-step deterministic seeds derived from the run's
//!   base seed and step index
//! - **Golden records**: Signed JSONL event logs, compared
//!   timestamp-tolerantly on replay
//! - **Checkpoints**: Durable resume-after-crash snapshots
//! - **Jobs**: Bulk work items claimed at-most-once by worker pools
//! - **Inboxes**: Single-slot reply routing for cross-workflow calls
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use replayweave::checkpoint::InMemoryCheckpointStore;
//! use replayweave::engine::{RunOptions, WorkflowEngine};
//! use replayweave::golden::MemoryGoldenRecorder;
//! use replayweave::skills::{SkillRegistry, builtin::EchoSkill};
//! use replayweave::spec::{StepDescriptor, WorkflowSpec};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = SkillRegistry::new();
//! registry.register("echo", Arc::new(EchoSkill::new()));
//!
//! let engine = WorkflowEngine::new(
//!     Arc::new(registry),
//!     Arc::new(InMemoryCheckpointStore::new()),
//!     Arc::new(MemoryGoldenRecorder::new()),
//! );
//!
//! let spec = WorkflowSpec::new("hello")
//!     .with_step(StepDescriptor::new("a", "echo").with_input("v", json!(1)))
//!     .with_step(
//!         StepDescriptor::new("b", "echo")
//!             .with_input("v", json!("${a.v}"))
//!             .with_depends_on(["a"]),
//!     );
//!
//! let result = engine.run(&spec, "run-1", 42, RunOptions::default()).await?;
//! assert!(result.is_completed());
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`spec`] - Workflow and step descriptions, validation, scheduling
//! - [`engine`] - The step driver: retries, error modes, resume
//! - [`skills`] - Skill trait, metadata, and registry
//! - [`canonical`] - Canonical JSON and content hashing
//! - [`seed`] - Deterministic seed derivation and retry jitter
//! - [`reference`] - `${step.path}` input reference resolution
//! - [`policy`] - Emergency stop, ceilings, idempotency, budgets
//! - [`sandbox`] - Static validation of untrusted plans
//! - [`golden`] - Signed append-only event records and comparison
//! - [`checkpoint`] - Durable resume-after-crash snapshots
//! - [`jobs`] - Bulk jobs with at-most-once item claims
//! - [`inbox`] - Correlated request/reply between workflows
//! - [`metrics`] - Pluggable counter/gauge/histogram sinks

pub mod canonical;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod golden;
pub mod inbox;
pub mod jobs;
pub mod metrics;
pub mod policy;
pub mod reference;
pub mod sandbox;
pub mod seed;
pub mod skills;
pub mod spec;
pub mod telemetry;
pub mod types;
