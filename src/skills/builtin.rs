//! Built-in skills: the `echo` reference skill and test doubles.
//!
//! `echo` returns its resolved inputs as its output, which makes it the
//! workhorse of determinism tests — its output is a pure function of
//! the inputs. The fault-injection skills exist so retry and error-mode
//! behavior can be exercised without real collaborators.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::{Skill, SkillContext, SkillError, SkillMetadata, SkillOutput};
use crate::types::SkillErrorKind;

/// Echoes the resolved inputs back as the step output.
pub struct EchoSkill {
    metadata: SkillMetadata,
    cost_minor: u64,
}

impl EchoSkill {
    #[must_use]
    pub fn new() -> Self {
        Self::with_metadata(SkillMetadata::new("1.0"))
    }

    #[must_use]
    pub fn with_metadata(metadata: SkillMetadata) -> Self {
        Self {
            metadata,
            cost_minor: 0,
        }
    }

    #[must_use]
    pub fn with_cost(mut self, cost_minor: u64) -> Self {
        self.cost_minor = cost_minor;
        self
    }
}

impl Default for EchoSkill {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Skill for EchoSkill {
    fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    async fn invoke(&self, ctx: SkillContext) -> Result<SkillOutput, SkillError> {
        let mut out = Map::new();
        for (k, v) in ctx.inputs {
            out.insert(k, v);
        }
        Ok(SkillOutput::new(Value::Object(out)).with_cost(self.cost_minor))
    }
}

/// Fails with a fixed kind every time.
pub struct FailingSkill {
    metadata: SkillMetadata,
    kind: SkillErrorKind,
    invocations: AtomicUsize,
}

impl FailingSkill {
    #[must_use]
    pub fn new(kind: SkillErrorKind) -> Self {
        Self {
            metadata: SkillMetadata::new("1.0"),
            kind,
            invocations: AtomicUsize::new(0),
        }
    }

    /// How many times the engine actually invoked this skill; retry
    /// tests assert on it.
    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Skill for FailingSkill {
    fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    async fn invoke(&self, _ctx: SkillContext) -> Result<SkillOutput, SkillError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Err(SkillError::new(self.kind, "injected failure"))
    }
}

/// Fails transiently `failures` times, then succeeds by echoing.
pub struct FlakySkill {
    metadata: SkillMetadata,
    failures: u32,
    remaining: AtomicU32,
    invocations: AtomicUsize,
}

impl FlakySkill {
    #[must_use]
    pub fn new(failures: u32) -> Self {
        Self {
            metadata: SkillMetadata::new("1.0"),
            failures,
            remaining: AtomicU32::new(failures),
            invocations: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn invocations(&self) -> usize {
        self.invocations.load(Ordering::SeqCst)
    }

    /// Rearm the failure budget (between test runs).
    pub fn reset(&self) {
        self.remaining.store(self.failures, Ordering::SeqCst);
    }
}

#[async_trait]
impl Skill for FlakySkill {
    fn metadata(&self) -> &SkillMetadata {
        &self.metadata
    }

    async fn invoke(&self, ctx: SkillContext) -> Result<SkillOutput, SkillError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |r| r.checked_sub(1))
            .is_ok()
        {
            return Err(SkillError::transient("not yet"));
        }
        let mut out = Map::new();
        for (k, v) in ctx.inputs {
            out.insert(k, v);
        }
        Ok(SkillOutput::new(Value::Object(out)))
    }
}

/// Wraps another skill and counts invocations; resume tests use it to
/// prove completed steps are not re-executed.
pub struct CountingSkill {
    inner: Arc<dyn Skill>,
    invocations: Arc<AtomicUsize>,
}

impl CountingSkill {
    #[must_use]
    pub fn new(inner: Arc<dyn Skill>) -> Self {
        Self {
            inner,
            invocations: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.invocations)
    }
}

#[async_trait]
impl Skill for CountingSkill {
    fn metadata(&self) -> &SkillMetadata {
        self.inner.metadata()
    }

    async fn invoke(&self, ctx: SkillContext) -> Result<SkillOutput, SkillError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.inner.invoke(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;
    use serde_json::json;

    fn ctx(inputs: FxHashMap<String, Value>) -> SkillContext {
        SkillContext {
            inputs,
            seed: 7,
            replay: false,
        }
    }

    #[tokio::test]
    async fn echo_returns_inputs() {
        let mut inputs = FxHashMap::default();
        inputs.insert("v".to_string(), json!(1));
        let out = EchoSkill::new().invoke(ctx(inputs)).await.unwrap();
        assert_eq!(out.output, json!({"v": 1}));
    }

    #[tokio::test]
    async fn flaky_recovers_after_failures() {
        let skill = FlakySkill::new(2);
        assert!(skill.invoke(ctx(FxHashMap::default())).await.is_err());
        assert!(skill.invoke(ctx(FxHashMap::default())).await.is_err());
        assert!(skill.invoke(ctx(FxHashMap::default())).await.is_ok());
        assert_eq!(skill.invocations(), 3);
    }
}
