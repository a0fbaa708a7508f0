//! Policy enforcement: emergency stop, cost ceilings, idempotency,
//! and delegated agent budgets.
//!
//! The enforcer answers one question before every step: may this step
//! execute right now? Checks run in a fixed order — emergency stop,
//! step ceiling, workflow ceiling, idempotency, agent budget — and the
//! first failure wins. After a successful step the engine commits the
//! actual cost through [`PolicyEnforcer::record_spend`]; the invariant
//! is that committed spend never exceeds the workflow ceiling.
//!
//! The emergency stop is a process-wide atomic initialized from
//! `WORKFLOW_EMERGENCY_STOP` and hot-reloadable through
//! [`PolicyEnforcer::set_emergency_stop`]; nothing re-reads the
//! environment on the hot path.

pub mod ledger;

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::instrument;

use crate::skills::SkillRegistry;
use crate::spec::StepDescriptor;

pub use ledger::{BudgetLedger, InMemoryLedger, LedgerError, ReservationId};

/// Why a step was denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DenyKind {
    EmergencyStop,
    StepCeiling,
    WorkflowCeiling,
    IdempotencyMissing,
    AgentBudgetExceeded,
}

impl DenyKind {
    /// Stable label for metrics and golden statuses.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmergencyStop => "emergency_stop",
            Self::StepCeiling => "step_ceiling",
            Self::WorkflowCeiling => "workflow_ceiling",
            Self::IdempotencyMissing => "idempotency_missing",
            Self::AgentBudgetExceeded => "agent_budget_exceeded",
        }
    }

    /// Ceiling denials surface as `budget_exceeded` at the run level;
    /// everything else is a `policy_violation`.
    #[must_use]
    pub fn is_budget(self) -> bool {
        matches!(
            self,
            Self::StepCeiling | Self::WorkflowCeiling | Self::AgentBudgetExceeded
        )
    }
}

/// Outcome of a policy check.
#[derive(Clone, Debug)]
pub enum PolicyDecision {
    Allow {
        /// Ledger hold taken for the step when an agent id was given;
        /// the engine settles it on success and refunds on failure.
        reservation: Option<(String, ReservationId)>,
    },
    Deny {
        kind: DenyKind,
        reason: String,
    },
}

impl PolicyDecision {
    #[must_use]
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Static limits applied to every run through an enforcer.
#[derive(Clone, Copy, Debug)]
pub struct PolicyLimits {
    /// Per-step estimated-cost ceiling.
    pub step_ceiling_minor: u64,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            step_ceiling_minor: u64::MAX,
        }
    }
}

/// Per-run spend accounting plus the global stop switch.
pub struct PolicyEnforcer {
    emergency_stop: AtomicBool,
    limits: PolicyLimits,
    spend: Mutex<FxHashMap<String, u64>>,
    ledger: Option<Arc<dyn BudgetLedger>>,
}

impl PolicyEnforcer {
    #[must_use]
    pub fn new(limits: PolicyLimits) -> Self {
        Self {
            emergency_stop: AtomicBool::new(false),
            limits,
            spend: Mutex::new(FxHashMap::default()),
            ledger: None,
        }
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn BudgetLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn with_emergency_stop(self, stopped: bool) -> Self {
        self.emergency_stop.store(stopped, Ordering::SeqCst);
        self
    }

    /// Flip the process-wide stop switch. Takes effect at the next
    /// step boundary of every run; propagation is best-effort, not
    /// atomic with in-flight steps.
    pub fn set_emergency_stop(&self, stopped: bool) {
        self.emergency_stop.store(stopped, Ordering::SeqCst);
    }

    #[must_use]
    pub fn emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    /// Committed spend for a run, snapshotted under the accumulator
    /// mutex.
    #[must_use]
    pub fn committed_minor(&self, run_id: &str) -> u64 {
        self.lock_spend().get(run_id).copied().unwrap_or(0)
    }

    /// Drop a run's accumulator once the run reaches a terminal state.
    pub fn forget_run(&self, run_id: &str) {
        self.lock_spend().remove(run_id);
    }

    /// Commit the actual cost of a completed step.
    pub fn record_spend(&self, run_id: &str, actual_cost_minor: u64) {
        let mut spend = self.lock_spend();
        *spend.entry(run_id.to_string()).or_insert(0) += actual_cost_minor;
    }

    /// Run the ordered policy checks for one step.
    ///
    /// On `Allow` with an `agent_id`, the returned reservation is the
    /// ledger hold for the step's estimated cost.
    #[instrument(skip(self, step, registry), fields(step_id = %step.step_id))]
    pub async fn check_can_execute(
        &self,
        run_id: &str,
        step: &StepDescriptor,
        workflow_ceiling_minor: u64,
        registry: &SkillRegistry,
        agent_id: Option<&str>,
    ) -> PolicyDecision {
        if self.emergency_stopped() {
            return PolicyDecision::Deny {
                kind: DenyKind::EmergencyStop,
                reason: "emergency stop is engaged".to_string(),
            };
        }

        let estimated = step.estimated_cost_minor;
        if estimated > self.limits.step_ceiling_minor {
            return PolicyDecision::Deny {
                kind: DenyKind::StepCeiling,
                reason: format!(
                    "step `{}` estimates {estimated} over the step ceiling {}",
                    step.step_id, self.limits.step_ceiling_minor
                ),
            };
        }

        let committed = self.committed_minor(run_id);
        if committed.saturating_add(estimated) > workflow_ceiling_minor {
            return PolicyDecision::Deny {
                kind: DenyKind::WorkflowCeiling,
                reason: format!(
                    "committed {committed} plus estimated {estimated} exceeds workflow ceiling {workflow_ceiling_minor}"
                ),
            };
        }

        let side_effecting = registry
            .metadata(&step.skill_id)
            .map(|m| m.side_effecting)
            .unwrap_or(false);
        if side_effecting && step.effective_idempotency_key().is_none() {
            return PolicyDecision::Deny {
                kind: DenyKind::IdempotencyMissing,
                reason: format!(
                    "side-effecting skill `{}` requires a non-empty idempotency_key",
                    step.skill_id
                ),
            };
        }

        if let (Some(agent), Some(ledger)) = (agent_id, self.ledger.as_ref()) {
            match ledger.reserve(agent, estimated).await {
                Ok(reservation_id) => {
                    return PolicyDecision::Allow {
                        reservation: Some((agent.to_string(), reservation_id)),
                    };
                }
                Err(LedgerError::Denied { reason, .. }) => {
                    return PolicyDecision::Deny {
                        kind: DenyKind::AgentBudgetExceeded,
                        reason,
                    };
                }
                Err(err) => {
                    return PolicyDecision::Deny {
                        kind: DenyKind::AgentBudgetExceeded,
                        reason: format!("budget tracker unavailable: {err}"),
                    };
                }
            }
        }

        PolicyDecision::Allow { reservation: None }
    }

    /// Settle the ledger hold taken by a successful policy check.
    pub async fn settle_reservation(
        &self,
        agent_id: &str,
        reservation: &ReservationId,
        actual_minor: u64,
    ) -> Result<(), LedgerError> {
        match &self.ledger {
            Some(ledger) => ledger.settle(agent_id, reservation, actual_minor).await,
            None => Ok(()),
        }
    }

    /// Release the ledger hold for a step that did not complete.
    pub async fn refund_reservation(
        &self,
        agent_id: &str,
        reservation: &ReservationId,
    ) -> Result<(), LedgerError> {
        match &self.ledger {
            Some(ledger) => ledger.refund(agent_id, reservation).await,
            None => Ok(()),
        }
    }

    fn lock_spend(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, u64>> {
        match self.spend.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for PolicyEnforcer {
    fn default() -> Self {
        Self::new(PolicyLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skills::builtin::EchoSkill;
    use crate::skills::SkillMetadata;

    fn registry() -> SkillRegistry {
        let mut r = SkillRegistry::new();
        r.register("echo", Arc::new(EchoSkill::new()));
        r.register(
            "http_post",
            Arc::new(EchoSkill::with_metadata(
                SkillMetadata::new("1.0").side_effecting(),
            )),
        );
        r
    }

    #[tokio::test]
    async fn emergency_stop_denies_everything() {
        let enforcer = PolicyEnforcer::default().with_emergency_stop(true);
        let step = StepDescriptor::new("a", "echo");
        let decision = enforcer
            .check_can_execute("run", &step, u64::MAX, &registry(), None)
            .await;
        assert!(matches!(
            decision,
            PolicyDecision::Deny {
                kind: DenyKind::EmergencyStop,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn workflow_ceiling_counts_committed_spend() {
        let enforcer = PolicyEnforcer::default();
        enforcer.record_spend("run", 8);
        let step = StepDescriptor::new("a", "echo").with_estimated_cost(5);
        let decision = enforcer
            .check_can_execute("run", &step, 10, &registry(), None)
            .await;
        assert!(matches!(
            decision,
            PolicyDecision::Deny {
                kind: DenyKind::WorkflowCeiling,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn side_effecting_requires_idempotency_key() {
        let enforcer = PolicyEnforcer::default();
        let bare = StepDescriptor::new("a", "http_post");
        let decision = enforcer
            .check_can_execute("run", &bare, u64::MAX, &registry(), None)
            .await;
        assert!(matches!(
            decision,
            PolicyDecision::Deny {
                kind: DenyKind::IdempotencyMissing,
                ..
            }
        ));

        let keyed = StepDescriptor::new("a", "http_post").with_idempotency_key("k-1");
        let decision = enforcer
            .check_can_execute("run", &keyed, u64::MAX, &registry(), None)
            .await;
        assert!(decision.is_allow());
    }
}
