//! Policy enforcer: check order, budget monotonicity, ledger
//! integration.

use std::sync::Arc;

use replayweave::policy::{
    BudgetLedger, DenyKind, InMemoryLedger, PolicyDecision, PolicyEnforcer, PolicyLimits,
};
use replayweave::skills::builtin::EchoSkill;
use replayweave::skills::{SkillMetadata, SkillRegistry};
use replayweave::spec::StepDescriptor;
use serde_json::json;

fn registry() -> SkillRegistry {
    let mut r = SkillRegistry::new();
    r.register("echo", Arc::new(EchoSkill::new()));
    r.register(
        "db_write",
        Arc::new(EchoSkill::with_metadata(
            SkillMetadata::new("1.0").side_effecting(),
        )),
    );
    r
}

#[tokio::test]
async fn emergency_stop_wins_over_everything() {
    let enforcer = PolicyEnforcer::default().with_emergency_stop(true);
    // Even a zero-cost side-effect-free step is denied.
    let step = StepDescriptor::new("a", "echo");
    let decision = enforcer
        .check_can_execute("r", &step, u64::MAX, &registry(), None)
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
async fn step_ceiling_checked_before_workflow_ceiling() {
    let enforcer = PolicyEnforcer::new(PolicyLimits {
        step_ceiling_minor: 5,
    });
    // Over both ceilings; the step ceiling fires first.
    let step = StepDescriptor::new("a", "echo").with_estimated_cost(100);
    let decision = enforcer
        .check_can_execute("r", &step, 10, &registry(), None)
        .await;
    assert!(matches!(
        decision,
        PolicyDecision::Deny {
            kind: DenyKind::StepCeiling,
            ..
        }
    ));
}

#[tokio::test]
async fn spend_accumulates_until_ceiling() {
    let enforcer = PolicyEnforcer::default();
    let step = StepDescriptor::new("a", "echo").with_estimated_cost(4);

    for expected in [4u64, 8] {
        let decision = enforcer
            .check_can_execute("r", &step, 10, &registry(), None)
            .await;
        assert!(decision.is_allow());
        enforcer.record_spend("r", 4);
        assert_eq!(enforcer.committed_minor("r"), expected);
    }

    // 8 committed + 4 estimated > 10: denied, and nothing further is
    // committed.
    let decision = enforcer
        .check_can_execute("r", &step, 10, &registry(), None)
        .await;
    assert!(matches!(
        decision,
        PolicyDecision::Deny {
            kind: DenyKind::WorkflowCeiling,
            ..
        }
    ));
    assert_eq!(enforcer.committed_minor("r"), 8);
}

#[tokio::test]
async fn idempotency_key_accepted_from_inputs() {
    let enforcer = PolicyEnforcer::default();
    let via_input = StepDescriptor::new("a", "db_write")
        .with_input("idempotency_key", json!("key-9"));
    assert!(enforcer
        .check_can_execute("r", &via_input, u64::MAX, &registry(), None)
        .await
        .is_allow());

    let empty_key = StepDescriptor::new("a", "db_write").with_input("idempotency_key", json!(""));
    assert!(matches!(
        enforcer
            .check_can_execute("r", &empty_key, u64::MAX, &registry(), None)
            .await,
        PolicyDecision::Deny {
            kind: DenyKind::IdempotencyMissing,
            ..
        }
    ));
}

#[tokio::test]
async fn agent_budget_delegates_to_ledger() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.set_budget("agent-1", 10);
    let enforcer = PolicyEnforcer::default().with_ledger(Arc::clone(&ledger) as _);

    let step = StepDescriptor::new("a", "echo").with_estimated_cost(8);
    let decision = enforcer
        .check_can_execute("r", &step, u64::MAX, &registry(), Some("agent-1"))
        .await;
    let PolicyDecision::Allow {
        reservation: Some((agent, reservation_id)),
    } = decision
    else {
        panic!("expected allow with reservation");
    };
    assert_eq!(agent, "agent-1");

    // Second reservation exceeds the agent budget.
    let denied = enforcer
        .check_can_execute("r", &step, u64::MAX, &registry(), Some("agent-1"))
        .await;
    assert!(matches!(
        denied,
        PolicyDecision::Deny {
            kind: DenyKind::AgentBudgetExceeded,
            ..
        }
    ));

    // Settle the first hold for its actual (smaller) cost.
    enforcer
        .settle_reservation("agent-1", &reservation_id, 6)
        .await
        .unwrap();
    assert_eq!(ledger.spent("agent-1"), 6);
}

#[tokio::test]
async fn refund_releases_the_hold() {
    let ledger = Arc::new(InMemoryLedger::new());
    ledger.set_budget("agent-1", 10);
    let r1 = ledger.reserve("agent-1", 10).await.unwrap();
    assert!(ledger.reserve("agent-1", 1).await.is_err());
    ledger.refund("agent-1", &r1).await.unwrap();
    assert!(ledger.reserve("agent-1", 10).await.is_ok());
}
