//! Abstract budget/ledger interface consumed by policy and jobs.
//!
//! The real ledger is an external system; the orchestrator only speaks
//! reserve/settle/refund. `settle` is idempotent on the reservation id.

use std::sync::Mutex;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use uuid::Uuid;

/// Opaque reservation handle issued by [`BudgetLedger::reserve`].
pub type ReservationId = String;

#[derive(Debug, Error, Diagnostic)]
pub enum LedgerError {
    #[error("reservation denied for agent `{agent_id}`: {reason}")]
    #[diagnostic(
        code(replayweave::ledger::denied),
        help("The agent's remaining budget does not cover the requested amount.")
    )]
    Denied { agent_id: String, reason: String },

    #[error("unknown reservation: {reservation_id}")]
    #[diagnostic(code(replayweave::ledger::unknown_reservation))]
    UnknownReservation { reservation_id: String },

    #[error("ledger backend error: {message}")]
    #[diagnostic(code(replayweave::ledger::backend))]
    Backend { message: String },
}

/// Reservation-based budget tracker keyed by agent id.
#[async_trait]
pub trait BudgetLedger: Send + Sync {
    /// Place a hold of `amount_minor` against the agent's budget.
    async fn reserve(&self, agent_id: &str, amount_minor: u64)
    -> Result<ReservationId, LedgerError>;

    /// Convert a hold into actual spend. Idempotent on
    /// `reservation_id`: settling twice charges once.
    async fn settle(
        &self,
        agent_id: &str,
        reservation_id: &ReservationId,
        actual_minor: u64,
    ) -> Result<(), LedgerError>;

    /// Release a hold without spending.
    async fn refund(&self, agent_id: &str, reservation_id: &ReservationId)
    -> Result<(), LedgerError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum HoldState {
    Held(u64),
    Settled(u64),
    Refunded,
}

#[derive(Default)]
struct LedgerInner {
    budgets: FxHashMap<String, u64>,
    holds: FxHashMap<ReservationId, (String, HoldState)>,
    spent: FxHashMap<String, u64>,
}

/// In-process ledger used by tests and single-node deployments.
///
/// Agents without a configured budget are treated as unlimited.
#[derive(Default)]
pub struct InMemoryLedger {
    inner: Mutex<LedgerInner>,
}

impl InMemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap the named agent's total reservable budget.
    pub fn set_budget(&self, agent_id: impl Into<String>, budget_minor: u64) {
        let mut inner = self.lock();
        inner.budgets.insert(agent_id.into(), budget_minor);
    }

    /// Total settled spend for an agent.
    #[must_use]
    pub fn spent(&self, agent_id: &str) -> u64 {
        self.lock().spent.get(agent_id).copied().unwrap_or(0)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerInner> {
        // A poisoned ledger mutex means a panic mid-update; propagating
        // the inner state is still safe because every update is a
        // single insert.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn outstanding(inner: &LedgerInner, agent_id: &str) -> u64 {
        inner
            .holds
            .values()
            .filter(|(agent, _)| agent == agent_id)
            .map(|(_, state)| match state {
                HoldState::Held(amount) | HoldState::Settled(amount) => *amount,
                HoldState::Refunded => 0,
            })
            .sum()
    }
}

#[async_trait]
impl BudgetLedger for InMemoryLedger {
    async fn reserve(
        &self,
        agent_id: &str,
        amount_minor: u64,
    ) -> Result<ReservationId, LedgerError> {
        let mut inner = self.lock();
        if let Some(&budget) = inner.budgets.get(agent_id) {
            let used = Self::outstanding(&inner, agent_id);
            if used.saturating_add(amount_minor) > budget {
                return Err(LedgerError::Denied {
                    agent_id: agent_id.to_string(),
                    reason: format!(
                        "requested {amount_minor} with {used} of {budget} already held"
                    ),
                });
            }
        }
        let id = Uuid::new_v4().to_string();
        inner
            .holds
            .insert(id.clone(), (agent_id.to_string(), HoldState::Held(amount_minor)));
        Ok(id)
    }

    async fn settle(
        &self,
        agent_id: &str,
        reservation_id: &ReservationId,
        actual_minor: u64,
    ) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let (holder, state) =
            inner
                .holds
                .get(reservation_id)
                .cloned()
                .ok_or_else(|| LedgerError::UnknownReservation {
                    reservation_id: reservation_id.clone(),
                })?;
        if holder != agent_id {
            return Err(LedgerError::UnknownReservation {
                reservation_id: reservation_id.clone(),
            });
        }
        if matches!(state, HoldState::Settled(_)) {
            return Ok(());
        }
        inner
            .holds
            .insert(reservation_id.clone(), (holder, HoldState::Settled(actual_minor)));
        *inner.spent.entry(agent_id.to_string()).or_insert(0) += actual_minor;
        Ok(())
    }

    async fn refund(
        &self,
        agent_id: &str,
        reservation_id: &ReservationId,
    ) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let (holder, _) =
            inner
                .holds
                .get(reservation_id)
                .cloned()
                .ok_or_else(|| LedgerError::UnknownReservation {
                    reservation_id: reservation_id.clone(),
                })?;
        if holder != agent_id {
            return Err(LedgerError::UnknownReservation {
                reservation_id: reservation_id.clone(),
            });
        }
        inner
            .holds
            .insert(reservation_id.clone(), (holder, HoldState::Refunded));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_respects_budget() {
        let ledger = InMemoryLedger::new();
        ledger.set_budget("agent", 100);
        let r1 = ledger.reserve("agent", 60).await.unwrap();
        assert!(ledger.reserve("agent", 60).await.is_err());
        ledger.refund("agent", &r1).await.unwrap();
        ledger.reserve("agent", 60).await.unwrap();
    }

    #[tokio::test]
    async fn settle_is_idempotent() {
        let ledger = InMemoryLedger::new();
        let r = ledger.reserve("agent", 10).await.unwrap();
        ledger.settle("agent", &r, 7).await.unwrap();
        ledger.settle("agent", &r, 7).await.unwrap();
        assert_eq!(ledger.spent("agent"), 7);
    }
}
