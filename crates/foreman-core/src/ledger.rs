use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;

use foreman_types::{CreditReservation, EngineEvent, ReservationState, RunScope};

use crate::event_bus::EventBus;

/// Credits charged per thousand estimated tokens.
const CREDITS_PER_KILOTOKEN: u64 = 10;

pub fn credits_for_tokens(estimated_tokens: u64) -> u64 {
    (estimated_tokens.saturating_mul(CREDITS_PER_KILOTOKEN)).div_ceil(1000)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Approved {
        reservation_id: String,
        credits_reserved: u64,
    },
    Denied {
        reason: String,
    },
}

/// Admission-control primitive: reserve an estimated cost before the run
/// starts, reconcile to the actual cost when it ends. At most one
/// un-reconciled reservation per run; reconciliation is exactly-once.
#[derive(Clone)]
pub struct CreditLedger {
    balances: Arc<RwLock<HashMap<String, u64>>>,
    reservations: Arc<RwLock<HashMap<String, CreditReservation>>>,
    event_bus: EventBus,
}

impl CreditLedger {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            balances: Arc::new(RwLock::new(HashMap::new())),
            reservations: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub async fn set_balance(&self, actor_id: &str, credits: u64) {
        self.balances
            .write()
            .await
            .insert(actor_id.to_string(), credits);
    }

    pub async fn balance(&self, actor_id: &str) -> u64 {
        self.balances
            .read()
            .await
            .get(actor_id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn reserve(
        &self,
        run_id: &str,
        actor_id: &str,
        estimated_input_tokens: u64,
        estimated_output_tokens: u64,
        scope: RunScope,
    ) -> AdmissionOutcome {
        let estimated_credits =
            credits_for_tokens(estimated_input_tokens.saturating_add(estimated_output_tokens));

        {
            let reservations = self.reservations.read().await;
            if reservations
                .values()
                .any(|r| r.run_id == run_id && r.state == ReservationState::Reserved)
            {
                return AdmissionOutcome::Denied {
                    reason: format!("run `{run_id}` already holds a reservation"),
                };
            }
        }

        // The platform scope is the free path: no balance check, no debit.
        if scope != RunScope::Platform {
            let mut balances = self.balances.write().await;
            let available = balances.get(actor_id).copied().unwrap_or(0);
            if available < estimated_credits {
                tracing::warn!(
                    actor_id,
                    estimated_credits,
                    available,
                    "admission denied: insufficient balance"
                );
                return AdmissionOutcome::Denied {
                    reason: format!(
                        "insufficient balance: {estimated_credits} credits required, {available} available"
                    ),
                };
            }
            balances.insert(actor_id.to_string(), available - estimated_credits);
        }

        let reservation = CreditReservation::new(run_id, actor_id, estimated_credits);
        let reservation_id = reservation.id.clone();
        self.reservations
            .write()
            .await
            .insert(reservation_id.clone(), reservation);
        self.event_bus.publish(EngineEvent::new(
            "credit.reserved",
            json!({
                "runID": run_id,
                "actorID": actor_id,
                "reservationID": reservation_id,
                "creditsReserved": estimated_credits
            }),
        ));
        AdmissionOutcome::Approved {
            reservation_id,
            credits_reserved: estimated_credits,
        }
    }

    /// Settles the reservation against the actual cost and refunds the
    /// difference. A second call for the same reservation is a no-op so
    /// every exit path can reconcile without double-settling.
    pub async fn reconcile(&self, reservation_id: &str, actual_credits: u64) -> bool {
        let (run_id, actor_id, refund) = {
            let mut reservations = self.reservations.write().await;
            let Some(reservation) = reservations.get_mut(reservation_id) else {
                return false;
            };
            if reservation.state == ReservationState::Reconciled {
                return false;
            }
            reservation.state = ReservationState::Reconciled;
            reservation.actual_credits = Some(actual_credits);
            reservation.reconciled_at = Some(Utc::now());
            let refund = reservation.estimated_credits.saturating_sub(actual_credits);
            (
                reservation.run_id.clone(),
                reservation.actor_id.clone(),
                refund,
            )
        };

        if refund > 0 {
            let mut balances = self.balances.write().await;
            if let Some(balance) = balances.get_mut(&actor_id) {
                *balance = balance.saturating_add(refund);
            }
        }

        self.event_bus.publish(EngineEvent::new(
            "credit.reconciled",
            json!({
                "runID": run_id,
                "actorID": actor_id,
                "reservationID": reservation_id,
                "actualCredits": actual_credits,
                "refunded": refund
            }),
        ));
        true
    }

    pub async fn reservation(&self, reservation_id: &str) -> Option<CreditReservation> {
        self.reservations.read().await.get(reservation_id).cloned()
    }

    pub async fn reservations_for_run(&self, run_id: &str) -> Vec<CreditReservation> {
        self.reservations
            .read()
            .await
            .values()
            .filter(|r| r.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> CreditLedger {
        CreditLedger::new(EventBus::new())
    }

    #[tokio::test]
    async fn reserve_debits_and_reconcile_refunds() {
        let ledger = ledger();
        ledger.set_balance("actor-1", 100).await;

        let outcome = ledger
            .reserve("run-1", "actor-1", 3_000, 1_000, RunScope::Project)
            .await;
        let AdmissionOutcome::Approved {
            reservation_id,
            credits_reserved,
        } = outcome
        else {
            panic!("expected approval");
        };
        assert_eq!(credits_reserved, 40);
        assert_eq!(ledger.balance("actor-1").await, 60);

        assert!(ledger.reconcile(&reservation_id, 25).await);
        assert_eq!(ledger.balance("actor-1").await, 75);

        let reservation = ledger.reservation(&reservation_id).await.expect("reservation");
        assert_eq!(reservation.state, ReservationState::Reconciled);
        assert_eq!(reservation.actual_credits, Some(25));
    }

    #[tokio::test]
    async fn insufficient_balance_is_denied_without_a_reservation() {
        let ledger = ledger();
        ledger.set_balance("actor-1", 5).await;

        let outcome = ledger
            .reserve("run-1", "actor-1", 10_000, 0, RunScope::Project)
            .await;
        assert!(matches!(outcome, AdmissionOutcome::Denied { .. }));
        assert!(ledger.reservations_for_run("run-1").await.is_empty());
        assert_eq!(ledger.balance("actor-1").await, 5);
    }

    #[tokio::test]
    async fn platform_scope_bypasses_balance_checks() {
        let ledger = ledger();
        let outcome = ledger
            .reserve("run-1", "owner", 500_000, 100_000, RunScope::Platform)
            .await;
        assert!(matches!(outcome, AdmissionOutcome::Approved { .. }));
    }

    #[tokio::test]
    async fn reconcile_is_exactly_once() {
        let ledger = ledger();
        ledger.set_balance("actor-1", 100).await;
        let AdmissionOutcome::Approved { reservation_id, .. } = ledger
            .reserve("run-1", "actor-1", 4_000, 0, RunScope::Project)
            .await
        else {
            panic!("expected approval");
        };

        assert!(ledger.reconcile(&reservation_id, 0).await);
        let balance_after_first = ledger.balance("actor-1").await;
        assert!(!ledger.reconcile(&reservation_id, 0).await);
        assert_eq!(ledger.balance("actor-1").await, balance_after_first);
    }

    #[tokio::test]
    async fn one_unreconciled_reservation_per_run() {
        let ledger = ledger();
        ledger.set_balance("actor-1", 1_000).await;
        let AdmissionOutcome::Approved { reservation_id, .. } = ledger
            .reserve("run-1", "actor-1", 1_000, 0, RunScope::Project)
            .await
        else {
            panic!("expected approval");
        };

        let second = ledger
            .reserve("run-1", "actor-1", 1_000, 0, RunScope::Project)
            .await;
        assert!(matches!(second, AdmissionOutcome::Denied { .. }));

        ledger.reconcile(&reservation_id, 1).await;
        let third = ledger
            .reserve("run-1", "actor-1", 1_000, 0, RunScope::Project)
            .await;
        assert!(matches!(third, AdmissionOutcome::Approved { .. }));
    }
}
