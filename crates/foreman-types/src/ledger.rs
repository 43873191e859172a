use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Reserved,
    Reconciled,
}

/// Admission-control record for one run. A reservation is reconciled exactly
/// once, on every exit path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditReservation {
    pub id: String,
    #[serde(rename = "runID")]
    pub run_id: String,
    #[serde(rename = "actorID")]
    pub actor_id: String,
    pub estimated_credits: u64,
    pub actual_credits: Option<u64>,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl CreditReservation {
    pub fn new(run_id: &str, actor_id: &str, estimated_credits: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            actor_id: actor_id.to_string(),
            estimated_credits,
            actual_credits: None,
            state: ReservationState::Reserved,
            created_at: Utc::now(),
            reconciled_at: None,
        }
    }
}
