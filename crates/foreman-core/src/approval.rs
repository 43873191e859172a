use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_types::EngineEvent;

use crate::event_bus::EventBus;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    #[serde(rename = "runID")]
    pub run_id: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    pub status: String,
}

/// Explicit suspended-run approval: the request id is the stored continuation
/// key, the waiter is a watch channel, and the wait is bounded by a hard
/// timeout. Resolving from an external signal resumes the run.
#[derive(Clone)]
pub struct ApprovalManager {
    requests: Arc<RwLock<HashMap<String, ApprovalRequest>>>,
    waiters: Arc<RwLock<HashMap<String, watch::Sender<Option<ApprovalDecision>>>>>,
    event_bus: EventBus,
}

impl ApprovalManager {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub async fn ask(&self, run_id: &str, summary: &str, context: Option<Value>) -> ApprovalRequest {
        let req = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            summary: summary.to_string(),
            context: context.clone(),
            status: "pending".to_string(),
        };
        let (tx, _rx) = watch::channel(None);
        self.requests
            .write()
            .await
            .insert(req.id.clone(), req.clone());
        self.waiters.write().await.insert(req.id.clone(), tx);
        self.event_bus.publish(EngineEvent::new(
            "approval.asked",
            json!({
                "runID": run_id,
                "requestID": req.id,
                "summary": summary,
                "context": context,
            }),
        ));
        req
    }

    pub async fn list(&self) -> Vec<ApprovalRequest> {
        self.requests.read().await.values().cloned().collect()
    }

    pub async fn reply(&self, id: &str, approve: bool) -> bool {
        let decision = if approve {
            ApprovalDecision::Approved
        } else {
            ApprovalDecision::Rejected
        };
        {
            let mut requests = self.requests.write().await;
            let Some(req) = requests.get_mut(id) else {
                return false;
            };
            req.status = if approve { "approved" } else { "rejected" }.to_string();
        }
        self.event_bus.publish(EngineEvent::new(
            "approval.replied",
            json!({"requestID": id, "approved": approve}),
        ));
        if let Some(waiter) = self.waiters.read().await.get(id).cloned() {
            let _ = waiter.send(Some(decision));
        }
        true
    }

    /// Suspends until the external signal, the timeout, or cancellation.
    pub async fn wait_for_decision(
        &self,
        id: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ApprovalDecision {
        let Some(mut rx) = ({
            let waiters = self.waiters.read().await;
            waiters.get(id).map(|tx| tx.subscribe())
        }) else {
            return ApprovalDecision::Rejected;
        };

        let immediate = { rx.borrow().clone() };
        if let Some(decision) = immediate {
            self.waiters.write().await.remove(id);
            return decision;
        }

        let decision = tokio::select! {
            _ = cancel.cancelled() => ApprovalDecision::Cancelled,
            _ = tokio::time::sleep(timeout) => ApprovalDecision::TimedOut,
            changed = rx.changed() => {
                if changed.is_ok() {
                    rx.borrow().clone().unwrap_or(ApprovalDecision::Rejected)
                } else {
                    ApprovalDecision::Rejected
                }
            }
        };

        if decision == ApprovalDecision::TimedOut {
            if let Some(req) = self.requests.write().await.get_mut(id) {
                req.status = "timed_out".to_string();
            }
            self.event_bus.publish(EngineEvent::new(
                "approval.timed_out",
                json!({"requestID": id}),
            ));
        }
        self.waiters.write().await.remove(id);
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reply_resolves_the_waiting_run() {
        let bus = EventBus::new();
        let manager = ApprovalManager::new(bus);
        let request = manager.ask("run-1", "commit 2 files?", None).await;

        let id = request.id.clone();
        let manager_clone = manager.clone();
        tokio::spawn(async move {
            let _ = manager_clone.reply(&id, true).await;
        });

        let decision = manager
            .wait_for_decision(
                &request.id,
                Duration::from_secs(5),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(decision, ApprovalDecision::Approved);
    }

    #[tokio::test]
    async fn rejection_is_reported_as_rejected() {
        let bus = EventBus::new();
        let manager = ApprovalManager::new(bus);
        let request = manager.ask("run-1", "overwrite config?", None).await;

        manager.reply(&request.id, false).await;
        let decision = manager
            .wait_for_decision(
                &request.id,
                Duration::from_secs(5),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(decision, ApprovalDecision::Rejected);
    }

    #[tokio::test]
    async fn wait_times_out_with_a_hard_bound() {
        let bus = EventBus::new();
        let manager = ApprovalManager::new(bus);
        let request = manager.ask("run-1", "never answered", None).await;

        let decision = manager
            .wait_for_decision(
                &request.id,
                Duration::from_millis(20),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(decision, ApprovalDecision::TimedOut);
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let bus = EventBus::new();
        let manager = ApprovalManager::new(bus);
        let request = manager.ask("run-1", "pending", None).await;

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });

        let decision = manager
            .wait_for_decision(&request.id, Duration::from_secs(30), cancel)
            .await;
        assert_eq!(decision, ApprovalDecision::Cancelled);
    }

    #[tokio::test]
    async fn approval_asked_event_carries_run_and_request_ids() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let manager = ApprovalManager::new(bus);

        let request = manager.ask("run-9", "apply patch?", None).await;
        let event = rx.recv().await.expect("event");
        assert_eq!(event.event_type, "approval.asked");
        assert_eq!(
            event.properties.get("runID").and_then(|v| v.as_str()),
            Some("run-9")
        );
        assert_eq!(
            event.properties.get("requestID").and_then(|v| v.as_str()),
            Some(request.id.as_str())
        );
    }
}
