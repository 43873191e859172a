use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;

/// One actor's active run slot.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveRun {
    #[serde(rename = "runID")]
    pub run_id: String,
    #[serde(rename = "startedAtMs")]
    pub started_at_ms: u64,
    #[serde(rename = "lastActivityAtMs")]
    pub last_activity_at_ms: u64,
}

/// Per-actor mutual exclusion, owned by the orchestrator service. Acquire
/// fails immediately (no queueing) when the actor already holds a slot;
/// stale slots are reaped after the idle timeout.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    active: Arc<RwLock<HashMap<String, ActiveRun>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, actor_id: &str) -> Option<ActiveRun> {
        self.active.read().await.get(actor_id).cloned()
    }

    pub async fn acquire(&self, actor_id: &str, run_id: String) -> Result<ActiveRun, ActiveRun> {
        let mut guard = self.active.write().await;
        if let Some(existing) = guard.get(actor_id).cloned() {
            return Err(existing);
        }
        let now = now_ms();
        let run = ActiveRun {
            run_id,
            started_at_ms: now,
            last_activity_at_ms: now,
        };
        guard.insert(actor_id.to_string(), run.clone());
        Ok(run)
    }

    pub async fn touch(&self, actor_id: &str, run_id: &str) {
        let mut guard = self.active.write().await;
        if let Some(run) = guard.get_mut(actor_id) {
            if run.run_id == run_id {
                run.last_activity_at_ms = now_ms();
            }
        }
    }

    /// Releases the slot only if it still belongs to `run_id`, so a late
    /// finish from a reaped run cannot evict its successor.
    pub async fn release(&self, actor_id: &str, run_id: &str) -> Option<ActiveRun> {
        let mut guard = self.active.write().await;
        if let Some(run) = guard.get(actor_id) {
            if run.run_id == run_id {
                return guard.remove(actor_id);
            }
        }
        None
    }

    pub async fn reap_stale(&self, stale_ms: u64) -> Vec<(String, ActiveRun)> {
        let now = now_ms();
        let mut guard = self.active.write().await;
        let stale_ids = guard
            .iter()
            .filter_map(|(actor_id, run)| {
                if now.saturating_sub(run.last_activity_at_ms) > stale_ms {
                    Some(actor_id.clone())
                } else {
                    None
                }
            })
            .collect::<Vec<_>>();
        let mut out = Vec::with_capacity(stale_ids.len());
        for actor_id in stale_ids {
            if let Some(run) = guard.remove(&actor_id) {
                out.push((actor_id, run));
            }
        }
        out
    }
}

pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
