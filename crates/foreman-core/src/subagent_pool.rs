use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use foreman_types::{EngineEvent, SubagentJob, SubagentJobStatus, ToolInvocation};

use crate::event_bus::EventBus;
use crate::storage::Storage;

/// Result of one delegated sub-run.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub success: bool,
    pub summary: String,
    pub mutated_files: Vec<String>,
}

/// The reduced reasoning-and-tool loop a job runs on. The engine wires a
/// nested orchestrator in here; tests wire scripted runners.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run(&self, job: SubagentJob) -> anyhow::Result<JobReport>;
}

#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub running: Vec<SubagentJob>,
    pub queued: Vec<SubagentJob>,
    pub completed: Vec<SubagentJob>,
}

#[derive(Default)]
struct ActorLanes {
    running: Vec<String>,
    queued: VecDeque<String>,
    slots: Vec<Option<String>>,
}

struct PoolState {
    jobs: HashMap<String, SubagentJob>,
    lanes: HashMap<String, ActorLanes>,
    /// Parent run to report completions to, per job.
    parents: HashMap<String, String>,
}

/// Concurrency-bounded worker queue for delegated sub-runs: at most
/// `capacity` jobs running per actor, FIFO beyond that, promotion as slots
/// free. Job failure never touches siblings or the parent loop.
#[derive(Clone)]
pub struct SubagentPool {
    capacity: usize,
    runner: Arc<dyn SubagentRunner>,
    storage: Arc<Storage>,
    state: Arc<RwLock<PoolState>>,
    event_bus: EventBus,
}

impl SubagentPool {
    pub fn new(
        capacity: usize,
        runner: Arc<dyn SubagentRunner>,
        storage: Arc<Storage>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            runner,
            storage,
            state: Arc::new(RwLock::new(PoolState {
                jobs: HashMap::new(),
                lanes: HashMap::new(),
                parents: HashMap::new(),
            })),
            event_bus,
        }
    }

    pub async fn enqueue(
        &self,
        actor_id: &str,
        parent_run_id: &str,
        description: &str,
        file_refs: Vec<String>,
    ) -> anyhow::Result<String> {
        let job = SubagentJob::new(actor_id, description, file_refs);
        let job_id = job.id.clone();
        self.storage.save_job(job.clone()).await?;

        let start_now = {
            let mut state = self.state.write().await;
            state.jobs.insert(job_id.clone(), job);
            state
                .parents
                .insert(job_id.clone(), parent_run_id.to_string());
            let lanes = state.lanes.entry(actor_id.to_string()).or_default();
            if lanes.running.len() < self.capacity {
                true
            } else {
                lanes.queued.push_back(job_id.clone());
                false
            }
        };

        self.event_bus.publish(EngineEvent::new(
            "subagent.enqueued",
            json!({"jobID": job_id, "actorID": actor_id, "runID": parent_run_id}),
        ));

        if start_now {
            self.start_job(actor_id.to_string(), job_id.clone()).await;
        }
        Ok(job_id)
    }

    pub async fn status(&self, actor_id: &str) -> PoolSnapshot {
        let state = self.state.read().await;
        let mut snapshot = PoolSnapshot::default();
        for job in state.jobs.values().filter(|j| j.actor_id == actor_id) {
            match job.status {
                SubagentJobStatus::Running => snapshot.running.push(job.clone()),
                SubagentJobStatus::Queued => snapshot.queued.push(job.clone()),
                SubagentJobStatus::Completed | SubagentJobStatus::Failed => {
                    snapshot.completed.push(job.clone())
                }
            }
        }
        snapshot.queued.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        snapshot
    }

    pub async fn job(&self, job_id: &str) -> Option<SubagentJob> {
        self.state.read().await.jobs.get(job_id).cloned()
    }

    // Returns an explicitly-boxed `Send` future rather than being an `async
    // fn`: `start_job` -> `finish_job` -> `start_job` forms an async recursion
    // cycle whose `Send`-ness the compiler cannot auto-infer. Boxing here gives
    // `finish_job`'s `await` a concrete `Send` type and breaks the cycle.
    fn start_job(
        &self,
        actor_id: String,
        job_id: String,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let job = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(job) = state.jobs.get_mut(&job_id) else {
                return;
            };
            let lanes = state.lanes.entry(actor_id.clone()).or_default();
            lanes.slots.resize(self.capacity, None);
            let slot = lanes.slots.iter().position(|s| s.is_none()).unwrap_or(0);
            lanes.slots[slot] = Some(job_id.clone());
            lanes.running.push(job_id.clone());
            job.status = SubagentJobStatus::Running;
            job.slot = Some(slot as u8);
            job.clone()
        };
        let _ = self.storage.save_job(job.clone()).await;
        self.event_bus.publish(EngineEvent::new(
            "subagent.started",
            json!({"jobID": job.id, "actorID": actor_id, "slot": job.slot}),
        ));

        let pool = self.clone();
        tokio::spawn(async move {
            let report = pool.runner.run(job.clone()).await;
            pool.finish_job(actor_id, job, report).await;
        });
        })
    }

    async fn finish_job(
        &self,
        actor_id: String,
        job: SubagentJob,
        report: anyhow::Result<JobReport>,
    ) {
        let (status, summary, mutated_files, success) = match report {
            Ok(report) => (
                if report.success {
                    SubagentJobStatus::Completed
                } else {
                    SubagentJobStatus::Failed
                },
                report.summary,
                report.mutated_files,
                report.success,
            ),
            Err(err) => (
                SubagentJobStatus::Failed,
                format!("subagent crashed: {err}"),
                Vec::new(),
                false,
            ),
        };

        let (updated, parent_run_id, next_job) = {
            let mut state = self.state.write().await;
            let parent = state.parents.remove(&job.id);
            let lanes = state.lanes.entry(actor_id.clone()).or_default();
            lanes.running.retain(|id| id != &job.id);
            for slot in lanes.slots.iter_mut() {
                if slot.as_deref() == Some(job.id.as_str()) {
                    *slot = None;
                }
            }
            let next_job = lanes.queued.pop_front();
            let updated = state.jobs.get_mut(&job.id).map(|entry| {
                entry.status = status;
                entry.result = Some(summary.clone());
                entry.clone()
            });
            (updated, parent, next_job)
        };

        if let Some(updated) = updated {
            let _ = self.storage.save_job(updated).await;
        }

        // Completion reports land on the parent run's invocation log, so the
        // parent sees delegated file mutations the same way it sees its own
        // tool results.
        if let Some(parent_run_id) = parent_run_id {
            let input = json!({"jobID": job.id, "description": job.description});
            let invocation = if success {
                ToolInvocation::success(
                    &parent_run_id,
                    "delegate",
                    input,
                    format!("{summary}\nmutated: {}", mutated_files.join(", ")),
                    0,
                )
            } else {
                ToolInvocation::failure(&parent_run_id, "delegate", input, summary.clone(), 0)
            };
            let _ = self.storage.append_invocation(invocation).await;
        }

        self.event_bus.publish(EngineEvent::new(
            if success {
                "subagent.completed"
            } else {
                "subagent.failed"
            },
            json!({
                "jobID": job.id,
                "actorID": actor_id,
                "summary": summary,
                "mutatedFiles": mutated_files,
            }),
        ));

        // Promote the next queued job within the same scheduling step.
        if let Some(next_id) = next_job {
            self.start_job(actor_id, next_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Runner that blocks until the test releases a permit, then succeeds.
    struct GatedRunner {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl SubagentRunner for GatedRunner {
        async fn run(&self, job: SubagentJob) -> anyhow::Result<JobReport> {
            let _permit = self.gate.acquire().await?;
            Ok(JobReport {
                success: true,
                summary: format!("done: {}", job.description),
                mutated_files: vec!["src/patched.rs".to_string()],
            })
        }
    }

    struct FailingRunner;

    #[async_trait]
    impl SubagentRunner for FailingRunner {
        async fn run(&self, _job: SubagentJob) -> anyhow::Result<JobReport> {
            anyhow::bail!("boom")
        }
    }

    async fn wait_until<F, Fut>(mut predicate: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if predicate().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within timeout");
    }

    async fn pool_with_runner(runner: Arc<dyn SubagentRunner>) -> (SubagentPool, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        let pool = SubagentPool::new(2, runner, storage, EventBus::new());
        (pool, dir)
    }

    #[tokio::test]
    async fn three_jobs_yield_two_running_one_queued() {
        let gate = Arc::new(Semaphore::new(0));
        let (pool, _dir) = pool_with_runner(Arc::new(GatedRunner { gate: gate.clone() })).await;

        for idx in 0..3 {
            pool.enqueue("actor-1", "run-1", &format!("job {idx}"), vec![])
                .await
                .expect("enqueue");
        }

        wait_until(|| async {
            let status = pool.status("actor-1").await;
            status.running.len() == 2 && status.queued.len() == 1
        })
        .await;

        let status = pool.status("actor-1").await;
        let slots = status
            .running
            .iter()
            .filter_map(|j| j.slot)
            .collect::<std::collections::HashSet<_>>();
        assert_eq!(slots.len(), 2, "running jobs occupy distinct slots");
    }

    #[tokio::test]
    async fn completing_a_job_promotes_the_queued_one() {
        let gate = Arc::new(Semaphore::new(0));
        let (pool, _dir) = pool_with_runner(Arc::new(GatedRunner { gate: gate.clone() })).await;

        for idx in 0..3 {
            pool.enqueue("actor-1", "run-1", &format!("job {idx}"), vec![])
                .await
                .expect("enqueue");
        }
        wait_until(|| async { pool.status("actor-1").await.running.len() == 2 }).await;

        gate.add_permits(1);
        wait_until(|| async {
            let status = pool.status("actor-1").await;
            status.completed.len() == 1 && status.running.len() == 2 && status.queued.is_empty()
        })
        .await;

        gate.add_permits(2);
        wait_until(|| async { pool.status("actor-1").await.completed.len() == 3 }).await;
    }

    #[tokio::test]
    async fn caps_are_per_actor() {
        let gate = Arc::new(Semaphore::new(0));
        let (pool, _dir) = pool_with_runner(Arc::new(GatedRunner { gate: gate.clone() })).await;

        pool.enqueue("actor-1", "run-1", "a", vec![]).await.expect("enqueue");
        pool.enqueue("actor-2", "run-2", "b", vec![]).await.expect("enqueue");
        pool.enqueue("actor-2", "run-2", "c", vec![]).await.expect("enqueue");

        wait_until(|| async {
            pool.status("actor-1").await.running.len() == 1
                && pool.status("actor-2").await.running.len() == 2
        })
        .await;
    }

    #[tokio::test]
    async fn failure_reports_to_parent_log_and_spares_siblings() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        let pool = SubagentPool::new(2, Arc::new(FailingRunner), storage.clone(), EventBus::new());

        pool.enqueue("actor-1", "run-parent", "doomed", vec![])
            .await
            .expect("enqueue");

        wait_until(|| async { pool.status("actor-1").await.completed.len() == 1 }).await;

        let status = pool.status("actor-1").await;
        assert_eq!(status.completed[0].status, SubagentJobStatus::Failed);

        let log = storage.invocations_for_run("run-parent").await;
        assert_eq!(log.len(), 1);
        assert!(!log[0].success);
        assert_eq!(log[0].tool, "delegate");
        assert!(log[0].error.as_deref().unwrap_or_default().contains("boom"));
    }

    #[tokio::test]
    async fn successful_job_reports_mutated_files_to_parent() {
        let gate = Arc::new(Semaphore::new(1));
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = Arc::new(Storage::new(dir.path()).await.expect("storage"));
        let pool = SubagentPool::new(
            2,
            Arc::new(GatedRunner { gate }),
            storage.clone(),
            EventBus::new(),
        );

        pool.enqueue("actor-1", "run-parent", "patch it", vec!["src/lib.rs".to_string()])
            .await
            .expect("enqueue");
        wait_until(|| async { pool.status("actor-1").await.completed.len() == 1 }).await;

        let log = storage.invocations_for_run("run-parent").await;
        assert_eq!(log.len(), 1);
        assert!(log[0].success);
        assert!(log[0]
            .output
            .as_deref()
            .unwrap_or_default()
            .contains("src/patched.rs"));
    }
}
