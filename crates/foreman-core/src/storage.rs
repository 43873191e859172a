use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::sync::RwLock;

use foreman_types::{CreditReservation, Run, SubagentJob, Task, ToolInvocation};

/// JSON-file persistence for run records, the append-only invocation log,
/// task boards, reservations and subagent jobs. In-memory maps are the
/// source of truth; `flush` writes them out.
pub struct Storage {
    base: PathBuf,
    runs: RwLock<HashMap<String, Run>>,
    invocations: RwLock<HashMap<String, Vec<ToolInvocation>>>,
    tasks: RwLock<HashMap<String, Vec<Task>>>,
    reservations: RwLock<HashMap<String, Vec<CreditReservation>>>,
    jobs: RwLock<HashMap<String, SubagentJob>>,
}

impl Storage {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base).await?;
        let runs = read_map::<Run>(&base.join("runs.json")).await;
        let invocations = read_map::<Vec<ToolInvocation>>(&base.join("invocations.json")).await;
        let tasks = read_map::<Vec<Task>>(&base.join("tasks.json")).await;
        let reservations =
            read_map::<Vec<CreditReservation>>(&base.join("reservations.json")).await;
        let jobs = read_map::<SubagentJob>(&base.join("jobs.json")).await;
        Ok(Self {
            base,
            runs: RwLock::new(runs),
            invocations: RwLock::new(invocations),
            tasks: RwLock::new(tasks),
            reservations: RwLock::new(reservations),
            jobs: RwLock::new(jobs),
        })
    }

    pub async fn save_run(&self, run: Run) -> anyhow::Result<()> {
        self.runs.write().await.insert(run.id.clone(), run);
        self.flush_runs().await
    }

    pub async fn get_run(&self, run_id: &str) -> Option<Run> {
        self.runs.read().await.get(run_id).cloned()
    }

    pub async fn list_runs(&self) -> Vec<Run> {
        let mut runs = self.runs.read().await.values().cloned().collect::<Vec<_>>();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        runs
    }

    /// Invocations stay ordered by dispatch time: append-only per run.
    pub async fn append_invocation(&self, invocation: ToolInvocation) -> anyhow::Result<()> {
        {
            let mut log = self.invocations.write().await;
            log.entry(invocation.run_id.clone())
                .or_default()
                .push(invocation);
        }
        self.flush_invocations().await
    }

    pub async fn invocations_for_run(&self, run_id: &str) -> Vec<ToolInvocation> {
        self.invocations
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Replaces the persisted board snapshot for a run.
    pub async fn save_tasks(&self, board_id: &str, tasks: Vec<Task>) -> anyhow::Result<()> {
        self.tasks
            .write()
            .await
            .insert(board_id.to_string(), tasks);
        self.flush_tasks().await
    }

    pub async fn tasks_for_run(&self, board_id: &str) -> Vec<Task> {
        self.tasks
            .read()
            .await
            .get(board_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn save_reservations(
        &self,
        run_id: &str,
        reservations: Vec<CreditReservation>,
    ) -> anyhow::Result<()> {
        self.reservations
            .write()
            .await
            .insert(run_id.to_string(), reservations);
        self.flush_reservations().await
    }

    pub async fn reservations_for_run(&self, run_id: &str) -> Vec<CreditReservation> {
        self.reservations
            .read()
            .await
            .get(run_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn save_job(&self, job: SubagentJob) -> anyhow::Result<()> {
        self.jobs.write().await.insert(job.id.clone(), job);
        self.flush_jobs().await
    }

    pub async fn get_job(&self, job_id: &str) -> Option<SubagentJob> {
        self.jobs.read().await.get(job_id).cloned()
    }

    pub async fn jobs_for_actor(&self, actor_id: &str) -> Vec<SubagentJob> {
        let mut jobs = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.actor_id == actor_id)
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub async fn flush(&self) -> anyhow::Result<()> {
        self.flush_runs().await?;
        self.flush_invocations().await?;
        self.flush_tasks().await?;
        self.flush_reservations().await?;
        self.flush_jobs().await
    }

    async fn flush_tasks(&self) -> anyhow::Result<()> {
        let snapshot = self.tasks.read().await.clone();
        write_json(&self.base.join("tasks.json"), &snapshot).await
    }

    async fn flush_reservations(&self) -> anyhow::Result<()> {
        let snapshot = self.reservations.read().await.clone();
        write_json(&self.base.join("reservations.json"), &snapshot).await
    }

    async fn flush_runs(&self) -> anyhow::Result<()> {
        let snapshot = self.runs.read().await.clone();
        write_json(&self.base.join("runs.json"), &snapshot).await
    }

    async fn flush_invocations(&self) -> anyhow::Result<()> {
        let snapshot = self.invocations.read().await.clone();
        write_json(&self.base.join("invocations.json"), &snapshot).await
    }

    async fn flush_jobs(&self) -> anyhow::Result<()> {
        let snapshot = self.jobs.read().await.clone();
        write_json(&self.base.join("jobs.json"), &snapshot).await
    }
}

async fn read_map<T: serde::de::DeserializeOwned>(path: &Path) -> HashMap<String, T> {
    match fs::read_to_string(path).await {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}
