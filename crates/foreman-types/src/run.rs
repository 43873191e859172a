use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    AwaitingApproval,
    Complete,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Complete | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

/// Coarse lifecycle stage of a run. Forward-only; see `PhaseMachine` for the
/// transition rules.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Thinking,
    Working,
    Verifying,
    Complete,
    Failed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Thinking => "thinking",
            RunPhase::Working => "working",
            RunPhase::Verifying => "verifying",
            RunPhase::Complete => "complete",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    Platform,
    Project,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunIntent {
    Fix,
    Build,
    Diagnose,
    Question,
    General,
}

impl RunIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            RunIntent::Fix => "fix",
            RunIntent::Build => "build",
            RunIntent::Diagnose => "diagnose",
            RunIntent::Question => "question",
            RunIntent::General => "general",
        }
    }
}

/// Per-run workflow counters. A mutating call always flips `has_mutations`
/// and zeroes the consecutive read-only iteration streak.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowTelemetry {
    pub read_ops: u64,
    pub write_ops: u64,
    pub tool_calls: u64,
    pub consecutive_readonly_iterations: u64,
    pub has_mutations: bool,
}

impl WorkflowTelemetry {
    pub fn record_read(&mut self) {
        self.read_ops += 1;
        self.tool_calls += 1;
    }

    pub fn record_mutation(&mut self) {
        self.write_ops += 1;
        self.tool_calls += 1;
        self.has_mutations = true;
        self.consecutive_readonly_iterations = 0;
    }

    /// Bookkeeping calls (task board updates, delegation) count as tool
    /// calls but as neither reads nor writes.
    pub fn record_other(&mut self) {
        self.tool_calls += 1;
    }

    /// Close out one loop iteration. An iteration with tool calls but no
    /// mutation extends the read-only streak; a mutation already reset it.
    pub fn finish_iteration(&mut self, saw_mutation: bool) {
        if !saw_mutation {
            self.consecutive_readonly_iterations += 1;
        }
    }
}

/// One end-to-end execution of the orchestration loop for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    #[serde(rename = "actorID")]
    pub actor_id: String,
    pub scope: RunScope,
    pub request: String,
    pub intent: RunIntent,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub iterations: u64,
    pub iteration_budget: u64,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    #[serde(default)]
    pub telemetry: WorkflowTelemetry,
}

impl Run {
    pub fn new(
        actor_id: impl Into<String>,
        scope: RunScope,
        request: impl Into<String>,
        intent: RunIntent,
        iteration_budget: u64,
        wall_clock_budget_ms: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor_id.into(),
            scope,
            request: request.into(),
            intent,
            phase: RunPhase::Thinking,
            status: RunStatus::Queued,
            iterations: 0,
            iteration_budget,
            started_at: now,
            last_activity_at: now,
            deadline_at: now + chrono::Duration::milliseconds(wall_clock_budget_ms as i64),
            telemetry: WorkflowTelemetry::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubagentJobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

/// A delegated sub-run executed under the pool's concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentJob {
    pub id: String,
    #[serde(rename = "actorID")]
    pub actor_id: String,
    pub description: String,
    #[serde(default)]
    pub file_refs: Vec<String>,
    pub status: SubagentJobStatus,
    pub slot: Option<u8>,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SubagentJob {
    pub fn new(actor_id: &str, description: impl Into<String>, file_refs: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            actor_id: actor_id.to_string(),
            description: description.into(),
            file_refs,
            status: SubagentJobStatus::Queued,
            slot: None,
            result: None,
            created_at: Utc::now(),
        }
    }
}

/// Restorable snapshot taken before a run's first mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    #[serde(rename = "runID")]
    pub run_id: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutation_resets_readonly_streak_and_sets_flag() {
        let mut telemetry = WorkflowTelemetry::default();
        telemetry.record_read();
        telemetry.finish_iteration(false);
        telemetry.record_read();
        telemetry.finish_iteration(false);
        assert_eq!(telemetry.consecutive_readonly_iterations, 2);
        assert!(!telemetry.has_mutations);

        telemetry.record_mutation();
        assert!(telemetry.has_mutations);
        assert_eq!(telemetry.consecutive_readonly_iterations, 0);
        assert_eq!(telemetry.write_ops, 1);
        assert_eq!(telemetry.read_ops, 2);
        assert_eq!(telemetry.tool_calls, 3);
    }

    #[test]
    fn terminal_statuses() {
        assert!(RunStatus::Complete.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::AwaitingApproval.is_terminal());
    }
}
