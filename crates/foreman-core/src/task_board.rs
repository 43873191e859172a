use chrono::Utc;
use serde_json::json;

use foreman_types::{EngineEvent, Task, TaskStatus};

use crate::event_bus::EventBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskBoardError {
    NotFound { task_id: String },
    SecondInProgress { active_id: String, rejected_id: String },
}

impl std::fmt::Display for TaskBoardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskBoardError::NotFound { task_id } => write!(f, "task `{task_id}` not found"),
            TaskBoardError::SecondInProgress {
                active_id,
                rejected_id,
            } => write!(
                f,
                "task `{rejected_id}` cannot start while `{active_id}` is in progress"
            ),
        }
    }
}

impl std::error::Error for TaskBoardError {}

/// Ordered sub-goal list for one run. Single-writer: the owning run's loop is
/// the only mutator, so this is plain owned state, not a shared registry.
#[derive(Debug, Clone)]
pub struct TaskBoard {
    board_id: String,
    tasks: Vec<Task>,
}

impl TaskBoard {
    pub fn new(board_id: impl Into<String>) -> Self {
        Self {
            board_id: board_id.into(),
            tasks: Vec::new(),
        }
    }

    pub fn create_tasks(&mut self, titles: &[(String, String)]) -> Vec<Task> {
        let mut created = Vec::with_capacity(titles.len());
        for (title, description) in titles {
            created.push(self.create_task(None, title, description));
        }
        created
    }

    /// An engine-proposed id is adopted unless it is already taken.
    pub fn create_task(&mut self, id: Option<&str>, title: &str, description: &str) -> Task {
        let task = match id.filter(|id| self.get(id).is_none()) {
            Some(id) => Task::with_id(id, &self.board_id, title, description),
            None => Task::new(&self.board_id, title, description),
        };
        self.tasks.push(task.clone());
        task
    }

    /// Creating new tasks while one is in progress is fine; *starting* a
    /// second one is not.
    pub fn update_task(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        result: Option<String>,
    ) -> Result<Task, TaskBoardError> {
        if status == TaskStatus::InProgress {
            if let Some(active) = self
                .tasks
                .iter()
                .find(|t| t.status == TaskStatus::InProgress && t.id != task_id)
            {
                return Err(TaskBoardError::SecondInProgress {
                    active_id: active.id.clone(),
                    rejected_id: task_id.to_string(),
                });
            }
        }
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == task_id) else {
            return Err(TaskBoardError::NotFound {
                task_id: task_id.to_string(),
            });
        };
        task.status = status;
        if result.is_some() {
            task.result = result;
        }
        task.updated_at = Utc::now();
        Ok(task.clone())
    }

    pub fn current(&self) -> &[Task] {
        &self.tasks
    }

    pub fn in_progress(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::InProgress)
    }

    pub fn has_pending_work(&self) -> bool {
        self.tasks
            .iter()
            .any(|t| t.status != TaskStatus::Completed)
    }

    /// All-completed only counts when the board is non-empty.
    pub fn all_completed(&self) -> bool {
        !self.tasks.is_empty() && self.tasks.iter().all(|t| t.status == TaskStatus::Completed)
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    /// Terminal cleanup: an in-progress task is force-closed with an
    /// annotation; pending tasks were never started, so no terminal state is
    /// assumed for them.
    pub fn force_close(&mut self) -> Vec<Task> {
        let mut closed = Vec::new();
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Completed;
                task.result = Some(match task.result.take() {
                    Some(existing) => format!("{existing} (force-closed at run termination)"),
                    None => "force-closed at run termination".to_string(),
                });
                task.updated_at = Utc::now();
                closed.push(task.clone());
            }
        }
        closed
    }
}

pub fn publish_task_event(bus: &EventBus, event_type: &str, task: &Task) {
    bus.publish(EngineEvent::new(
        event_type,
        json!({
            "taskID": task.id,
            "boardID": task.board_id,
            "title": task.title,
            "status": task.status,
            "result": task.result,
        }),
    ));
}
