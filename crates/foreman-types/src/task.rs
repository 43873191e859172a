use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

/// One sub-goal tracked on a run's task board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "boardID")]
    pub board_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    pub owner: String,
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(board_id: &str, title: impl Into<String>, description: impl Into<String>) -> Self {
        Self::with_id(
            uuid::Uuid::new_v4().to_string(),
            board_id,
            title,
            description,
        )
    }

    /// Adopts an engine-proposed id so later updates can reference it.
    pub fn with_id(
        id: impl Into<String>,
        board_id: &str,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            board_id: board_id.to_string(),
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            owner: "agent".to_string(),
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}
