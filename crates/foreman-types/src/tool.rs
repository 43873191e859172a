use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Behavioural category of a tool. The orchestrator only needs this tag and
/// the name/input/result shape, never a tool's internals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Mutate,
    Execute,
    Diagnose,
    Delegate,
    Knowledge,
}

impl ToolCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolCategory::Read => "read",
            ToolCategory::Mutate => "mutate",
            ToolCategory::Execute => "execute",
            ToolCategory::Diagnose => "diagnose",
            ToolCategory::Delegate => "delegate",
            ToolCategory::Knowledge => "knowledge",
        }
    }

    /// Categories permitted while a task is `in_progress`. Delegation is the
    /// one category that must wait for the current task to close.
    pub fn is_task_completing(self) -> bool {
        !matches!(self, ToolCategory::Delegate)
    }

    pub fn is_mutating(self) -> bool {
        matches!(self, ToolCategory::Mutate | ToolCategory::Execute)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

/// Append-only record of one dispatch attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub id: String,
    #[serde(rename = "runID")]
    pub run_id: String,
    pub tool: String,
    pub input: Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub success: bool,
    pub duration_ms: u64,
}

impl ToolInvocation {
    pub fn success(run_id: &str, tool: &str, input: Value, output: String, duration_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            tool: tool.to_string(),
            input,
            output: Some(output),
            error: None,
            success: true,
            duration_ms,
        }
    }

    pub fn failure(run_id: &str, tool: &str, input: Value, error: String, duration_ms: u64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            tool: tool.to_string(),
            input,
            output: None,
            error: Some(error),
            success: false,
            duration_ms,
        }
    }
}
