use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::{json, Value};
use tokio::fs;
use tokio::process::Command;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use foreman_types::{ToolCategory, ToolResult, ToolSchema};

#[async_trait]
pub trait Tool: Send + Sync {
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult>;
    async fn execute_with_cancel(
        &self,
        args: Value,
        _cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        self.execute(args).await
    }
}

/// Typed command table: tool name resolves to {schema, category, handler} in
/// one lookup. The orchestrator consults the category tag for sequencing and
/// telemetry and never branches on tool names.
///
/// File tools resolve paths against the workspace root they were built with,
/// never against the process working directory.
#[derive(Clone)]
pub struct ToolRegistry {
    tools: Arc<RwLock<HashMap<String, Arc<dyn Tool>>>>,
}

impl ToolRegistry {
    pub fn new(workspace_root: impl AsRef<Path>) -> Self {
        let root = Arc::new(workspace_root.as_ref().to_path_buf());
        let mut map: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        map.insert("read".to_string(), Arc::new(ReadTool { root: root.clone() }));
        map.insert("write".to_string(), Arc::new(WriteTool { root: root.clone() }));
        map.insert("edit".to_string(), Arc::new(EditTool { root: root.clone() }));
        map.insert("bash".to_string(), Arc::new(BashTool { root: root.clone() }));
        map.insert("glob".to_string(), Arc::new(GlobTool { root: root.clone() }));
        map.insert("grep".to_string(), Arc::new(GrepTool { root: root.clone() }));
        map.insert(
            "diagnostics".to_string(),
            Arc::new(DiagnosticsTool { root }),
        );
        map.insert("webfetch".to_string(), Arc::new(WebFetchTool));
        map.insert("task_write".to_string(), Arc::new(TaskWriteTool));
        map.insert("delegate".to_string(), Arc::new(DelegateTool));
        Self {
            tools: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.write().await.insert(name.into(), tool);
    }

    pub async fn list(&self) -> Vec<ToolSchema> {
        let mut dedup: HashMap<String, ToolSchema> = HashMap::new();
        for schema in self.tools.read().await.values().map(|t| t.schema()) {
            dedup.entry(schema.name.clone()).or_insert(schema);
        }
        let mut schemas = dedup.into_values().collect::<Vec<_>>();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    pub async fn category(&self, name: &str) -> Option<ToolCategory> {
        let tools = self.tools.read().await;
        tools.get(name).map(|tool| tool.schema().category)
    }

    pub async fn execute(&self, name: &str, args: Value) -> anyhow::Result<ToolResult> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return Ok(ToolResult {
                output: format!("Unknown tool: {name}"),
                metadata: json!({"unknown": true}),
            });
        };
        tool.execute(args).await
    }

    pub async fn execute_with_cancel(
        &self,
        name: &str,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let tool = {
            let tools = self.tools.read().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return Ok(ToolResult {
                output: format!("Unknown tool: {name}"),
                metadata: json!({"unknown": true}),
            });
        };
        tool.execute_with_cancel(args, cancel).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSchemaValidationError {
    pub tool_name: String,
    pub path: String,
    pub reason: String,
}

impl std::fmt::Display for ToolSchemaValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid tool schema `{}` at `{}`: {}",
            self.tool_name, self.path, self.reason
        )
    }
}

impl std::error::Error for ToolSchemaValidationError {}

pub fn validate_tool_schemas(schemas: &[ToolSchema]) -> Result<(), ToolSchemaValidationError> {
    for schema in schemas {
        validate_schema_node(&schema.name, "$", &schema.input_schema)?;
    }
    Ok(())
}

fn validate_schema_node(
    tool_name: &str,
    path: &str,
    value: &Value,
) -> Result<(), ToolSchemaValidationError> {
    let Some(obj) = value.as_object() else {
        if let Some(arr) = value.as_array() {
            for (idx, item) in arr.iter().enumerate() {
                validate_schema_node(tool_name, &format!("{path}[{idx}]"), item)?;
            }
        }
        return Ok(());
    };

    if obj.get("type").and_then(|t| t.as_str()) == Some("array") && !obj.contains_key("items") {
        return Err(ToolSchemaValidationError {
            tool_name: tool_name.to_string(),
            path: path.to_string(),
            reason: "array schema missing items".to_string(),
        });
    }

    if let Some(items) = obj.get("items") {
        validate_schema_node(tool_name, &format!("{path}.items"), items)?;
    }
    if let Some(props) = obj.get("properties").and_then(|v| v.as_object()) {
        for (key, child) in props {
            validate_schema_node(tool_name, &format!("{path}.properties.{key}"), child)?;
        }
    }
    if let Some(one_of) = obj.get("oneOf").and_then(|v| v.as_array()) {
        for (idx, child) in one_of.iter().enumerate() {
            validate_schema_node(tool_name, &format!("{path}.oneOf[{idx}]"), child)?;
        }
    }
    if let Some(any_of) = obj.get("anyOf").and_then(|v| v.as_array()) {
        for (idx, child) in any_of.iter().enumerate() {
            validate_schema_node(tool_name, &format!("{path}.anyOf[{idx}]"), child)?;
        }
    }

    Ok(())
}

fn is_path_allowed(path: &str) -> bool {
    let raw = Path::new(path);
    if raw.is_absolute() {
        return false;
    }
    !raw.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

fn denied(path: &str) -> ToolResult {
    ToolResult {
        output: "path denied by sandbox policy".to_string(),
        metadata: json!({"path": path, "denied": true}),
    }
}

struct ReadTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for ReadTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "read".to_string(),
            description: "Read file contents".to_string(),
            category: ToolCategory::Read,
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let path = args["path"].as_str().unwrap_or("");
        if !is_path_allowed(path) {
            return Ok(denied(path));
        }
        let data = fs::read_to_string(self.root.join(path)).await.unwrap_or_default();
        Ok(ToolResult {
            output: data,
            metadata: json!({"path": path}),
        })
    }
}

struct WriteTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for WriteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "write".to_string(),
            description: "Write file contents".to_string(),
            category: ToolCategory::Mutate,
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"},"content":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let path = args["path"].as_str().unwrap_or("");
        let content = args["content"].as_str().unwrap_or("");
        if !is_path_allowed(path) {
            return Ok(denied(path));
        }
        let absolute = self.root.join(path);
        let existed = fs::try_exists(&absolute).await.unwrap_or(false);
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&absolute, content).await?;
        Ok(ToolResult {
            output: "ok".to_string(),
            metadata: json!({
                "path": path,
                "operation": if existed { "update" } else { "create" }
            }),
        })
    }
}

struct EditTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for EditTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "edit".to_string(),
            description: "String replacement edit".to_string(),
            category: ToolCategory::Mutate,
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"},"old":{"type":"string"},"new":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let path = args["path"].as_str().unwrap_or("");
        let old = args["old"].as_str().unwrap_or("");
        let new = args["new"].as_str().unwrap_or("");
        if !is_path_allowed(path) {
            return Ok(denied(path));
        }
        let absolute = self.root.join(path);
        let content = fs::read_to_string(&absolute).await?;
        if !content.contains(old) {
            return Ok(ToolResult {
                output: format!("old text not found in `{path}`"),
                metadata: json!({"path": path, "applied": false}),
            });
        }
        let updated = content.replace(old, new);
        fs::write(&absolute, updated).await?;
        Ok(ToolResult {
            output: "ok".to_string(),
            metadata: json!({"path": path, "operation": "update", "applied": true}),
        })
    }
}

struct BashTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for BashTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "bash".to_string(),
            description: "Run shell command in the workspace".to_string(),
            category: ToolCategory::Execute,
            input_schema: json!({"type":"object","properties":{"command":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let cmd = args["command"].as_str().unwrap_or("");
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command.current_dir(self.root.as_ref());
        if let Some(env) = args.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                if let Some(value) = v.as_str() {
                    command.env(k, value);
                }
            }
        }
        let output = command.output().await?;
        Ok(ToolResult {
            output: String::from_utf8_lossy(&output.stdout).to_string(),
            metadata: json!({
                "stderr": String::from_utf8_lossy(&output.stderr),
                "exitCode": output.status.code()
            }),
        })
    }

    async fn execute_with_cancel(
        &self,
        args: Value,
        cancel: CancellationToken,
    ) -> anyhow::Result<ToolResult> {
        let cmd = args["command"].as_str().unwrap_or("");
        let mut command = Command::new("sh");
        command.args(["-c", cmd]);
        command.current_dir(self.root.as_ref());
        if let Some(env) = args.get("env").and_then(|v| v.as_object()) {
            for (k, v) in env {
                if let Some(value) = v.as_str() {
                    command.env(k, value);
                }
            }
        }
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        let child = command.spawn()?;
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(ToolResult {
                    output: "command cancelled".to_string(),
                    metadata: json!({"cancelled": true}),
                });
            }
            result = child.wait_with_output() => result?
        };
        Ok(ToolResult {
            output: String::from_utf8_lossy(&output.stdout).to_string(),
            metadata: json!({
                "stderr": String::from_utf8_lossy(&output.stderr),
                "exitCode": output.status.code()
            }),
        })
    }
}

struct GlobTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for GlobTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "glob".to_string(),
            description: "Find files by glob".to_string(),
            category: ToolCategory::Read,
            input_schema: json!({"type":"object","properties":{"pattern":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = args["pattern"].as_str().unwrap_or("*");
        if pattern.contains("..") || Path::new(pattern).is_absolute() {
            return Ok(ToolResult {
                output: "pattern denied by sandbox policy".to_string(),
                metadata: json!({"pattern": pattern}),
            });
        }
        let rooted = self.root.join(pattern);
        let mut files = Vec::new();
        for path in (glob::glob(&rooted.to_string_lossy())?).flatten() {
            let display = path
                .strip_prefix(self.root.as_ref())
                .unwrap_or(&path)
                .display()
                .to_string();
            files.push(display);
            if files.len() >= 100 {
                break;
            }
        }
        Ok(ToolResult {
            output: files.join("\n"),
            metadata: json!({"count": files.len()}),
        })
    }
}

struct GrepTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for GrepTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "grep".to_string(),
            description: "Regex search in workspace files".to_string(),
            category: ToolCategory::Read,
            input_schema: json!({"type":"object","properties":{"pattern":{"type":"string"},"path":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let pattern = args["pattern"].as_str().unwrap_or("");
        let rel_root = args["path"].as_str().unwrap_or("");
        if !rel_root.is_empty() && !is_path_allowed(rel_root) {
            return Ok(denied(rel_root));
        }
        let search_root = self.root.join(rel_root);
        let regex = Regex::new(pattern)?;
        let mut out = Vec::new();
        for entry in WalkBuilder::new(&search_root).build().flatten() {
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = entry.path();
            let display = path
                .strip_prefix(self.root.as_ref())
                .unwrap_or(path)
                .display()
                .to_string();
            if let Ok(content) = fs::read_to_string(path).await {
                for (idx, line) in content.lines().enumerate() {
                    if regex.is_match(line) {
                        out.push(format!("{}:{}:{}", display, idx + 1, line));
                        if out.len() >= 100 {
                            break;
                        }
                    }
                }
            }
            if out.len() >= 100 {
                break;
            }
        }
        Ok(ToolResult {
            output: out.join("\n"),
            metadata: json!({"count": out.len()}),
        })
    }
}

struct DiagnosticsTool {
    root: Arc<PathBuf>,
}
#[async_trait]
impl Tool for DiagnosticsTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "diagnostics".to_string(),
            description: "Static diagnostics for a workspace file".to_string(),
            category: ToolCategory::Diagnose,
            input_schema: json!({"type":"object","properties":{"path":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let path = args["path"].as_str().unwrap_or("");
        if path.is_empty() || !is_path_allowed(path) {
            return Ok(ToolResult {
                output: "missing or unsafe path".to_string(),
                metadata: json!({"path": path}),
            });
        }
        let output = diagnostics_for_path(&self.root.join(path), path).await;
        Ok(ToolResult {
            output,
            metadata: json!({"path": path}),
        })
    }
}

struct WebFetchTool;
#[async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "webfetch".to_string(),
            description: "Fetch URL text".to_string(),
            category: ToolCategory::Knowledge,
            input_schema: json!({"type":"object","properties":{"url":{"type":"string"}}}),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let url = args["url"].as_str().unwrap_or("");
        if url.is_empty() {
            tracing::warn!("WebFetchTool missing url. Args: {}", args);
            return Ok(ToolResult {
                output: "missing url".to_string(),
                metadata: json!({}),
            });
        }
        let body = reqwest::get(url).await?.text().await?;
        Ok(ToolResult {
            output: body.chars().take(20_000).collect(),
            metadata: json!({"truncated": body.len() > 20_000}),
        })
    }
}

/// Normalizes a task batch payload. The orchestrator applies the normalized
/// metadata to the run's task board and emits the task events; this tool
/// itself has no side effects.
struct TaskWriteTool;
#[async_trait]
impl Tool for TaskWriteTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "task_write".to_string(),
            description: "Create or update tasks on the run's task board".to_string(),
            category: ToolCategory::Read,
            input_schema: json!({
                "type":"object",
                "properties":{
                    "tasks":{
                        "type":"array",
                        "items":{
                            "type":"object",
                            "properties":{
                                "id":{"type":"string"},
                                "title":{"type":"string"},
                                "description":{"type":"string"},
                                "status":{"type":"string"}
                            }
                        }
                    }
                }
            }),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let tasks = normalize_task_payload(args["tasks"].as_array().cloned().unwrap_or_default());
        Ok(ToolResult {
            output: format!("task board update: {} items", tasks.len()),
            metadata: json!({"tasks": tasks}),
        })
    }
}

/// Normalizes a delegation request. The orchestrator enqueues the job on the
/// subagent pool; the pool reports results back to the parent run's log.
struct DelegateTool;
#[async_trait]
impl Tool for DelegateTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "delegate".to_string(),
            description: "Delegate a sub-task to a pooled subagent".to_string(),
            category: ToolCategory::Delegate,
            input_schema: json!({
                "type":"object",
                "properties":{
                    "description":{"type":"string"},
                    "files":{"type":"array","items":{"type":"string"}}
                }
            }),
        }
    }
    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let description = args["description"].as_str().unwrap_or("").trim().to_string();
        if description.is_empty() {
            return Ok(ToolResult {
                output: "delegation skipped: empty description".to_string(),
                metadata: json!({"accepted": false}),
            });
        }
        let files = args["files"]
            .as_array()
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| v.as_str().map(ToString::to_string))
            .collect::<Vec<_>>();
        Ok(ToolResult {
            output: format!("Subagent job accepted: {description}"),
            metadata: json!({"accepted": true, "description": description, "files": files}),
        })
    }
}

static TASK_SEQ: AtomicU64 = AtomicU64::new(1);

pub fn normalize_task_payload(items: Vec<Value>) -> Vec<Value> {
    items
        .into_iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let title = obj
                .get("title")
                .and_then(|v| v.as_str())
                .or_else(|| obj.get("content").and_then(|v| v.as_str()))
                .unwrap_or("")
                .trim()
                .to_string();
            if title.is_empty() {
                return None;
            }
            let id = obj
                .get("id")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| format!("task-{}", TASK_SEQ.fetch_add(1, Ordering::Relaxed)));
            let status = obj
                .get("status")
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(ToString::to_string)
                .unwrap_or_else(|| "pending".to_string());
            let description = obj
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            Some(json!({"id": id, "title": title, "description": description, "status": status}))
        })
        .collect()
}

async fn diagnostics_for_path(absolute: &Path, display: &str) -> String {
    let Ok(content) = fs::read_to_string(absolute).await else {
        return "File not found".to_string();
    };
    let mut issues = Vec::new();
    let mut balance = 0i64;
    for (idx, line) in content.lines().enumerate() {
        for ch in line.chars() {
            if ch == '{' {
                balance += 1;
            } else if ch == '}' {
                balance -= 1;
            }
        }
        if line.contains("TODO") {
            issues.push(format!("{display}:{}: TODO marker", idx + 1));
        }
    }
    if balance != 0 {
        issues.push(format!("{display}:1: Unbalanced braces"));
    }
    if issues.is_empty() {
        "No diagnostics.".to_string()
    } else {
        issues.join("\n")
    }
}
