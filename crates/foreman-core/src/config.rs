use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

use foreman_providers::ProvidersConfig;

/// Every safety limit the engine enforces. All fields are overridable
/// through the config file or a runtime patch; the defaults are the values
/// named in the external contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LimitsConfig {
    #[serde(default = "default_wall_clock_budget_ms")]
    pub wall_clock_budget_ms: u64,
    #[serde(default = "default_iteration_deadline_ms")]
    pub iteration_deadline_ms: u64,
    #[serde(default = "default_idle_session_timeout_ms")]
    pub idle_session_timeout_ms: u64,
    #[serde(default = "default_session_token_budget")]
    pub session_token_budget: u64,
    #[serde(default = "default_max_tool_calls_per_iteration")]
    pub max_tool_calls_per_iteration: u64,
    #[serde(default = "default_max_upstream_calls")]
    pub max_upstream_calls: u64,
    #[serde(default = "default_max_consecutive_thinking")]
    pub max_consecutive_thinking: u64,
    #[serde(default = "default_max_empty_iterations")]
    pub max_empty_iterations: u64,
    #[serde(default = "default_readonly_iteration_ceiling")]
    pub readonly_iteration_ceiling: u64,
    #[serde(default = "default_subagent_concurrency")]
    pub subagent_concurrency: usize,
    #[serde(default = "default_approval_timeout_ms")]
    pub approval_timeout_ms: u64,
}

fn default_wall_clock_budget_ms() -> u64 {
    300_000
}
fn default_iteration_deadline_ms() -> u64 {
    180_000
}
fn default_idle_session_timeout_ms() -> u64 {
    1_800_000
}
fn default_session_token_budget() -> u64 {
    250_000
}
fn default_max_tool_calls_per_iteration() -> u64 {
    5
}
fn default_max_upstream_calls() -> u64 {
    50
}
fn default_max_consecutive_thinking() -> u64 {
    3
}
fn default_max_empty_iterations() -> u64 {
    3
}
fn default_readonly_iteration_ceiling() -> u64 {
    60
}
fn default_subagent_concurrency() -> usize {
    2
}
fn default_approval_timeout_ms() -> u64 {
    600_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            wall_clock_budget_ms: default_wall_clock_budget_ms(),
            iteration_deadline_ms: default_iteration_deadline_ms(),
            idle_session_timeout_ms: default_idle_session_timeout_ms(),
            session_token_budget: default_session_token_budget(),
            max_tool_calls_per_iteration: default_max_tool_calls_per_iteration(),
            max_upstream_calls: default_max_upstream_calls(),
            max_consecutive_thinking: default_max_consecutive_thinking(),
            max_empty_iterations: default_max_empty_iterations(),
            readonly_iteration_ceiling: default_readonly_iteration_ceiling(),
            subagent_concurrency: default_subagent_concurrency(),
            approval_timeout_ms: default_approval_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(flatten)]
    pub providers: ProvidersConfig,
}

/// Two-layer store: a persisted file plus a runtime patch layer that drops
/// on restart.
#[derive(Clone)]
pub struct ConfigStore {
    path: PathBuf,
    file_layer: Arc<RwLock<Value>>,
    runtime_layer: Arc<RwLock<Value>>,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let file_layer = read_json_file(&path).await.unwrap_or_else(|_| empty_object());
        let store = Self {
            path,
            file_layer: Arc::new(RwLock::new(file_layer)),
            runtime_layer: Arc::new(RwLock::new(empty_object())),
        };
        store.save().await?;
        Ok(store)
    }

    pub async fn get(&self) -> EngineConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn limits(&self) -> LimitsConfig {
        self.get().await.limits
    }

    pub async fn get_effective_value(&self) -> Value {
        let mut merged = empty_object();
        deep_merge(&mut merged, &self.file_layer.read().await.clone());
        deep_merge(&mut merged, &self.runtime_layer.read().await.clone());
        merged
    }

    pub async fn patch_file(&self, patch: Value) -> anyhow::Result<Value> {
        {
            let mut layer = self.file_layer.write().await;
            deep_merge(&mut layer, &patch);
        }
        self.save().await?;
        Ok(self.get_effective_value().await)
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        {
            let mut layer = self.runtime_layer.write().await;
            deep_merge(&mut layer, &patch);
        }
        self.get_effective_value().await
    }

    async fn save(&self) -> anyhow::Result<()> {
        let layer = self.file_layer.read().await.clone();
        let raw = serde_json::to_string_pretty(&layer)?;
        fs::write(&self.path, raw).await?;
        Ok(())
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&raw)?)
}

fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
