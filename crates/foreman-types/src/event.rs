use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One event on the engine's broadcast bus and the caller-facing stream.
/// `event_type` values are the names from the external contract
/// (`phase_change`, `task_updated`, `done`, ...), plus internal
/// `provider.call.*` telemetry events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
    pub created_at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_serializes_with_type_rename() {
        let event = EngineEvent::new("phase_change", json!({"phase": "working"}));
        let raw = serde_json::to_value(&event).expect("serialize");
        assert_eq!(raw.get("type").and_then(|v| v.as_str()), Some("phase_change"));
        assert_eq!(
            raw.pointer("/properties/phase").and_then(|v| v.as_str()),
            Some("working")
        );
    }
}
