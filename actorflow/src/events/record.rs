//! Event records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::UnitIdentity;

/// A pipeline run started executing steps.
pub const PIPELINE_STARTED: &str = "pipeline.started";
/// A pipeline step returned successfully.
pub const PIPELINE_STEP_COMPLETED: &str = "pipeline.step_completed";
/// A pipeline run completed.
pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
/// A pipeline run failed.
pub const PIPELINE_FAILED: &str = "pipeline.failed";

/// One published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Dotted event type, e.g. `pipeline.completed`.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The unit the event is about.
    pub identity: String,
    /// Result payload for successful outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Error payload for failed outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    /// Creates a record stamped now.
    #[must_use]
    pub fn new(event_type: impl Into<String>, identity: &UnitIdentity) -> Self {
        Self {
            event_type: event_type.into(),
            identity: identity.to_string(),
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Attaches a result payload.
    #[must_use]
    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Attaches an error payload.
    #[must_use]
    pub fn with_error(mut self, error: serde_json::Value) -> Self {
        self.error = Some(error);
        self
    }

    /// Converts to the JSON shape published to external sinks.
    #[must_use]
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.event_type,
            "identity": self.identity,
            "result": self.result,
            "error": self.error,
            "timestamp": self.timestamp.to_rfc3339(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_shape() {
        let identity = UnitIdentity::derive("pipeline", "wf_42", None);
        let record = EventRecord::new(PIPELINE_COMPLETED, &identity)
            .with_result(serde_json::json!({"A.score": {"score": 10}}));
        let value = record.to_value();

        assert_eq!(value["type"], "pipeline.completed");
        assert_eq!(value["identity"], identity.to_string());
        assert_eq!(value["result"]["A.score"]["score"], 10);
        assert!(value["error"].is_null());
        assert!(DateTime::parse_from_rfc3339(value["timestamp"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn test_serde_uses_type_key() {
        let identity = UnitIdentity::derive("pipeline", "wf_1", None);
        let record = EventRecord::new(PIPELINE_FAILED, &identity)
            .with_error(serde_json::json!("quota exceeded"));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "pipeline.failed");
        assert!(json.get("result").is_none());

        let back: EventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }
}
