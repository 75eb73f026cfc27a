//! Agent task records and the inter-agent communication trace.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

/// Task lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// An agent task tracked by the session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub agent_id: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The result when the backend reported it as plain text.
    pub fn result_text(&self) -> Option<&str> {
        self.result
            .as_ref()
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }
}

/// Progress bookkeeping for an in-flight task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct TaskProgress {
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// One message exchanged between two agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct AgentCommunicationEntry {
    pub from: String,
    pub to: String,
    pub message: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_kind_uses_type_on_the_wire() {
        let task = Task::new("t1", "valuation", "agent-a");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "valuation");
        assert_eq!(json["agentId"], "agent-a");
        assert_eq!(json["status"], "pending");
    }

    #[test]
    fn test_result_text_only_for_non_empty_strings() {
        let mut task = Task::new("t1", "report", "agent-a");
        assert_eq!(task.result_text(), None);

        task.result = Some(json!({"rows": 3}));
        assert_eq!(task.result_text(), None);

        task.result = Some(json!("   "));
        assert_eq!(task.result_text(), None);

        task.result = Some(json!(" Comparable sales pulled. "));
        assert_eq!(task.result_text(), Some("Comparable sales pulled."));
    }

    #[test]
    fn test_communication_entry_defaults() {
        let entry: AgentCommunicationEntry =
            serde_json::from_value(json!({"from": "a", "to": "b", "message": "hi"})).unwrap();
        assert_eq!(entry.data, Value::Null);
        assert!(entry.timestamp <= Utc::now());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
    }
}
