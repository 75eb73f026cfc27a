//! Chat message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

/// Chat message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Delivery details attached to a message.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct MessageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Endpoint path that produced the reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// True while deltas are still being applied.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub completed: bool,
    /// Set on locally synthesized fallback and task-failure messages.
    #[serde(default)]
    pub error: bool,
}

/// Chat message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub session_id: String,
    #[serde(default)]
    pub metadata: MessageMetadata,
}

impl Message {
    pub fn new(role: Role, session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            session_id: session_id.into(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Create a system message
    pub fn system(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::System, session_id, content)
    }

    /// Create a user message
    pub fn user(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(Role::User, session_id, content)
    }

    /// Create an assistant message
    pub fn assistant(session_id: impl Into<String>, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Assistant, session_id, content);
        message.metadata.completed = true;
        message
    }

    /// Empty assistant message that deltas are appended to.
    pub fn streaming_placeholder(session_id: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Assistant, session_id, "");
        message.metadata.streaming = true;
        message
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.metadata.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.metadata.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_error(mut self) -> Self {
        self.metadata.error = true;
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}
