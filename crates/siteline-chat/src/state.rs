//! Session state - every bounded store of one chat session.
//!
//! All mutation goes through a short critical section on [`SharedState`];
//! the lock is never held across an `.await`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use siteline_models::{Message, StatusSnapshot, Task};
use tracing::{debug, info, warn};

use crate::artifacts::{ArtifactLog, extract_artifacts};
use crate::config::LimitsConfig;
use crate::conversation::ConversationStore;
use crate::realtime::ServerEvent;
use crate::tasks::TaskLedger;

pub type SharedState = Arc<Mutex<SessionState>>;

/// Entries removed by one pass of [`SessionState::enforce_caps`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub messages: usize,
    pub tasks: usize,
    pub artifacts: usize,
    pub progress: usize,
}

impl PruneReport {
    pub fn total(&self) -> usize {
        self.messages + self.tasks + self.artifacts + self.progress
    }
}

#[derive(Debug)]
pub struct SessionState {
    session_id: String,
    pub conversation: ConversationStore,
    pub tasks: TaskLedger,
    pub artifacts: ArtifactLog,
    /// Every model identifier seen on a completed reply.
    pub models_used: BTreeSet<String>,
    pub status: StatusSnapshot,
    limits: LimitsConfig,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>, limits: &LimitsConfig) -> Self {
        Self {
            session_id: session_id.into(),
            conversation: ConversationStore::new(limits.max_messages),
            tasks: TaskLedger::new(limits),
            artifacts: ArtifactLog::new(limits.max_artifacts),
            models_used: BTreeSet::new(),
            status: StatusSnapshot::default(),
            limits: limits.clone(),
        }
    }

    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Bookkeeping for a finished assistant reply: remember the model and
    /// collect its code blocks. Returns how many artifacts were added.
    pub fn record_completion(&mut self, message_id: &str, content: &str, model: Option<&str>) -> usize {
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            self.models_used.insert(model.to_string());
        }
        let found = extract_artifacts(content, message_id, model);
        if found.is_empty() {
            return 0;
        }
        let added = self.artifacts.extend(found);
        debug!(message_id, added, "Collected artifacts");
        added
    }

    /// Apply one realtime event in receipt order.
    pub fn apply_event(&mut self, event: ServerEvent, now: DateTime<Utc>) {
        match event {
            ServerEvent::TaskStarted { task } => {
                if !self.tasks.task_started(task.to_task(), now) {
                    debug!(task_id = %task.id, "Duplicate task_started ignored");
                }
            }
            ServerEvent::TaskCompleted { task } => {
                let at = task.completed_at.unwrap_or(now);
                let Some(done) = self.tasks.task_completed(task.to_task(), task.result.clone(), at)
                else {
                    debug!(task_id = %task.id, "Replayed task_completed ignored");
                    return;
                };
                info!(task_id = %done.id, "Task completed");
                if let Some(text) = done.result_text() {
                    let summary = format!("**{}** finished:\n\n{}", task_label(&done), text);
                    let message = Message::assistant(&self.session_id, summary);
                    let id = message.id.clone();
                    self.conversation.append(message);
                    self.record_completion(&id, text, None);
                }
            }
            ServerEvent::TaskFailed { task } => {
                let at = task.completed_at.unwrap_or(now);
                let Some(failed) = self.tasks.task_failed(task.to_task(), task.error.clone(), at)
                else {
                    debug!(task_id = %task.id, "Replayed task_failed ignored");
                    return;
                };
                warn!(task_id = %failed.id, error = ?failed.error, "Task failed");
                let reason = failed.error.as_deref().unwrap_or("no reason given");
                let content = format!("**{}** failed: {}", task_label(&failed), reason);
                self.conversation
                    .append(Message::assistant(&self.session_id, content).with_error());
            }
            ServerEvent::TaskProgress { task } => {
                self.tasks
                    .record_progress(&task.id, task.percent(), task.note.clone(), now);
            }
            ServerEvent::AgentCommunication { communication } => {
                self.tasks.record_communication(communication);
            }
            ServerEvent::McpToolUpdate { tools } => {
                self.status.tools = tools;
                self.status.updated_at = Some(now);
            }
            ServerEvent::ApiStatusUpdate { apis } => {
                self.status.apis = apis;
                self.status.updated_at = Some(now);
            }
            ServerEvent::Pong { .. } | ServerEvent::Unknown => {}
        }
    }

    /// Truncate every collection to its cap and drop orphaned progress.
    pub fn enforce_caps(&mut self, now: DateTime<Utc>) -> PruneReport {
        PruneReport {
            messages: self.conversation.prune(self.limits.max_messages),
            tasks: self.tasks.force_limits(now),
            artifacts: self.artifacts.truncate(self.limits.max_artifacts),
            progress: self.tasks.prune_progress(),
        }
    }
}

fn task_label(task: &Task) -> String {
    let name = if task.kind.is_empty() { &task.id } else { &task.kind };
    if task.agent_id.is_empty() {
        format!("Task {name}")
    } else {
        format!("Task {name} ({})", task.agent_id)
    }
}
