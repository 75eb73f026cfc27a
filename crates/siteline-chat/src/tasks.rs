//! Task ledger - bounded tracking of agent tasks and inter-agent traffic.
//!
//! Task events can arrive out of order relative to the chat request that
//! caused them, so completion and failure create the record on demand.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use siteline_models::{AgentCommunicationEntry, Task, TaskProgress, TaskStatus};

use crate::config::LimitsConfig;

#[derive(Debug, Clone)]
pub struct TaskLedger {
    /// Tasks in insertion order
    tasks: VecDeque<Task>,
    communications: VecDeque<AgentCommunicationEntry>,
    progress: HashMap<String, TaskProgress>,
    max_active_tasks: usize,
    max_agent_messages: usize,
    retention: Duration,
}

impl Default for TaskLedger {
    fn default() -> Self {
        Self::new(&LimitsConfig::default())
    }
}

impl TaskLedger {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            tasks: VecDeque::new(),
            communications: VecDeque::new(),
            progress: HashMap::new(),
            max_active_tasks: limits.max_active_tasks,
            max_agent_messages: limits.max_agent_messages,
            retention: limits.task_retention(),
        }
    }

    /// Register a started task. Returns false if the id is already known.
    pub fn task_started(&mut self, mut task: Task, now: DateTime<Utc>) -> bool {
        if self.position(&task.id).is_some() {
            return false;
        }
        task.status = TaskStatus::Processing;
        self.tasks.push_back(task);
        self.enforce_limits(now);
        true
    }

    /// Mark a task completed, creating it if the start event was never seen.
    ///
    /// Returns `None` when the task had already finished; the event is then
    /// a replay and changes nothing.
    pub fn task_completed(
        &mut self,
        reported: Task,
        result: Option<Value>,
        at: DateTime<Utc>,
    ) -> Option<Task> {
        if self.is_finished(&reported.id) {
            return None;
        }
        let task = self.upsert(reported);
        task.status = TaskStatus::Completed;
        if result.is_some() {
            task.result = result;
        }
        task.completed_at = Some(at);
        let snapshot = task.clone();
        self.progress.remove(&snapshot.id);
        self.enforce_limits(at);
        Some(snapshot)
    }

    /// Mark a task failed, creating it if the start event was never seen.
    /// `None` for a task that had already finished.
    pub fn task_failed(
        &mut self,
        reported: Task,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Option<Task> {
        if self.is_finished(&reported.id) {
            return None;
        }
        let task = self.upsert(reported);
        task.status = TaskStatus::Failed;
        task.error = error;
        task.completed_at = Some(at);
        let snapshot = task.clone();
        self.progress.remove(&snapshot.id);
        self.enforce_limits(at);
        Some(snapshot)
    }

    pub fn record_progress(
        &mut self,
        task_id: &str,
        percent: u8,
        note: Option<String>,
        at: DateTime<Utc>,
    ) {
        self.progress.insert(
            task_id.to_string(),
            TaskProgress {
                percent: percent.min(100),
                note,
                updated_at: at,
            },
        );
    }

    /// Append to the communication trace, evicting the oldest entry when full.
    pub fn record_communication(&mut self, entry: AgentCommunicationEntry) {
        self.communications.push_back(entry);
        while self.communications.len() > self.max_agent_messages {
            self.communications.pop_front();
        }
    }

    /// Bring the task list back under `max_active_tasks`.
    ///
    /// Finished tasks past the retention window go first; after that the
    /// oldest entries go regardless of status. Returns the number removed.
    pub fn enforce_limits(&mut self, now: DateTime<Utc>) -> usize {
        self.truncate_tasks(self.max_active_tasks, now)
    }

    /// Force both collections down to their caps.
    pub fn force_limits(&mut self, now: DateTime<Utc>) -> usize {
        let mut removed = self.enforce_limits(now);
        let excess = self
            .communications
            .len()
            .saturating_sub(self.max_agent_messages);
        self.communications.drain(..excess);
        removed += excess;
        removed
    }

    fn truncate_tasks(&mut self, max: usize, now: DateTime<Utc>) -> usize {
        let before = self.tasks.len();
        if before <= max {
            return 0;
        }

        let cutoff = now - self.retention;
        let mut over = before - max;
        self.tasks.retain(|task| {
            if over == 0 {
                return true;
            }
            let stale = task.status.is_terminal()
                && task.completed_at.is_some_and(|done| done < cutoff);
            if stale {
                over -= 1;
            }
            !stale
        });

        while self.tasks.len() > max {
            self.tasks.pop_front();
        }
        before - self.tasks.len()
    }

    /// Remove progress entries whose task is gone or finished.
    pub fn prune_progress(&mut self) -> usize {
        let tasks = &self.tasks;
        let before = self.progress.len();
        self.progress.retain(|id, _| {
            tasks
                .iter()
                .any(|task| &task.id == id && !task.status.is_terminal())
        });
        before - self.progress.len()
    }

    fn upsert(&mut self, reported: Task) -> &mut Task {
        let idx = match self.position(&reported.id) {
            Some(idx) => idx,
            None => {
                self.tasks.push_back(reported);
                self.tasks.len() - 1
            }
        };
        &mut self.tasks[idx]
    }

    fn is_finished(&self, id: &str) -> bool {
        self.get(id).is_some_and(|task| task.status.is_terminal())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|task| task.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.iter().cloned().collect()
    }

    pub fn communications(&self) -> Vec<AgentCommunicationEntry> {
        self.communications.iter().cloned().collect()
    }

    pub fn progress(&self, task_id: &str) -> Option<&TaskProgress> {
        self.progress.get(task_id)
    }

    pub fn progress_len(&self) -> usize {
        self.progress.len()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn clear(&mut self) {
        self.tasks.clear();
        self.communications.clear();
        self.progress.clear();
    }
}
