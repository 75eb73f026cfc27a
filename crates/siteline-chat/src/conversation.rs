//! Conversation store - ordered message log with a sliding window
//!
//! Messages are kept oldest first. At most one system message is active: a
//! new one replaces the old rather than accumulating. Eviction only ever
//! removes non-system messages, oldest first.

use std::collections::VecDeque;

use siteline_models::{Message, Role};

use crate::config::DEFAULT_MAX_MESSAGES;

#[derive(Debug, Clone)]
pub struct ConversationStore {
    /// Messages stored in order (oldest first)
    messages: VecDeque<Message>,
    /// Cap applied after every append
    max_messages: usize,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl ConversationStore {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_messages,
        }
    }

    /// Append a message, then trim back to the configured cap.
    ///
    /// A system message goes through [`Self::replace_system_message`] so the
    /// single-active-system rule holds.
    pub fn append(&mut self, message: Message) {
        if message.is_system() {
            self.replace_system_message(message);
            return;
        }
        self.messages.push_back(message);
        self.prune(self.max_messages);
    }

    /// Replace all system messages with one new system message at the head.
    pub fn replace_system(&mut self, session_id: &str, content: impl Into<String>) {
        self.replace_system_message(Message::system(session_id, content));
    }

    fn replace_system_message(&mut self, message: Message) {
        self.messages.retain(|m| m.role != Role::System);
        self.messages.push_front(message);
        self.prune(self.max_messages);
    }

    /// Drop the oldest non-system messages until at most `max_size` remain.
    ///
    /// System messages are never removed, so the store can stay above
    /// `max_size` only when it holds nothing but system messages. Returns
    /// the number of messages removed.
    pub fn prune(&mut self, max_size: usize) -> usize {
        let mut removed = 0;
        while self.messages.len() > max_size {
            let Some(idx) = self.messages.iter().position(|m| m.role != Role::System) else {
                break;
            };
            self.messages.remove(idx);
            removed += 1;
        }
        removed
    }

    /// Append a streamed delta to an in-progress message.
    ///
    /// Returns false when the message is gone or no longer streaming.
    pub fn append_delta(&mut self, id: &str, delta: &str) -> bool {
        match self.get_mut(id) {
            Some(message) if message.metadata.streaming => {
                message.content.push_str(delta);
                true
            }
            _ => false,
        }
    }

    /// Mark a streamed message as finished and return its final content.
    pub fn finish_streaming(&mut self, id: &str) -> Option<String> {
        let message = self.get_mut(id)?;
        message.metadata.streaming = false;
        message.metadata.completed = true;
        Some(message.content.clone())
    }

    pub fn set_content(&mut self, id: &str, content: impl Into<String>) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.content = content.into();
                true
            }
            None => false,
        }
    }

    /// Set delivery metadata on an existing message.
    pub fn annotate(&mut self, id: &str, model: Option<&str>, endpoint: Option<&str>) {
        if let Some(message) = self.get_mut(id) {
            if let Some(model) = model {
                message.metadata.model = Some(model.to_string());
            }
            if let Some(endpoint) = endpoint {
                message.metadata.endpoint = Some(endpoint.to_string());
            }
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        let idx = self.messages.iter().position(|m| m.id == id)?;
        self.messages.remove(idx)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }

    /// Get all messages as a vector, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    pub fn system_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.is_system())
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.role == Role::Assistant)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SESSION: &str = "session-1";

    fn contents(store: &ConversationStore) -> Vec<String> {
        store.messages().into_iter().map(|m| m.content).collect()
    }

    #[test]
    fn test_append_preserves_order() {
        let mut store = ConversationStore::new(10);
        store.append(Message::user(SESSION, "one"));
        store.append(Message::assistant(SESSION, "two"));
        store.append(Message::user(SESSION, "three"));

        assert_eq!(contents(&store), vec!["one", "two", "three"]);
    }

    #[test]
    fn test_sliding_window_keeps_system_message() {
        let mut store = ConversationStore::new(5);
        store.replace_system(SESSION, "You analyse residential parcels.");

        for n in 0..12 {
            store.append(Message::user(SESSION, format!("question {n}")));
        }

        assert_eq!(store.len(), 5);
        let messages = store.messages();
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[4].content, "question 11");
        assert_eq!(messages[1].content, "question 8");
    }

    #[test]
    fn test_replace_system_keeps_one_at_head() {
        let mut store = ConversationStore::new(10);
        store.append(Message::user(SESSION, "a"));
        store.replace_system(SESSION, "first");
        store.append(Message::assistant(SESSION, "b"));
        store.replace_system(SESSION, "second");

        let messages = store.messages();
        assert_eq!(
            messages.iter().filter(|m| m.role == Role::System).count(),
            1
        );
        assert_eq!(contents(&store), vec!["second", "a", "b"]);
    }

    #[test]
    fn test_appending_system_message_replaces() {
        let mut store = ConversationStore::new(10);
        store.append(Message::system(SESSION, "old"));
        store.append(Message::user(SESSION, "hi"));
        store.append(Message::system(SESSION, "new"));

        assert_eq!(contents(&store), vec!["new", "hi"]);
    }

    #[test]
    fn test_prune_never_drops_system() {
        let mut store = ConversationStore::new(100);
        store.replace_system(SESSION, "sys");
        store.append(Message::user(SESSION, "a"));
        store.append(Message::user(SESSION, "b"));

        assert_eq!(store.prune(0), 2);
        assert_eq!(contents(&store), vec!["sys"]);
    }

    #[test]
    fn test_streaming_delta_lifecycle() {
        let mut store = ConversationStore::new(10);
        let placeholder = Message::streaming_placeholder(SESSION);
        let id = placeholder.id.clone();
        store.append(placeholder);

        assert!(store.append_delta(&id, "Median "));
        assert!(store.append_delta(&id, "price up 4%"));
        assert_eq!(store.finish_streaming(&id).as_deref(), Some("Median price up 4%"));

        let message = store.get(&id).unwrap();
        assert!(!message.metadata.streaming);
        assert!(message.metadata.completed);
        assert!(!store.append_delta(&id, "late"));
    }

    #[test]
    fn test_delta_to_removed_message_is_rejected() {
        let mut store = ConversationStore::new(10);
        let placeholder = Message::streaming_placeholder(SESSION);
        let id = placeholder.id.clone();
        store.append(placeholder);
        store.remove(&id);

        assert!(!store.append_delta(&id, "x"));
        assert!(store.is_empty());
    }
}
