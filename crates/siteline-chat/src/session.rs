//! Chat session - the context object owning every store and background task.
//!
//! One `ChatSession` per conversation view. It wires the dispatch router,
//! the realtime channel and the memory governor to a single
//! [`SessionState`], and tears all of them down on [`ChatSession::shutdown`]
//! or drop.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use siteline_models::{
    AgentCommunicationEntry, Artifact, ConnectionState, Message, StatusSnapshot, Task,
    TaskProgress,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::dispatch::{DispatchOutcome, DispatchRouter, SendOptions};
use crate::error::{ChatError, Result};
use crate::governor::{GovernorHandle, MemoryGovernor, MemoryProbe, ProcMemoryProbe};
use crate::realtime::{RealtimeChannel, ServerEvent, realtime_url};
use crate::state::{SessionState, SharedState};

pub struct ChatSession {
    config: ChatConfig,
    state: SharedState,
    router: DispatchRouter,
    probe: Arc<dyn MemoryProbe>,
    realtime: Option<RealtimeChannel>,
    event_pump: Option<JoinHandle<()>>,
    governor: Option<GovernorHandle>,
    /// Cancelled on shutdown; parent of every other token.
    cancel: CancellationToken,
    /// Parent of in-flight sends, replaced by [`Self::cancel_pending`].
    sends: Mutex<CancellationToken>,
}

impl ChatSession {
    pub fn new(config: ChatConfig) -> Result<Self> {
        Self::with_session_id(config, Uuid::new_v4().to_string())
    }

    pub fn with_session_id(config: ChatConfig, session_id: impl Into<String>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ChatError::Config(format!("{e:#}")))?;
        let state = SessionState::new(session_id, &config.limits).shared();
        let router = DispatchRouter::new(&config, state.clone())?;
        let cancel = CancellationToken::new();
        let sends = Mutex::new(cancel.child_token());
        Ok(Self {
            config,
            state,
            router,
            probe: Arc::new(ProcMemoryProbe),
            realtime: None,
            event_pump: None,
            governor: None,
            cancel,
            sends,
        })
    }

    /// Replace the default `/proc` based probe.
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Start background work: the memory governor and, when enabled, the
    /// realtime channel. Must run inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        if self.config.governor.enabled && self.governor.is_none() {
            let governor = MemoryGovernor::new(self.config.governor.clone(), self.probe.clone());
            self.governor = Some(governor.spawn(self.state.clone()));
        }

        if self.config.realtime.enabled && self.realtime.is_none() {
            let url = realtime_url(&self.config.base_url, &self.config.realtime.path)?;
            let (mut channel, events) = RealtimeChannel::new(url, self.config.realtime.clone());
            self.event_pump = Some(tokio::spawn(pump_events(
                events,
                self.state.clone(),
                self.cancel.clone(),
            )));
            channel.connect();
            self.realtime = Some(channel);
        }

        info!(session_id = %self.session_id(), "Chat session started");
        Ok(())
    }

    pub fn session_id(&self) -> String {
        self.state.lock().session_id().to_string()
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    /// Handle for hosts that need direct access to the stores.
    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn set_system_prompt(&self, content: impl Into<String>) {
        let mut state = self.state.lock();
        let session_id = state.session_id().to_string();
        state.conversation.replace_system(&session_id, content);
    }

    /// Send a user message; see [`DispatchRouter::send`].
    pub async fn send(&self, user_text: &str, options: &SendOptions) -> DispatchOutcome {
        let cancel = self.sends.lock().child_token();
        self.router.send(user_text, options, &cancel).await
    }

    /// Send with the configured default model and streaming on.
    pub async fn send_default(&self, user_text: &str) -> DispatchOutcome {
        let options = SendOptions::new(self.config.default_model.clone());
        self.send(user_text, &options).await
    }

    /// Abandon every in-flight send. Partial streamed replies are removed.
    pub fn cancel_pending(&self) {
        let mut sends = self.sends.lock();
        sends.cancel();
        *sends = self.cancel.child_token();
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().conversation.messages()
    }

    pub fn artifacts(&self) -> Vec<Artifact> {
        self.state.lock().artifacts.artifacts()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.state.lock().tasks.tasks()
    }

    pub fn communications(&self) -> Vec<AgentCommunicationEntry> {
        self.state.lock().tasks.communications()
    }

    pub fn task_progress(&self, task_id: &str) -> Option<TaskProgress> {
        self.state.lock().tasks.progress(task_id).cloned()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.state.lock().status.clone()
    }

    pub fn models_used(&self) -> Vec<String> {
        self.state.lock().models_used.iter().cloned().collect()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.realtime
            .as_ref()
            .map_or(ConnectionState::Disconnected, RealtimeChannel::state)
    }

    pub fn subscribe_connection(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.realtime.as_ref().map(RealtimeChannel::subscribe)
    }

    /// Manual reconnect; a no-op unless the channel is disconnected.
    pub fn reconnect(&mut self) -> bool {
        match self.realtime.as_mut() {
            Some(channel) => channel.reconnect(),
            None => false,
        }
    }

    /// Cancel pending sends, close the channel and stop every timer.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();

        if let Some(mut channel) = self.realtime.take() {
            channel.disconnect();
            channel.closed().await;
        }
        if let Some(mut governor) = self.governor.take() {
            governor.stop().await;
        }
        if let Some(pump) = self.event_pump.take()
            && let Err(e) = pump.await
        {
            debug!(error = %e, "Event pump ended abnormally");
        }
        info!(session_id = %self.session_id(), "Chat session shut down");
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Apply channel events to the session state in receipt order.
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
    state: SharedState,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let Some(event) = event else { break };
        state.lock().apply_event(event, Utc::now());
    }
}
