//! Realtime channel - persistent WebSocket for task and status notifications.
//!
//! The channel owns one background connection task. That task opens the
//! socket, runs the keepalive ping, decodes inbound frames into
//! [`ServerEvent`]s and forwards them to the session. Connection state is
//! published on a `watch` channel so the UI can follow it.
//!
//! Nothing here is fatal to chat: when the channel is down, dispatch keeps
//! working and the UI offers [`RealtimeChannel::reconnect`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use siteline_models::{AgentCommunicationEntry, ConnectionState, Task};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::RealtimeConfig;
use crate::debug::summarize_payload;
use crate::error::{ChatError, Result};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Task fields as sent by the backend.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    /// Percent complete, for `task_progress`.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskPayload {
    pub fn to_task(&self) -> Task {
        let mut task = Task::new(&self.id, &self.kind, &self.agent_id);
        task.result = self.result.clone();
        task
    }

    pub fn percent(&self) -> u8 {
        self.progress.unwrap_or(0.0).clamp(0.0, 100.0).round() as u8
    }
}

/// Inbound frame, dispatched on its `type` field.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    TaskStarted {
        task: TaskPayload,
    },
    TaskCompleted {
        task: TaskPayload,
    },
    TaskFailed {
        task: TaskPayload,
    },
    TaskProgress {
        task: TaskPayload,
    },
    AgentCommunication {
        communication: AgentCommunicationEntry,
    },
    McpToolUpdate {
        #[serde(default)]
        tools: Value,
    },
    ApiStatusUpdate {
        #[serde(default)]
        apis: Value,
    },
    Pong {
        #[serde(default)]
        timestamp: Value,
    },
    #[serde(other)]
    Unknown,
}

/// Build the channel URL from the page origin: `https` maps to `wss`,
/// `http` to `ws`.
pub fn realtime_url(base_url: &str, path: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)?;
    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(ChatError::Config(format!(
                "Unsupported scheme '{other}' for realtime channel"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ChatError::Config(format!("Cannot switch {base_url} to {scheme}")))?;
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

struct Connection {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Explicit connection object owned by the session.
pub struct RealtimeChannel {
    url: Url,
    config: RealtimeConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    connection: Option<Connection>,
}

impl RealtimeChannel {
    /// Create a disconnected channel and the receiver its events arrive on.
    pub fn new(url: Url, config: RealtimeConfig) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let channel = Self {
            url,
            config,
            state: Arc::new(state),
            events,
            connection: None,
        };
        (channel, receiver)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Follow state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Open the socket. Only acts from `disconnected`; returns whether a
    /// connection attempt was started.
    pub fn connect(&mut self) -> bool {
        if self.state() != ConnectionState::Disconnected {
            return false;
        }

        // A task may still be waiting out a reconnect delay.
        self.stop();
        self.state.send_replace(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_connection(
            self.url.clone(),
            self.config.clone(),
            self.state.clone(),
            self.events.clone(),
            cancel.clone(),
        ));
        self.connection = Some(Connection { cancel, task });
        true
    }

    /// Manual reconnect affordance; a no-op unless `disconnected`.
    pub fn reconnect(&mut self) -> bool {
        if !self.state().can_reconnect() {
            debug!(state = %self.state(), "Ignoring reconnect request");
            return false;
        }
        info!(url = %self.url, "Manual realtime reconnect");
        self.connect()
    }

    /// Close the socket with a normal-closure frame and stop the keepalive.
    pub fn disconnect(&mut self) {
        self.stop();
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Wait for the connection task to finish after [`Self::disconnect`].
    pub async fn closed(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.cancel.cancel();
            if let Err(e) = connection.task.await {
                debug!(error = %e, "Realtime connection task ended abnormally");
            }
        }
    }

    fn stop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.cancel.cancel();
        }
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        if let Some(connection) = &self.connection {
            connection.cancel.cancel();
        }
    }
}

/// Publish a state change unless this connection task has been superseded.
fn publish(
    state: &watch::Sender<ConnectionState>,
    cancel: &CancellationToken,
    next: ConnectionState,
) {
    state.send_if_modified(|current| {
        if cancel.is_cancelled() || *current == next {
            return false;
        }
        *current = next;
        true
    });
}

async fn run_connection(
    url: Url,
    config: RealtimeConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: mpsc::UnboundedSender<ServerEvent>,
    cancel: CancellationToken,
) {
    loop {
        publish(&state, &cancel, ConnectionState::Connecting);

        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            attempt = tokio::time::timeout(
                config.connect_timeout(),
                tokio_tungstenite::connect_async(url.as_str()),
            ) => attempt,
        };

        match attempt {
            Ok(Ok((socket, _))) => {
                info!(url = %url, "Realtime channel connected");
                publish(&state, &cancel, ConnectionState::Connected);
                match pump(socket, &config, &events, &cancel).await {
                    Ok(()) => info!(url = %url, "Realtime channel closed"),
                    Err(e) => warn!(url = %url, error = %e, "Realtime channel failed"),
                }
            }
            Ok(Err(e)) => warn!(url = %url, error = %e, "Realtime channel connection failed"),
            Err(_) => warn!(
                url = %url,
                timeout_ms = config.connect_timeout_ms,
                "Realtime handshake timed out"
            ),
        }

        publish(&state, &cancel, ConnectionState::Disconnected);
        if cancel.is_cancelled() || !config.auto_reconnect {
            break;
        }

        let delay = config.reconnect_delay();
        debug!(delay_ms = delay.as_millis() as u64, "Scheduling realtime reconnect");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Drive one open socket until it closes, errors, or is cancelled.
///
/// The keepalive timer is local to this call, so it stops with the socket.
async fn pump(
    socket: Socket,
    config: &RealtimeConfig,
    events: &mpsc::UnboundedSender<ServerEvent>,
    cancel: &CancellationToken,
) -> Result<()> {
    let (mut write, mut read) = socket.split();
    let period = config.keepalive_interval();
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let frame = CloseFrame {
                    code: CloseCode::Normal,
                    reason: "session ended".into(),
                };
                if let Err(e) = write.send(WsMessage::Close(Some(frame))).await {
                    debug!(error = %e, "Failed to send close frame");
                }
                return Ok(());
            }
            _ = keepalive.tick() => {
                let ping = json!({"type": "ping", "timestamp": Utc::now().timestamp_millis()});
                write.send(WsMessage::Text(ping.to_string().into())).await?;
            }
            frame = read.next() => match frame {
                None => return Ok(()),
                Some(Err(e)) => return Err(e.into()),
                Some(Ok(WsMessage::Text(text))) => forward_frame(text.as_str(), events),
                Some(Ok(WsMessage::Close(frame))) => {
                    debug!(?frame, "Server closed realtime channel");
                    return Ok(());
                }
                Some(Ok(_)) => {}
            },
        }
    }
}

fn forward_frame(text: &str, events: &mpsc::UnboundedSender<ServerEvent>) {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            let payload = serde_json::from_str::<Value>(text)
                .map(|value| summarize_payload(&value))
                .unwrap_or_else(|_| text.chars().take(200).collect());
            debug!(error = %e, payload = %payload, "Ignoring malformed realtime frame");
            return;
        }
    };

    match event {
        ServerEvent::Pong { .. } => {}
        ServerEvent::Unknown => {
            debug!(frame = %text.chars().take(200).collect::<String>(), "Ignoring unknown realtime event");
        }
        event => {
            if events.send(event).is_err() {
                debug!("Realtime event receiver dropped");
            }
        }
    }
}
