//! Dispatch router - sends one user message through the endpoint fallback chain.
//!
//! Candidates are tried in order and the first success wins; later ones are
//! never contacted. A streaming candidate grows a placeholder message delta
//! by delta, a single-shot candidate appends one reply. When every candidate
//! fails the user still gets an answer: a local emergency reply flagged as an
//! error.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde_json::{Value, json};
use siteline_models::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{ChatConfig, EndpointConfig};
use crate::debug::summarize_payload;
use crate::error::{ChatError, Result};
use crate::fallback::emergency_reply;
use crate::http_client::build_http_client;
use crate::state::SharedState;
use crate::stream::{StreamEvent, decode_stream};

/// Reply used when a backend answers with JSON in no recognised shape.
pub const DEFAULT_REPLY: &str =
    "I'm here to help with your real-estate analysis. Could you tell me a bit more about what you're looking for?";

/// Per-send choices supplied by the host.
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub model: String,
    pub streaming: bool,
}

impl SendOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            streaming: true,
        }
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
        self
    }
}

/// One failed candidate.
#[derive(Debug)]
pub struct AttemptFailure {
    pub endpoint: String,
    pub error: ChatError,
}

#[derive(Debug)]
pub enum DispatchOutcome {
    /// A backend answered; `message_id` is the assistant reply.
    Delivered {
        endpoint: String,
        message_id: String,
        failures: Vec<AttemptFailure>,
    },
    /// Every candidate failed and the emergency reply was appended.
    Fallback {
        message_id: String,
        failures: Vec<AttemptFailure>,
    },
    Cancelled,
}

impl DispatchOutcome {
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Delivered { message_id, .. } | Self::Fallback { message_id, .. } => {
                Some(message_id)
            }
            Self::Cancelled => None,
        }
    }

    pub fn failures(&self) -> &[AttemptFailure] {
        match self {
            Self::Delivered { failures, .. } | Self::Fallback { failures, .. } => failures,
            Self::Cancelled => &[],
        }
    }
}

/// Known single-shot response shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendReply {
    /// `choices[0].message.content`
    ChatCompletion(String),
    Content(String),
    Message(String),
    Text(String),
    Response(String),
}

/// Shapes in priority order.
const REPLY_SHAPES: [(&str, fn(String) -> BackendReply); 5] = [
    ("/choices/0/message/content", BackendReply::ChatCompletion),
    ("/content", BackendReply::Content),
    ("/message", BackendReply::Message),
    ("/text", BackendReply::Text),
    ("/response", BackendReply::Response),
];

impl BackendReply {
    /// First shape holding a non-empty string wins.
    pub fn detect(body: &Value) -> Option<Self> {
        REPLY_SHAPES.iter().find_map(|(pointer, shape)| {
            body.pointer(pointer)
                .and_then(Value::as_str)
                .filter(|text| !text.trim().is_empty())
                .map(|text| shape(text.to_string()))
        })
    }

    pub fn into_content(self) -> String {
        match self {
            Self::ChatCompletion(text)
            | Self::Content(text)
            | Self::Message(text)
            | Self::Text(text)
            | Self::Response(text) => text,
        }
    }
}

pub struct DispatchRouter {
    client: Client,
    base_url: Url,
    endpoints: Vec<EndpointConfig>,
    timeout: Duration,
    state: SharedState,
}

impl DispatchRouter {
    pub fn new(config: &ChatConfig, state: SharedState) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)?;
        if config.endpoints.is_empty() {
            return Err(ChatError::Config("no chat endpoints configured".to_string()));
        }
        Ok(Self {
            client: build_http_client(&base_url)?,
            base_url,
            endpoints: config.endpoints.clone(),
            timeout: config.request_timeout(),
            state,
        })
    }

    pub fn endpoints(&self) -> &[EndpointConfig] {
        &self.endpoints
    }

    /// Send `user_text` and append the reply. Never fails: exhaustion ends in
    /// the emergency reply, cancellation in [`DispatchOutcome::Cancelled`].
    pub async fn send(
        &self,
        user_text: &str,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> DispatchOutcome {
        let session_id = {
            let mut state = self.state.lock();
            let message = Message::user(state.session_id(), user_text).with_model(&options.model);
            state.conversation.append(message);
            state.session_id().to_string()
        };

        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            if cancel.is_cancelled() {
                info!("Chat request cancelled");
                return DispatchOutcome::Cancelled;
            }

            let path = endpoint.resolve_path(&session_id);
            let stream = options.streaming && endpoint.streaming;
            let body = request_body(endpoint, user_text, &session_id, options, stream);
            debug!(endpoint = %path, stream, "Trying chat endpoint");

            let attempt = if stream {
                self.attempt_streaming(&path, &body, options, cancel).await
            } else {
                self.attempt_single(&path, &body, options, cancel).await
            };

            match attempt {
                Ok(message_id) => {
                    info!(endpoint = %path, failed_before = failures.len(), "Chat reply delivered");
                    return DispatchOutcome::Delivered {
                        endpoint: path,
                        message_id,
                        failures,
                    };
                }
                Err(ChatError::Cancelled) => {
                    info!(endpoint = %path, "Chat request cancelled");
                    return DispatchOutcome::Cancelled;
                }
                Err(e) => {
                    warn!(endpoint = %path, error = %e, retryable = e.is_retryable(), "Chat endpoint failed, trying next");
                    failures.push(AttemptFailure {
                        endpoint: path,
                        error: e,
                    });
                }
            }
        }

        error!(attempts = failures.len(), "All chat endpoints failed, using local fallback");
        let mut state = self.state.lock();
        let message = Message::assistant(state.session_id(), emergency_reply(user_text)).with_error();
        let message_id = message.id.clone();
        state.conversation.append(message);
        DispatchOutcome::Fallback {
            message_id,
            failures,
        }
    }

    async fn attempt_single(
        &self,
        path: &str,
        body: &Value,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.base_url.join(path)?;
        let request = self.client.post(url).timeout(self.timeout).json(body).send();
        let response = until_cancelled(cancel, request).await??;
        let response = check_status(path, response).await?;
        let text = until_cancelled(cancel, response.text()).await??;

        let value: Value = serde_json::from_str(&text)
            .map_err(|e| ChatError::invalid(path, format!("body is not JSON: {e}")))?;
        let content = match BackendReply::detect(&value) {
            Some(reply) => reply.into_content(),
            None => {
                debug!(endpoint = path, body = %summarize_payload(&value), "No known reply shape, using default reply");
                DEFAULT_REPLY.to_string()
            }
        };
        let model = value
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.is_empty())
            .unwrap_or(options.model.as_str())
            .to_string();

        let mut state = self.state.lock();
        let message = Message::assistant(state.session_id(), content.as_str())
            .with_model(&model)
            .with_endpoint(path);
        let message_id = message.id.clone();
        state.conversation.append(message);
        state.record_completion(&message_id, &content, Some(&model));
        Ok(message_id)
    }

    async fn attempt_streaming(
        &self,
        path: &str,
        body: &Value,
        options: &SendOptions,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = self.base_url.join(path)?;
        // The timeout covers the response head only; a healthy stream may run longer.
        let request = self
            .client
            .post(url)
            .header(ACCEPT, "text/event-stream")
            .json(body)
            .send();
        let response = match until_cancelled(cancel, tokio::time::timeout(self.timeout, request)).await? {
            Ok(response) => response?,
            Err(_) => return Err(ChatError::Timeout(format!("{path} response"))),
        };
        let response = check_status(path, response).await?;

        let message_id = {
            let mut state = self.state.lock();
            let placeholder = Message::streaming_placeholder(state.session_id())
                .with_model(&options.model)
                .with_endpoint(path);
            let id = placeholder.id.clone();
            state.conversation.append(placeholder);
            id
        };

        if let Err(e) = self.consume_stream(&message_id, response, cancel).await {
            self.state.lock().conversation.remove(&message_id);
            return Err(e);
        }

        let mut state = self.state.lock();
        let Some(content) = state.conversation.finish_streaming(&message_id) else {
            return Err(ChatError::StreamAborted("reply evicted before completion".to_string()));
        };
        if content.trim().is_empty() {
            state.conversation.set_content(&message_id, DEFAULT_REPLY);
        }
        state.record_completion(&message_id, &content, Some(&options.model));
        Ok(message_id)
    }

    /// Apply deltas in arrival order until the `[DONE]` sentinel.
    async fn consume_stream(
        &self,
        message_id: &str,
        response: Response,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut events = decode_stream(response.bytes_stream());
        loop {
            match until_cancelled(cancel, events.next()).await? {
                Some(Ok(StreamEvent::Delta(delta))) => {
                    if !self.state.lock().conversation.append_delta(message_id, &delta) {
                        return Err(ChatError::StreamAborted("reply evicted mid-stream".to_string()));
                    }
                }
                Some(Ok(StreamEvent::Done)) => return Ok(()),
                Some(Err(e)) => return Err(e),
                None => return Err(ChatError::StreamAborted("stream closed without [DONE]".to_string())),
            }
        }
    }
}

fn request_body(
    endpoint: &EndpointConfig,
    user_text: &str,
    session_id: &str,
    options: &SendOptions,
    stream: bool,
) -> Value {
    let mut body = json!({
        "message": user_text,
        "sessionId": session_id,
        "model": options.model,
        "stream": stream,
    });
    if let Value::Object(fields) = &mut body {
        for (key, value) in &endpoint.flags {
            fields.insert(key.clone(), value.clone());
        }
    }
    body
}

async fn check_status(path: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ChatError::status(path, status.as_u16(), body))
}

async fn until_cancelled<F: Future>(cancel: &CancellationToken, future: F) -> Result<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ChatError::Cancelled),
        output = future => Ok(output),
    }
}
