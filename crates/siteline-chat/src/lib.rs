//! Siteline Chat - chat orchestration core for the Siteline dashboard
//!
//! This crate provides:
//! - Dispatch through an ordered endpoint fallback chain with local fallback
//! - Incremental decoding of streamed (SSE-style) replies
//! - A realtime WebSocket channel for multi-agent task notifications
//! - Bounded session stores (conversation, tasks, artifacts) and a memory governor

#![allow(dead_code)]

pub mod artifacts;
pub mod config;
pub mod conversation;
pub mod debug;
pub mod dispatch;
pub mod error;
pub mod fallback;
pub mod governor;
mod http_client;
pub mod realtime;
pub mod session;
pub mod state;
pub mod stream;
pub mod tasks;
pub mod telemetry;

// Re-export commonly used types
pub use artifacts::{ArtifactLog, extract_artifacts};
pub use config::{
    ChatConfig, EndpointConfig, GovernorConfig, LimitsConfig, RealtimeConfig, default_endpoints,
};
pub use conversation::ConversationStore;
pub use debug::summarize_payload;
pub use dispatch::{
    AttemptFailure, BackendReply, DEFAULT_REPLY, DispatchOutcome, DispatchRouter, SendOptions,
};
pub use error::{ChatError, Result};
pub use governor::{GovernorHandle, MemoryGovernor, MemoryProbe, MemorySample, ProcMemoryProbe};
pub use realtime::{RealtimeChannel, ServerEvent, TaskPayload, realtime_url};
pub use session::ChatSession;
pub use state::{PruneReport, SessionState, SharedState};
pub use stream::{EventStream, StreamDecoder, StreamEvent, decode_stream};
pub use tasks::TaskLedger;
pub use telemetry::init_tracing;

pub use siteline_models as models;
