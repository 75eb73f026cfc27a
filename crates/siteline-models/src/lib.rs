//! Siteline Models - records shared between the chat core and the dashboard UI.
//!
//! Everything here is plain data with camelCase wire names; the UI receives
//! these through the session snapshot and the generated TypeScript bindings.

pub mod artifact;
pub mod connection;
pub mod message;
pub mod task;

pub use artifact::{Artifact, ArtifactKind};
pub use connection::{ConnectionState, StatusSnapshot};
pub use message::{Message, MessageMetadata, Role};
pub use task::{AgentCommunicationEntry, Task, TaskProgress, TaskStatus};
