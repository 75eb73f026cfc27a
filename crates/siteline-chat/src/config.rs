//! Chat core configuration
//!
//! Loads from `~/.config/siteline/chat.toml`. Every field has a default, so an
//! empty or partial file is valid:
//!
//! ```toml
//! base_url = "https://app.siteline.example"
//!
//! [limits]
//! max_messages = 200
//!
//! [realtime]
//! auto_reconnect = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const BASE_URL_ENV: &str = "SITELINE_BASE_URL";

pub const DEFAULT_MAX_MESSAGES: usize = 100;
pub const DEFAULT_MAX_ACTIVE_TASKS: usize = 50;
pub const DEFAULT_MAX_AGENT_MESSAGES: usize = 100;
pub const DEFAULT_MAX_ARTIFACTS: usize = 50;

/// Chat core configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChatConfig {
    /// Origin the dashboard is served from; endpoints and `/ws` resolve against it.
    pub base_url: String,
    /// Per-attempt timeout for endpoint requests.
    pub request_timeout_secs: u64,
    pub default_model: String,
    pub limits: LimitsConfig,
    pub realtime: RealtimeConfig,
    pub governor: GovernorConfig,
    /// Candidate endpoints, tried in order.
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            request_timeout_secs: 60,
            default_model: "gpt-4o".to_string(),
            limits: LimitsConfig::default(),
            realtime: RealtimeConfig::default(),
            governor: GovernorConfig::default(),
            endpoints: default_endpoints(),
        }
    }
}

/// Caps for the session's bounded collections
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_messages: usize,
    pub max_active_tasks: usize,
    pub max_agent_messages: usize,
    pub max_artifacts: usize,
    /// Completed tasks older than this are the first to go when over budget.
    pub task_retention_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_messages: DEFAULT_MAX_MESSAGES,
            max_active_tasks: DEFAULT_MAX_ACTIVE_TASKS,
            max_agent_messages: DEFAULT_MAX_AGENT_MESSAGES,
            max_artifacts: DEFAULT_MAX_ARTIFACTS,
            task_retention_secs: 5 * 60,
        }
    }
}

impl LimitsConfig {
    pub fn task_retention(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.task_retention_secs as i64)
    }
}

/// Realtime channel policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RealtimeConfig {
    /// When false the session never opens the channel.
    pub enabled: bool,
    pub path: String,
    pub auto_reconnect: bool,
    pub reconnect_delay_ms: u64,
    pub keepalive_secs: u64,
    /// Upper bound on the TCP connect plus WebSocket upgrade.
    pub connect_timeout_ms: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "/ws".to_string(),
            auto_reconnect: true,
            reconnect_delay_ms: 3_000,
            keepalive_secs: 30,
            connect_timeout_ms: 10_000,
        }
    }
}

impl RealtimeConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

/// Memory watchdog policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GovernorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    /// Used/total ratio above which the governor prunes.
    pub pressure_ratio: f64,
    /// Absolute ceiling; pruning also triggers when used bytes exceed it.
    pub max_used_bytes: Option<u64>,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            pressure_ratio: 0.85,
            max_used_bytes: None,
        }
    }
}

impl GovernorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// One candidate chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Path relative to `base_url`, or an absolute URL; `{sessionId}` is
    /// substituted.
    pub path: String,
    /// Whether the endpoint can answer with an event stream.
    #[serde(default)]
    pub streaming: bool,
    /// Extra fields merged into the request body.
    #[serde(default)]
    pub flags: Map<String, Value>,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            streaming: false,
            flags: Map::new(),
        }
    }

    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    pub fn with_flag(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.flags.insert(key.to_string(), value.into());
        self
    }

    pub fn resolve_path(&self, session_id: &str) -> String {
        self.path.replace("{sessionId}", session_id)
    }
}

/// Ordered fallback chain, richest endpoint first.
pub fn default_endpoints() -> Vec<EndpointConfig> {
    vec![
        EndpointConfig::new("/api/chat/stream").streaming(),
        EndpointConfig::new("/api/chat/unified")
            .with_flag("useMemory", true)
            .with_flag("includeContext", true),
        EndpointConfig::new("/api/chat"),
        EndpointConfig::new("/api/ai/chat"),
        EndpointConfig::new("/api/assistant"),
        EndpointConfig::new("/api/sessions/{sessionId}/messages").with_flag("persistOnly", true),
    ]
}

impl ChatConfig {
    /// Load configuration from the default path, falling back to defaults.
    pub fn load() -> Result<Self> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::load_from_path(&path)?,
            _ => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read chat config {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse chat config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default configuration file path
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("siteline").join("chat.toml"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(base_url) = std::env::var(BASE_URL_ENV)
            && !base_url.trim().is_empty()
        {
            self.base_url = base_url.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.base_url)
            .with_context(|| format!("Invalid base_url '{}'", self.base_url))?;
        if self.endpoints.is_empty() {
            bail!("At least one chat endpoint must be configured");
        }
        let limits = &self.limits;
        if limits.max_messages == 0
            || limits.max_active_tasks == 0
            || limits.max_agent_messages == 0
            || limits.max_artifacts == 0
        {
            bail!("Collection limits must be greater than zero");
        }
        if !(0.0..=1.0).contains(&self.governor.pressure_ratio) {
            bail!(
                "governor.pressure_ratio must be within 0..=1, got {}",
                self.governor.pressure_ratio
            );
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ChatConfig::default();
        config.validate().unwrap();
        assert_eq!(config.endpoints.len(), 6);
        assert!(config.endpoints[0].streaming);
        assert_eq!(config.realtime.keepalive_interval(), Duration::from_secs(30));
        assert_eq!(config.governor.interval(), Duration::from_secs(30));
        assert_eq!(config.limits.task_retention(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
base_url = "https://dash.example.com"

[limits]
max_messages = 20

[realtime]
auto_reconnect = false
"#
        )
        .unwrap();

        let config = ChatConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.base_url, "https://dash.example.com");
        assert_eq!(config.limits.max_messages, 20);
        assert_eq!(config.limits.max_artifacts, DEFAULT_MAX_ARTIFACTS);
        assert!(!config.realtime.auto_reconnect);
        assert!(config.realtime.enabled);
        assert_eq!(config.endpoints, default_endpoints());
    }

    #[test]
    fn test_custom_endpoints_with_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[[endpoints]]
path = "/v2/chat"
streaming = true

[[endpoints]]
path = "/v1/chat"
flags = {{ legacy = true }}
"#
        )
        .unwrap();

        let config = ChatConfig::load_from_path(file.path()).unwrap();
        assert_eq!(config.endpoints.len(), 2);
        assert!(config.endpoints[0].streaming);
        assert_eq!(config.endpoints[1].flags["legacy"], Value::Bool(true));
    }

    #[test]
    fn test_zero_limit_rejected() {
        let mut config = ChatConfig::default();
        config.limits.max_active_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let config = ChatConfig {
            base_url: "not a url".to_string(),
            ..ChatConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_session_placeholder_resolution() {
        let endpoint = EndpointConfig::new("/api/sessions/{sessionId}/messages");
        assert_eq!(endpoint.resolve_path("abc"), "/api/sessions/abc/messages");
    }
}
