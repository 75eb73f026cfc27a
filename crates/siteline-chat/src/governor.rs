//! Memory governor - periodic backstop that prunes the session under pressure.
//!
//! Every store already bounds itself on insert; the governor only matters
//! when the host reports memory pressure, at which point it forces every
//! collection back to its cap in one pass.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::GovernorConfig;
use crate::state::{PruneReport, SharedState};

/// Point-in-time memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

impl MemorySample {
    /// Used fraction of total; 0 when the total is unknown.
    pub fn ratio(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.used_bytes as f64 / self.total_bytes as f64
    }
}

/// Host-provided source of memory readings.
#[async_trait]
pub trait MemoryProbe: Send + Sync {
    /// `None` when no reading is available; the governor then does nothing.
    async fn sample(&self) -> Option<MemorySample>;
}

/// Resident set size of this process against system memory, read from
/// `/proc`. Yields nothing on platforms without it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

#[async_trait]
impl MemoryProbe for ProcMemoryProbe {
    async fn sample(&self) -> Option<MemorySample> {
        let status = tokio::fs::read_to_string("/proc/self/status").await.ok()?;
        let meminfo = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        Some(MemorySample {
            used_bytes: kib_field(&status, "VmRSS")? * 1024,
            total_bytes: kib_field(&meminfo, "MemTotal")? * 1024,
        })
    }
}

/// Parse a `Key:   1234 kB` line.
fn kib_field(text: &str, key: &str) -> Option<u64> {
    text.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix(':')?;
        rest.split_whitespace().next()?.parse().ok()
    })
}

pub struct MemoryGovernor {
    config: GovernorConfig,
    probe: Arc<dyn MemoryProbe>,
}

impl MemoryGovernor {
    pub fn new(config: GovernorConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self { config, probe }
    }

    pub fn under_pressure(&self, sample: &MemorySample) -> bool {
        let over_ratio = sample.ratio() > self.config.pressure_ratio;
        let over_bytes = self
            .config
            .max_used_bytes
            .is_some_and(|max| sample.used_bytes > max);
        over_ratio || over_bytes
    }

    /// Take one sample and prune if it shows pressure.
    pub async fn check_once(&self, state: &SharedState) -> Option<PruneReport> {
        let sample = self.probe.sample().await?;
        if !self.under_pressure(&sample) {
            debug!(used = sample.used_bytes, total = sample.total_bytes, "Memory within budget");
            return None;
        }

        let report = state.lock().enforce_caps(Utc::now());
        warn!(
            used = sample.used_bytes,
            total = sample.total_bytes,
            removed = report.total(),
            ?report,
            "Memory pressure, pruned session stores"
        );
        Some(report)
    }

    /// Run [`Self::check_once`] every `interval_secs` until the handle is
    /// stopped or dropped.
    pub fn spawn(self, state: SharedState) -> GovernorHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let period = self.config.interval();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_once(&state).await;
                    }
                }
            }
            debug!("Memory governor stopped");
        });
        GovernorHandle {
            cancel,
            task: Some(task),
        }
    }
}

/// Owned handle to a running governor; dropping it stops the timer.
pub struct GovernorHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl GovernorHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Cancel the timer and wait for the task to exit.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            debug!(error = %e, "Memory governor task ended abnormally");
        }
    }
}

impl Drop for GovernorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use crate::config::LimitsConfig;
    use crate::state::SessionState;
    use siteline_models::Message;

    struct FixedProbe {
        sample: Option<MemorySample>,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(used_bytes: u64, total_bytes: u64) -> Arc<Self> {
            Arc::new(Self {
                sample: Some(MemorySample {
                    used_bytes,
                    total_bytes,
                }),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MemoryProbe for FixedProbe {
        async fn sample(&self) -> Option<MemorySample> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.sample
        }
    }

    fn config() -> GovernorConfig {
        GovernorConfig {
            pressure_ratio: 0.85,
            max_used_bytes: None,
            ..GovernorConfig::default()
        }
    }

    /// A state whose conversation sits above its cap, as after a cap change.
    fn overfull_state() -> SharedState {
        let mut state = SessionState::new("s", &LimitsConfig::default());
        for n in 0..6 {
            state.conversation.append(Message::user("s", format!("m{n}")));
        }
        state.tasks.record_progress("gone", 50, None, Utc::now());

        let limits = LimitsConfig {
            max_messages: 3,
            ..LimitsConfig::default()
        };
        let mut capped = SessionState::new("s", &limits);
        capped.conversation = state.conversation;
        capped.tasks = state.tasks;
        capped.shared()
    }

    #[test]
    fn test_pressure_thresholds() {
        let governor = MemoryGovernor::new(config(), FixedProbe::new(0, 0));
        assert!(!governor.under_pressure(&MemorySample { used_bytes: 80, total_bytes: 100 }));
        assert!(governor.under_pressure(&MemorySample { used_bytes: 90, total_bytes: 100 }));
        assert!(!governor.under_pressure(&MemorySample { used_bytes: 90, total_bytes: 0 }));

        let capped = MemoryGovernor::new(
            GovernorConfig {
                max_used_bytes: Some(1_000),
                ..config()
            },
            FixedProbe::new(0, 0),
        );
        assert!(capped.under_pressure(&MemorySample { used_bytes: 1_001, total_bytes: 1_000_000 }));
    }

    #[tokio::test]
    async fn test_check_once_prunes_under_pressure() {
        let state = overfull_state();
        let governor = MemoryGovernor::new(config(), FixedProbe::new(95, 100));

        let report = governor.check_once(&state).await.unwrap();
        assert_eq!(report.messages, 3);
        assert_eq!(report.progress, 1);

        let state = state.lock();
        let contents: Vec<String> = state
            .conversation
            .messages()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["m3", "m4", "m5"]);
        assert_eq!(state.tasks.progress_len(), 0);
    }

    #[tokio::test]
    async fn test_check_once_idle_without_pressure() {
        let state = overfull_state();
        let governor = MemoryGovernor::new(config(), FixedProbe::new(10, 100));

        assert!(governor.check_once(&state).await.is_none());
        assert_eq!(state.lock().conversation.len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_governor_ticks_until_stopped() {
        let probe = FixedProbe::new(10, 100);
        let governor = MemoryGovernor::new(
            GovernorConfig {
                interval_secs: 30,
                ..config()
            },
            probe.clone(),
        );
        let mut handle = governor.spawn(overfull_state());
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        handle.stop().await;
        assert!(!handle.is_running());
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_kib_field_parsing() {
        let status = "Name:\tsiteline\nVmPeak:\t  9000 kB\nVmRSS:\t   5120 kB\n";
        assert_eq!(kib_field(status, "VmRSS"), Some(5120));
        assert_eq!(kib_field(status, "VmSwap"), None);
        assert_eq!(kib_field("MemTotal:       16318108 kB", "MemTotal"), Some(16318108));
    }
}
