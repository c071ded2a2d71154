use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Decides which side answers when both sides of a pair offered at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlarePolicy {
    /// the lexicographically smaller identifier abandons its offer and answers.
    /// the larger one ignores the incoming offer
    SmallerIdAnswers,
    /// whoever receives an offer while offering abandons its own
    AcceptIncoming,
}

/// Timings and limits of the orchestration core. All durations are milliseconds.
///
/// Every field has a default, so a partial JSON document is enough:
/// `{"join_delay_ms": 250, "glare_policy": "accept_incoming"}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// wait after a remote join before offering, so the joiner can finish its own setup
    pub join_delay_ms: u64,
    /// spacing between successive offers when seeding from the member list
    pub join_stagger_ms: u64,
    /// how long a failed/disconnected transport may recover before the session fails
    pub failure_grace_ms: u64,
    /// consecutive automatic re-initiations per remote before `PeerUnreachable`
    pub max_reinitiations: u32,
    pub pending_offer_timeout_ms: u64,
    pub camera_state_request_delay_ms: u64,
    pub presence_reply_delay_ms: u64,
    pub mic_release_debounce_ms: u64,
    pub min_speech_ms: u64,
    pub remote_mic_timeout_ms: u64,
    pub duplicate_window_ms: u64,
    pub glare_policy: GlarePolicy,
    pub ice_servers: Vec<String>,
    pub channel: ReconnectPolicy,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            join_delay_ms: 500,
            join_stagger_ms: 100,
            failure_grace_ms: 2000,
            max_reinitiations: 3,
            pending_offer_timeout_ms: 5000,
            camera_state_request_delay_ms: 100,
            presence_reply_delay_ms: 100,
            mic_release_debounce_ms: 300,
            min_speech_ms: 200,
            remote_mic_timeout_ms: 10_000,
            duplicate_window_ms: 5000,
            glare_policy: GlarePolicy::SmallerIdAnswers,
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            channel: ReconnectPolicy::default(),
        }
    }
}

impl MeshConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).context("invalid mesh configuration")
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json_str(&contents)
    }

    pub fn join_delay(&self) -> Duration {
        Duration::from_millis(self.join_delay_ms)
    }

    pub fn join_stagger(&self) -> Duration {
        Duration::from_millis(self.join_stagger_ms)
    }

    pub fn failure_grace(&self) -> Duration {
        Duration::from_millis(self.failure_grace_ms)
    }

    pub fn pending_offer_timeout(&self) -> Duration {
        Duration::from_millis(self.pending_offer_timeout_ms)
    }

    pub fn camera_state_request_delay(&self) -> Duration {
        Duration::from_millis(self.camera_state_request_delay_ms)
    }

    pub fn presence_reply_delay(&self) -> Duration {
        Duration::from_millis(self.presence_reply_delay_ms)
    }

    pub fn mic_release_debounce(&self) -> Duration {
        Duration::from_millis(self.mic_release_debounce_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn remote_mic_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_mic_timeout_ms)
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_millis(self.duplicate_window_ms)
    }
}

/// Backoff used to re-establish the signaling channel after an abnormal close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// fraction of the base delay added as random jitter, 0.0 disables it
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.3,
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64) * self.multiplier.powi(attempt as i32);
        let base = base.min(self.max_delay_ms as f64);
        let jitter = if self.jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.jitter) * base
        } else {
            0.0
        };
        Duration::from_millis((base + jitter) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
