//! Operational defaults - limits, timeouts and retry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recording and scheduling limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingDefaults {
    /// Sessions allowed in Recording/Processing/Transferring at once.
    #[serde(default = "RecordingDefaults::default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,

    /// Duration used when a trigger is created without one.
    #[serde(default = "RecordingDefaults::default_duration_minutes")]
    pub default_duration_minutes: u32,

    /// How late a fire may run before it is dropped as missed.
    #[serde(default = "RecordingDefaults::default_misfire_grace_secs")]
    pub misfire_grace_secs: u64,

    /// How long stop() waits for a session task to exit.
    #[serde(default = "RecordingDefaults::default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL for the capture tool.
    #[serde(default = "RecordingDefaults::default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,

    /// Finished sessions older than this are purged from history.
    #[serde(default = "RecordingDefaults::default_session_retention_days")]
    pub session_retention_days: u32,
}

impl RecordingDefaults {
    fn default_max_concurrent_sessions() -> usize {
        3
    }

    fn default_duration_minutes() -> u32 {
        60
    }

    fn default_misfire_grace_secs() -> u64 {
        300
    }

    fn default_stop_timeout_secs() -> u64 {
        10
    }

    fn default_terminate_grace_secs() -> u64 {
        5
    }

    fn default_session_retention_days() -> u32 {
        30
    }

    pub fn misfire_grace(&self) -> Duration {
        Duration::from_secs(self.misfire_grace_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

impl Default for RecordingDefaults {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: Self::default_max_concurrent_sessions(),
            default_duration_minutes: Self::default_duration_minutes(),
            misfire_grace_secs: Self::default_misfire_grace_secs(),
            stop_timeout_secs: Self::default_stop_timeout_secs(),
            terminate_grace_secs: Self::default_terminate_grace_secs(),
            session_retention_days: Self::default_session_retention_days(),
        }
    }
}

/// Transfer queue and SSH delivery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferDefaults {
    #[serde(default = "TransferDefaults::default_max_retries")]
    pub default_max_retries: u32,

    /// Base of the exponential backoff between attempts.
    #[serde(default = "TransferDefaults::default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    #[serde(default = "TransferDefaults::default_workers")]
    pub workers: usize,

    /// Delete the local artifact after a verified upload.
    #[serde(default = "TransferDefaults::default_cleanup_after_transfer")]
    pub cleanup_after_transfer: bool,

    /// Only used when no key in `ssh_key_dir` is usable.
    #[serde(default)]
    pub ssh_password: Option<String>,

    /// Permanently failed records older than this are purged.
    #[serde(default = "TransferDefaults::default_purge_after_days")]
    pub purge_after_days: u32,

    #[serde(default = "TransferDefaults::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl TransferDefaults {
    fn default_max_retries() -> u32 {
        3
    }

    fn default_retry_delay_secs() -> u64 {
        60
    }

    fn default_workers() -> usize {
        1
    }

    fn default_cleanup_after_transfer() -> bool {
        true
    }

    fn default_purge_after_days() -> u32 {
        7
    }

    fn default_connect_timeout_secs() -> u64 {
        30
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for TransferDefaults {
    fn default() -> Self {
        Self {
            default_max_retries: Self::default_max_retries(),
            retry_delay_secs: Self::default_retry_delay_secs(),
            workers: Self::default_workers(),
            cleanup_after_transfer: Self::default_cleanup_after_transfer(),
            ssh_password: None,
            purge_after_days: Self::default_purge_after_days(),
            connect_timeout_secs: Self::default_connect_timeout_secs(),
        }
    }
}

/// Runtime policy knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultsConfig {
    #[serde(default)]
    pub recording: RecordingDefaults,

    #[serde(default)]
    pub transfer: TransferDefaults,
}
