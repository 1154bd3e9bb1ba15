//! Infrastructure configuration - paths, tools and telemetry.
//!
//! These are read once at startup; changing them requires a restart.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations used by the daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for the SQLite store and other runtime state.
    /// Default: ~/.local/share/tapedeck
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Where raw captures and processed artifacts are written.
    /// Default: ~/.local/share/tapedeck/recordings
    #[serde(default = "PathsConfig::default_recordings_dir")]
    pub recordings_dir: PathBuf,

    /// Directory searched for SSH private keys.
    /// Default: ~/.ssh
    #[serde(default = "PathsConfig::default_ssh_key_dir")]
    pub ssh_key_dir: PathBuf,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/tapedeck"))
            .unwrap_or_else(|| PathBuf::from(".local/share/tapedeck"))
    }

    fn default_recordings_dir() -> PathBuf {
        Self::default_state_dir().join("recordings")
    }

    fn default_ssh_key_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".ssh"))
            .unwrap_or_else(|| PathBuf::from(".ssh"))
    }

    /// Path of the SQLite database inside the state directory.
    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("tapedeck.db")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            recordings_dir: Self::default_recordings_dir(),
            ssh_key_dir: Self::default_ssh_key_dir(),
        }
    }
}

/// Logging and OTLP export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Filter directive for tracing-subscriber (trace, debug, info, ...).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,

    /// OTLP gRPC endpoint. Unset means logs go to stderr only.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            otlp_endpoint: None,
        }
    }
}

/// External tools invoked for capture, probing and re-encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "ToolsConfig::default_ffmpeg")]
    pub ffmpeg: PathBuf,

    #[serde(default = "ToolsConfig::default_ffprobe")]
    pub ffprobe: PathBuf,
}

impl ToolsConfig {
    fn default_ffmpeg() -> PathBuf {
        PathBuf::from("ffmpeg")
    }

    fn default_ffprobe() -> PathBuf {
        PathBuf::from("ffprobe")
    }
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg: Self::default_ffmpeg(),
            ffprobe: Self::default_ffprobe(),
        }
    }
}

/// Everything that is fixed for the lifetime of the process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InfraConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,
}
