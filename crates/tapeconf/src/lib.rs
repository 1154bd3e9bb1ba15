//! Configuration loading for tapedeck.
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): paths, external tools and telemetry.
//!   Fixed for the lifetime of the process.
//!
//! - **Defaults** (`DefaultsConfig`): limits, timeouts and retry policy that
//!   seed the scheduler, workflows and transfer queue.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/tapedeck/config.toml` (system)
//! 2. `~/.config/tapedeck/config.toml` (user)
//! 3. `./tapedeck.toml` or the `--config` path (local override)
//! 4. Environment variables (`TAPEDECK_*`, `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/tapedeck"
//! recordings_dir = "/srv/recordings"
//! ssh_key_dir = "~/.ssh"
//!
//! [telemetry]
//! log_level = "info,tapedeck=debug"
//!
//! [tools]
//! ffmpeg = "/usr/bin/ffmpeg"
//!
//! [recording]
//! max_concurrent_sessions = 3
//!
//! [transfer]
//! retry_delay_secs = 60
//! default_max_retries = 3
//! ```

pub mod defaults;
pub mod infra;
pub mod loader;

pub use defaults::{DefaultsConfig, RecordingDefaults, TransferDefaults};
pub use infra::{InfraConfig, PathsConfig, TelemetryConfig, ToolsConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete tapedeck configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TapeConfig {
    #[serde(flatten)]
    pub infra: InfraConfig,

    #[serde(flatten)]
    pub defaults: DefaultsConfig,
}

impl TapeConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./tapedeck.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        loader::load_layers(&files, |key| std::env::var(key).ok())
    }

    /// Render the effective config as TOML.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# tapedeck configuration\n\n");

        output.push_str("[paths]\n");
        let paths = &self.infra.paths;
        output.push_str(&format!("state_dir = \"{}\"\n", paths.state_dir.display()));
        output.push_str(&format!(
            "recordings_dir = \"{}\"\n",
            paths.recordings_dir.display()
        ));
        output.push_str(&format!("ssh_key_dir = \"{}\"\n", paths.ssh_key_dir.display()));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = \"{}\"\n",
            self.infra.telemetry.log_level
        ));
        if let Some(endpoint) = &self.infra.telemetry.otlp_endpoint {
            output.push_str(&format!("otlp_endpoint = \"{}\"\n", endpoint));
        }

        output.push_str("\n[tools]\n");
        output.push_str(&format!("ffmpeg = \"{}\"\n", self.infra.tools.ffmpeg.display()));
        output.push_str(&format!(
            "ffprobe = \"{}\"\n",
            self.infra.tools.ffprobe.display()
        ));

        let recording = &self.defaults.recording;
        output.push_str("\n[recording]\n");
        output.push_str(&format!(
            "max_concurrent_sessions = {}\n",
            recording.max_concurrent_sessions
        ));
        output.push_str(&format!(
            "default_duration_minutes = {}\n",
            recording.default_duration_minutes
        ));
        output.push_str(&format!(
            "misfire_grace_secs = {}\n",
            recording.misfire_grace_secs
        ));
        output.push_str(&format!("stop_timeout_secs = {}\n", recording.stop_timeout_secs));
        output.push_str(&format!(
            "terminate_grace_secs = {}\n",
            recording.terminate_grace_secs
        ));
        output.push_str(&format!(
            "session_retention_days = {}\n",
            recording.session_retention_days
        ));

        let transfer = &self.defaults.transfer;
        output.push_str("\n[transfer]\n");
        output.push_str(&format!(
            "default_max_retries = {}\n",
            transfer.default_max_retries
        ));
        output.push_str(&format!("retry_delay_secs = {}\n", transfer.retry_delay_secs));
        output.push_str(&format!("workers = {}\n", transfer.workers));
        output.push_str(&format!(
            "cleanup_after_transfer = {}\n",
            transfer.cleanup_after_transfer
        ));
        if transfer.ssh_password.is_some() {
            output.push_str("# ssh_password is set (not shown)\n");
        }
        output.push_str(&format!("purge_after_days = {}\n", transfer.purge_after_days));
        output.push_str(&format!(
            "connect_timeout_secs = {}\n",
            transfer.connect_timeout_secs
        ));

        output
    }
}
