//! Config file discovery, layering, and environment variable overlay.

use crate::{ConfigError, TapeConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
/// Returns existing paths in load order (system, user, local/cli).
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tapedeck/config.toml");
    if system.exists() {
        files.push(system);
    }

    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tapedeck/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tapedeck.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Layer `files` over the compiled defaults, then apply env overrides
/// resolved through `lookup`.
pub fn load_layers<F>(files: &[PathBuf], lookup: F) -> Result<(TapeConfig, ConfigSources), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in files {
        let table = read_table(path)?;
        merge_tables(&mut merged, table);
        sources.files.push(path.clone());
    }

    let origin = sources
        .files
        .last()
        .cloned()
        .unwrap_or_else(|| PathBuf::from("<defaults>"));
    let mut config: TapeConfig =
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin,
                message: e.to_string(),
            })?;

    expand_config_paths(&mut config);
    apply_env_overrides(&mut config, &mut sources, lookup);

    Ok((config, sources))
}

fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Deep-merge `overlay` into `base`; nested tables merge key by key,
/// everything else is replaced.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

fn expand_config_paths(config: &mut TapeConfig) {
    let paths = &mut config.infra.paths;
    paths.state_dir = expand_path(&paths.state_dir.to_string_lossy());
    paths.recordings_dir = expand_path(&paths.recordings_dir.to_string_lossy());
    paths.ssh_key_dir = expand_path(&paths.ssh_key_dir.to_string_lossy());
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides<F>(config: &mut TapeConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut hit = |key: &str| -> Option<String> {
        let value = lookup(key)?;
        sources.env_overrides.push(key.to_string());
        Some(value)
    };

    // Paths
    if let Some(v) = hit("TAPEDECK_STATE_DIR") {
        config.infra.paths.state_dir = expand_path(&v);
    }
    if let Some(v) = hit("TAPEDECK_RECORDINGS_DIR") {
        config.infra.paths.recordings_dir = expand_path(&v);
    }
    if let Some(v) = hit("TAPEDECK_SSH_KEY_DIR") {
        config.infra.paths.ssh_key_dir = expand_path(&v);
    }

    // Telemetry
    if let Some(v) = hit("TAPEDECK_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
    }
    if let Some(v) = hit("RUST_LOG") {
        config.infra.telemetry.log_level = v;
    }
    if let Some(v) = hit("TAPEDECK_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = Some(v);
    }
    if let Some(v) = hit("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.infra.telemetry.otlp_endpoint = Some(v);
    }

    // Tools
    if let Some(v) = hit("TAPEDECK_FFMPEG") {
        config.infra.tools.ffmpeg = expand_path(&v);
    }
    if let Some(v) = hit("TAPEDECK_FFPROBE") {
        config.infra.tools.ffprobe = expand_path(&v);
    }

    // Policy
    if let Some(n) = hit("TAPEDECK_MAX_CONCURRENT_SESSIONS").and_then(|v| v.parse::<usize>().ok()) {
        config.defaults.recording.max_concurrent_sessions = n;
    }
    if let Some(n) = hit("TAPEDECK_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
        config.defaults.transfer.default_max_retries = n;
    }
    if let Some(n) = hit("TAPEDECK_RETRY_DELAY_SECS").and_then(|v| v.parse::<u64>().ok()) {
        config.defaults.transfer.retry_delay_secs = n;
    }
    if let Some(n) = hit("TAPEDECK_TRANSFER_WORKERS").and_then(|v| v.parse::<usize>().ok()) {
        config.defaults.transfer.workers = n;
    }
    if let Some(v) = hit("TAPEDECK_CLEANUP_AFTER_TRANSFER") {
        config.defaults.transfer.cleanup_after_transfer = parse_bool(&v);
    }
    if let Some(v) = hit("TAPEDECK_SSH_PASSWORD") {
        config.defaults.transfer.ssh_password = Some(v);
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        assert_eq!(expand_path("/absolute/path"), PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base: toml::Table = "[recording]\nmax_concurrent_sessions = 2\nstop_timeout_secs = 4\n"
            .parse()
            .unwrap();
        let overlay: toml::Table = "[recording]\nmax_concurrent_sessions = 5\n".parse().unwrap();
        merge_tables(&mut base, overlay);

        let recording = base["recording"].as_table().unwrap();
        assert_eq!(recording["max_concurrent_sessions"].as_integer(), Some(5));
        assert_eq!(recording["stop_timeout_secs"].as_integer(), Some(4));
    }

    #[test]
    fn test_no_files_gives_defaults() {
        let (config, sources) = load_layers(&[], no_env).unwrap();
        assert_eq!(config, TapeConfig::default());
        assert!(sources.files.is_empty());
        assert!(sources.env_overrides.is_empty());
    }

    #[test]
    fn test_env_overrides_are_recorded() {
        let env: HashMap<&str, &str> = [
            ("TAPEDECK_MAX_CONCURRENT_SESSIONS", "7"),
            ("TAPEDECK_CLEANUP_AFTER_TRANSFER", "no"),
            ("RUST_LOG", "debug"),
            ("TAPEDECK_RETRY_DELAY_SECS", "not-a-number"),
        ]
        .into_iter()
        .collect();

        let (config, sources) =
            load_layers(&[], |key| env.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.defaults.recording.max_concurrent_sessions, 7);
        assert!(!config.defaults.transfer.cleanup_after_transfer);
        assert_eq!(config.infra.telemetry.log_level, "debug");
        assert_eq!(config.defaults.transfer.retry_delay_secs, 60);
        assert!(sources
            .env_overrides
            .contains(&"TAPEDECK_MAX_CONCURRENT_SESSIONS".to_string()));
    }
}
