//! External capture tool management.
//!
//! The tool (ffmpeg) runs in its own process group so terminate/kill signals
//! reach it and anything it spawns without touching the daemon. A handle is
//! monitored at a fixed poll interval; stop requests and the duration bound
//! are both handled by signalling the group, SIGTERM first, SIGKILL after the
//! grace period.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::Url;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use thiserror::Error;

/// Lines of tool stderr kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 20;

const USER_AGENT: &str = concat!("tapedeck/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid source url {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("unsupported source scheme {scheme:?} (expected http, https, rtmp or rtmps)")]
    UnsupportedScheme { scheme: String },

    #[error("source {url} unreachable: {message}")]
    Unreachable { url: String, message: String },

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Http,
    Rtmp,
}

/// Accept only http(s) and rtmp(s) sources.
pub fn validate_source(url: &str) -> Result<(Url, SourceKind), CaptureError> {
    let parsed = Url::parse(url).map_err(|e| CaptureError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    let kind = match parsed.scheme() {
        "http" | "https" => SourceKind::Http,
        "rtmp" | "rtmps" => SourceKind::Rtmp,
        other => {
            return Err(CaptureError::UnsupportedScheme {
                scheme: other.to_string(),
            })
        }
    };

    if parsed.host_str().map_or(true, str::is_empty) {
        return Err(CaptureError::InvalidUrl {
            url: url.to_string(),
            message: "missing host".to_string(),
        });
    }

    Ok((parsed, kind))
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
    pub codec: String,
    pub bitrate: String,
    /// Probe the source before launching the tool.
    pub probe_sources: bool,
    pub http_probe_timeout: Duration,
    pub rtmp_probe_timeout: Duration,
    pub poll_interval: Duration,
    pub terminate_grace: Duration,
    /// Extra wall-clock time past the requested duration before the monitor
    /// ends the capture itself.
    pub duration_slack: Duration,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            ffprobe: PathBuf::from("ffprobe"),
            codec: "libmp3lame".to_string(),
            bitrate: "128k".to_string(),
            probe_sources: true,
            http_probe_timeout: Duration::from_secs(10),
            rtmp_probe_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(1),
            terminate_grace: Duration::from_secs(5),
            duration_slack: Duration::from_secs(10),
        }
    }
}

impl CaptureSettings {
    pub fn from_config(config: &tapeconf::TapeConfig) -> Self {
        Self {
            ffmpeg: config.infra.tools.ffmpeg.clone(),
            ffprobe: config.infra.tools.ffprobe.clone(),
            terminate_grace: config.defaults.recording.terminate_grace(),
            ..Self::default()
        }
    }
}

/// What to record and where.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    pub source_url: String,
    pub output: PathBuf,
    pub duration: Option<Duration>,
}

/// Build the capture tool's argument list. Always overwrites the target.
pub fn capture_args(spec: &CaptureSpec, settings: &CaptureSettings) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-y".into(),
        "-i".into(),
        spec.source_url.clone().into(),
        "-acodec".into(),
        settings.codec.clone().into(),
        "-ab".into(),
        settings.bitrate.clone().into(),
        "-f".into(),
        "mp3".into(),
    ];
    if let Some(duration) = spec.duration {
        args.push("-t".into());
        args.push(duration.as_secs().max(1).to_string().into());
    }
    args.push(spec.output.clone().into_os_string());
    args
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureProgress {
    pub bytes: u64,
    pub elapsed: Duration,
    /// Share of the requested duration elapsed, if bounded.
    pub fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CaptureOutcome {
    Completed { bytes: u64, elapsed: Duration },
    /// Ended by an external stop request.
    Stopped { bytes: u64 },
    Failed {
        reason: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
}

/// Launches captures with fixed settings.
#[derive(Debug, Clone)]
pub struct CaptureProcess {
    settings: CaptureSettings,
}

impl CaptureProcess {
    pub fn new(settings: CaptureSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &CaptureSettings {
        &self.settings
    }

    /// Validate and probe a source without recording it.
    pub async fn test_source(&self, url: &str) -> Result<SourceKind, CaptureError> {
        let (parsed, kind) = validate_source(url)?;
        match kind {
            SourceKind::Http => probe_http(&parsed, self.settings.http_probe_timeout).await?,
            SourceKind::Rtmp => {
                probe_rtmp(&self.settings.ffprobe, url, self.settings.rtmp_probe_timeout).await?
            }
        }
        Ok(kind)
    }

    /// Validate, optionally probe, and spawn the tool.
    pub async fn start(&self, spec: CaptureSpec) -> Result<CaptureHandle, CaptureError> {
        if self.settings.probe_sources {
            self.test_source(&spec.source_url).await?;
        } else {
            validate_source(&spec.source_url)?;
        }

        if let Some(parent) = spec.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut command = Command::new(&self.settings.ffmpeg);
        command
            .args(capture_args(&spec, &self.settings))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| CaptureError::Spawn {
            tool: self.settings.ffmpeg.clone(),
            source: e,
        })?;

        let pid = child.id();
        let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&tail);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(target: "tapedeck::capture::tool", "{}", line);
                    if let Ok(mut tail) = tail.lock() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                }
            })
        });

        tracing::info!(
            pid = ?pid,
            source = %spec.source_url,
            output = %spec.output.display(),
            duration_secs = ?spec.duration.map(|d| d.as_secs()),
            "Capture started"
        );

        Ok(CaptureHandle {
            child,
            pid,
            started: Instant::now(),
            output: spec.output,
            duration: spec.duration,
            bytes: 0,
            stderr_tail: tail,
            stderr_task,
            settings: self.settings.clone(),
        })
    }
}

/// A running capture. Dropping it kills the tool.
pub struct CaptureHandle {
    child: Child,
    pid: Option<u32>,
    started: Instant,
    output: PathBuf,
    duration: Option<Duration>,
    bytes: u64,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
    settings: CaptureSettings,
}

impl CaptureHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Watch the tool until it exits, `stop` fires, or the duration bound
    /// passes. Progress is reported once per poll.
    pub async fn monitor<F>(mut self, stop: &CancellationToken, mut on_progress: F) -> CaptureOutcome
    where
        F: FnMut(CaptureProgress),
    {
        let mut ticker = tokio::time::interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let hard_stop = self.duration.map(|d| d + self.settings.duration_slack);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    tracing::info!(pid = ?self.pid, "Stop requested, terminating capture");
                    self.terminate().await;
                    self.refresh_bytes().await;
                    return CaptureOutcome::Stopped { bytes: self.bytes };
                }
                _ = ticker.tick() => {}
            }

            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.refresh_bytes().await;
                    return self.classify_exit(status).await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(pid = ?self.pid, error = %e, "Failed to poll capture process");
                }
            }

            self.refresh_bytes().await;
            let elapsed = self.started.elapsed();
            on_progress(CaptureProgress {
                bytes: self.bytes,
                elapsed,
                fraction: self
                    .duration
                    .map(|d| (elapsed.as_secs_f64() / d.as_secs_f64().max(1e-3)).min(1.0)),
            });

            if let Some(limit) = hard_stop {
                if elapsed >= limit {
                    tracing::info!(
                        pid = ?self.pid,
                        elapsed_secs = elapsed.as_secs(),
                        "Duration bound reached, ending capture"
                    );
                    self.terminate().await;
                    self.refresh_bytes().await;
                    return if self.bytes > 0 {
                        CaptureOutcome::Completed {
                            bytes: self.bytes,
                            elapsed,
                        }
                    } else {
                        CaptureOutcome::Failed {
                            reason: "duration elapsed without any output".to_string(),
                            exit_code: None,
                            stderr_tail: self.take_tail().await,
                        }
                    };
                }
            }
        }
    }

    async fn refresh_bytes(&mut self) {
        if let Ok(meta) = tokio::fs::metadata(&self.output).await {
            self.bytes = meta.len();
        }
    }

    async fn classify_exit(&mut self, status: ExitStatus) -> CaptureOutcome {
        let elapsed = self.started.elapsed();
        if status.success() {
            tracing::info!(pid = ?self.pid, bytes = self.bytes, "Capture finished");
            return CaptureOutcome::Completed {
                bytes: self.bytes,
                elapsed,
            };
        }

        let stderr_tail = self.take_tail().await;
        let reason = match status.code() {
            Some(code) => format!("capture tool exited with status {}", code),
            None => "capture tool was terminated by a signal".to_string(),
        };
        tracing::warn!(pid = ?self.pid, %reason, tail = %stderr_tail, "Capture failed");
        CaptureOutcome::Failed {
            reason,
            exit_code: status.code(),
            stderr_tail,
        }
    }

    /// Collect the stderr tail, giving the reader a moment to drain.
    async fn take_tail(&mut self) -> String {
        if let Some(task) = self.stderr_task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        self.stderr_tail
            .lock()
            .map(|tail| tail.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    /// SIGTERM the group, wait out the grace period, then SIGKILL.
    async fn terminate(&mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        signal_group(self.pid, Signal::Terminate);
        match tokio::time::timeout(self.settings.terminate_grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(pid = ?self.pid, error = %e, "Error waiting for capture exit");
                None
            }
            Err(_) => {
                tracing::warn!(
                    pid = ?self.pid,
                    grace_secs = self.settings.terminate_grace.as_secs_f64(),
                    "Capture ignored SIGTERM, killing process group"
                );
                signal_group(self.pid, Signal::Kill);
                if let Err(e) = self.child.kill().await {
                    tracing::debug!(pid = ?self.pid, error = %e, "kill after SIGKILL");
                }
                self.child.wait().await.ok()
            }
        }
    }
}

enum Signal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: Signal) {
    let Some(pid) = pid else { return };
    let sig = match signal {
        Signal::Terminate => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // The child leads its own group (process_group(0)), so -pid targets it.
    unsafe {
        libc::kill(-(pid as libc::pid_t), sig);
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: Signal) {}

fn content_type_is_audio(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.starts_with("audio/") || ct.starts_with("application/ogg") || ct.starts_with("video/mp2t")
}

async fn probe_http(url: &Url, timeout: Duration) -> Result<(), CaptureError> {
    let unreachable = |message: String| CaptureError::Unreachable {
        url: url.to_string(),
        message,
    };

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(|e| unreachable(e.to_string()))?;

    let response = client
        .head(url.clone())
        .send()
        .await
        .map_err(|e| unreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(unreachable(format!("HTTP {}", response.status())));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !content_type_is_audio(content_type) {
        tracing::warn!(
            url = %url,
            content_type = %content_type,
            "Source does not advertise an audio content type, recording anyway"
        );
    }
    Ok(())
}

async fn probe_rtmp(ffprobe: &Path, url: &str, timeout: Duration) -> Result<(), CaptureError> {
    let mut command = Command::new(ffprobe);
    command
        .args([
            "-v",
            "quiet",
            "-print_format",
            "json",
            "-show_streams",
            "-analyzeduration",
            "5000000",
            "-probesize",
            "5000000",
            url,
        ])
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(CaptureError::Spawn {
                tool: ffprobe.to_path_buf(),
                source: e,
            })
        }
        Err(_) => {
            return Err(CaptureError::Unreachable {
                url: url.to_string(),
                message: format!("probe timed out after {}s", timeout.as_secs()),
            })
        }
    };

    if !output.status.success() {
        return Err(CaptureError::Unreachable {
            url: url.to_string(),
            message: format!("probe exited with {}", output.status),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::fake_tool;
    use tempfile::TempDir;

    fn quick_settings(tool: PathBuf) -> CaptureSettings {
        CaptureSettings {
            ffmpeg: tool,
            probe_sources: false,
            poll_interval: Duration::from_millis(50),
            terminate_grace: Duration::from_millis(300),
            duration_slack: Duration::from_millis(0),
            ..CaptureSettings::default()
        }
    }

    fn spec(dir: &TempDir, duration: Option<Duration>) -> CaptureSpec {
        CaptureSpec {
            source_url: "http://radio.example/live".to_string(),
            output: dir.path().join("out").join("cap_raw.mp3"),
            duration,
        }
    }

    fn process_alive(pid: u32) -> bool {
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }

    #[test]
    fn test_validate_source_schemes() {
        assert_eq!(validate_source("https://a.example/s").unwrap().1, SourceKind::Http);
        assert_eq!(validate_source("rtmps://a.example/app").unwrap().1, SourceKind::Rtmp);
        assert!(matches!(
            validate_source("file:///etc/passwd"),
            Err(CaptureError::UnsupportedScheme { .. })
        ));
        assert!(matches!(
            validate_source("not a url"),
            Err(CaptureError::InvalidUrl { .. })
        ));
    }

    #[test]
    fn test_capture_args() {
        let spec = CaptureSpec {
            source_url: "http://s/live".to_string(),
            output: PathBuf::from("/r/x.mp3"),
            duration: Some(Duration::from_secs(1800)),
        };
        let args: Vec<String> = capture_args(&spec, &CaptureSettings::default())
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(
            args,
            vec![
                "-y", "-i", "http://s/live", "-acodec", "libmp3lame", "-ab", "128k", "-f", "mp3",
                "-t", "1800", "/r/x.mp3"
            ]
        );

        let unbounded = CaptureSpec { duration: None, ..spec };
        let args = capture_args(&unbounded, &CaptureSettings::default());
        assert!(!args.iter().any(|a| a == "-t"));
    }

    #[test]
    fn test_content_type_sniff() {
        assert!(content_type_is_audio("audio/mpeg"));
        assert!(content_type_is_audio("application/ogg"));
        assert!(content_type_is_audio("video/MP2T"));
        assert!(!content_type_is_audio("text/html; charset=utf-8"));
    }

    #[tokio::test]
    async fn test_clean_exit_completes() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, r#"printf 'ID3data' > "$out"; exit 0"#);
        let capture = CaptureProcess::new(quick_settings(tool));

        let handle = capture.start(spec(&dir, None)).await.unwrap();
        let outcome = handle.monitor(&CancellationToken::new(), |_| {}).await;
        match outcome {
            CaptureOutcome::Completed { bytes, .. } => assert_eq!(bytes, 7),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_fails_with_tail() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, r#"echo "Connection refused" >&2; exit 3"#);
        let capture = CaptureProcess::new(quick_settings(tool));

        let handle = capture.start(spec(&dir, None)).await.unwrap();
        match handle.monitor(&CancellationToken::new(), |_| {}).await {
            CaptureOutcome::Failed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr_tail.contains("Connection refused"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_terminates_group() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, r#"echo x > "$out"; sleep 30"#);
        let capture = CaptureProcess::new(quick_settings(tool));

        let handle = capture.start(spec(&dir, Some(Duration::from_secs(60)))).await.unwrap();
        let pid = handle.pid().unwrap();
        let stop = CancellationToken::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = handle.monitor(&stop, |_| {}).await;
        assert!(matches!(outcome, CaptureOutcome::Stopped { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_sigterm_ignored_escalates_to_kill() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(
            &dir,
            r#"trap '' TERM; echo x > "$out"; while true; do sleep 1; done"#,
        );
        let capture = CaptureProcess::new(quick_settings(tool));

        let handle = capture.start(spec(&dir, None)).await.unwrap();
        let pid = handle.pid().unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        let outcome = handle.monitor(&stop, |_| {}).await;
        assert!(matches!(outcome, CaptureOutcome::Stopped { .. }));
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_duration_bound_ends_capture() {
        let dir = TempDir::new().unwrap();
        let tool = fake_tool(&dir, r#"echo audio > "$out"; sleep 30"#);
        let capture = CaptureProcess::new(quick_settings(tool));

        let handle = capture
            .start(spec(&dir, Some(Duration::from_millis(300))))
            .await
            .unwrap();
        let mut last_fraction = 0.0;
        let outcome = handle
            .monitor(&CancellationToken::new(), |p| {
                if let Some(f) = p.fraction {
                    assert!(f >= last_fraction);
                    last_fraction = f;
                }
            })
            .await;
        assert!(matches!(outcome, CaptureOutcome::Completed { bytes, .. } if bytes > 0));
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_error() {
        let dir = TempDir::new().unwrap();
        let capture = CaptureProcess::new(quick_settings(dir.path().join("no-such-ffmpeg")));
        assert!(matches!(
            capture.start(spec(&dir, None)).await,
            Err(CaptureError::Spawn { .. })
        ));
    }
}
