#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use tapedeck::capture::{CaptureProcess, CaptureSettings};
use tapedeck::cron::CronZone;
use tapedeck::processing::{AudioProcessor, ProcessingError, TrackMetadata};
use tapedeck::scheduler::NewTrigger;
use tapedeck::transfer::client::ProgressFn;
use tapedeck::transfer::{
    Destination, QueueSettings, TransferClient, TransferError, TransferQueue, UploadReport,
};
use tapedeck::workflow::{LoggingSessionObserver, WorkflowContext};
use tapedeck::{
    Admission, JobScheduler, RecordingSession, ScheduleTrigger, SchedulerSettings, SessionId,
    SessionStage, SqliteStore, Store, StreamConfig, TransferHandOff, WorkflowCoordinator,
};

/// Executable shell script standing in for ffmpeg; `$out` is the last arg.
pub fn fake_tool(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-ffmpeg");
    let script = format!("#!/bin/sh\nfor a in \"$@\"; do out=\"$a\"; done\n{}\n", body);
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Refuses the first `refuse` uploads, then succeeds.
pub struct FakeClient {
    refuse: usize,
    calls: Mutex<Vec<Instant>>,
}

impl FakeClient {
    pub fn refusing(refuse: usize) -> Arc<Self> {
        Arc::new(Self {
            refuse,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TransferClient for FakeClient {
    async fn upload(
        &self,
        local: &Path,
        destination: &Destination,
        progress: Option<ProgressFn>,
    ) -> Result<UploadReport, TransferError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Instant::now());
            calls.len()
        };
        if n <= self.refuse {
            return Err(TransferError::Connection {
                host: destination.host.clone(),
                port: destination.port,
                message: "Connection refused".to_string(),
            });
        }
        let size = std::fs::metadata(local).map(|m| m.len()).unwrap_or(0);
        if let Some(progress) = progress {
            progress(size, size);
        }
        Ok(UploadReport {
            remote_path: destination.remote_path_for(local),
            bytes: size,
            removed_local: false,
        })
    }

    async fn test_connection(&self, _destination: &Destination) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Copies the capture to the artifact path.
pub struct CopyProcessor;

#[async_trait]
impl AudioProcessor for CopyProcessor {
    async fn process(
        &self,
        captured: &Path,
        output: &Path,
        _metadata: &TrackMetadata,
        _artwork: Option<&Path>,
    ) -> Result<(), ProcessingError> {
        tokio::fs::copy(captured, output).await?;
        Ok(())
    }
}

pub struct Rig {
    pub dir: TempDir,
    pub store: Arc<SqliteStore>,
    pub queue: Arc<TransferQueue>,
    pub coordinator: Arc<WorkflowCoordinator>,
    pub scheduler: Arc<JobScheduler>,
    pub client: Arc<FakeClient>,
    pub stream: StreamConfig,
}

pub fn queue_settings(base_delay: Duration) -> QueueSettings {
    QueueSettings {
        base_delay,
        default_max_retries: 3,
        idle_poll: Duration::from_millis(20),
        purge_after: Duration::from_secs(3600),
    }
}

/// Full engine over an in-memory store with a scripted capture tool.
pub fn rig(tool_body: &str, limit: usize, client: Arc<FakeClient>) -> Result<Rig> {
    let dir = TempDir::new()?;
    let body = tool_body.replace("$DIR", &dir.path().display().to_string());
    let tool = fake_tool(dir.path(), &body);

    let store = Arc::new(SqliteStore::open_memory()?);
    let stream = StreamConfig::new("Morning Show", "http://radio.example/live", "rec@nas:/srv/in/");
    store.create_stream(&stream)?;

    let queue = Arc::new(TransferQueue::new(
        store.clone(),
        client.clone(),
        queue_settings(Duration::from_millis(30)),
    ));
    let admission = Admission::new(limit);
    let ctx = Arc::new(WorkflowContext {
        store: store.clone(),
        capture: CaptureProcess::new(CaptureSettings {
            ffmpeg: tool,
            probe_sources: false,
            poll_interval: Duration::from_millis(50),
            terminate_grace: Duration::from_millis(500),
            ..CaptureSettings::default()
        }),
        processor: Arc::new(CopyProcessor),
        sink: Arc::new(TransferHandOff::new(store.clone(), queue.clone())),
        observer: Arc::new(LoggingSessionObserver),
        recordings_dir: dir.path().join("recordings"),
    });
    let coordinator = Arc::new(WorkflowCoordinator::new(
        ctx,
        admission.clone(),
        Duration::from_secs(10),
    ));
    let scheduler = Arc::new(JobScheduler::new(
        store.clone(),
        coordinator.clone(),
        admission,
        SchedulerSettings {
            max_concurrent_sessions: limit,
            zone: CronZone::Utc,
            ..SchedulerSettings::default()
        },
    ));

    Ok(Rig {
        dir,
        store,
        queue,
        coordinator,
        scheduler,
        client,
        stream,
    })
}

impl Rig {
    /// Add an hourly trigger and make it due at `due`.
    pub fn hourly_trigger(&self, due: DateTime<Utc>, max_retries: u32) -> Result<ScheduleTrigger> {
        let mut trigger = self.scheduler.add_trigger(NewTrigger {
            stream_id: self.stream.id.clone(),
            name: "top of the hour".to_string(),
            cron: "0 * * * *".to_string(),
            duration_minutes: 30,
            max_retries,
            active: true,
        })?;
        trigger.next_fire = Some(due);
        self.store.update_trigger(&trigger)?;
        Ok(trigger)
    }

    pub fn session(&self, id: &SessionId) -> Result<RecordingSession> {
        self.store
            .get_session(id)?
            .ok_or_else(|| anyhow::anyhow!("session {} missing", id))
    }

    /// Poll the store until the session reaches `stage`.
    pub async fn wait_for_stage(&self, id: &SessionId, stage: SessionStage) -> Result<RecordingSession> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let session = self.session(id)?;
            if session.stage == stage {
                return Ok(session);
            }
            if Instant::now() > deadline {
                anyhow::bail!("session {} stuck in {} waiting for {}", id, session.stage, stage);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

pub fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 11, h, m, 0).unwrap()
}

pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}
