//! Per-recording state machine.
//!
//! A [`SessionWorkflow`] owns one [`RecordingSession`] and is its only
//! writer. It walks `Initializing → Recording → Processing → Transferring`
//! and ends in exactly one of `Completed`, `Failed` or `Cancelled`.
//! Transferring is a hand-off: the artifact is queued for delivery and the
//! session completes without waiting for the network.
//!
//! Observer callbacks are delivered in order on a dispatcher task, so a
//! slow or panicking observer never stalls or breaks the workflow.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureOutcome, CaptureProcess, CaptureSpec};
use crate::naming::{raw_capture_name, render_pattern};
use crate::processing::{AudioProcessor, TrackMetadata};
use crate::scheduler::SessionSlot;
use crate::store::{Store, StoreError};
use crate::types::{
    RecordingSession, ScheduleTrigger, SessionId, SessionStage, StreamConfig, TransferId,
};

/// How long a finished workflow waits for its observer to drain.
const OBSERVER_FLUSH: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("session {id} is {stage}; only failed sessions can be retried")]
    NotRetryable { id: SessionId, stage: SessionStage },

    #[error("session {id} has used all {max_retries} retries")]
    RetriesExhausted { id: SessionId, max_retries: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Receives stage changes and per-stage progress.
///
/// Calls arrive on a dispatcher task, in order. Implementations must not
/// block; a panic is caught and logged.
pub trait SessionObserver: Send + Sync {
    fn on_stage_change(
        &self,
        session: &SessionId,
        from: SessionStage,
        to: SessionStage,
        reason: Option<&str>,
    );

    /// `fraction` never decreases within a stage.
    fn on_progress(&self, session: &SessionId, stage: SessionStage, fraction: f64);
}

pub struct LoggingSessionObserver;

impl SessionObserver for LoggingSessionObserver {
    fn on_stage_change(
        &self,
        session: &SessionId,
        from: SessionStage,
        to: SessionStage,
        reason: Option<&str>,
    ) {
        match to {
            SessionStage::Failed => tracing::error!(
                session.id = %session,
                %from,
                %to,
                reason = reason.unwrap_or(""),
                "Session failed"
            ),
            _ => tracing::info!(session.id = %session, %from, %to, "Session stage changed"),
        }
    }

    fn on_progress(&self, session: &SessionId, stage: SessionStage, fraction: f64) {
        tracing::debug!(session.id = %session, %stage, progress = fraction, "Session progress");
    }
}

/// Where finished artifacts go. Returns the id of the queued transfer.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    async fn hand_off(&self, session: &RecordingSession, artifact: &Path) -> anyhow::Result<TransferId>;
}

/// Collaborators shared by every workflow.
pub struct WorkflowContext {
    pub store: Arc<dyn Store>,
    pub capture: CaptureProcess,
    pub processor: Arc<dyn AudioProcessor>,
    pub sink: Arc<dyn ArtifactSink>,
    pub observer: Arc<dyn SessionObserver>,
    pub recordings_dir: PathBuf,
}

enum WorkflowEvent {
    Stage {
        from: SessionStage,
        to: SessionStage,
        reason: Option<String>,
    },
    Progress {
        stage: SessionStage,
        fraction: f64,
    },
}

struct WorkflowState {
    session: RecordingSession,
    /// Last progress reported for the current stage.
    progress: Option<f64>,
    slot: Option<SessionSlot>,
    events: Option<mpsc::UnboundedSender<WorkflowEvent>>,
}

/// Early exit from a stage, carrying the terminal stage reached.
type StageResult<T> = Result<T, SessionStage>;

pub struct SessionWorkflow {
    ctx: Arc<WorkflowContext>,
    trigger: ScheduleTrigger,
    stream: StreamConfig,
    state: Mutex<WorkflowState>,
    stop: CancellationToken,
    done: CancellationToken,
}

impl SessionWorkflow {
    /// `slot` is released when the session reaches a terminal stage.
    pub fn new(
        ctx: Arc<WorkflowContext>,
        session: RecordingSession,
        trigger: ScheduleTrigger,
        stream: StreamConfig,
        slot: Option<SessionSlot>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            trigger,
            stream,
            state: Mutex::new(WorkflowState {
                session,
                progress: None,
                slot,
                events: None,
            }),
            stop: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, WorkflowState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> SessionId {
        self.state().session.id.clone()
    }

    pub fn stage(&self) -> SessionStage {
        self.state().session.stage
    }

    pub fn snapshot(&self) -> RecordingSession {
        self.state().session.clone()
    }

    pub fn trigger(&self) -> &ScheduleTrigger {
        &self.trigger
    }

    pub fn stream(&self) -> &StreamConfig {
        &self.stream
    }

    /// Ask the workflow to stop. Observed within one capture poll.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait up to `timeout` for the run to end. Returns false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.done.cancelled())
            .await
            .is_ok()
    }

    pub fn start(self: &Arc<Self>) -> JoinHandle<SessionStage> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Drive the session to a terminal stage.
    pub async fn run(self: Arc<Self>) -> SessionStage {
        let id = self.id();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = spawn_dispatcher(Arc::clone(&self.ctx.observer), id.clone(), rx);
        self.state().events = Some(tx);

        tracing::info!(
            session.id = %id,
            trigger.id = %self.trigger.id,
            stream = %self.stream.name,
            attempt = self.state().session.attempt,
            "Session starting"
        );

        let stage = match self.drive().await {
            Ok(stage) | Err(stage) => stage,
        };

        {
            let mut state = self.state();
            state.slot.take();
            state.events.take();
        }
        if tokio::time::timeout(OBSERVER_FLUSH, dispatcher).await.is_err() {
            tracing::warn!(session.id = %id, "Session observer did not drain in time");
        }
        self.done.cancel();
        stage
    }

    async fn drive(&self) -> StageResult<SessionStage> {
        self.check_stop("stopped before recording started")?;

        let started_local = Local::now();
        let raw = self
            .ctx
            .recordings_dir
            .join(raw_capture_name(&self.stream.name, &started_local));
        let artifact = self.ctx.recordings_dir.join(render_pattern(
            &self.stream.filename_pattern,
            &self.stream.name,
            &started_local,
        ));
        self.update(|s| {
            s.raw_path = Some(raw.clone());
            s.artifact_path = Some(artifact.clone());
        });

        self.record(&raw).await?;
        self.process(&raw, &artifact, &started_local).await?;
        let transfer_id = self.hand_off(&artifact).await?;

        if raw != artifact {
            if let Err(e) = tokio::fs::remove_file(&raw).await {
                tracing::debug!(path = %raw.display(), error = %e, "Raw capture already gone");
            }
        }
        tracing::info!(
            session.id = %self.id(),
            transfer.id = %transfer_id,
            artifact = %artifact.display(),
            "Session handed off"
        );
        Ok(self.finish(SessionStage::Completed, None))
    }

    async fn record(&self, raw: &Path) -> StageResult<u64> {
        self.transition(SessionStage::Recording, None);

        let spec = CaptureSpec {
            source_url: self.stream.source_url.clone(),
            output: raw.to_path_buf(),
            duration: Some(Duration::from_secs(u64::from(self.trigger.duration_minutes) * 60)),
        };
        let handle = match self.ctx.capture.start(spec).await {
            Ok(handle) => handle,
            Err(e) => return Err(self.fail(format!("capture failed to start: {}", e))),
        };

        let outcome = handle
            .monitor(&self.stop, |progress| {
                self.state().session.bytes_captured = progress.bytes;
                if let Some(fraction) = progress.fraction {
                    self.report_progress(SessionStage::Recording, fraction);
                }
            })
            .await;

        match outcome {
            CaptureOutcome::Completed { bytes, elapsed } => {
                self.update(|s| s.bytes_captured = bytes);
                self.report_progress(SessionStage::Recording, 1.0);
                tracing::info!(
                    session.id = %self.id(),
                    bytes,
                    elapsed_secs = elapsed.as_secs(),
                    "Recording finished"
                );
                Ok(bytes)
            }
            CaptureOutcome::Stopped { bytes } => {
                self.update(|s| s.bytes_captured = bytes);
                Err(self.finish(
                    SessionStage::Cancelled,
                    Some("stopped during recording".to_string()),
                ))
            }
            CaptureOutcome::Failed {
                reason,
                stderr_tail,
                ..
            } => Err(self.fail(capture_failure_reason(&reason, &stderr_tail))),
        }
    }

    async fn process(
        &self,
        raw: &Path,
        artifact: &Path,
        recorded_at: &DateTime<Local>,
    ) -> StageResult<()> {
        self.check_stop("stopped before processing")?;
        self.transition(SessionStage::Processing, None);
        self.report_progress(SessionStage::Processing, 0.0);

        let metadata = TrackMetadata::for_recording(&self.stream, &recorded_at.fixed_offset());
        let artwork = self.stream.artwork_path.as_deref();
        match self
            .ctx
            .processor
            .process(raw, artifact, &metadata, artwork)
            .await
        {
            Ok(()) => {
                self.report_progress(SessionStage::Processing, 1.0);
                Ok(())
            }
            // raw capture stays on disk for diagnosis
            Err(e) => Err(self.fail(format!("processing failed: {}", e))),
        }
    }

    async fn hand_off(&self, artifact: &Path) -> StageResult<TransferId> {
        self.check_stop("stopped before hand-off")?;
        self.transition(SessionStage::Transferring, None);
        self.report_progress(SessionStage::Transferring, 0.0);

        let snapshot = self.snapshot();
        match self.ctx.sink.hand_off(&snapshot, artifact).await {
            Ok(transfer_id) => {
                self.update(|s| s.transfer_id = Some(transfer_id.clone()));
                self.report_progress(SessionStage::Transferring, 1.0);
                Ok(transfer_id)
            }
            Err(e) => Err(self.fail(format!("hand-off failed: {:#}", e))),
        }
    }

    fn check_stop(&self, reason: &str) -> StageResult<()> {
        if self.stop.is_cancelled() {
            return Err(self.finish(SessionStage::Cancelled, Some(reason.to_string())));
        }
        Ok(())
    }

    fn fail(&self, reason: String) -> SessionStage {
        self.finish(SessionStage::Failed, Some(reason))
    }

    fn finish(&self, stage: SessionStage, reason: Option<String>) -> SessionStage {
        self.transition(stage, reason);
        stage
    }

    /// Move to `to`, persist and notify. Terminal stages are final.
    fn transition(&self, to: SessionStage, reason: Option<String>) {
        let (snapshot, from) = {
            let mut state = self.state();
            let from = state.session.stage;
            if from.is_terminal() {
                tracing::warn!(
                    session.id = %state.session.id,
                    %from,
                    %to,
                    "Ignoring transition out of terminal stage"
                );
                return;
            }

            let now = Utc::now();
            let session = &mut state.session;
            session.stage = to;
            session.updated_at = now;
            if to == SessionStage::Recording {
                session.started_at = Some(now);
            }
            if to.is_terminal() {
                session.finished_at = Some(now);
                session.failure_reason = reason.clone();
            }
            state.progress = None;
            if to.is_terminal() {
                // frees the admission slot at hand-off, not at delivery
                state.slot.take();
            }
            if let Some(events) = &state.events {
                let _ = events.send(WorkflowEvent::Stage { from, to, reason });
            }
            (state.session.clone(), from)
        };

        tracing::debug!(session.id = %snapshot.id, %from, %to, "Session transition");
        self.persist(&snapshot);
    }

    fn report_progress(&self, stage: SessionStage, fraction: f64) {
        let fraction = fraction.clamp(0.0, 1.0);
        let mut state = self.state();
        if state.session.stage != stage {
            return;
        }
        if state.progress.is_some_and(|last| fraction <= last) {
            return;
        }
        state.progress = Some(fraction);
        if let Some(events) = &state.events {
            let _ = events.send(WorkflowEvent::Progress { stage, fraction });
        }
    }

    fn update<F: FnOnce(&mut RecordingSession)>(&self, f: F) {
        let snapshot = {
            let mut state = self.state();
            f(&mut state.session);
            state.session.updated_at = Utc::now();
            state.session.clone()
        };
        self.persist(&snapshot);
    }

    fn persist(&self, session: &RecordingSession) {
        if let Err(e) = self.ctx.store.update_session(session) {
            tracing::error!(session.id = %session.id, error = %e, "Failed to persist session");
        }
    }
}

fn spawn_dispatcher(
    observer: Arc<dyn SessionObserver>,
    id: SessionId,
    mut rx: mpsc::UnboundedReceiver<WorkflowEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let result = catch_unwind(AssertUnwindSafe(|| match &event {
                WorkflowEvent::Stage { from, to, reason } => {
                    observer.on_stage_change(&id, *from, *to, reason.as_deref())
                }
                WorkflowEvent::Progress { stage, fraction } => {
                    observer.on_progress(&id, *stage, *fraction)
                }
            }));
            if result.is_err() {
                tracing::error!(session.id = %id, "Session observer panicked");
            }
        }
    })
}

fn capture_failure_reason(reason: &str, stderr_tail: &str) -> String {
    match stderr_tail.lines().rev().find(|l| !l.trim().is_empty()) {
        Some(last) => format!("{}: {}", reason, last.trim()),
        None => reason.to_string(),
    }
}

/// Reset a failed session for another attempt.
///
/// Files from the previous attempt are deleted first so at most one
/// attempt's artifacts ever exist. `max_retries` counts retries, not runs.
pub async fn prepare_retry(
    session: &mut RecordingSession,
    max_retries: u32,
) -> Result<(), WorkflowError> {
    if session.stage != SessionStage::Failed {
        return Err(WorkflowError::NotRetryable {
            id: session.id.clone(),
            stage: session.stage,
        });
    }
    if session.attempt > max_retries {
        return Err(WorkflowError::RetriesExhausted {
            id: session.id.clone(),
            max_retries,
        });
    }

    for path in [session.raw_path.take(), session.artifact_path.take()]
        .into_iter()
        .flatten()
    {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => tracing::debug!(path = %path.display(), "Removed previous attempt output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    let now = Utc::now();
    session.stage = SessionStage::Initializing;
    session.attempt += 1;
    session.transfer_id = None;
    session.failure_reason = None;
    session.bytes_captured = 0;
    session.started_at = None;
    session.finished_at = None;
    session.updated_at = now;
    Ok(())
}
