//! Live session registry and the glue between scheduler, workflows and
//! the transfer queue.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

use crate::scheduler::{Admission, SessionSlot, SessionStarter};
use crate::store::{Store, StoreError};
use crate::transfer::{EnqueueRequest, TransferQueue};
use crate::types::{
    RecordingSession, ScheduleTrigger, SessionId, SessionStage, StreamId, TransferId, TriggerId,
};
use crate::workflow::{prepare_retry, ArtifactSink, SessionWorkflow, WorkflowContext, WorkflowError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error("trigger {0} not found")]
    TriggerNotFound(TriggerId),

    #[error("stream {0} not found")]
    StreamNotFound(StreamId),

    #[error("session {0} is still running")]
    AlreadyRunning(SessionId),

    #[error("all {0} session slots are busy")]
    AtCapacity(usize),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopResult {
    NotRunning,
    Stopped(SessionStage),
    /// Still running after the stop timeout.
    Stuck,
}

type Registry = Arc<Mutex<HashMap<SessionId, Arc<SessionWorkflow>>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionWorkflow>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WorkflowCoordinator {
    ctx: Arc<WorkflowContext>,
    admission: Admission,
    sessions: Registry,
    stop_timeout: Duration,
}

impl WorkflowCoordinator {
    pub fn new(ctx: Arc<WorkflowContext>, admission: Admission, stop_timeout: Duration) -> Self {
        Self {
            ctx,
            admission,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            stop_timeout,
        }
    }

    fn store(&self) -> &Arc<dyn Store> {
        &self.ctx.store
    }

    /// Mark sessions left mid-flight by a crash as failed.
    pub fn recover_interrupted(&self) -> Result<usize, CoordinatorError> {
        let failed = self
            .store()
            .fail_interrupted_sessions("interrupted by daemon shutdown")?;
        if failed > 0 {
            tracing::warn!(count = failed, "Marked interrupted sessions as failed");
        }
        Ok(failed)
    }

    /// Register and spawn a workflow. The entry leaves the registry when
    /// the run ends, including when it panics.
    fn launch(&self, workflow: Arc<SessionWorkflow>) -> SessionId {
        let id = workflow.id();
        lock(&self.sessions).insert(id.clone(), Arc::clone(&workflow));

        let registry = Arc::clone(&self.sessions);
        let store = Arc::clone(self.store());
        let task_id = id.clone();
        tokio::spawn(async move {
            match workflow.start().await {
                Ok(stage) => {
                    tracing::debug!(session.id = %task_id, %stage, "Session task finished")
                }
                Err(e) => {
                    tracing::error!(session.id = %task_id, error = %e, "Session task aborted");
                    mark_aborted(store.as_ref(), &task_id, &e.to_string());
                }
            }
            lock(&registry).remove(&task_id);
        });
        id
    }

    fn workflow_for(
        &self,
        session: RecordingSession,
        trigger: ScheduleTrigger,
        slot: SessionSlot,
    ) -> Result<Arc<SessionWorkflow>, CoordinatorError> {
        let stream = self
            .store()
            .get_stream(&trigger.stream_id)?
            .ok_or_else(|| CoordinatorError::StreamNotFound(trigger.stream_id.clone()))?;
        Ok(SessionWorkflow::new(
            Arc::clone(&self.ctx),
            session,
            trigger,
            stream,
            Some(slot),
        ))
    }

    /// Snapshots of every live session, oldest first.
    pub fn list_active_sessions(&self) -> Vec<RecordingSession> {
        let mut sessions: Vec<RecordingSession> = lock(&self.sessions)
            .values()
            .map(|wf| wf.snapshot())
            .collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    /// Request a stop and wait up to the stop timeout for the task to end.
    pub async fn stop_session(&self, id: &SessionId) -> StopResult {
        let Some(workflow) = lock(&self.sessions).get(id).cloned() else {
            return StopResult::NotRunning;
        };
        self.stop_workflow(&workflow).await
    }

    async fn stop_workflow(&self, workflow: &SessionWorkflow) -> StopResult {
        workflow.request_stop();
        if workflow.wait(self.stop_timeout).await {
            StopResult::Stopped(workflow.stage())
        } else {
            tracing::error!(
                session.id = %workflow.id(),
                stage = %workflow.stage(),
                timeout_secs = self.stop_timeout.as_secs(),
                "Session did not stop in time"
            );
            StopResult::Stuck
        }
    }

    /// Stop every live session in parallel. Returns how many were stuck.
    pub async fn stop_all(&self) -> usize {
        let workflows: Vec<Arc<SessionWorkflow>> = lock(&self.sessions).values().cloned().collect();
        if workflows.is_empty() {
            return 0;
        }
        tracing::info!(count = workflows.len(), "Stopping all sessions");

        let results =
            futures::future::join_all(workflows.iter().map(|wf| self.stop_workflow(wf))).await;
        results.iter().filter(|r| **r == StopResult::Stuck).count()
    }

    /// Start another attempt of a failed session, within its trigger's
    /// retry budget and subject to admission.
    pub async fn retry_session(&self, id: &SessionId) -> Result<SessionId, CoordinatorError> {
        if lock(&self.sessions).contains_key(id) {
            return Err(CoordinatorError::AlreadyRunning(id.clone()));
        }
        let mut session = self
            .store()
            .get_session(id)?
            .ok_or_else(|| CoordinatorError::SessionNotFound(id.clone()))?;
        let trigger = self
            .store()
            .get_trigger(&session.trigger_id)?
            .ok_or_else(|| CoordinatorError::TriggerNotFound(session.trigger_id.clone()))?;

        if session.stage != SessionStage::Failed {
            return Err(WorkflowError::NotRetryable {
                id: id.clone(),
                stage: session.stage,
            }
            .into());
        }
        if session.attempt > trigger.max_retries {
            return Err(WorkflowError::RetriesExhausted {
                id: id.clone(),
                max_retries: trigger.max_retries,
            }
            .into());
        }

        let slot = self
            .admission
            .try_acquire()
            .ok_or(CoordinatorError::AtCapacity(self.admission.limit()))?;

        prepare_retry(&mut session, trigger.max_retries).await?;
        self.store().update_session(&session)?;

        tracing::info!(session.id = %id, attempt = session.attempt, "Retrying session");
        let workflow = self.workflow_for(session, trigger, slot)?;
        Ok(self.launch(workflow))
    }
}

#[async_trait]
impl SessionStarter for WorkflowCoordinator {
    async fn start_session(
        &self,
        trigger: &ScheduleTrigger,
        session: RecordingSession,
        slot: SessionSlot,
    ) -> anyhow::Result<SessionId> {
        let workflow = self.workflow_for(session, trigger.clone(), slot)?;
        Ok(self.launch(workflow))
    }
}

fn mark_aborted(store: &dyn Store, id: &SessionId, message: &str) {
    let result = store.get_session(id).and_then(|session| match session {
        Some(mut s) if !s.stage.is_terminal() => {
            let now = Utc::now();
            s.stage = SessionStage::Failed;
            s.failure_reason = Some(format!("internal error: {}", message));
            s.finished_at = Some(now);
            s.updated_at = now;
            store.update_session(&s)
        }
        _ => Ok(()),
    });
    if let Err(e) = result {
        tracing::error!(session.id = %id, error = %e, "Failed to record aborted session");
    }
}

/// Queues finished artifacts for delivery to their stream's destination.
pub struct TransferHandOff {
    store: Arc<dyn Store>,
    queue: Arc<TransferQueue>,
}

impl TransferHandOff {
    pub fn new(store: Arc<dyn Store>, queue: Arc<TransferQueue>) -> Self {
        Self { store, queue }
    }
}

#[async_trait]
impl ArtifactSink for TransferHandOff {
    async fn hand_off(&self, session: &RecordingSession, artifact: &Path) -> anyhow::Result<TransferId> {
        let trigger = self
            .store
            .get_trigger(&session.trigger_id)?
            .with_context(|| format!("trigger {} not found", session.trigger_id))?;
        let stream = self
            .store
            .get_stream(&trigger.stream_id)?
            .with_context(|| format!("stream {} not found", trigger.stream_id))?;

        let request = EnqueueRequest::new(artifact, stream.destination.clone())
            .session(session.id.clone())
            .metadata(serde_json::json!({
                "stream": stream.name,
                "trigger": trigger.name,
                "attempt": session.attempt,
            }));
        let id = self
            .queue
            .enqueue(request)
            .with_context(|| format!("failed to queue {}", artifact.display()))?;

        tracing::info!(
            session.id = %session.id,
            transfer.id = %id,
            destination = %stream.destination,
            "Artifact queued for transfer"
        );
        Ok(id)
    }
}
