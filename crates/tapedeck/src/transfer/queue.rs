//! Durable transfer queue with backoff retry.
//!
//! Records live in the [`Store`]; the in-memory [`ReadySet`] mirrors only
//! entries whose eligible time has come, plus failed entries reinserted with
//! a future eligible time. Workers pop the highest-priority eligible entry,
//! earliest eligible first on ties.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::backoff::retry_delay;
use super::client::{ProgressFn, TransferClient, TransferError};
use super::destination::{Destination, DestinationError};
use crate::store::{Store, StoreError};
use crate::types::{QueuedTransfer, SessionId, TransferId, TransferStatus};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    InvalidDestination(#[from] DestinationError),

    #[error("local file {0} does not exist")]
    FileNotFound(PathBuf),

    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error("transfer {id} is {status}; only failed transfers can be retried")]
    NotRetryable { id: TransferId, status: TransferStatus },

    #[error("transfer {0} is being uploaded")]
    InProgress(TransferId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Backoff base; attempt n waits `base * 2^(n-1)`.
    pub base_delay: Duration,
    pub default_max_retries: u32,
    /// Longest a worker sleeps before re-checking the store.
    pub idle_poll: Duration,
    /// Failed records older than this are purged.
    pub purge_after: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            default_max_retries: 3,
            idle_poll: Duration::from_secs(5),
            purge_after: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl QueueSettings {
    pub fn from_config(config: &tapeconf::TapeConfig) -> Self {
        let transfer = &config.defaults.transfer;
        Self {
            base_delay: transfer.retry_delay(),
            default_max_retries: transfer.default_max_retries,
            purge_after: Duration::from_secs(u64::from(transfer.purge_after_days) * 24 * 3600),
            ..Self::default()
        }
    }
}

/// Parameters for [`TransferQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub local_path: PathBuf,
    pub destination: String,
    pub priority: i32,
    pub max_retries: Option<u32>,
    /// Delay before the first attempt.
    pub delay: Duration,
    pub session_id: Option<SessionId>,
    pub metadata: serde_json::Value,
}

impl EnqueueRequest {
    pub fn new(local_path: impl Into<PathBuf>, destination: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            destination: destination.into(),
            priority: 0,
            max_retries: None,
            delay: Duration::ZERO,
            session_id: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub in_progress: usize,
    pub failed: usize,
    /// Entries currently mirrored in memory.
    pub ready: usize,
    pub workers_running: usize,
}

/// Result of handling one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Delivered,
    Retrying { attempts: u32, delay: Duration },
    Failed { attempts: u32 },
    /// The local file vanished; failed without using an attempt.
    SourceMissing,
    /// Removed or changed state after it was picked.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReadyEntry {
    id: TransferId,
    priority: i32,
    eligible_at: DateTime<Utc>,
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then earlier eligible time
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.eligible_at.cmp(&self.eligible_at))
            .then_with(|| other.id.as_str().cmp(self.id.as_str()))
    }
}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<&QueuedTransfer> for ReadyEntry {
    fn from(t: &QueuedTransfer) -> Self {
        Self {
            id: t.id.clone(),
            priority: t.priority,
            eligible_at: t.eligible_at,
        }
    }
}

/// Heap of entries to drain plus bookkeeping to avoid double handling.
#[derive(Default)]
struct ReadySet {
    heap: BinaryHeap<ReadyEntry>,
    members: HashSet<TransferId>,
    in_flight: HashSet<TransferId>,
}

impl ReadySet {
    fn insert(&mut self, entry: ReadyEntry) -> bool {
        if self.members.contains(&entry.id) || self.in_flight.contains(&entry.id) {
            return false;
        }
        self.members.insert(entry.id.clone());
        self.heap.push(entry);
        true
    }

    /// Best eligible entry; ineligible ones met on the way are put back.
    fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<ReadyEntry> {
        let mut deferred = Vec::new();
        let mut found = None;
        while let Some(entry) = self.heap.pop() {
            if entry.eligible_at <= now {
                found = Some(entry);
                break;
            }
            deferred.push(entry);
        }
        self.heap.extend(deferred);

        let entry = found?;
        self.members.remove(&entry.id);
        self.in_flight.insert(entry.id.clone());
        Some(entry)
    }

    fn finish(&mut self, id: &TransferId) {
        self.in_flight.remove(id);
    }

    fn remove(&mut self, id: &TransferId) {
        if self.members.remove(id) {
            self.heap.retain(|e| &e.id != id);
        }
    }

    fn next_eligible(&self) -> Option<DateTime<Utc>> {
        self.heap.iter().map(|e| e.eligible_at).min()
    }

    fn len(&self) -> usize {
        self.heap.len()
    }
}

pub struct TransferQueue {
    store: Arc<dyn Store>,
    client: Arc<dyn TransferClient>,
    settings: QueueSettings,
    ready: Mutex<ReadySet>,
    wake: Notify,
    workers_running: AtomicUsize,
}

impl TransferQueue {
    pub fn new(store: Arc<dyn Store>, client: Arc<dyn TransferClient>, settings: QueueSettings) -> Self {
        Self {
            store,
            client,
            settings,
            ready: Mutex::new(ReadySet::default()),
            wake: Notify::new(),
            workers_running: AtomicUsize::new(0),
        }
    }

    fn ready(&self) -> MutexGuard<'_, ReadySet> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload after a restart: interrupted uploads go back to queued and
    /// every due entry is mirrored.
    pub fn rehydrate(&self) -> Result<usize, QueueError> {
        let requeued = self.store.requeue_in_progress_transfers()?;
        if requeued > 0 {
            tracing::warn!(count = requeued, "Re-queued transfers interrupted by shutdown");
        }
        let loaded = self.promote_due()?;
        tracing::info!(ready = loaded, "Transfer queue rehydrated");
        Ok(loaded)
    }

    /// Mirror store entries that have become eligible.
    pub fn promote_due(&self) -> Result<usize, QueueError> {
        let due = self.store.list_due_transfers(Utc::now())?;
        let inserted = {
            let mut ready = self.ready();
            due.iter()
                .filter(|t| ready.insert(ReadyEntry::from(*t)))
                .count()
        };
        if inserted > 0 {
            self.wake.notify_waiters();
        }
        Ok(inserted)
    }

    /// Validate and persist a new transfer.
    pub fn enqueue(&self, request: EnqueueRequest) -> Result<TransferId, QueueError> {
        Destination::parse(&request.destination)?;
        if !request.local_path.is_file() {
            return Err(QueueError::FileNotFound(request.local_path));
        }

        let now = Utc::now();
        let delay = chrono::Duration::from_std(request.delay).unwrap_or(chrono::Duration::zero());
        let transfer = QueuedTransfer {
            id: TransferId::new(),
            local_path: request.local_path,
            destination: request.destination,
            priority: request.priority,
            attempts: 0,
            max_retries: request
                .max_retries
                .unwrap_or(self.settings.default_max_retries),
            eligible_at: now + delay,
            status: TransferStatus::Queued,
            last_error: None,
            session_id: request.session_id,
            metadata: request.metadata,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_transfer(&transfer)?;

        tracing::info!(
            transfer.id = %transfer.id,
            local = %transfer.local_path.display(),
            destination = %transfer.destination,
            priority = transfer.priority,
            delay_secs = request.delay.as_secs(),
            "Transfer queued"
        );

        self.promote_due()?;
        self.wake.notify_one();
        Ok(transfer.id)
    }

    pub fn status(&self) -> Result<QueueStatus, QueueError> {
        let counts = self.store.transfer_counts()?;
        Ok(QueueStatus {
            queued: counts.queued,
            in_progress: counts.in_progress,
            failed: counts.failed,
            ready: self.ready().len(),
            workers_running: self.workers_running.load(AtomicOrdering::SeqCst),
        })
    }

    pub fn get(&self, id: &TransferId) -> Result<Option<QueuedTransfer>, QueueError> {
        Ok(self.store.get_transfer(id)?)
    }

    /// Queued, in-progress and failed records in drain order.
    pub fn list_pending(&self, limit: usize) -> Result<Vec<QueuedTransfer>, QueueError> {
        Ok(self.store.list_pending_transfers(limit)?)
    }

    /// Give a permanently failed transfer a fresh set of attempts.
    pub fn retry(&self, id: &TransferId) -> Result<(), QueueError> {
        let mut record = self
            .store
            .get_transfer(id)?
            .ok_or_else(|| QueueError::NotFound(id.clone()))?;
        if record.status != TransferStatus::Failed {
            return Err(QueueError::NotRetryable {
                id: id.clone(),
                status: record.status,
            });
        }

        let now = Utc::now();
        record.status = TransferStatus::Queued;
        record.attempts = 0;
        record.last_error = None;
        record.eligible_at = now;
        record.updated_at = now;
        self.store.update_transfer(&record)?;
        self.ready().insert(ReadyEntry::from(&record));
        self.wake.notify_one();

        tracing::info!(transfer.id = %id, "Transfer re-queued by operator");
        Ok(())
    }

    pub fn remove(&self, id: &TransferId) -> Result<bool, QueueError> {
        if let Some(record) = self.store.get_transfer(id)? {
            if record.status == TransferStatus::InProgress {
                return Err(QueueError::InProgress(id.clone()));
            }
        }
        self.ready().remove(id);
        let removed = self.store.delete_transfer(id)?;
        if removed {
            tracing::info!(transfer.id = %id, "Transfer removed");
        }
        Ok(removed)
    }

    /// Drop failed records older than the retention period.
    pub fn purge(&self) -> Result<usize, QueueError> {
        let retention = chrono::Duration::from_std(self.settings.purge_after)
            .unwrap_or(chrono::Duration::days(7));
        let purged = self.store.purge_failed_transfers(Utc::now() - retention)?;
        if purged > 0 {
            tracing::info!(count = purged, "Purged old failed transfers");
        }
        Ok(purged)
    }

    /// Handle at most one eligible entry. `Ok(None)` means nothing was ready.
    pub async fn process_next(&self) -> Result<Option<(TransferId, TransferOutcome)>, QueueError> {
        let Some(entry) = self.ready().pop_ready(Utc::now()) else {
            return Ok(None);
        };

        let result = self.process(&entry.id).await;
        self.ready().finish(&entry.id);
        match &result {
            Ok(TransferOutcome::Retrying { .. }) => {
                if let Ok(Some(record)) = self.store.get_transfer(&entry.id) {
                    self.ready().insert(ReadyEntry::from(&record));
                }
            }
            Err(_) => self.release(&entry.id),
            Ok(_) => {}
        }
        result.map(|outcome| Some((entry.id, outcome)))
    }

    /// Return an entry left InProgress by an aborted attempt to Queued.
    /// Attempts and eligibility are untouched.
    fn release(&self, id: &TransferId) {
        let mut record = match self.store.get_transfer(id) {
            Ok(Some(record)) if record.status == TransferStatus::InProgress => record,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(transfer.id = %id, error = %e, "Cannot reload transfer to release it");
                return;
            }
        };
        record.status = TransferStatus::Queued;
        record.updated_at = Utc::now();
        match self.store.update_transfer(&record) {
            Ok(()) => {
                self.ready().insert(ReadyEntry::from(&record));
                tracing::warn!(transfer.id = %id, "Transfer released back to the queue");
            }
            Err(e) => tracing::error!(
                transfer.id = %id,
                error = %e,
                "Cannot release transfer; it stays in progress until restart"
            ),
        }
    }

    async fn process(&self, id: &TransferId) -> Result<TransferOutcome, QueueError> {
        let Some(mut record) = self.store.get_transfer(id)? else {
            return Ok(TransferOutcome::Skipped);
        };
        if record.status != TransferStatus::Queued {
            return Ok(TransferOutcome::Skipped);
        }

        record.status = TransferStatus::InProgress;
        record.updated_at = Utc::now();
        self.store.update_transfer(&record)?;

        if !record.local_path.exists() {
            tracing::error!(
                transfer.id = %id,
                local = %record.local_path.display(),
                "Local file vanished before upload"
            );
            self.mark_failed(&mut record, "local file not found".to_string())?;
            return Ok(TransferOutcome::SourceMissing);
        }

        let destination = match Destination::parse(&record.destination) {
            Ok(d) => d,
            Err(e) => {
                self.mark_failed(&mut record, e.to_string())?;
                return Ok(TransferOutcome::Failed {
                    attempts: record.attempts,
                });
            }
        };

        let progress_id = id.clone();
        let progress: ProgressFn = Arc::new(move |sent, total| {
            tracing::trace!(transfer.id = %progress_id, sent, total, "Upload progress");
        });

        tracing::info!(
            transfer.id = %id,
            attempt = record.attempts + 1,
            max_retries = record.max_retries,
            destination = %destination,
            "Uploading"
        );

        match self
            .client
            .upload(&record.local_path, &destination, Some(progress))
            .await
        {
            Ok(report) => {
                self.store.delete_transfer(id)?;
                tracing::info!(
                    transfer.id = %id,
                    remote_path = %report.remote_path,
                    bytes = report.bytes,
                    "Transfer delivered"
                );
                Ok(TransferOutcome::Delivered)
            }
            Err(TransferError::LocalFileMissing(path)) => {
                self.mark_failed(&mut record, format!("local file not found: {}", path.display()))?;
                Ok(TransferOutcome::SourceMissing)
            }
            Err(e) => self.record_failure(&mut record, e),
        }
    }

    fn record_failure(
        &self,
        record: &mut QueuedTransfer,
        error: TransferError,
    ) -> Result<TransferOutcome, QueueError> {
        record.attempts += 1;
        record.last_error = Some(error.to_string());
        let now = Utc::now();
        record.updated_at = now;

        if record.attempts < record.max_retries {
            let delay = retry_delay(self.settings.base_delay, record.attempts);
            record.eligible_at =
                now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::days(3650));
            record.status = TransferStatus::Queued;
            self.store.update_transfer(record)?;
            tracing::warn!(
                transfer.id = %record.id,
                attempts = record.attempts,
                max_retries = record.max_retries,
                kind = ?error.kind(),
                retry_in_secs = delay.as_secs_f64(),
                error = %error,
                "Transfer failed, will retry"
            );
            Ok(TransferOutcome::Retrying {
                attempts: record.attempts,
                delay,
            })
        } else {
            record.status = TransferStatus::Failed;
            self.store.update_transfer(record)?;
            tracing::error!(
                transfer.id = %record.id,
                attempts = record.attempts,
                kind = ?error.kind(),
                error = %error,
                "Transfer permanently failed"
            );
            Ok(TransferOutcome::Failed {
                attempts: record.attempts,
            })
        }
    }

    fn mark_failed(&self, record: &mut QueuedTransfer, reason: String) -> Result<(), QueueError> {
        record.status = TransferStatus::Failed;
        record.last_error = Some(reason);
        record.updated_at = Utc::now();
        self.store.update_transfer(record)?;
        Ok(())
    }

    /// How long an idle worker should sleep.
    fn idle_wait(&self) -> Duration {
        let poll = self.settings.idle_poll;
        match self.ready().next_eligible() {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(poll),
            None => poll,
        }
    }

    /// Drain loop for one worker; returns when `cancel` fires.
    ///
    /// An upload already running when `cancel` fires is allowed to finish.
    pub async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        self.workers_running.fetch_add(1, AtomicOrdering::SeqCst);
        tracing::info!(worker, "Transfer worker started");

        while !cancel.is_cancelled() {
            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(worker, error = %e, "Transfer worker error");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.idle_poll) => {}
                    }
                }
            }

            let wait = self.idle_wait();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            if let Err(e) = self.promote_due() {
                tracing::warn!(worker, error = %e, "Failed to load due transfers");
            }
        }

        self.workers_running.fetch_sub(1, AtomicOrdering::SeqCst);
        tracing::info!(worker, "Transfer worker stopped");
    }

    pub fn spawn_workers(self: &Arc<Self>, count: usize, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| tokio::spawn(Arc::clone(self).run_worker(worker, cancel.child_token())))
            .collect()
    }
}
