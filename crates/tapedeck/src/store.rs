//! Durable records for streams, triggers, sessions and queued transfers.
//!
//! `Store` is the seam the engine talks to; `SqliteStore` is the shipped
//! implementation. Calls are short and blocking; async callers use them
//! directly the way they would a mutex.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::types::{
    QueuedTransfer, RecordingSession, ScheduleTrigger, SessionId, SessionStage, StreamConfig,
    StreamId, TransferId, TransferStatus, TriggerId,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} {id} is still referenced by {count} {referrer}")]
    InUse {
        kind: &'static str,
        id: String,
        count: usize,
        referrer: &'static str,
    },

    #[error("database lock poisoned")]
    Poisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome counts for one trigger's sessions over a window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TriggerStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// Wall time between start and finish, completed sessions only.
    pub recorded_secs: i64,
    /// Bytes captured, completed sessions only.
    pub bytes_captured: u64,
}

impl TriggerStats {
    /// Percentage of sessions that completed; 0 when there were none.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 * 100.0 / self.total as f64
        }
    }

    pub fn average_bytes(&self) -> u64 {
        if self.completed == 0 {
            0
        } else {
            self.bytes_captured / self.completed as u64
        }
    }

    fn add(&mut self, session: &RecordingSession) {
        self.total += 1;
        match session.stage {
            SessionStage::Completed => {
                self.completed += 1;
                self.bytes_captured += session.bytes_captured;
                if let (Some(start), Some(end)) = (session.started_at, session.finished_at) {
                    self.recorded_secs += (end - start).num_seconds().max(0);
                }
            }
            SessionStage::Failed => self.failed += 1,
            SessionStage::Cancelled => self.cancelled += 1,
            _ => {}
        }
    }
}

/// Per-status transfer counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounts {
    pub queued: usize,
    pub in_progress: usize,
    pub failed: usize,
}

/// Persistence for everything the engine must remember across restarts.
///
/// Each entity has a single writer: triggers are written by the scheduler,
/// sessions by their workflow, transfers by the queue.
pub trait Store: Send + Sync {
    // --- Streams ---
    fn create_stream(&self, stream: &StreamConfig) -> StoreResult<()>;
    fn get_stream(&self, id: &StreamId) -> StoreResult<Option<StreamConfig>>;
    fn list_streams(&self) -> StoreResult<Vec<StreamConfig>>;
    fn update_stream(&self, stream: &StreamConfig) -> StoreResult<()>;
    /// Refused while an active trigger references the stream.
    fn delete_stream(&self, id: &StreamId) -> StoreResult<bool>;

    // --- Triggers ---
    fn create_trigger(&self, trigger: &ScheduleTrigger) -> StoreResult<()>;
    fn get_trigger(&self, id: &TriggerId) -> StoreResult<Option<ScheduleTrigger>>;
    fn list_triggers(&self) -> StoreResult<Vec<ScheduleTrigger>>;
    fn list_active_triggers(&self) -> StoreResult<Vec<ScheduleTrigger>>;
    fn update_trigger(&self, trigger: &ScheduleTrigger) -> StoreResult<()>;
    /// Refused while a non-terminal session references the trigger.
    fn delete_trigger(&self, id: &TriggerId) -> StoreResult<bool>;

    // --- Sessions ---
    fn create_session(&self, session: &RecordingSession) -> StoreResult<()>;
    fn get_session(&self, id: &SessionId) -> StoreResult<Option<RecordingSession>>;
    fn update_session(&self, session: &RecordingSession) -> StoreResult<()>;
    /// Newest first.
    fn list_sessions(&self, limit: usize) -> StoreResult<Vec<RecordingSession>>;
    /// Newest first.
    fn list_sessions_for_trigger(
        &self,
        trigger_id: &TriggerId,
        limit: usize,
    ) -> StoreResult<Vec<RecordingSession>>;
    /// Sessions created at or after `since`.
    fn trigger_stats(
        &self,
        trigger_id: &TriggerId,
        since: DateTime<Utc>,
    ) -> StoreResult<TriggerStats>;
    /// Delete terminal sessions that finished before `older_than`.
    fn purge_sessions(&self, older_than: DateTime<Utc>) -> StoreResult<usize>;
    fn list_unfinished_sessions(&self) -> StoreResult<Vec<RecordingSession>>;
    /// Mark every non-terminal session Failed; used after an unclean exit.
    fn fail_interrupted_sessions(&self, reason: &str) -> StoreResult<usize>;

    // --- Transfers ---
    fn insert_transfer(&self, transfer: &QueuedTransfer) -> StoreResult<()>;
    fn get_transfer(&self, id: &TransferId) -> StoreResult<Option<QueuedTransfer>>;
    fn update_transfer(&self, transfer: &QueuedTransfer) -> StoreResult<()>;
    fn delete_transfer(&self, id: &TransferId) -> StoreResult<bool>;
    /// Queued entries eligible at `now`, by priority then eligible time.
    fn list_due_transfers(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueuedTransfer>>;
    /// Queued, in-progress and failed entries in drain order.
    fn list_pending_transfers(&self, limit: usize) -> StoreResult<Vec<QueuedTransfer>>;
    fn transfer_counts(&self) -> StoreResult<TransferCounts>;
    /// Reset entries left InProgress by a crash back to Queued.
    fn requeue_in_progress_transfers(&self) -> StoreResult<usize>;
    fn purge_failed_transfers(&self, older_than: DateTime<Utc>) -> StoreResult<usize>;
}

const SCHEMA: &str = include_str!("schema.sql");

const TERMINAL_STAGES: &str = "('completed', 'failed', 'cancelled')";

/// SQLite-backed store with connection-per-call for files.
pub struct SqliteStore {
    path: PathBuf,
    /// In-memory databases vanish with their connection, so keep one.
    memory_conn: Option<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open database at path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self {
            path,
            memory_conn: None,
        };
        store.with_conn(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })?;
        Ok(store)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            memory_conn: Some(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute_batch(sql)?;
            Ok(())
        })
    }

    fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        if let Some(ref mutex) = self.memory_conn {
            let conn = mutex.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        } else {
            let conn = Connection::open(&self.path)?;
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )?;
            f(&conn)
        }
    }
}

impl Store for SqliteStore {
    // --- Streams ---

    fn create_stream(&self, s: &StreamConfig) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO streams (id, name, source_url, artist, album, album_artist,
                    artwork_path, filename_pattern, destination, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    s.id.as_str(),
                    s.name,
                    s.source_url,
                    s.artist,
                    s.album,
                    s.album_artist,
                    s.artwork_path.as_deref().map(path_text),
                    s.filename_pattern,
                    s.destination,
                    ts(&s.created_at),
                    ts(&s.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_stream(&self, id: &StreamId) -> StoreResult<Option<StreamConfig>> {
        self.with_conn(|conn| {
            let stream = conn
                .query_row(
                    &format!("SELECT {} FROM streams WHERE id = ?1", STREAM_COLUMNS),
                    params![id.as_str()],
                    stream_from_row,
                )
                .optional()?;
            Ok(stream)
        })
    }

    fn list_streams(&self) -> StoreResult<Vec<StreamConfig>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM streams ORDER BY name", STREAM_COLUMNS))?;
            let streams = stmt
                .query_map([], stream_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(streams)
        })
    }

    fn update_stream(&self, s: &StreamConfig) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE streams SET name = ?2, source_url = ?3, artist = ?4, album = ?5,
                    album_artist = ?6, artwork_path = ?7, filename_pattern = ?8,
                    destination = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    s.id.as_str(),
                    s.name,
                    s.source_url,
                    s.artist,
                    s.album,
                    s.album_artist,
                    s.artwork_path.as_deref().map(path_text),
                    s.filename_pattern,
                    s.destination,
                    ts(&s.updated_at),
                ],
            )?;
            expect_one(changed, "stream", s.id.as_str())
        })
    }

    fn delete_stream(&self, id: &StreamId) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let active: i64 = tx.query_row(
                "SELECT COUNT(*) FROM triggers WHERE stream_id = ?1 AND active = 1",
                params![id.as_str()],
                |row| row.get(0),
            )?;
            if active > 0 {
                return Err(StoreError::InUse {
                    kind: "stream",
                    id: id.to_string(),
                    count: active as usize,
                    referrer: "active trigger(s)",
                });
            }
            let removed = tx.execute("DELETE FROM streams WHERE id = ?1", params![id.as_str()])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    // --- Triggers ---

    fn create_trigger(&self, t: &ScheduleTrigger) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO triggers (id, stream_id, name, cron, duration_minutes, active,
                    max_retries, next_fire, last_fire, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    t.id.as_str(),
                    t.stream_id.as_str(),
                    t.name,
                    t.cron,
                    t.duration_minutes as i64,
                    t.active,
                    t.max_retries as i64,
                    t.next_fire.as_ref().map(ts),
                    t.last_fire.as_ref().map(ts),
                    ts(&t.created_at),
                    ts(&t.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_trigger(&self, id: &TriggerId) -> StoreResult<Option<ScheduleTrigger>> {
        self.with_conn(|conn| {
            let trigger = conn
                .query_row(
                    &format!("SELECT {} FROM triggers WHERE id = ?1", TRIGGER_COLUMNS),
                    params![id.as_str()],
                    trigger_from_row,
                )
                .optional()?;
            Ok(trigger)
        })
    }

    fn list_triggers(&self) -> StoreResult<Vec<ScheduleTrigger>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM triggers ORDER BY created_at",
                TRIGGER_COLUMNS
            ))?;
            let triggers = stmt
                .query_map([], trigger_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(triggers)
        })
    }

    fn list_active_triggers(&self) -> StoreResult<Vec<ScheduleTrigger>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM triggers WHERE active = 1 ORDER BY created_at",
                TRIGGER_COLUMNS
            ))?;
            let triggers = stmt
                .query_map([], trigger_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(triggers)
        })
    }

    fn update_trigger(&self, t: &ScheduleTrigger) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE triggers SET stream_id = ?2, name = ?3, cron = ?4, duration_minutes = ?5,
                    active = ?6, max_retries = ?7, next_fire = ?8, last_fire = ?9, updated_at = ?10
                 WHERE id = ?1",
                params![
                    t.id.as_str(),
                    t.stream_id.as_str(),
                    t.name,
                    t.cron,
                    t.duration_minutes as i64,
                    t.active,
                    t.max_retries as i64,
                    t.next_fire.as_ref().map(ts),
                    t.last_fire.as_ref().map(ts),
                    ts(&t.updated_at),
                ],
            )?;
            expect_one(changed, "trigger", t.id.as_str())
        })
    }

    fn delete_trigger(&self, id: &TriggerId) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let live: i64 = tx.query_row(
                &format!(
                    "SELECT COUNT(*) FROM sessions WHERE trigger_id = ?1 AND stage NOT IN {}",
                    TERMINAL_STAGES
                ),
                params![id.as_str()],
                |row| row.get(0),
            )?;
            if live > 0 {
                return Err(StoreError::InUse {
                    kind: "trigger",
                    id: id.to_string(),
                    count: live as usize,
                    referrer: "unfinished session(s)",
                });
            }
            let removed = tx.execute("DELETE FROM triggers WHERE id = ?1", params![id.as_str()])?;
            tx.commit()?;
            Ok(removed > 0)
        })
    }

    // --- Sessions ---

    fn create_session(&self, s: &RecordingSession) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, trigger_id, stage, attempt, raw_path, artifact_path,
                    transfer_id, failure_reason, bytes_captured, created_at, started_at,
                    finished_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    s.id.as_str(),
                    s.trigger_id.as_str(),
                    s.stage.as_str(),
                    s.attempt as i64,
                    s.raw_path.as_deref().map(path_text),
                    s.artifact_path.as_deref().map(path_text),
                    s.transfer_id.as_ref().map(|id| id.as_str()),
                    s.failure_reason,
                    s.bytes_captured as i64,
                    ts(&s.created_at),
                    s.started_at.as_ref().map(ts),
                    s.finished_at.as_ref().map(ts),
                    ts(&s.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_session(&self, id: &SessionId) -> StoreResult<Option<RecordingSession>> {
        self.with_conn(|conn| {
            let session = conn
                .query_row(
                    &format!("SELECT {} FROM sessions WHERE id = ?1", SESSION_COLUMNS),
                    params![id.as_str()],
                    session_from_row,
                )
                .optional()?;
            Ok(session)
        })
    }

    fn update_session(&self, s: &RecordingSession) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE sessions SET stage = ?2, attempt = ?3, raw_path = ?4, artifact_path = ?5,
                    transfer_id = ?6, failure_reason = ?7, bytes_captured = ?8, started_at = ?9,
                    finished_at = ?10, updated_at = ?11
                 WHERE id = ?1",
                params![
                    s.id.as_str(),
                    s.stage.as_str(),
                    s.attempt as i64,
                    s.raw_path.as_deref().map(path_text),
                    s.artifact_path.as_deref().map(path_text),
                    s.transfer_id.as_ref().map(|id| id.as_str()),
                    s.failure_reason,
                    s.bytes_captured as i64,
                    s.started_at.as_ref().map(ts),
                    s.finished_at.as_ref().map(ts),
                    ts(&s.updated_at),
                ],
            )?;
            expect_one(changed, "session", s.id.as_str())
        })
    }

    fn list_sessions(&self, limit: usize) -> StoreResult<Vec<RecordingSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions ORDER BY created_at DESC LIMIT ?1",
                SESSION_COLUMNS
            ))?;
            let sessions = stmt
                .query_map(params![limit as i64], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    fn list_sessions_for_trigger(
        &self,
        trigger_id: &TriggerId,
        limit: usize,
    ) -> StoreResult<Vec<RecordingSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions WHERE trigger_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                SESSION_COLUMNS
            ))?;
            let sessions = stmt
                .query_map(params![trigger_id.as_str(), limit as i64], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    fn trigger_stats(
        &self,
        trigger_id: &TriggerId,
        since: DateTime<Utc>,
    ) -> StoreResult<TriggerStats> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions WHERE trigger_id = ?1 AND created_at >= ?2",
                SESSION_COLUMNS
            ))?;
            let mut stats = TriggerStats::default();
            let rows = stmt.query_map(params![trigger_id.as_str(), ts(&since)], session_from_row)?;
            for session in rows {
                stats.add(&session?);
            }
            Ok(stats)
        })
    }

    fn purge_sessions(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                &format!(
                    "DELETE FROM sessions
                     WHERE stage IN {} AND COALESCE(finished_at, updated_at) < ?1",
                    TERMINAL_STAGES
                ),
                params![ts(&older_than)],
            )?;
            Ok(removed)
        })
    }

    fn list_unfinished_sessions(&self) -> StoreResult<Vec<RecordingSession>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions WHERE stage NOT IN {} ORDER BY created_at",
                SESSION_COLUMNS, TERMINAL_STAGES
            ))?;
            let sessions = stmt
                .query_map([], session_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(sessions)
        })
    }

    fn fail_interrupted_sessions(&self, reason: &str) -> StoreResult<usize> {
        let now = ts(&Utc::now());
        self.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE sessions SET stage = 'failed', failure_reason = ?1,
                        finished_at = ?2, updated_at = ?2
                     WHERE stage NOT IN {}",
                    TERMINAL_STAGES
                ),
                params![reason, now],
            )?;
            Ok(changed)
        })
    }

    // --- Transfers ---

    fn insert_transfer(&self, t: &QueuedTransfer) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO transfers (id, local_path, destination, priority, attempts,
                    max_retries, eligible_at, status, last_error, session_id, metadata,
                    created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    t.id.as_str(),
                    path_text(&t.local_path),
                    t.destination,
                    t.priority,
                    t.attempts as i64,
                    t.max_retries as i64,
                    ts(&t.eligible_at),
                    t.status.as_str(),
                    t.last_error,
                    t.session_id.as_ref().map(|id| id.as_str()),
                    t.metadata.to_string(),
                    ts(&t.created_at),
                    ts(&t.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    fn get_transfer(&self, id: &TransferId) -> StoreResult<Option<QueuedTransfer>> {
        self.with_conn(|conn| {
            let transfer = conn
                .query_row(
                    &format!("SELECT {} FROM transfers WHERE id = ?1", TRANSFER_COLUMNS),
                    params![id.as_str()],
                    transfer_from_row,
                )
                .optional()?;
            Ok(transfer)
        })
    }

    fn update_transfer(&self, t: &QueuedTransfer) -> StoreResult<()> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE transfers SET priority = ?2, attempts = ?3, max_retries = ?4,
                    eligible_at = ?5, status = ?6, last_error = ?7, metadata = ?8, updated_at = ?9
                 WHERE id = ?1",
                params![
                    t.id.as_str(),
                    t.priority,
                    t.attempts as i64,
                    t.max_retries as i64,
                    ts(&t.eligible_at),
                    t.status.as_str(),
                    t.last_error,
                    t.metadata.to_string(),
                    ts(&t.updated_at),
                ],
            )?;
            expect_one(changed, "transfer", t.id.as_str())
        })
    }

    fn delete_transfer(&self, id: &TransferId) -> StoreResult<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute("DELETE FROM transfers WHERE id = ?1", params![id.as_str()])?;
            Ok(removed > 0)
        })
    }

    fn list_due_transfers(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueuedTransfer>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transfers
                 WHERE status = 'queued' AND eligible_at <= ?1
                 ORDER BY priority DESC, eligible_at ASC",
                TRANSFER_COLUMNS
            ))?;
            let transfers = stmt
                .query_map(params![ts(&now)], transfer_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(transfers)
        })
    }

    fn list_pending_transfers(&self, limit: usize) -> StoreResult<Vec<QueuedTransfer>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM transfers
                 WHERE status IN ('queued', 'in_progress', 'failed')
                 ORDER BY priority DESC, eligible_at ASC
                 LIMIT ?1",
                TRANSFER_COLUMNS
            ))?;
            let transfers = stmt
                .query_map(params![limit as i64], transfer_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(transfers)
        })
    }

    fn transfer_counts(&self) -> StoreResult<TransferCounts> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM transfers GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;

            let mut counts = TransferCounts::default();
            for (status, count) in rows {
                match TransferStatus::parse(&status) {
                    Some(TransferStatus::Queued) => counts.queued = count as usize,
                    Some(TransferStatus::InProgress) => counts.in_progress = count as usize,
                    Some(TransferStatus::Failed) => counts.failed = count as usize,
                    None => tracing::warn!(status = %status, "Unknown transfer status in store"),
                }
            }
            Ok(counts)
        })
    }

    fn requeue_in_progress_transfers(&self) -> StoreResult<usize> {
        let now = ts(&Utc::now());
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE transfers SET status = 'queued', updated_at = ?1 WHERE status = 'in_progress'",
                params![now],
            )?;
            Ok(changed)
        })
    }

    fn purge_failed_transfers(&self, older_than: DateTime<Utc>) -> StoreResult<usize> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM transfers WHERE status = 'failed' AND updated_at < ?1",
                params![ts(&older_than)],
            )?;
            Ok(removed)
        })
    }
}

// --- Row mapping ---

const STREAM_COLUMNS: &str = "id, name, source_url, artist, album, album_artist, artwork_path,
    filename_pattern, destination, created_at, updated_at";

const TRIGGER_COLUMNS: &str = "id, stream_id, name, cron, duration_minutes, active, max_retries,
    next_fire, last_fire, created_at, updated_at";

const SESSION_COLUMNS: &str = "id, trigger_id, stage, attempt, raw_path, artifact_path,
    transfer_id, failure_reason, bytes_captured, created_at, started_at, finished_at, updated_at";

const TRANSFER_COLUMNS: &str = "id, local_path, destination, priority, attempts, max_retries,
    eligible_at, status, last_error, session_id, metadata, created_at, updated_at";

fn stream_from_row(row: &Row<'_>) -> rusqlite::Result<StreamConfig> {
    Ok(StreamConfig {
        id: StreamId(row.get(0)?),
        name: row.get(1)?,
        source_url: row.get(2)?,
        artist: row.get(3)?,
        album: row.get(4)?,
        album_artist: row.get(5)?,
        artwork_path: row.get::<_, Option<String>>(6)?.map(PathBuf::from),
        filename_pattern: row.get(7)?,
        destination: row.get(8)?,
        created_at: datetime_at(row, 9)?,
        updated_at: datetime_at(row, 10)?,
    })
}

fn trigger_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduleTrigger> {
    Ok(ScheduleTrigger {
        id: TriggerId(row.get(0)?),
        stream_id: StreamId(row.get(1)?),
        name: row.get(2)?,
        cron: row.get(3)?,
        duration_minutes: row.get::<_, i64>(4)? as u32,
        active: row.get(5)?,
        max_retries: row.get::<_, i64>(6)? as u32,
        next_fire: optional_datetime_at(row, 7)?,
        last_fire: optional_datetime_at(row, 8)?,
        created_at: datetime_at(row, 9)?,
        updated_at: datetime_at(row, 10)?,
    })
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<RecordingSession> {
    let stage_text: String = row.get(2)?;
    let stage = SessionStage::parse(&stage_text).ok_or_else(|| bad_text(2, "stage", &stage_text))?;

    Ok(RecordingSession {
        id: SessionId(row.get(0)?),
        trigger_id: TriggerId(row.get(1)?),
        stage,
        attempt: row.get::<_, i64>(3)? as u32,
        raw_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
        artifact_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        transfer_id: row.get::<_, Option<String>>(6)?.map(TransferId),
        failure_reason: row.get(7)?,
        bytes_captured: row.get::<_, i64>(8)? as u64,
        created_at: datetime_at(row, 9)?,
        started_at: optional_datetime_at(row, 10)?,
        finished_at: optional_datetime_at(row, 11)?,
        updated_at: datetime_at(row, 12)?,
    })
}

fn transfer_from_row(row: &Row<'_>) -> rusqlite::Result<QueuedTransfer> {
    let status_text: String = row.get(7)?;
    let status =
        TransferStatus::parse(&status_text).ok_or_else(|| bad_text(7, "status", &status_text))?;
    let metadata_text: String = row.get(10)?;

    Ok(QueuedTransfer {
        id: TransferId(row.get(0)?),
        local_path: PathBuf::from(row.get::<_, String>(1)?),
        destination: row.get(2)?,
        priority: row.get(3)?,
        attempts: row.get::<_, i64>(4)? as u32,
        max_retries: row.get::<_, i64>(5)? as u32,
        eligible_at: datetime_at(row, 6)?,
        status,
        last_error: row.get(8)?,
        session_id: row.get::<_, Option<String>>(9)?.map(SessionId),
        metadata: serde_json::from_str(&metadata_text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?,
        created_at: datetime_at(row, 11)?,
        updated_at: datetime_at(row, 12)?,
    })
}

fn bad_text(idx: usize, column: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        format!("unknown {} {:?}", column, value).into(),
    )
}

fn expect_one(changed: usize, kind: &'static str, id: &str) -> StoreResult<()> {
    if changed == 0 {
        Err(StoreError::NotFound {
            kind,
            id: id.to_string(),
        })
    } else {
        Ok(())
    }
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    parse_datetime(idx, &row.get::<_, String>(idx)?)
}

fn optional_datetime_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_datetime(idx, &s))
        .transpose()
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
