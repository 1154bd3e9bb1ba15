//! Core records shared by the scheduler, workflows and the transfer queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Identifies a configured source stream.
    StreamId
);
string_id!(
    /// Identifies a cron trigger.
    TriggerId
);
string_id!(
    /// Identifies one recording attempt chain.
    SessionId
);
string_id!(
    /// Identifies a queued transfer.
    TransferId
);

/// A source stream plus where its recordings go.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub id: StreamId,
    pub name: String,
    pub source_url: String,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub album_artist: Option<String>,
    pub artwork_path: Option<PathBuf>,
    /// `{date}`, `{name}` and `{timestamp}` are substituted.
    pub filename_pattern: String,
    /// `user@host[:port]:/path`
    pub destination: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StreamConfig {
    pub const DEFAULT_PATTERN: &'static str = "{date}_{name}.mp3";

    pub fn new(
        name: impl Into<String>,
        source_url: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: StreamId::new(),
            name: name.into(),
            source_url: source_url.into(),
            artist: None,
            album: None,
            album_artist: None,
            artwork_path: None,
            filename_pattern: Self::DEFAULT_PATTERN.to_string(),
            destination: destination.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted cron rule that starts recordings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleTrigger {
    pub id: TriggerId,
    pub stream_id: StreamId,
    pub name: String,
    pub cron: String,
    pub duration_minutes: u32,
    pub active: bool,
    pub max_retries: u32,
    pub next_fire: Option<DateTime<Utc>>,
    pub last_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a recording session.
///
/// `Initializing` is the only start state. `Completed`, `Failed` and
/// `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Initializing,
    Recording,
    Processing,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStage::Initializing => "initializing",
            SessionStage::Recording => "recording",
            SessionStage::Processing => "processing",
            SessionStage::Transferring => "transferring",
            SessionStage::Completed => "completed",
            SessionStage::Failed => "failed",
            SessionStage::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(SessionStage::Initializing),
            "recording" => Some(SessionStage::Recording),
            "processing" => Some(SessionStage::Processing),
            "transferring" => Some(SessionStage::Transferring),
            "completed" => Some(SessionStage::Completed),
            "failed" => Some(SessionStage::Failed),
            "cancelled" => Some(SessionStage::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStage::Completed | SessionStage::Failed | SessionStage::Cancelled
        )
    }

    /// Stages that count against the concurrent-session limit.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionStage::Recording | SessionStage::Processing | SessionStage::Transferring
        )
    }
}

impl std::fmt::Display for SessionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recording execution of a trigger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSession {
    pub id: SessionId,
    pub trigger_id: TriggerId,
    pub stage: SessionStage,
    /// 1-based; bumped on every retry.
    pub attempt: u32,
    pub raw_path: Option<PathBuf>,
    pub artifact_path: Option<PathBuf>,
    pub transfer_id: Option<TransferId>,
    pub failure_reason: Option<String>,
    pub bytes_captured: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RecordingSession {
    pub fn new(trigger_id: TriggerId) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            trigger_id,
            stage: SessionStage::Initializing,
            attempt: 1,
            raw_path: None,
            artifact_path: None,
            transfer_id: None,
            failure_reason: None,
            bytes_captured: 0,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }
}

/// Persisted state of a queued transfer.
///
/// Completed transfers are deleted, so there is no completed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Queued,
    InProgress,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Queued => "queued",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(TransferStatus::Queued),
            "in_progress" => Some(TransferStatus::InProgress),
            "failed" => Some(TransferStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedTransfer {
    pub id: TransferId,
    pub local_path: PathBuf,
    pub destination: String,
    /// Higher drains first.
    pub priority: i32,
    pub attempts: u32,
    pub max_retries: u32,
    pub eligible_at: DateTime<Utc>,
    pub status: TransferStatus,
    pub last_error: Option<String>,
    pub session_id: Option<SessionId>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
