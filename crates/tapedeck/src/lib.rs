//! Scheduled stream recording.
//!
//! The [`scheduler::JobScheduler`] fires cron triggers under a
//! concurrent-session limit; each fire becomes a
//! [`workflow::SessionWorkflow`] that captures the stream, processes the
//! audio and hands the artifact to the durable [`transfer::TransferQueue`]
//! for SFTP delivery. [`coordinator::WorkflowCoordinator`] owns the live
//! sessions.

pub mod capture;
pub mod coordinator;
pub mod cron;
pub mod naming;
pub mod processing;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod transfer;
pub mod types;
pub mod workflow;

pub use coordinator::{StopResult, TransferHandOff, WorkflowCoordinator};
pub use scheduler::{Admission, JobScheduler, SchedulerSettings};
pub use store::{SqliteStore, Store, TriggerStats};
pub use types::{
    QueuedTransfer, RecordingSession, ScheduleTrigger, SessionId, SessionStage, StreamConfig,
    StreamId, TransferId, TransferStatus, TriggerId,
};

#[cfg(test)]
pub(crate) mod testutil {
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    /// Write an executable shell script standing in for an external tool.
    /// `$out` holds the last argument (the output path).
    pub fn fake_tool(dir: &TempDir, body: &str) -> PathBuf {
        let path = dir.path().join(format!("fake-tool-{}", uuid::Uuid::new_v4().simple()));
        let script = format!("#!/bin/sh\nfor a in \"$@\"; do out=\"$a\"; done\n{}\n", body);
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }
}
