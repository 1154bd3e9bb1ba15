//! Delivery of finished recordings to remote hosts.

pub mod backoff;
pub mod client;
pub mod destination;
pub mod queue;

pub use client::{Credentials, SshTransferClient, TransferClient, TransferError, UploadReport};
pub use destination::Destination;
pub use queue::{EnqueueRequest, QueueError, QueueSettings, QueueStatus, TransferOutcome, TransferQueue};
