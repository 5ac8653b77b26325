//! Outbound seam between the scheduler core and the chat transport.

use crate::job_scheduler::{JobStatus, JobUid};

/// Terminal report for one job, handed to the notification collaborator
/// exactly once when the job leaves the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNotification {
    pub uid: JobUid,
    pub status: JobStatus,
    pub command: String,
    pub requester: u64,
    pub destination: u64,
    /// Combined stdout/stderr captured for the run; empty when the
    /// subprocess never spawned or produced nothing.
    pub output: Vec<u8>,
    /// OS error description, present only when `status` is [`JobStatus::Error`].
    pub error: Option<String>,
}

/// Delivery handle each worker clones once at startup.
pub trait JobNotifier: Send + Sync {
    /// Delivers one terminal job report. Callers are pool workers, so
    /// implementations must hand the report off rather than block on a slow
    /// transport.
    fn notify(&self, notification: JobNotification);
}
