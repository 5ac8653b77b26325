//! Job scheduling and execution core for the drudge bot.
//!
//! Provides the fixed-capacity job table, bounded dispatch queue, static
//! worker pool, and the subprocess execution engine, plus the notifier seam
//! chat transports implement to receive terminal job reports.

pub mod job_scheduler;
pub mod notifier;

pub use job_scheduler::{
    JobScheduler, JobSchedulerConfig, JobStatus, JobStatusReport, JobUid, QueryError, StartError,
    SubmitError,
};
pub use notifier::{JobNotification, JobNotifier};
