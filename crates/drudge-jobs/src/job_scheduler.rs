//! Job scheduling and execution core: a fixed-capacity job table, a bounded
//! FIFO dispatch queue, and a static pool of worker threads that run each
//! job's shell command to completion.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::notifier::JobNotifier;

mod dispatch_queue;
mod job_executor;
mod job_table;

#[cfg(test)]
mod tests;

use dispatch_queue::DispatchQueue;
use job_executor::execute_job;
use job_table::JobSlot;

pub use job_table::JobStatus;

/// Sparse, randomly assigned 63-bit job identifier. Meaningful only while the
/// job is live; a finished job's uid becomes eligible for reuse.
pub type JobUid = i64;

/// Tuning knobs for one scheduler instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSchedulerConfig {
    /// Number of long-lived worker threads.
    pub worker_count: usize,
    /// Job table and dispatch queue capacity; must be a power of two.
    pub table_capacity: usize,
    /// Output window capacity in bytes; `capacity - 1` bytes are retained.
    pub output_buffer_bytes: usize,
    /// Scratch buffer size for each read from a job's output pipe.
    pub read_chunk_bytes: usize,
    /// Shell used to run submitted command text via `-c`.
    pub shell: PathBuf,
}

impl Default for JobSchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            table_capacity: 16_384,
            output_buffer_bytes: 131_072,
            read_chunk_bytes: 65_536,
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

/// Errors produced while constructing a scheduler.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(&'static str),
    #[error("failed to spawn worker thread")]
    SpawnWorker(#[from] std::io::Error),
}

/// Reasons a submission is rejected outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("job command must be non-empty")]
    EmptyCommand,
    #[error("job table is full")]
    TableFull,
    #[error("dispatch queue is full")]
    QueueFull,
    #[error("scheduler is shutting down")]
    ShuttingDown,
}

/// Reasons a status query produces no report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueryError {
    #[error("no running job with that id")]
    NotFound,
    #[error("job belongs to a different requester")]
    Forbidden,
}

/// Snapshot of a running job returned by [`JobScheduler::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusReport {
    pub uid: JobUid,
    pub status: JobStatus,
    pub command: String,
    pub output: Vec<u8>,
}

struct SchedulerInner {
    config: JobSchedulerConfig,
    slots: Box<[JobSlot]>,
    table: Mutex<TableState>,
    queue: DispatchQueue,
    shutting_down: AtomicBool,
}

#[derive(Debug, Default)]
struct TableState {
    live: usize,
}

impl SchedulerInner {
    /// Frees a slot after its single pass through the lifecycle.
    fn release_slot(&self, slot_index: usize) {
        let mut table = lock_unpoisoned(&self.table);
        self.slots[slot_index].release();
        table.live = table.live.saturating_sub(1);
    }

    #[cfg(test)]
    fn live_jobs(&self) -> usize {
        lock_unpoisoned(&self.table).live
    }
}

/// Handle to one running scheduler.
///
/// Constructed once at process start; [`JobScheduler::shutdown`] is the
/// defined end of life. There is no cancellation and no execution timeout, so
/// a job stuck on a hung subprocess occupies its worker indefinitely and
/// shrinks the effective pool until the process exits.
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl JobScheduler {
    /// Builds the table and queue and spawns the worker pool. Each worker
    /// clones the notifier handle once, up front, and keeps it for every job
    /// it executes.
    pub fn start(
        config: JobSchedulerConfig,
        notifier: Arc<dyn JobNotifier>,
    ) -> Result<Self, StartError> {
        if config.worker_count == 0 {
            return Err(StartError::InvalidConfig("worker_count must be nonzero"));
        }
        if config.table_capacity == 0 || !config.table_capacity.is_power_of_two() {
            return Err(StartError::InvalidConfig(
                "table_capacity must be a power of two",
            ));
        }
        if config.output_buffer_bytes < 2 {
            return Err(StartError::InvalidConfig(
                "output_buffer_bytes must be at least 2",
            ));
        }

        let slots = (0..config.table_capacity)
            .map(|_| JobSlot::new(config.output_buffer_bytes))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let inner = Arc::new(SchedulerInner {
            slots,
            table: Mutex::new(TableState::default()),
            queue: DispatchQueue::new(config.table_capacity),
            shutting_down: AtomicBool::new(false),
            config,
        });

        let mut workers = Vec::with_capacity(inner.config.worker_count);
        for worker_index in 0..inner.config.worker_count {
            let inner = Arc::clone(&inner);
            let notifier = Arc::clone(&notifier);
            let handle = thread::Builder::new()
                .name(format!("drudge-worker-{worker_index}"))
                .spawn(move || worker_loop(&inner, notifier.as_ref()))?;
            workers.push(handle);
        }
        info!(
            workers = inner.config.worker_count,
            table_capacity = inner.config.table_capacity,
            "job scheduler started"
        );
        Ok(Self { inner, workers })
    }

    /// Queues one shell command for asynchronous execution and returns its
    /// freshly assigned uid.
    pub fn submit(
        &self,
        command: &str,
        requester: u64,
        destination: u64,
    ) -> Result<JobUid, SubmitError> {
        if command.is_empty() {
            return Err(SubmitError::EmptyCommand);
        }
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(SubmitError::ShuttingDown);
        }

        let mask = self.inner.config.table_capacity - 1;
        let (uid, slot_index) = {
            let mut table = lock_unpoisoned(&self.inner.table);
            if table.live == self.inner.config.table_capacity {
                return Err(SubmitError::TableFull);
            }
            // Roll candidates until the addressed slot is free; collision
            // avoidance is open addressing on the fixed table, not chaining.
            let (uid, slot_index) = loop {
                let candidate = random_uid();
                let slot_index = (candidate as usize) & mask;
                if self.inner.slots[slot_index].is_free() {
                    break (candidate, slot_index);
                }
            };
            self.inner.slots[slot_index].allocate(
                uid,
                command.to_string(),
                requester,
                destination,
            );
            table.live += 1;
            (uid, slot_index)
        };

        if !self.inner.queue.push(slot_index) {
            // Sized equal to the table the queue cannot fill, but a rejected
            // push must not leak the slot.
            self.inner.release_slot(slot_index);
            return Err(SubmitError::QueueFull);
        }
        debug!(uid, "job queued");
        Ok(uid)
    }

    /// Reports on a live, running job owned by `requester`.
    ///
    /// Only in-flight jobs are queryable: a finished job's slot may already
    /// hold an unrelated job, so terminal and unknown uids both answer
    /// [`QueryError::NotFound`].
    pub fn query(&self, uid: JobUid, requester: u64) -> Result<JobStatusReport, QueryError> {
        if uid < 0 {
            return Err(QueryError::NotFound);
        }
        let mask = self.inner.config.table_capacity - 1;
        let slot = &self.inner.slots[(uid as usize) & mask];
        if slot.uid() != uid {
            return Err(QueryError::NotFound);
        }
        let status = slot.status();
        if status != JobStatus::Running {
            return Err(QueryError::NotFound);
        }
        let meta = slot.meta();
        if meta.requester != requester {
            return Err(QueryError::Forbidden);
        }
        let output = slot.output_snapshot();
        // The slot may have been released and reallocated while the snapshot
        // was taken; a changed uid invalidates the report.
        if slot.uid() != uid {
            return Err(QueryError::NotFound);
        }
        Ok(JobStatusReport {
            uid,
            status,
            command: meta.command,
            output,
        })
    }

    /// Stops accepting submissions, lets the pool drain every queued job, and
    /// joins the workers. A job stuck on a hung subprocess blocks shutdown
    /// the same way it blocks its worker.
    pub fn shutdown(mut self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.queue.close();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("job worker panicked before shutdown");
            }
        }
        info!("job scheduler stopped");
    }
}

fn worker_loop(inner: &SchedulerInner, notifier: &dyn JobNotifier) {
    while let Some(slot_index) = inner.queue.pop() {
        execute_job(inner, slot_index, notifier);
    }
    debug!("job worker exiting");
}

fn random_uid() -> JobUid {
    // Clock fallback when the entropy source is unavailable; the free-slot
    // re-roll still guarantees uniqueness among live jobs.
    let value = getrandom::u64().unwrap_or_else(|_| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
    });
    (value & i64::MAX as u64) as i64
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
