//! Fixed-capacity job slot arena and the capped output window.

use std::sync::{
    atomic::{AtomicI64, AtomicU8, Ordering},
    Mutex,
};

use super::lock_unpoisoned;

/// Sentinel uid stored in a slot that holds no live job.
pub(super) const FREE_UID: i64 = -1;

/// Lifecycle states for a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    /// Job is queued and has not reached a worker yet.
    Waiting = 0,
    /// Job subprocess is currently executing.
    Running = 1,
    /// Job subprocess exited on its own.
    Exited = 2,
    /// Job subprocess was killed by a signal.
    Terminated = 3,
    /// Job subprocess could not be spawned.
    Error = 4,
}

impl JobStatus {
    /// Returns the stable snake_case label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Terminated => "terminated",
            Self::Error => "error",
        }
    }

    /// Returns the human-readable phrase used in chat notifications.
    pub fn phrase(self) -> &'static str {
        match self {
            Self::Waiting => "is currently in the queue",
            Self::Running => "is running",
            Self::Exited => "has exited successfully",
            Self::Terminated => "was terminated",
            Self::Error => "had an error",
        }
    }

    /// Returns true when the job cannot transition any further.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Terminated | Self::Error)
    }

    pub(super) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Waiting,
            1 => Self::Running,
            2 => Self::Exited,
            3 => Self::Terminated,
            _ => Self::Error,
        }
    }
}

/// Capped byte window over the most recent combined subprocess output.
///
/// Capacity is fixed and one byte stays reserved, so the usable window is
/// `capacity - 1` bytes. Overflow drops the oldest buffered bytes, never the
/// tail of an incoming chunk.
#[derive(Debug)]
pub(super) struct OutputBuffer {
    data: Vec<u8>,
    usable: usize,
}

impl OutputBuffer {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            usable: capacity.saturating_sub(1).max(1),
        }
    }

    pub(super) fn clear(&mut self) {
        self.data.clear();
    }

    pub(super) fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends `chunk`, discarding oldest bytes first when the window would
    /// overflow.
    pub(super) fn append_tail(&mut self, chunk: &[u8]) {
        if chunk.len() >= self.usable {
            let tail = &chunk[chunk.len() - self.usable..];
            self.data.clear();
            self.data.extend_from_slice(tail);
            return;
        }
        let free = self.usable - self.data.len();
        if chunk.len() > free {
            let keep = self.usable - chunk.len();
            let drop = self.data.len() - keep;
            self.data.copy_within(drop.., 0);
            self.data.truncate(keep);
        }
        self.data.extend_from_slice(chunk);
    }
}

/// Submission metadata written once when a slot is allocated and immutable
/// for the job's lifetime.
#[derive(Debug, Clone, Default)]
pub(super) struct JobMeta {
    pub(super) command: String,
    pub(super) requester: u64,
    pub(super) destination: u64,
}

/// One fixed arena position, either free or holding exactly one live job.
pub(super) struct JobSlot {
    /// The only authoritative "is this slot live" signal; [`FREE_UID`] when
    /// free. Written under the table lock, read lock-free by lookups.
    uid: AtomicI64,
    /// Written by the owning worker, read by status queries without a lock.
    status: AtomicU8,
    meta: Mutex<JobMeta>,
    /// Per-job lock: the sole serialization point between the worker's
    /// appends and a status query's snapshot.
    output: Mutex<OutputBuffer>,
}

impl JobSlot {
    pub(super) fn new(output_capacity: usize) -> Self {
        Self {
            uid: AtomicI64::new(FREE_UID),
            status: AtomicU8::new(JobStatus::Waiting as u8),
            meta: Mutex::new(JobMeta::default()),
            output: Mutex::new(OutputBuffer::new(output_capacity)),
        }
    }

    pub(super) fn uid(&self) -> i64 {
        self.uid.load(Ordering::SeqCst)
    }

    pub(super) fn is_free(&self) -> bool {
        self.uid() == FREE_UID
    }

    pub(super) fn status(&self) -> JobStatus {
        JobStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub(super) fn set_status(&self, status: JobStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
    }

    pub(super) fn meta(&self) -> JobMeta {
        lock_unpoisoned(&self.meta).clone()
    }

    pub(super) fn append_output(&self, chunk: &[u8]) {
        lock_unpoisoned(&self.output).append_tail(chunk);
    }

    pub(super) fn output_snapshot(&self) -> Vec<u8> {
        lock_unpoisoned(&self.output).as_slice().to_vec()
    }

    /// Publishes a freshly initialised job. The caller holds the table lock;
    /// the uid store comes last so lookups never observe a half-written slot.
    pub(super) fn allocate(&self, uid: i64, command: String, requester: u64, destination: u64) {
        {
            let mut meta = lock_unpoisoned(&self.meta);
            meta.command = command;
            meta.requester = requester;
            meta.destination = destination;
        }
        lock_unpoisoned(&self.output).clear();
        self.set_status(JobStatus::Waiting);
        self.uid.store(uid, Ordering::SeqCst);
    }

    /// Releases the slot for reuse and drops the command text. The caller
    /// holds the table lock.
    pub(super) fn release(&self) {
        self.uid.store(FREE_UID, Ordering::SeqCst);
        lock_unpoisoned(&self.meta).command = String::new();
    }
}
