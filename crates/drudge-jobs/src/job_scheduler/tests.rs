//! Tests for scheduler lifecycle, dispatch ordering, output capture, and the
//! status-query contract.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use super::{
    dispatch_queue::DispatchQueue, job_table::OutputBuffer, JobScheduler, JobSchedulerConfig,
    JobStatus, QueryError, StartError, SubmitError,
};
use crate::notifier::{JobNotification, JobNotifier};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingNotifier {
    notifications: Mutex<Vec<JobNotification>>,
    wake: Condvar,
}

impl RecordingNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn wait_for(&self, count: usize) -> Vec<JobNotification> {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut notifications = self.notifications.lock().expect("notifier lock");
        while notifications.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            assert!(
                !remaining.is_zero(),
                "timed out waiting for {count} notifications, saw {}",
                notifications.len()
            );
            let (guard, _) = self
                .wake
                .wait_timeout(notifications, remaining)
                .expect("notifier wait");
            notifications = guard;
        }
        notifications.clone()
    }
}

impl JobNotifier for RecordingNotifier {
    fn notify(&self, notification: JobNotification) {
        self.notifications
            .lock()
            .expect("notifier lock")
            .push(notification);
        self.wake.notify_all();
    }
}

fn test_config(table_capacity: usize, worker_count: usize) -> JobSchedulerConfig {
    JobSchedulerConfig {
        worker_count,
        table_capacity,
        output_buffer_bytes: 4096,
        read_chunk_bytes: 1024,
        ..JobSchedulerConfig::default()
    }
}

fn make_fifo(path: &Path) {
    let status = std::process::Command::new("mkfifo")
        .arg(path)
        .status()
        .expect("run mkfifo");
    assert!(status.success(), "mkfifo failed for {}", path.display());
}

/// Opening the writer end blocks until the gated `cat` holds the reader open;
/// dropping it delivers end-of-file and lets the job finish.
fn release_gate(path: &Path) {
    let writer = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open fifo writer");
    drop(writer);
}

fn gate_command(path: &Path) -> String {
    format!("cat {}", path.display())
}

#[test]
fn output_window_append_is_exact() {
    let mut window = OutputBuffer::new(8);

    window.append_tail(b"abc");
    assert_eq!(window.as_slice(), b"abc");

    // 3 + 5 bytes overflow the 7-byte window by one; the oldest byte goes.
    window.append_tail(b"defgh");
    assert_eq!(window.as_slice(), b"bcdefgh");

    // A chunk at least as large as the window replaces it with its own tail.
    window.append_tail(b"0123456789");
    assert_eq!(window.as_slice(), b"3456789");
}

#[test]
fn dispatch_queue_is_fifo_and_bounded() {
    let queue = DispatchQueue::new(4);
    assert!(queue.push(7));
    assert!(queue.push(8));
    assert!(queue.push(9));
    assert!(queue.push(10));
    assert!(!queue.push(11), "fifth push must report a full ring");

    assert_eq!(queue.pop(), Some(7));
    assert_eq!(queue.pop(), Some(8));
    assert!(queue.push(12), "a freed position accepts a wrapped push");
    assert_eq!(queue.pop(), Some(9));
    assert_eq!(queue.pop(), Some(10));
    assert_eq!(queue.pop(), Some(12));
    assert_eq!(queue.len(), 0);

    queue.close();
    assert!(!queue.push(13), "a closed queue rejects pushes");
    assert_eq!(queue.pop(), None, "a closed drained queue releases workers");
}

#[test]
fn start_rejects_invalid_config() {
    let notifier = RecordingNotifier::new();

    let mut config = test_config(16, 2);
    config.worker_count = 0;
    assert!(matches!(
        JobScheduler::start(config, notifier.clone()),
        Err(StartError::InvalidConfig(_))
    ));

    let mut config = test_config(16, 2);
    config.table_capacity = 100;
    assert!(matches!(
        JobScheduler::start(config, notifier.clone()),
        Err(StartError::InvalidConfig(_))
    ));

    let mut config = test_config(16, 2);
    config.output_buffer_bytes = 1;
    assert!(matches!(
        JobScheduler::start(config, notifier),
        Err(StartError::InvalidConfig(_))
    ));
}

#[test]
fn submit_rejects_empty_command() {
    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(16, 1), notifier.clone()).expect("start");
    assert_eq!(scheduler.submit("", 1, 2), Err(SubmitError::EmptyCommand));
    scheduler.shutdown();
}

#[test]
fn echo_job_reports_success_with_output() {
    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(16, 2), notifier.clone()).expect("start");

    let uid = scheduler.submit("echo hello", 11, 22).expect("submit");
    let notifications = notifier.wait_for(1);

    assert_eq!(notifications.len(), 1);
    let notification = &notifications[0];
    assert_eq!(notification.uid, uid);
    assert_eq!(notification.status, JobStatus::Exited);
    assert_eq!(notification.status.phrase(), "has exited successfully");
    assert_eq!(notification.command, "echo hello");
    assert_eq!(notification.requester, 11);
    assert_eq!(notification.destination, 22);
    assert_eq!(notification.output, b"hello\n");
    assert_eq!(notification.error, None);

    scheduler.shutdown();
}

#[test]
fn signalled_job_classifies_as_terminated() {
    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(16, 1), notifier.clone()).expect("start");

    scheduler.submit("kill -TERM $$", 1, 2).expect("submit");
    let notifications = notifier.wait_for(1);

    assert_eq!(notifications[0].status, JobStatus::Terminated);
    assert_eq!(notifications[0].status.phrase(), "was terminated");

    scheduler.shutdown();
}

#[test]
fn oversized_output_keeps_only_the_tail() {
    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(16, 1), notifier.clone()).expect("start");

    // seq produces ~108 KiB, far beyond the 4 KiB window.
    scheduler.submit("seq 1 20000", 1, 2).expect("submit");
    let notifications = notifier.wait_for(1);

    let output = &notifications[0].output;
    assert_eq!(output.len(), 4095, "window retains capacity - 1 bytes");
    assert!(
        output.ends_with(b"20000\n"),
        "the most recent bytes must win"
    );

    scheduler.shutdown();
}

#[test]
fn spawn_failure_reports_error_and_frees_the_slot() {
    let notifier = RecordingNotifier::new();
    let mut config = test_config(8, 1);
    config.shell = PathBuf::from("/nonexistent/drudge-shell");
    let scheduler = JobScheduler::start(config, notifier.clone()).expect("start");

    let uid = scheduler.submit("echo hello", 1, 2).expect("submit");
    let notifications = notifier.wait_for(1);

    assert_eq!(notifications[0].uid, uid);
    assert_eq!(notifications[0].status, JobStatus::Error);
    assert_eq!(notifications[0].status.phrase(), "had an error");
    assert!(notifications[0].output.is_empty());
    assert!(notifications[0].error.is_some());

    // No slot leaked: the table still fills all the way up.
    assert_eq!(scheduler.inner.live_jobs(), 0);
    for _ in 0..8 {
        scheduler.submit("echo again", 1, 2).expect("resubmit");
    }
    notifier.wait_for(9);

    scheduler.shutdown();
}

#[test]
fn dispatch_preserves_submission_order() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let gate = tempdir.path().join("gate");
    make_fifo(&gate);

    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(16, 1), notifier.clone()).expect("start");

    scheduler.submit(&gate_command(&gate), 1, 2).expect("gate");
    scheduler.submit("echo a", 1, 2).expect("submit a");
    scheduler.submit("echo b", 1, 2).expect("submit b");
    scheduler.submit("echo c", 1, 2).expect("submit c");

    release_gate(&gate);
    let notifications = notifier.wait_for(4);

    let commands: Vec<&str> = notifications
        .iter()
        .skip(1)
        .map(|notification| notification.command.as_str())
        .collect();
    assert_eq!(commands, ["echo a", "echo b", "echo c"]);

    scheduler.shutdown();
}

#[test]
fn full_table_rejects_submissions_until_a_job_finishes() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let gate = tempdir.path().join("gate");
    make_fifo(&gate);

    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(4, 1), notifier.clone()).expect("start");

    let mut uids = HashSet::new();
    for _ in 0..4 {
        let uid = scheduler.submit(&gate_command(&gate), 1, 2).expect("fill");
        assert!(uids.insert(uid), "live uids must be unique");
    }
    assert_eq!(scheduler.inner.live_jobs(), 4);
    assert_eq!(
        scheduler.submit("echo overflow", 1, 2),
        Err(SubmitError::TableFull)
    );
    assert_eq!(scheduler.inner.live_jobs(), 4, "rejection leaves the table unchanged");

    // One worker runs the gated jobs strictly in turn; release them one at a
    // time so each writer open pairs with exactly one reader.
    for finished in 1..=4 {
        release_gate(&gate);
        notifier.wait_for(finished);
    }

    assert_eq!(scheduler.inner.live_jobs(), 0);
    scheduler.submit("echo reuse", 1, 2).expect("freed slot accepts work");
    notifier.wait_for(5);

    scheduler.shutdown();
}

#[test]
fn capacity_plus_one_yields_exactly_one_rejection() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let gate_a = tempdir.path().join("gate-a");
    let gate_b = tempdir.path().join("gate-b");
    make_fifo(&gate_a);
    make_fifo(&gate_b);

    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(8, 2), notifier.clone()).expect("start");

    // Two gates park both workers, six more fill the table.
    let mut submitted = HashSet::new();
    submitted.insert(scheduler.submit(&gate_command(&gate_a), 1, 2).expect("gate a"));
    submitted.insert(scheduler.submit(&gate_command(&gate_b), 1, 2).expect("gate b"));
    for index in 0..6 {
        let uid = scheduler
            .submit(&format!("echo {index}"), 1, 2)
            .expect("fill");
        submitted.insert(uid);
    }
    assert_eq!(submitted.len(), 8);
    assert_eq!(
        scheduler.submit("echo one-too-many", 1, 2),
        Err(SubmitError::TableFull)
    );

    release_gate(&gate_a);
    release_gate(&gate_b);
    let notifications = notifier.wait_for(8);

    let reported: HashSet<i64> = notifications
        .iter()
        .map(|notification| notification.uid)
        .collect();
    assert_eq!(reported, submitted, "no dispatch may be lost or duplicated");

    scheduler.shutdown();
}

#[test]
fn query_reports_running_jobs_to_their_requester_only() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let gate = tempdir.path().join("gate");
    make_fifo(&gate);

    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(16, 1), notifier.clone()).expect("start");

    let command = format!("echo started; cat {}", gate.display());
    let uid = scheduler.submit(&command, 77, 2).expect("submit");

    // Poll until the worker has published Running and streamed the marker.
    let deadline = Instant::now() + WAIT_TIMEOUT;
    let report = loop {
        match scheduler.query(uid, 77) {
            Ok(report) if report.output.ends_with(b"started\n") => break report,
            Ok(_) | Err(QueryError::NotFound) => {
                assert!(Instant::now() < deadline, "job never reached Running");
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(error) => panic!("unexpected query error: {error}"),
        }
    };
    assert_eq!(report.uid, uid);
    assert_eq!(report.status, JobStatus::Running);
    assert_eq!(report.command, command);

    assert_eq!(scheduler.query(uid, 78), Err(QueryError::Forbidden));
    assert_eq!(scheduler.query(uid ^ 1, 77), Err(QueryError::NotFound));

    // A queued job is not queryable either; only Running entries answer.
    let queued = scheduler.submit("echo queued", 77, 2).expect("queued");
    assert_eq!(scheduler.query(queued, 77), Err(QueryError::NotFound));

    release_gate(&gate);
    notifier.wait_for(2);
    assert_eq!(
        scheduler.query(uid, 77),
        Err(QueryError::NotFound),
        "finished jobs are gone"
    );

    scheduler.shutdown();
}

#[test]
fn rejected_queue_push_rolls_the_slot_back() {
    let tempdir = tempfile::tempdir().expect("tempdir");
    let gate = tempdir.path().join("gate");
    make_fifo(&gate);

    let notifier = RecordingNotifier::new();
    let scheduler = JobScheduler::start(test_config(8, 1), notifier.clone()).expect("start");

    let gate_uid = scheduler.submit(&gate_command(&gate), 1, 2).expect("gate");
    let gate_index = (gate_uid as usize) & 7;

    // Wait until the worker has taken the gate job and parked on it.
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while scheduler.inner.queue.len() > 0 {
        assert!(Instant::now() < deadline, "worker never took the gate job");
        std::thread::sleep(Duration::from_millis(5));
    }

    // Jam the ring with indices of a free slot so the next submission's push
    // is rejected.
    let free_index = (gate_index + 1) & 7;
    while scheduler.inner.queue.push(free_index) {}

    let rejected = scheduler.submit("echo never", 1, 2);
    assert_eq!(rejected, Err(SubmitError::QueueFull));
    assert_eq!(
        scheduler.inner.live_jobs(),
        1,
        "the rolled-back slot must not stay live"
    );

    release_gate(&gate);
    // The jammed free-slot indices are skipped without executing anything.
    let notifications = notifier.wait_for(1);
    assert_eq!(notifications[0].uid, gate_uid);

    scheduler.shutdown();
}
