//! Per-job subprocess execution: spawn, stream combined output into the
//! job's window, classify the exit, free the slot, notify.

use std::{
    io::{ErrorKind, PipeReader, Read},
    path::Path,
    process::{Child, Command, Stdio},
};

use tracing::{debug, warn};

use super::{
    job_table::{JobStatus, FREE_UID},
    SchedulerInner,
};
use crate::notifier::{JobNotification, JobNotifier};

/// Runs one dequeued job to completion and emits exactly one notification.
///
/// The slot is released before the notification goes out, so the table can
/// reuse it immediately; everything the report needs is snapshotted first.
pub(super) fn execute_job(inner: &SchedulerInner, slot_index: usize, notifier: &dyn JobNotifier) {
    let slot = &inner.slots[slot_index];
    let uid = slot.uid();
    if uid == FREE_UID {
        // A rejected push rolled this slot back between enqueue and dequeue.
        return;
    }
    let meta = slot.meta();

    let mut shell = match spawn_shell(&inner.config.shell, &meta.command) {
        Ok(shell) => shell,
        Err(error) => {
            slot.set_status(JobStatus::Error);
            inner.release_slot(slot_index);
            warn!(uid, %error, "failed to spawn job subprocess");
            notifier.notify(JobNotification {
                uid,
                status: JobStatus::Error,
                command: meta.command,
                requester: meta.requester,
                destination: meta.destination,
                output: Vec::new(),
                error: Some(error.to_string()),
            });
            return;
        }
    };

    slot.set_status(JobStatus::Running);
    debug!(uid, "job running");

    // Stream until end-of-file. The only writer ends of the pipe live in the
    // child, so EOF is the completion signal; the per-job lock is held for
    // the append only, never across the read.
    let mut scratch = vec![0u8; inner.config.read_chunk_bytes.max(1)];
    loop {
        match shell.output.read(&mut scratch) {
            Ok(0) => break,
            Ok(read) => slot.append_output(&scratch[..read]),
            Err(error) if error.kind() == ErrorKind::Interrupted => continue,
            Err(error) => {
                warn!(uid, %error, "job output read failed");
                break;
            }
        }
    }

    let status = match shell.child.wait() {
        Ok(exit) if exit.code().is_some() => JobStatus::Exited,
        Ok(_) => JobStatus::Terminated,
        Err(error) => {
            warn!(uid, %error, "failed to reap job subprocess");
            JobStatus::Terminated
        }
    };
    slot.set_status(status);
    debug!(uid, status = status.as_str(), "job finished");

    let output = slot.output_snapshot();
    inner.release_slot(slot_index);
    notifier.notify(JobNotification {
        uid,
        status,
        command: meta.command,
        requester: meta.requester,
        destination: meta.destination,
        output,
        error: None,
    });
}

struct ShellChild {
    child: Child,
    output: PipeReader,
}

/// Spawns `<shell> -c <command>` with stdout and stderr sharing one pipe so
/// the capture preserves their interleaving.
fn spawn_shell(shell: &Path, command_text: &str) -> std::io::Result<ShellChild> {
    let (output, writer) = std::io::pipe()?;
    let stderr_writer = writer.try_clone()?;
    let mut command = Command::new(shell);
    command
        .arg("-c")
        .arg(command_text)
        .stdin(Stdio::null())
        .stdout(Stdio::from(writer))
        .stderr(Stdio::from(stderr_writer));
    let spawned = command.spawn();
    // The Command still holds parent-side copies of the pipe writers; they
    // must be gone before the read loop can ever see end-of-file.
    drop(command);
    Ok(ShellChild {
        child: spawned?,
        output,
    })
}
