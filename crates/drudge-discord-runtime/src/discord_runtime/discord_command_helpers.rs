//! Slash-command option extraction and reply rendering for the drudge bot.

use serde_json::{json, Value};

use drudge_jobs::{JobNotification, JobStatus, JobStatusReport, JobUid, SubmitError};

use super::{InteractionData, ReplyAttachment};
use crate::discord_helpers::truncate_for_discord;

pub(super) const DISCORD_MESSAGE_LIMIT: usize = 2_000;

pub(super) const NOT_FOUND_REPLY: &str =
    "This job does not exist. It may have already finished.";
pub(super) const FORBIDDEN_REPLY: &str = "You are not the owner of this job.";

/// Global command set registered at startup, bulk-overwrite style.
pub(super) fn global_command_definitions() -> Value {
    json!([
        {
            "name": "run",
            "description": "Start a new job.",
            "options": [{
                "type": 3,
                "name": "command",
                "description": "Your command",
                "required": true,
            }],
        },
        {
            "name": "status",
            "description": "Check on one of your running jobs.",
            "options": [{
                "type": 3,
                "name": "job",
                "description": "Job ID",
                "required": true,
            }],
        },
        {
            "name": "help",
            "description": "Get help on how to use the bot!",
        },
    ])
}

pub(super) fn string_option(data: &InteractionData, option_name: &str) -> Option<String> {
    data.options
        .iter()
        .find(|option| option.name == option_name)
        .and_then(|option| option.value.as_str())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Job ids travel as the hex string users see in the queued reply.
pub(super) fn parse_job_uid(raw: &str) -> Option<JobUid> {
    let trimmed = raw.trim().trim_matches('`');
    JobUid::from_str_radix(trimmed, 16)
        .ok()
        .filter(|uid| *uid >= 0)
}

pub(super) fn attachment_filename(uid: JobUid) -> String {
    format!("drudge_job_{uid:x}_output.ansi")
}

pub(super) fn render_queued_reply(uid: JobUid) -> String {
    format!("Your job has been queued!\nJob ID: `{uid:x}`")
}

pub(super) fn render_submit_error_reply(error: SubmitError) -> String {
    match error {
        SubmitError::EmptyCommand => "Your command is empty.".to_string(),
        SubmitError::TableFull | SubmitError::QueueFull => {
            "There was a problem queuing your job. The queue may be full.".to_string()
        }
        SubmitError::ShuttingDown => {
            "The bot is shutting down and not accepting new jobs.".to_string()
        }
    }
}

pub(super) fn render_status_reply(report: &JobStatusReport) -> String {
    truncate_for_discord(
        &format!(
            "**Job {:x}**\nYour job {}.\nCommand: `{}`",
            report.uid,
            report.status.phrase(),
            report.command
        ),
        DISCORD_MESSAGE_LIMIT,
    )
}

pub(super) fn report_attachment(report: &JobStatusReport) -> Option<ReplyAttachment> {
    if report.output.is_empty() {
        return None;
    }
    Some(ReplyAttachment {
        filename: attachment_filename(report.uid),
        content_type: "text/plain; charset=utf-8",
        bytes: report.output.clone(),
    })
}

/// Message and optional output attachment for one terminal job report.
pub(super) fn render_job_notification(
    notification: &JobNotification,
) -> (String, Option<ReplyAttachment>) {
    let mut content = format!(
        "**Job {:x}**\nHey <@{}>! Your job {}.",
        notification.uid,
        notification.requester,
        notification.status.phrase()
    );
    match notification.error.as_deref() {
        Some(error) => content.push_str(&format!("\nError: {error}")),
        None => content.push_str(&format!("\nResults of `{}`", notification.command)),
    }

    let attachment = if notification.status == JobStatus::Error || notification.output.is_empty() {
        None
    } else {
        Some(ReplyAttachment {
            filename: attachment_filename(notification.uid),
            content_type: "text/plain; charset=utf-8",
            bytes: notification.output.clone(),
        })
    };
    (
        truncate_for_discord(&content, DISCORD_MESSAGE_LIMIT),
        attachment,
    )
}

pub(super) fn render_help_reply(username: Option<&str>) -> String {
    let greeting = username.unwrap_or("there");
    [
        format!("Hello {greeting}, welcome to drudge!"),
        String::new(),
        "Supported commands:".to_string(),
        "- `/run command:<shell command>` queues a job and replies with its id".to_string(),
        "- `/status job:<id>` shows a running job's output so far".to_string(),
        "- `/help` shows this message".to_string(),
        String::new(),
        "Job results are posted back to the channel the job was started in.".to_string(),
    ]
    .join("\n")
}

pub(super) fn invalid_command_reply() -> String {
    "Invalid command, contact the maintainer of this bot.".to_string()
}
