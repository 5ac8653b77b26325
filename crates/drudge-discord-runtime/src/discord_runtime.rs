//! Discord bridge runtime: registers the bot's slash commands, reads
//! interactions off the gateway, feeds the job scheduler, and delivers job
//! notifications back to their channels.

use std::{sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use drudge_jobs::{JobNotification, JobNotifier, JobScheduler, QueryError};

mod discord_api_client;
mod discord_command_helpers;
mod discord_gateway;


use discord_api_client::DiscordApiClient;
use discord_command_helpers::{
    global_command_definitions, invalid_command_reply, parse_job_uid, render_help_reply,
    render_job_notification, render_queued_reply, render_status_reply, render_submit_error_reply,
    report_attachment, string_option, FORBIDDEN_REPLY, NOT_FOUND_REPLY,
};
use discord_gateway::{
    heartbeat_interval_ms, heartbeat_payload, identify_payload, parse_gateway_payload,
    send_payload, GatewayPayload, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_HELLO,
    OP_INVALID_SESSION, OP_RECONNECT,
};

/// Interaction type for slash commands.
const INTERACTION_KIND_APPLICATION_COMMAND: u8 = 2;

/// Default REST endpoint; overridable for tests and proxies.
pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
/// Runtime configuration for the Discord transport loop.
pub struct DiscordRuntimeConfig {
    pub api_base: String,
    pub bot_token: String,
    pub request_timeout_ms: u64,
    pub retry_max_attempts: usize,
    pub retry_base_delay_ms: u64,
    pub reconnect_delay: Duration,
}

impl DiscordRuntimeConfig {
    pub fn new(bot_token: String) -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            bot_token,
            request_timeout_ms: 30_000,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

/// Chat-side implementation of the scheduler's notifier seam.
///
/// Workers are plain threads, so the hand-off is a non-blocking send into an
/// unbounded channel the gateway session drains.
pub struct DiscordNotifier {
    sender: mpsc::UnboundedSender<JobNotification>,
}

impl DiscordNotifier {
    /// Returns the notifier plus the receiving half the runtime drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<JobNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl JobNotifier for DiscordNotifier {
    fn notify(&self, notification: JobNotification) {
        if self.sender.send(notification).is_err() {
            warn!("discord runtime is gone; dropping job notification");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DiscordUser {
    pub(crate) id: String,
    #[serde(default)]
    pub(crate) username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct GuildMember {
    #[serde(default)]
    pub(crate) user: Option<DiscordUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct InteractionOption {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) value: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct InteractionData {
    pub(crate) name: String,
    #[serde(default)]
    pub(crate) options: Vec<InteractionOption>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Interaction {
    pub(crate) id: String,
    pub(crate) token: String,
    #[serde(rename = "type")]
    pub(crate) kind: u8,
    #[serde(default)]
    pub(crate) data: Option<InteractionData>,
    #[serde(default)]
    pub(crate) channel_id: Option<String>,
    #[serde(default)]
    pub(crate) member: Option<GuildMember>,
    #[serde(default)]
    pub(crate) user: Option<DiscordUser>,
}

impl Interaction {
    /// Guild interactions carry the user inside the member, DMs at top level.
    pub(crate) fn requester(&self) -> Option<&DiscordUser> {
        self.member
            .as_ref()
            .and_then(|member| member.user.as_ref())
            .or(self.user.as_ref())
    }

    pub(crate) fn requester_id(&self) -> Option<u64> {
        self.requester().and_then(|user| user.id.parse().ok())
    }

    pub(crate) fn requester_name(&self) -> Option<&str> {
        self.requester().and_then(|user| user.username.as_deref())
    }

    pub(crate) fn destination_id(&self) -> Option<u64> {
        self.channel_id.as_deref().and_then(|id| id.parse().ok())
    }
}

/// One file attached to an interaction response or channel message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ReplyAttachment {
    pub(crate) filename: String,
    pub(crate) content_type: &'static str,
    pub(crate) bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InteractionReply {
    pub(crate) content: String,
    pub(crate) attachment: Option<ReplyAttachment>,
}

impl InteractionReply {
    pub(crate) fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            attachment: None,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

/// Runs the Discord transport loop until ctrl-c.
pub async fn run_discord_runtime(
    config: DiscordRuntimeConfig,
    scheduler: Arc<JobScheduler>,
    notifications: mpsc::UnboundedReceiver<JobNotification>,
) -> Result<()> {
    let mut runtime = DiscordRuntime::new(config, scheduler, notifications)?;
    runtime.run().await
}

struct DiscordRuntime {
    config: DiscordRuntimeConfig,
    api_client: DiscordApiClient,
    scheduler: Arc<JobScheduler>,
    notifications: mpsc::UnboundedReceiver<JobNotification>,
}

impl DiscordRuntime {
    fn new(
        config: DiscordRuntimeConfig,
        scheduler: Arc<JobScheduler>,
        notifications: mpsc::UnboundedReceiver<JobNotification>,
    ) -> Result<Self> {
        let api_client = DiscordApiClient::new(
            config.api_base.clone(),
            config.bot_token.clone(),
            config.request_timeout_ms,
            config.retry_max_attempts,
            config.retry_base_delay_ms,
        )?;
        Ok(Self {
            config,
            api_client,
            scheduler,
            notifications,
        })
    }

    async fn run(&mut self) -> Result<()> {
        let application_id = self.api_client.resolve_application_id().await?;
        self.api_client
            .overwrite_global_commands(&application_id, global_command_definitions())
            .await?;
        info!(%application_id, "registered discord slash commands");

        loop {
            let gateway_url = match self.api_client.fetch_gateway_url().await {
                Ok(url) => url,
                Err(error) => {
                    warn!(%error, "failed to fetch discord gateway url");
                    if self.pause_before_reconnect().await {
                        return Ok(());
                    }
                    continue;
                }
            };

            match self.run_gateway_session(&gateway_url).await {
                Ok(SessionEnd::Shutdown) => return Ok(()),
                Ok(SessionEnd::Reconnect) => {
                    info!("discord gateway session ended; reconnecting")
                }
                Err(error) => warn!(%error, "discord gateway session error"),
            }
            if self.pause_before_reconnect().await {
                return Ok(());
            }
        }
    }

    /// Sleeps out the reconnect delay; true means ctrl-c arrived instead.
    async fn pause_before_reconnect(&self) -> bool {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("discord runtime shutdown requested");
                true
            }
            _ = tokio::time::sleep(self.config.reconnect_delay) => false,
        }
    }

    async fn run_gateway_session(&mut self, gateway_url: &str) -> Result<SessionEnd> {
        let url = format!("{}/?v=10&encoding=json", gateway_url.trim_end_matches('/'));
        let (stream, _response) = connect_async(&url)
            .await
            .with_context(|| "failed to connect discord gateway websocket")?;
        let (mut sink, mut source) = stream.split();

        // Hello arrives first and carries the heartbeat cadence.
        let hello = loop {
            let Some(message_result) = source.next().await else {
                bail!("discord gateway closed before hello");
            };
            let message = message_result.context("failed reading gateway hello")?;
            if let Some(payload) = parse_gateway_payload(message)? {
                break payload;
            }
        };
        if hello.op != OP_HELLO {
            bail!("expected gateway hello, got op {}", hello.op);
        }
        let heartbeat_interval = heartbeat_interval_ms(&hello)?;

        send_payload(&mut sink, identify_payload(&self.config.bot_token)).await?;
        debug!(heartbeat_interval, "discord gateway identified");

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(heartbeat_interval.max(1_000)));
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_sequence: Option<u64> = None;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("discord runtime shutdown requested");
                    return Ok(SessionEnd::Shutdown);
                }
                _ = heartbeat.tick() => {
                    send_payload(&mut sink, heartbeat_payload(last_sequence)).await?;
                }
                maybe_notification = self.notifications.recv() => {
                    let Some(notification) = maybe_notification else {
                        bail!("job notification channel closed");
                    };
                    self.deliver_notification(notification).await;
                }
                maybe_message = source.next() => {
                    let Some(message_result) = maybe_message else {
                        return Ok(SessionEnd::Reconnect);
                    };
                    let message = message_result.context("failed reading gateway message")?;
                    let Some(payload) = parse_gateway_payload(message)? else {
                        continue;
                    };
                    if let Some(sequence) = payload.sequence {
                        last_sequence = Some(sequence);
                    }
                    match payload.op {
                        OP_DISPATCH => self.handle_dispatch(payload).await,
                        OP_HEARTBEAT => {
                            send_payload(&mut sink, heartbeat_payload(last_sequence)).await?;
                        }
                        OP_RECONNECT | OP_INVALID_SESSION => return Ok(SessionEnd::Reconnect),
                        OP_HELLO | OP_HEARTBEAT_ACK => {}
                        other => debug!(op = other, "ignoring gateway opcode"),
                    }
                }
            }
        }
    }

    async fn handle_dispatch(&mut self, payload: GatewayPayload) {
        match payload.event_type.as_deref() {
            Some("READY") => {
                let username = payload
                    .data
                    .pointer("/user/username")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                info!(username, "logged in to discord");
            }
            Some("INTERACTION_CREATE") => {
                match serde_json::from_value::<Interaction>(payload.data) {
                    Ok(interaction) => self.handle_interaction(interaction).await,
                    Err(error) => warn!(%error, "failed to decode interaction"),
                }
            }
            _ => {}
        }
    }

    async fn handle_interaction(&mut self, interaction: Interaction) {
        if interaction.kind != INTERACTION_KIND_APPLICATION_COMMAND {
            return;
        }
        let reply = self.build_command_reply(&interaction);
        if let Err(error) = self
            .api_client
            .create_interaction_response(&interaction.id, &interaction.token, &reply)
            .await
        {
            warn!(%error, "failed to answer discord interaction");
        }
    }

    fn build_command_reply(&self, interaction: &Interaction) -> InteractionReply {
        let Some(data) = interaction.data.as_ref() else {
            return InteractionReply::text(invalid_command_reply());
        };
        let Some(requester) = interaction.requester_id() else {
            return InteractionReply::text(invalid_command_reply());
        };
        match data.name.as_str() {
            "run" => {
                let Some(command) = string_option(data, "command") else {
                    return InteractionReply::text("Missing `command` option.");
                };
                let Some(destination) = interaction.destination_id() else {
                    return InteractionReply::text(invalid_command_reply());
                };
                match self.scheduler.submit(&command, requester, destination) {
                    Ok(uid) => InteractionReply::text(render_queued_reply(uid)),
                    Err(error) => InteractionReply::text(render_submit_error_reply(error)),
                }
            }
            "status" => {
                let Some(raw_uid) = string_option(data, "job") else {
                    return InteractionReply::text("Missing `job` option.");
                };
                let Some(uid) = parse_job_uid(&raw_uid) else {
                    return InteractionReply::text(format!("`{raw_uid}` is not a job id."));
                };
                match self.scheduler.query(uid, requester) {
                    Ok(report) => InteractionReply {
                        content: render_status_reply(&report),
                        attachment: report_attachment(&report),
                    },
                    Err(QueryError::NotFound) => InteractionReply::text(NOT_FOUND_REPLY),
                    Err(QueryError::Forbidden) => InteractionReply::text(FORBIDDEN_REPLY),
                }
            }
            "help" => InteractionReply::text(render_help_reply(interaction.requester_name())),
            _ => InteractionReply::text(invalid_command_reply()),
        }
    }

    async fn deliver_notification(&self, notification: JobNotification) {
        let (content, attachment) = render_job_notification(&notification);
        let result = self
            .api_client
            .create_message(
                notification.destination,
                &content,
                Some(notification.requester),
                attachment,
            )
            .await;
        if let Err(error) = result {
            warn!(
                uid = notification.uid,
                %error,
                "failed to deliver job notification"
            );
        }
    }
}
