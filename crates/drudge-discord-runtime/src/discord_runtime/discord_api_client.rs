//! Discord REST client helpers used by command registration, interaction
//! replies, and notification posting.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{InteractionReply, ReplyAttachment};
use crate::discord_helpers::{
    is_retryable_discord_status, is_retryable_transport_error, parse_retry_after, retry_delay,
    truncate_for_error,
};

#[derive(Debug, Clone, Deserialize)]
struct ApplicationResponse {
    id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GatewayBotResponse {
    url: String,
}

#[derive(Clone)]
pub(super) struct DiscordApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
    retry_max_attempts: usize,
    retry_base_delay_ms: u64,
}

impl DiscordApiClient {
    pub(super) fn new(
        api_base: String,
        bot_token: String,
        request_timeout_ms: u64,
        retry_max_attempts: usize,
        retry_base_delay_ms: u64,
    ) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("DiscordBot (drudge, 0.1.0)"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create discord api client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay_ms: retry_base_delay_ms.max(1),
        })
    }

    fn bot_authorization(&self) -> String {
        format!("Bot {}", self.bot_token)
    }

    pub(super) async fn resolve_application_id(&self) -> Result<String> {
        let response: ApplicationResponse = self
            .request_json("oauth2/applications/@me", || {
                self.http
                    .get(format!("{}/oauth2/applications/@me", self.api_base))
                    .header(reqwest::header::AUTHORIZATION, self.bot_authorization())
            })
            .await?;
        if response.id.trim().is_empty() {
            bail!("discord application lookup returned an empty id");
        }
        Ok(response.id)
    }

    pub(super) async fn fetch_gateway_url(&self) -> Result<String> {
        let response: GatewayBotResponse = self
            .request_json("gateway/bot", || {
                self.http
                    .get(format!("{}/gateway/bot", self.api_base))
                    .header(reqwest::header::AUTHORIZATION, self.bot_authorization())
            })
            .await?;
        if response.url.trim().is_empty() {
            bail!("discord gateway lookup returned an empty url");
        }
        Ok(response.url)
    }

    /// Bulk-overwrites the bot's global slash commands.
    pub(super) async fn overwrite_global_commands(
        &self,
        application_id: &str,
        commands: Value,
    ) -> Result<()> {
        let url = format!("{}/applications/{}/commands", self.api_base, application_id);
        self.request_ok("applications/commands", || {
            self.http
                .put(&url)
                .header(reqwest::header::AUTHORIZATION, self.bot_authorization())
                .json(&commands)
        })
        .await
    }

    /// Answers one interaction with a channel message, attaching the reply
    /// file when present.
    pub(super) async fn create_interaction_response(
        &self,
        interaction_id: &str,
        interaction_token: &str,
        reply: &InteractionReply,
    ) -> Result<()> {
        let url = format!(
            "{}/interactions/{}/{}/callback",
            self.api_base, interaction_id, interaction_token
        );
        let mut data = json!({ "content": reply.content });
        match reply.attachment.as_ref() {
            None => {
                self.request_ok("interactions/callback", || {
                    self.http
                        .post(&url)
                        .json(&json!({ "type": 4, "data": data.clone() }))
                })
                .await
            }
            Some(attachment) => {
                data["attachments"] = attachment_manifest(attachment);
                let payload = json!({ "type": 4, "data": data });
                self.request_ok("interactions/callback", || {
                    self.http
                        .post(&url)
                        .multipart(attachment_form(&payload, attachment))
                })
                .await
            }
        }
    }

    /// Posts one message to a channel, optionally mentioning a user and
    /// attaching a file.
    pub(super) async fn create_message(
        &self,
        channel_id: u64,
        content: &str,
        mention_user: Option<u64>,
        attachment: Option<ReplyAttachment>,
    ) -> Result<()> {
        let url = format!("{}/channels/{}/messages", self.api_base, channel_id);
        let mut payload = json!({ "content": content });
        if let Some(user) = mention_user {
            payload["allowed_mentions"] = json!({ "users": [user.to_string()] });
        }
        match attachment.as_ref() {
            None => {
                self.request_ok("channels/messages", || {
                    self.http
                        .post(&url)
                        .header(reqwest::header::AUTHORIZATION, self.bot_authorization())
                        .json(&payload)
                })
                .await
            }
            Some(attachment) => {
                payload["attachments"] = attachment_manifest(attachment);
                self.request_ok("channels/messages", || {
                    self.http
                        .post(&url)
                        .header(reqwest::header::AUTHORIZATION, self.bot_authorization())
                        .multipart(attachment_form(&payload, attachment))
                })
                .await
            }
        }
    }

    async fn request_json<T, F>(&self, operation: &str, builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let response = self.request_with_retry(operation, builder).await?;
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode discord {operation}"))
    }

    async fn request_ok<F>(&self, operation: &str, builder: F) -> Result<()>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        self.request_with_retry(operation, builder).await?;
        Ok(())
    }

    async fn request_with_retry<F>(
        &self,
        operation: &str,
        mut builder: F,
    ) -> Result<reqwest::Response>
    where
        F: FnMut() -> reqwest::RequestBuilder,
    {
        let mut attempt = 0_usize;
        loop {
            attempt = attempt.saturating_add(1);
            match builder().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    let retry_after = parse_retry_after(response.headers());
                    let body = response.text().await.unwrap_or_default();
                    if attempt < self.retry_max_attempts
                        && is_retryable_discord_status(status.as_u16())
                    {
                        tokio::time::sleep(retry_delay(
                            self.retry_base_delay_ms,
                            attempt,
                            retry_after,
                        ))
                        .await;
                        continue;
                    }
                    bail!(
                        "discord api {operation} failed with status {}: {}",
                        status.as_u16(),
                        truncate_for_error(&body, 800)
                    );
                }
                Err(error) => {
                    if attempt < self.retry_max_attempts && is_retryable_transport_error(&error) {
                        tokio::time::sleep(retry_delay(self.retry_base_delay_ms, attempt, None))
                            .await;
                        continue;
                    }
                    return Err(anyhow!(error))
                        .with_context(|| format!("discord api {operation} request failed"));
                }
            }
        }
    }
}

fn attachment_manifest(attachment: &ReplyAttachment) -> Value {
    json!([{ "id": 0, "filename": attachment.filename }])
}

/// Builds the `payload_json` + `files[0]` form Discord expects for uploads.
fn attachment_form(payload: &Value, attachment: &ReplyAttachment) -> reqwest::multipart::Form {
    let part = reqwest::multipart::Part::bytes(attachment.bytes.clone())
        .file_name(attachment.filename.clone());
    let part = match part.mime_str(attachment.content_type) {
        Ok(part) => part,
        Err(_) => reqwest::multipart::Part::bytes(attachment.bytes.clone())
            .file_name(attachment.filename.clone()),
    };
    reqwest::multipart::Form::new()
        .text("payload_json", payload.to_string())
        .part("files[0]", part)
}
