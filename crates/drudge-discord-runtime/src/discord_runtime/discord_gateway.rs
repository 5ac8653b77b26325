//! Gateway payload types and websocket plumbing for the Discord session.

use anyhow::{anyhow, Context, Result};
use futures_util::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub(super) const OP_DISPATCH: u8 = 0;
pub(super) const OP_HEARTBEAT: u8 = 1;
pub(super) const OP_IDENTIFY: u8 = 2;
pub(super) const OP_RECONNECT: u8 = 7;
pub(super) const OP_INVALID_SESSION: u8 = 9;
pub(super) const OP_HELLO: u8 = 10;
pub(super) const OP_HEARTBEAT_ACK: u8 = 11;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub(super) struct GatewayPayload {
    pub(super) op: u8,
    #[serde(rename = "d", default)]
    pub(super) data: Value,
    #[serde(rename = "s", default)]
    pub(super) sequence: Option<u64>,
    #[serde(rename = "t", default)]
    pub(super) event_type: Option<String>,
}

/// Decodes one websocket frame; control frames carry no payload.
pub(super) fn parse_gateway_payload(message: WsMessage) -> Result<Option<GatewayPayload>> {
    match message {
        WsMessage::Text(text) => {
            let payload: GatewayPayload = serde_json::from_str(text.as_str())
                .context("failed to decode gateway payload")?;
            Ok(Some(payload))
        }
        WsMessage::Binary(bytes) => {
            let payload: GatewayPayload = serde_json::from_slice(&bytes)
                .context("failed to decode binary gateway payload")?;
            Ok(Some(payload))
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {
            Ok(None)
        }
    }
}

pub(super) fn identify_payload(bot_token: &str) -> Value {
    json!({
        "op": OP_IDENTIFY,
        "d": {
            "token": bot_token,
            "intents": 0,
            "properties": {
                "os": std::env::consts::OS,
                "browser": "drudge",
                "device": "drudge",
            }
        }
    })
}

pub(super) fn heartbeat_payload(sequence: Option<u64>) -> Value {
    json!({ "op": OP_HEARTBEAT, "d": sequence })
}

pub(super) fn heartbeat_interval_ms(hello: &GatewayPayload) -> Result<u64> {
    hello
        .data
        .get("heartbeat_interval")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("gateway hello missing heartbeat_interval"))
}

pub(super) async fn send_payload<S>(sink: &mut S, payload: Value) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    sink.send(WsMessage::Text(payload.to_string().into()))
        .await
        .context("failed to send gateway payload")
}
