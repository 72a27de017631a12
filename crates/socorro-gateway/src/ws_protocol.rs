//! Frame schema for the coordination WebSocket.

use std::str::FromStr;

use anyhow::{anyhow, bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use socorro_fanout::{SubscriptionId, SubscriptionItem};
use socorro_types::{ActorRole, Notification, SubscriptionScope};

pub const WS_REQUEST_SCHEMA_VERSION: u32 = 1;
pub const WS_RESPONSE_SCHEMA_VERSION: u32 = 1;
pub const WS_PROTOCOL_VERSION: &str = "0.1.0";
pub const WS_HEARTBEAT_REQUEST_ID: &str = "heartbeat";
pub const WS_UNKNOWN_REQUEST_ID: &str = "unknown-request";

pub const WS_ERROR_CODE_INVALID_JSON: &str = "invalid_json";
pub const WS_ERROR_CODE_UNSUPPORTED_SCHEMA: &str = "unsupported_schema";
pub const WS_ERROR_CODE_UNSUPPORTED_KIND: &str = "unsupported_kind";
pub const WS_ERROR_CODE_INVALID_REQUEST_ID: &str = "invalid_request_id";
pub const WS_ERROR_CODE_INVALID_PAYLOAD: &str = "invalid_payload";
pub const WS_ERROR_CODE_HELLO_REQUIRED: &str = "hello_required";
pub const WS_ERROR_CODE_UNKNOWN_SUBSCRIPTION: &str = "unknown_subscription";
pub const WS_ERROR_CODE_INTERNAL_ERROR: &str = "internal_error";

const WS_REQUEST_KINDS: &[&str] = &[
    "hello",
    "transcript.open",
    "inbox.watch",
    "subscription.resume",
    "subscription.close",
    "message.send",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WsRequestKind {
    Hello,
    TranscriptOpen,
    InboxWatch,
    SubscriptionResume,
    SubscriptionClose,
    MessageSend,
}

impl WsRequestKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::TranscriptOpen => "transcript.open",
            Self::InboxWatch => "inbox.watch",
            Self::SubscriptionResume => "subscription.resume",
            Self::SubscriptionClose => "subscription.close",
            Self::MessageSend => "message.send",
        }
    }

    pub fn response_kind(self) -> String {
        format!("{}.response", self.as_str())
    }
}

impl FromStr for WsRequestKind {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "hello" => Ok(Self::Hello),
            "transcript.open" => Ok(Self::TranscriptOpen),
            "inbox.watch" => Ok(Self::InboxWatch),
            "subscription.resume" => Ok(Self::SubscriptionResume),
            "subscription.close" => Ok(Self::SubscriptionClose),
            "message.send" => Ok(Self::MessageSend),
            other => bail!(
                "unsupported websocket frame kind '{}'; supported kinds are {}",
                other,
                WS_REQUEST_KINDS.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WsRequestFrame {
    pub request_id: String,
    pub kind: WsRequestKind,
    pub payload: serde_json::Map<String, Value>,
}

/// Frame sent to clients: responses, pushes and errors share this shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WsFrame {
    pub schema_version: u32,
    pub request_id: String,
    pub kind: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RawWsRequestFrame {
    schema_version: u32,
    request_id: String,
    kind: String,
    #[serde(default = "empty_payload")]
    payload: Value,
}

fn empty_payload() -> Value {
    json!({})
}

/// `hello`: binds an identity to the connection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct HelloPayload {
    pub actor_id: String,
    pub role: ActorRole,
}

/// `transcript.open`: snapshot plus live tail for one request.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TranscriptOpenPayload {
    pub emergency_request_id: String,
}

/// `inbox.watch`: new and assigned requests for a responder.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct InboxWatchPayload {
    pub responder_id: String,
}

/// `subscription.resume`: re-attach after a reconnect.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionResumePayload {
    pub scope: SubscriptionScope,
    pub after_notification_id: u64,
}

/// `subscription.close`: drop one subscription owned by this connection.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SubscriptionClosePayload {
    pub subscription_id: u64,
}

/// `message.send`: append a chat message as the connection's identity.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MessageSendPayload {
    pub emergency_request_id: String,
    pub body: String,
    #[serde(default)]
    pub client_message_id: Option<String>,
}

pub fn parse_ws_request_frame(raw: &str) -> Result<WsRequestFrame> {
    let frame = serde_json::from_str::<RawWsRequestFrame>(raw)
        .context("failed to parse websocket frame JSON")?;
    if frame.schema_version != WS_REQUEST_SCHEMA_VERSION {
        bail!(
            "unsupported websocket frame schema: expected {}, found {}",
            WS_REQUEST_SCHEMA_VERSION,
            frame.schema_version
        );
    }
    let request_id = frame.request_id.trim();
    if request_id.is_empty() {
        bail!("websocket frame request_id must be non-empty");
    }
    let kind = WsRequestKind::from_str(frame.kind.trim())?;
    let payload = frame
        .payload
        .as_object()
        .ok_or_else(|| anyhow!("websocket frame payload must be a JSON object"))?
        .clone();

    Ok(WsRequestFrame {
        request_id: request_id.to_string(),
        kind,
        payload,
    })
}

/// Decodes the payload of `frame` into the typed payload for its kind.
pub fn parse_ws_payload<T: DeserializeOwned>(frame: &WsRequestFrame) -> Result<T> {
    serde_json::from_value(Value::Object(frame.payload.clone())).with_context(|| {
        format!(
            "websocket frame payload is invalid for kind '{}'",
            frame.kind.as_str()
        )
    })
}

pub fn best_effort_ws_request_id(raw: &str) -> Option<String> {
    let value = serde_json::from_str::<Value>(raw).ok()?;
    let request_id = value
        .as_object()
        .and_then(|object| object.get("request_id"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())?;
    Some(request_id.to_string())
}

pub fn classify_ws_parse_error(message: &str) -> &'static str {
    if message.contains("failed to parse websocket frame JSON") {
        WS_ERROR_CODE_INVALID_JSON
    } else if message.contains("unsupported websocket frame schema") {
        WS_ERROR_CODE_UNSUPPORTED_SCHEMA
    } else if message.contains("unsupported websocket frame kind") {
        WS_ERROR_CODE_UNSUPPORTED_KIND
    } else if message.contains("websocket frame request_id must be non-empty") {
        WS_ERROR_CODE_INVALID_REQUEST_ID
    } else if message.contains("websocket frame payload") {
        WS_ERROR_CODE_INVALID_PAYLOAD
    } else {
        WS_ERROR_CODE_INTERNAL_ERROR
    }
}

pub fn build_ws_response_frame(request_id: &str, kind: &str, payload: Value) -> WsFrame {
    WsFrame {
        schema_version: WS_RESPONSE_SCHEMA_VERSION,
        request_id: request_id.to_string(),
        kind: kind.to_string(),
        payload,
    }
}

pub fn build_ws_error_frame(request_id: &str, code: &str, message: &str) -> WsFrame {
    build_ws_response_frame(
        request_id,
        "error",
        json!({
            "code": code,
            "message": message,
        }),
    )
}

/// Push frame for one item delivered on `subscription_id`.
///
/// Pushes carry the subscription id as `request_id` so clients can route them.
pub fn build_subscription_push_frame(
    subscription_id: SubscriptionId,
    item: &SubscriptionItem,
) -> WsFrame {
    let request_id = subscription_id.to_string();
    match item {
        SubscriptionItem::Envelope(envelope) => {
            let kind = match envelope.payload {
                Notification::Transition(_) => "event.transition",
                Notification::Message(_) => "event.message",
            };
            build_ws_response_frame(
                &request_id,
                kind,
                json!({
                    "subscription_id": subscription_id,
                    "envelope": envelope,
                }),
            )
        }
        SubscriptionItem::ResyncRequired {
            last_notification_id,
        } => build_ws_response_frame(
            &request_id,
            "subscription.resync_required",
            json!({
                "subscription_id": subscription_id,
                "last_notification_id": last_notification_id,
            }),
        ),
    }
}

pub fn build_heartbeat_frame(connection_id: &str, published_at_unix_ms: i64) -> WsFrame {
    build_ws_response_frame(
        WS_HEARTBEAT_REQUEST_ID,
        "gateway.heartbeat",
        json!({
            "connection_id": connection_id,
            "ts_unix_ms": published_at_unix_ms,
        }),
    )
}
