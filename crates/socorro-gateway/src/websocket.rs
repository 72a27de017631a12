//! WebSocket connection loop: request frames in, responses and subscription pushes out.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use socorro_fanout::{ConnectionId, ResumeOutcome, SubscriptionHandle, SubscriptionId};
use socorro_types::Actor;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::http::ApiError;
use crate::server::GatewayState;
use crate::ws_protocol::{
    best_effort_ws_request_id, build_heartbeat_frame, build_subscription_push_frame,
    build_ws_error_frame, build_ws_response_frame, classify_ws_parse_error, parse_ws_payload,
    parse_ws_request_frame, HelloPayload, InboxWatchPayload, MessageSendPayload,
    SubscriptionClosePayload, SubscriptionResumePayload, TranscriptOpenPayload, WsFrame,
    WsRequestFrame, WsRequestKind, WS_ERROR_CODE_HELLO_REQUIRED, WS_ERROR_CODE_INTERNAL_ERROR,
    WS_ERROR_CODE_INVALID_PAYLOAD, WS_ERROR_CODE_UNKNOWN_SUBSCRIPTION, WS_PROTOCOL_VERSION,
    WS_UNKNOWN_REQUEST_ID,
};

fn ws_message_from_frame(frame: &WsFrame) -> WsMessage {
    match serde_json::to_string(frame) {
        Ok(raw) => WsMessage::Text(raw.into()),
        Err(error) => {
            let fallback = build_ws_error_frame(
                &frame.request_id,
                WS_ERROR_CODE_INTERNAL_ERROR,
                format!("failed to serialize websocket frame: {error}").as_str(),
            );
            WsMessage::Text(
                serde_json::to_string(&fallback)
                    .unwrap_or_else(|_| {
                        "{\"schema_version\":1,\"request_id\":\"unknown-request\",\"kind\":\"error\",\"payload\":{\"code\":\"internal_error\",\"message\":\"failed to serialize websocket frame\"}}".to_string()
                    })
                    .into(),
            )
        }
    }
}

fn payload_error(error: anyhow::Error) -> ApiError {
    let message = format!("{error:#}");
    ApiError::bad_request(classify_ws_parse_error(&message), message)
}

/// Per-socket state: identity, owned subscriptions and their forwarders.
struct WsSession {
    state: Arc<GatewayState>,
    connection: ConnectionId,
    actor: Option<Actor>,
    push_sender: mpsc::Sender<WsFrame>,
    forwarders: HashMap<SubscriptionId, JoinHandle<()>>,
}

impl WsSession {
    fn new(state: Arc<GatewayState>, push_sender: mpsc::Sender<WsFrame>) -> Self {
        Self {
            state,
            connection: ConnectionId::new(),
            actor: None,
            push_sender,
            forwarders: HashMap::new(),
        }
    }

    async fn dispatch_text(&mut self, raw: &str) -> WsFrame {
        let frame = match parse_ws_request_frame(raw) {
            Ok(frame) => frame,
            Err(error) => {
                let request_id = best_effort_ws_request_id(raw)
                    .unwrap_or_else(|| WS_UNKNOWN_REQUEST_ID.to_string());
                let message = format!("{error:#}");
                return build_ws_error_frame(
                    &request_id,
                    classify_ws_parse_error(&message),
                    &message,
                );
            }
        };

        match self.dispatch(&frame).await {
            Ok(payload) => {
                build_ws_response_frame(&frame.request_id, &frame.kind.response_kind(), payload)
            }
            Err(error) => build_ws_error_frame(&frame.request_id, error.code, &error.message),
        }
    }

    async fn dispatch(&mut self, frame: &WsRequestFrame) -> Result<Value, ApiError> {
        match frame.kind {
            WsRequestKind::Hello => {
                let payload: HelloPayload = parse_ws_payload(frame).map_err(payload_error)?;
                let actor_id = payload.actor_id.trim();
                if actor_id.is_empty() {
                    return Err(ApiError::bad_request(
                        WS_ERROR_CODE_INVALID_PAYLOAD,
                        "hello actor_id must be non-empty",
                    ));
                }
                let actor = Actor::new(actor_id, payload.role);
                tracing::debug!(
                    connection = %self.connection,
                    actor_id = %actor.actor_id,
                    role = actor.role.as_str(),
                    "websocket identity bound"
                );
                self.actor = Some(actor.clone());
                Ok(json!({
                    "connection_id": self.connection.as_str(),
                    "actor": actor,
                    "protocol_version": WS_PROTOCOL_VERSION,
                    "heartbeat_interval_seconds": self.state.heartbeat_interval.as_secs(),
                }))
            }
            WsRequestKind::TranscriptOpen => {
                let actor = self.require_actor()?;
                let payload: TranscriptOpenPayload =
                    parse_ws_payload(frame).map_err(payload_error)?;
                let session = self
                    .state
                    .service
                    .open_transcript(
                        &actor,
                        &payload.emergency_request_id,
                        self.connection.clone(),
                    )
                    .await?;
                let subscription_id = self.spawn_forwarder(session.subscription);
                Ok(json!({
                    "subscription_id": subscription_id,
                    "request": session.request,
                    "history": session.history,
                    "review_started": session.review_started,
                }))
            }
            WsRequestKind::InboxWatch => {
                self.require_actor()?;
                let payload: InboxWatchPayload = parse_ws_payload(frame).map_err(payload_error)?;
                let watch = self
                    .state
                    .service
                    .watch_inbox(&payload.responder_id, self.connection.clone())
                    .await?;
                let subscription_id = self.spawn_forwarder(watch.subscription);
                Ok(json!({
                    "subscription_id": subscription_id,
                    "open_requests": watch.open_requests,
                }))
            }
            WsRequestKind::SubscriptionResume => {
                self.require_actor()?;
                let payload: SubscriptionResumePayload =
                    parse_ws_payload(frame).map_err(payload_error)?;
                let outcome = self.state.service.resume(
                    payload.scope,
                    self.connection.clone(),
                    payload.after_notification_id,
                );
                let (handle, replayed, resync_required) = match outcome {
                    ResumeOutcome::Replayed { handle, replayed } => (handle, replayed, false),
                    ResumeOutcome::ResyncRequired { handle } => (handle, 0, true),
                };
                let subscription_id = self.spawn_forwarder(handle);
                Ok(json!({
                    "subscription_id": subscription_id,
                    "replayed": replayed,
                    "resync_required": resync_required,
                }))
            }
            WsRequestKind::SubscriptionClose => {
                let payload: SubscriptionClosePayload =
                    parse_ws_payload(frame).map_err(payload_error)?;
                let subscription_id = SubscriptionId(payload.subscription_id);
                let registry = self.state.service.fanout().registry();
                if !registry.is_owned_by(subscription_id, &self.connection) {
                    return Err(ApiError::bad_request(
                        WS_ERROR_CODE_UNKNOWN_SUBSCRIPTION,
                        format!("subscription {subscription_id} is not open on this connection"),
                    ));
                }
                let closed = registry.detach(subscription_id);
                if let Some(task) = self.forwarders.remove(&subscription_id) {
                    task.abort();
                }
                Ok(json!({
                    "subscription_id": subscription_id,
                    "closed": closed,
                }))
            }
            WsRequestKind::MessageSend => {
                let actor = self.require_actor()?;
                let payload: MessageSendPayload =
                    parse_ws_payload(frame).map_err(payload_error)?;
                let message = self
                    .state
                    .service
                    .send_message(
                        &actor,
                        &payload.emergency_request_id,
                        payload.body,
                        payload.client_message_id,
                    )
                    .await?;
                Ok(json!({ "message": message }))
            }
        }
    }

    fn require_actor(&self) -> Result<Actor, ApiError> {
        self.actor.clone().ok_or_else(|| {
            ApiError::bad_request(
                WS_ERROR_CODE_HELLO_REQUIRED,
                "send a hello frame before this request",
            )
        })
    }

    /// Moves `handle` into a task that turns its items into push frames.
    fn spawn_forwarder(&mut self, mut handle: SubscriptionHandle) -> SubscriptionId {
        let subscription_id = handle.id();
        let push_sender = self.push_sender.clone();
        let task = tokio::spawn(async move {
            while let Some(item) = handle.recv().await {
                let frame = build_subscription_push_frame(subscription_id, &item);
                if push_sender.send(frame).await.is_err() {
                    break;
                }
            }
        });
        self.forwarders.retain(|_, task| !task.is_finished());
        if let Some(previous) = self.forwarders.insert(subscription_id, task) {
            previous.abort();
        }
        subscription_id
    }

    fn shutdown(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
        self.state.service.disconnect(&self.connection);
        tracing::debug!(connection = %self.connection, "websocket connection closed");
    }
}

pub(crate) async fn handle_ws_upgrade(
    State(state): State<Arc<GatewayState>>,
    websocket: WebSocketUpgrade,
) -> Response {
    websocket
        .on_upgrade(move |socket| run_ws_connection(state, socket))
        .into_response()
}

pub(crate) async fn run_ws_connection(state: Arc<GatewayState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let push_capacity = state.service.config().fanout.subscriber_queue_capacity;
    let (push_sender, mut push_receiver) = mpsc::channel::<WsFrame>(push_capacity);
    let mut heartbeat = tokio::time::interval(state.heartbeat_interval);
    heartbeat.tick().await;
    let mut session = WsSession::new(state, push_sender);
    tracing::debug!(connection = %session.connection, "websocket connection opened");

    loop {
        tokio::select! {
            inbound = receiver.next() => {
                let Some(inbound) = inbound else {
                    break;
                };
                let message = match inbound {
                    Ok(message) => message,
                    Err(_) => break,
                };

                match message {
                    WsMessage::Text(text) => {
                        let response = session.dispatch_text(text.as_str()).await;
                        if sender.send(ws_message_from_frame(&response)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Binary(bytes) => {
                        let response = match String::from_utf8(bytes.to_vec()) {
                            Ok(text) => session.dispatch_text(text.as_str()).await,
                            Err(_) => build_ws_error_frame(
                                WS_UNKNOWN_REQUEST_ID,
                                WS_ERROR_CODE_INVALID_PAYLOAD,
                                "websocket binary frame must be UTF-8 encoded JSON text",
                            ),
                        };
                        if sender.send(ws_message_from_frame(&response)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Ping(payload) => {
                        if sender.send(WsMessage::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Pong(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            Some(push) = push_receiver.recv() => {
                if sender.send(ws_message_from_frame(&push)).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
                let frame = build_heartbeat_frame(
                    session.connection.as_str(),
                    Utc::now().timestamp_millis(),
                );
                if sender.send(ws_message_from_frame(&frame)).await.is_err() {
                    break;
                }
            }
        }
    }

    session.shutdown();
}
