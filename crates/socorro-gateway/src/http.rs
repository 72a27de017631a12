//! HTTP JSON handlers for request lifecycle and transcript operations.

use std::str::FromStr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use socorro_lifecycle::{AssignRequest, LifecycleError, LifecycleResult};
use socorro_types::{
    Actor, ActorRole, NewEmergencyRequest, Priority, RequestQuery, RequestStatus,
};

use crate::server::GatewayState;

pub const ACTOR_HEADER: &str = "x-socorro-actor";
pub const ROLE_HEADER: &str = "x-socorro-role";

/// Error mapped to the gateway's JSON error envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn missing_identity(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "missing_identity", message)
    }
}

impl From<LifecycleError> for ApiError {
    fn from(error: LifecycleError) -> Self {
        let status = match &error {
            LifecycleError::Validation(_) => StatusCode::BAD_REQUEST,
            LifecycleError::NotFound(_) => StatusCode::NOT_FOUND,
            LifecycleError::InvalidTransition { .. } | LifecycleError::Conflict { .. } => {
                StatusCode::CONFLICT
            }
            LifecycleError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, error.code(), error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error_type = if self.status.is_client_error() {
            "invalid_request_error"
        } else {
            "server_error"
        };
        (
            self.status,
            Json(json!({
                "error": {
                    "type": error_type,
                    "code": self.code,
                    "message": self.message,
                }
            })),
        )
            .into_response()
    }
}

fn parse_json_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice::<T>(body).map_err(|error| {
        ApiError::bad_request(
            "malformed_json",
            format!("failed to parse request body: {error}"),
        )
    })
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Reads the caller identity from the actor/role headers.
pub fn actor_from_headers(headers: &HeaderMap) -> Result<Actor, ApiError> {
    let actor_id = header_value(headers, ACTOR_HEADER)
        .ok_or_else(|| ApiError::missing_identity(format!("missing {ACTOR_HEADER} header")))?;
    let role = header_value(headers, ROLE_HEADER)
        .ok_or_else(|| ApiError::missing_identity(format!("missing {ROLE_HEADER} header")))?;
    let role = ActorRole::from_str(role)
        .map_err(|error| ApiError::bad_request("invalid_role", error.to_string()))?;
    Ok(Actor::new(actor_id, role))
}

fn respond<T: Serialize>(status: StatusCode, result: LifecycleResult<T>) -> Response {
    match result {
        Ok(value) => (status, Json(value)).into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct ListRequestsQuery {
    #[serde(default)]
    requester_id: Option<String>,
    #[serde(default)]
    responder_id: Option<String>,
    /// Comma-separated status filter, e.g. `PENDING,ASSIGNED`.
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    offset: Option<usize>,
}

impl ListRequestsQuery {
    fn into_request_query(self) -> Result<RequestQuery, ApiError> {
        let statuses = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.split(',')
                    .map(RequestStatus::from_str)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|error| ApiError::bad_request("invalid_status", error.to_string()))?,
            ),
        };
        Ok(RequestQuery {
            requester_id: self.requester_id,
            responder_id: self.responder_id,
            statuses,
            limit: self.limit.map(|limit| limit.clamp(1, 500)),
            offset: self.offset.unwrap_or(0),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct AssignBody {
    responder_id: String,
    #[serde(default)]
    priority: Option<Priority>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct FollowUpBody {
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SendMessageBody {
    body: String,
    #[serde(default)]
    client_message_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub(crate) struct HistoryQuery {
    #[serde(default)]
    after: Option<u64>,
}

pub(crate) async fn handle_healthz(State(state): State<Arc<GatewayState>>) -> Response {
    let metrics = state.service.fanout_metrics();
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "active_subscriptions": state.service.fanout().registry().active_subscriptions(),
            "fanout": {
                "published": metrics.published,
                "delivered": metrics.delivered,
                "dropped_full": metrics.dropped_full,
                "dropped_closed": metrics.dropped_closed,
                "replayed": metrics.replayed,
            },
        })),
    )
        .into_response()
}

pub(crate) async fn handle_create_request(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    let input = match parse_json_body::<NewEmergencyRequest>(&body) {
        Ok(input) => input,
        Err(error) => return error.into_response(),
    };
    respond(
        StatusCode::CREATED,
        state.service.create_request(&actor, input).await,
    )
}

pub(crate) async fn handle_list_requests(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ListRequestsQuery>,
) -> Response {
    let query = match query.into_request_query() {
        Ok(query) => query,
        Err(error) => return error.into_response(),
    };
    match state.service.list_requests(query).await {
        Ok(requests) => (StatusCode::OK, Json(json!({ "requests": requests }))).into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_get_request(
    State(state): State<Arc<GatewayState>>,
    AxumPath(request_id): AxumPath<String>,
) -> Response {
    respond(StatusCode::OK, state.service.get_request(&request_id).await)
}

pub(crate) async fn handle_assign(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(request_id): AxumPath<String>,
    body: Bytes,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    let body = match parse_json_body::<AssignBody>(&body) {
        Ok(body) => body,
        Err(error) => return error.into_response(),
    };
    let input = AssignRequest {
        responder_id: body.responder_id,
        priority: body.priority,
        notes: body.notes,
    };
    respond(
        StatusCode::OK,
        state.service.assign(&actor, &request_id, input).await,
    )
}

pub(crate) async fn handle_begin_review(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(request_id): AxumPath<String>,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    match state.service.begin_review(&actor, &request_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "request": outcome.request,
                "started": outcome.started,
                "notice": outcome.notice,
            })),
        )
            .into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_resolve(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(request_id): AxumPath<String>,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    respond(StatusCode::OK, state.service.resolve(&actor, &request_id).await)
}

pub(crate) async fn handle_cancel(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(request_id): AxumPath<String>,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    respond(StatusCode::OK, state.service.cancel(&actor, &request_id).await)
}

pub(crate) async fn handle_follow_up(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(request_id): AxumPath<String>,
    body: Bytes,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    let body = match parse_json_body::<FollowUpBody>(&body) {
        Ok(body) => body,
        Err(error) => return error.into_response(),
    };
    respond(
        StatusCode::OK,
        state
            .service
            .update_follow_up(&actor, &request_id, body.notes)
            .await,
    )
}

pub(crate) async fn handle_history(
    State(state): State<Arc<GatewayState>>,
    AxumPath(request_id): AxumPath<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    let result = match query.after {
        Some(after) => state.service.history_after(&request_id, after).await,
        None => state.service.history(&request_id).await,
    };
    match result {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({
                "request_id": request_id,
                "messages": messages,
            })),
        )
            .into_response(),
        Err(error) => ApiError::from(error).into_response(),
    }
}

pub(crate) async fn handle_send_message(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    AxumPath(request_id): AxumPath<String>,
    body: Bytes,
) -> Response {
    let actor = match actor_from_headers(&headers) {
        Ok(actor) => actor,
        Err(error) => return error.into_response(),
    };
    let body = match parse_json_body::<SendMessageBody>(&body) {
        Ok(body) => body,
        Err(error) => return error.into_response(),
    };
    respond(
        StatusCode::CREATED,
        state
            .service
            .send_message(&actor, &request_id, body.body, body.client_message_id)
            .await,
    )
}

pub(crate) async fn handle_responder_summary(
    State(state): State<Arc<GatewayState>>,
    AxumPath(responder_id): AxumPath<String>,
) -> Response {
    respond(
        StatusCode::OK,
        state.service.responder_summary(&responder_id).await,
    )
}
