//! Router assembly and server bootstrap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::Router;
use socorro_lifecycle::CoordinationService;
use tokio::net::TcpListener;

use crate::config::GatewayServerConfig;
use crate::http::{
    handle_assign, handle_begin_review, handle_cancel, handle_create_request, handle_follow_up,
    handle_get_request, handle_healthz, handle_history, handle_list_requests, handle_resolve,
    handle_responder_summary, handle_send_message,
};
use crate::websocket::handle_ws_upgrade;

pub const HEALTHZ_ENDPOINT: &str = "/healthz";
pub const REQUESTS_ENDPOINT: &str = "/requests";
pub const REQUEST_ENDPOINT: &str = "/requests/{request_id}";
pub const ASSIGN_ENDPOINT: &str = "/requests/{request_id}/assign";
pub const BEGIN_REVIEW_ENDPOINT: &str = "/requests/{request_id}/begin-review";
pub const RESOLVE_ENDPOINT: &str = "/requests/{request_id}/resolve";
pub const CANCEL_ENDPOINT: &str = "/requests/{request_id}/cancel";
pub const FOLLOW_UP_ENDPOINT: &str = "/requests/{request_id}/follow-up";
pub const MESSAGES_ENDPOINT: &str = "/requests/{request_id}/messages";
pub const RESPONDER_SUMMARY_ENDPOINT: &str = "/responders/{responder_id}/summary";
pub const WS_ENDPOINT: &str = "/ws";

/// Shared state handed to every handler.
pub struct GatewayState {
    pub service: Arc<CoordinationService>,
    pub heartbeat_interval: Duration,
}

impl GatewayState {
    pub fn new(service: Arc<CoordinationService>, heartbeat_interval: Duration) -> Self {
        Self {
            service,
            heartbeat_interval,
        }
    }
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(HEALTHZ_ENDPOINT, get(handle_healthz))
        .route(
            REQUESTS_ENDPOINT,
            post(handle_create_request).get(handle_list_requests),
        )
        .route(REQUEST_ENDPOINT, get(handle_get_request))
        .route(ASSIGN_ENDPOINT, post(handle_assign))
        .route(BEGIN_REVIEW_ENDPOINT, post(handle_begin_review))
        .route(RESOLVE_ENDPOINT, post(handle_resolve))
        .route(CANCEL_ENDPOINT, post(handle_cancel))
        .route(FOLLOW_UP_ENDPOINT, axum::routing::put(handle_follow_up))
        .route(
            MESSAGES_ENDPOINT,
            get(handle_history).post(handle_send_message),
        )
        .route(RESPONDER_SUMMARY_ENDPOINT, get(handle_responder_summary))
        .route(WS_ENDPOINT, get(handle_ws_upgrade))
        .with_state(state)
}

pub async fn run_gateway_server(config: GatewayServerConfig) -> Result<()> {
    let store = config.store.open()?;
    let service = CoordinationService::new(store, config.coordination)
        .context("failed to build coordination service")?;
    let state = Arc::new(GatewayState::new(
        Arc::new(service),
        config.heartbeat_interval,
    ));

    let listener = TcpListener::bind(config.bind.as_str())
        .await
        .with_context(|| format!("failed to bind socorro gateway on {}", config.bind))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(
        addr = %local_addr,
        store = ?config.store,
        ws_endpoint = WS_ENDPOINT,
        "socorro gateway listening"
    );

    axum::serve(listener, build_gateway_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("socorro gateway exited unexpectedly")?;
    tracing::info!("socorro gateway stopped");
    Ok(())
}
