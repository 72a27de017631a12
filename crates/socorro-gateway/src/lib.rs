//! HTTP and WebSocket transport for Socorro emergency-request coordination.

pub mod config;
pub mod http;
pub mod server;
pub mod websocket;
pub mod ws_protocol;

pub use config::{Cli, CliStoreBackend, GatewayServerConfig, StoreBackend};
pub use http::{ApiError, ACTOR_HEADER, ROLE_HEADER};
pub use server::{build_gateway_router, run_gateway_server, GatewayState};

use tracing_subscriber::filter::{EnvFilter, LevelFilter};

/// Installs the global fmt subscriber; `RUST_LOG` overrides `default_level`.
pub fn init_tracing(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}
