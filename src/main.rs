mod config;
mod error;
mod helpers;
mod middleware;
mod ranking;
mod routes;
mod ytdlp;

use std::{net::SocketAddr, sync::Arc};

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    config::{Config, RuntimeMode},
    error::ApiError,
    routes::{AppState, build_router},
    ytdlp::YtDlp,
};

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_api=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = Config::from_env();

    if !config.trust_proxy_headers {
        warn!("TRUST_PROXY_HEADERS=false: rate limiting uses the socket address");
    }
    if config.mode == RuntimeMode::Development {
        info!("running in development mode, upstream error details are exposed");
    }

    let backend = YtDlp::new(&config)
        .map_err(|error| ApiError::internal(format!("Could not build HTTP client: {error}")))?;
    let addr = config.bind_addr.clone();
    let state = AppState::new(Arc::new(backend), config);
    let app = build_router(state)?;

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|error| ApiError::internal(format!("Could not bind {addr}: {error}")))?;

    info!("video-api listening on http://{addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")))
}
