use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;
mod bypass;
mod config;
mod error;
mod identity;
mod keys;
mod proxy;
mod router;

use config::{Config, LogFormat};

const DEFAULT_LOG_FILTER: &str = "edge_gateway=info,tower_http=warn";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config first: it may carry the log level and format.
    let config_path = std::env::var("EDGE_GATEWAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/etc/edge-gateway/config.toml"));

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    init_tracing(&config);

    info!(
        port = config.gateway.port,
        routes = config.routes.len(),
        backends = config.backends.len(),
        "edge-gateway starting"
    );

    let state = Arc::new(router::RouterState::new(&config)?);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "gateway listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::client::router(state)
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway server error")?;

    info!("edge-gateway stopped");
    Ok(())
}

/// `RUST_LOG` wins, then `[gateway].log_level`, then the built-in default.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .ok()
        .or_else(|| {
            config
                .gateway
                .log_level
                .as_deref()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_FILTER));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.gateway.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}
