use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use imgflow_core::runtime::docker::DockerRuntime;
use imgflow_pipeline::QueueConfig;
use imgflow_store::HttpFetcher;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use imgflow_api::config::ServerConfig;
use imgflow_api::router::build_app_router;
use imgflow_api::state::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "imgflow_api=debug,imgflow_pipeline=debug,imgflow_store=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env();
    let queue_config = QueueConfig::from_env();
    tracing::info!(
        host = %config.host,
        port = %config.port,
        max_concurrent = queue_config.max_concurrent,
        container_binary = %queue_config.container_binary,
        "Loaded server configuration",
    );

    // --- Collaborators ---
    let runtime = Arc::new(DockerRuntime::new(queue_config.container_binary.clone()));
    let fetcher = Arc::new(HttpFetcher::default());

    // --- App state ---
    let state = AppState::build(config.clone(), queue_config, runtime, fetcher)
        .await
        .expect("Failed to open data root");

    let app = build_app_router(state.clone(), &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, draining work");

    let drain = Duration::from_secs(config.shutdown_timeout_secs);
    if tokio::time::timeout(drain, state.shutdown()).await.is_err() {
        tracing::warn!(
            timeout_secs = config.shutdown_timeout_secs,
            "Running work did not finish in time; it will be marked failed on next start",
        );
    }

    tracing::info!("Graceful shutdown complete");
}

/// Wait for a termination signal to initiate graceful shutdown.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
