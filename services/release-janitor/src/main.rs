pub mod sweep;

use std::net::SocketAddr;

use axum::http;
use shared::{
    services::kubernetes::Kubernetes,
    utilities::{config::Config, errors::AppError, instrumentation},
};
use tokio::{signal, task::JoinSet};
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{error, info};

use release_core::{app::Apps, lineage::LineageTracker};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install crypto provider
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Load .env file
    match dotenvy::dotenv() {
        Ok(path) => {
            println!("Loaded .env file from {}", path.display());
        }
        Err(dotenvy::Error::Io(ref err)) if err.kind() == std::io::ErrorKind::NotFound => {
            println!(".env file not found, continuing without it");
        }
        Err(e) => {
            println!("Couldn't load .env file: {}", e);
        }
    }

    // Initialize config
    let config = Config::init().await?;

    // Initialize tracing
    instrumentation::init_tracing("release_janitor", config.tracing_level);

    info!("🚀 Starting release-janitor");

    // Initialize services
    let kubernetes = Kubernetes::new(&config).await?;
    let apps = Apps::new(kubernetes.client.clone());
    let lineage = LineageTracker::new(kubernetes.client.clone(), &config.staging_namespace);

    let mut set = JoinSet::new();

    // Spawn background tasks
    set.spawn(sweep::start_sweeper(
        apps,
        lineage,
        config.janitor_sweep_secs,
    ));
    set.spawn(start_health_server());

    info!("✅ All background tasks started");

    // Unified shutdown logic
    tokio::select! {
        _ = shutdown_signal() => {
            info!("🛑 Shutdown signal received");
            set.shutdown().await;
        }
        // If ANY task exits (crashes or finishes), this branch runs
        Some(result) = set.join_next() => {
            match result {
                Ok(Ok(())) => error!("A background task exited unexpectedly!"),
                Ok(Err(e)) => error!("Task failed: {}", e),
                Err(e) => error!("Task panic: {}", e),
            }
            set.shutdown().await;
        }
    }

    info!("👋 Release-janitor shutting down");

    Ok(())
}

/// Start a simple HTTP server for health checks
async fn start_health_server() -> Result<(), AppError> {
    use axum::{Json, Router, routing::get};
    use serde_json::json;

    let health_route = Router::new()
        .route(
            "/health",
            get(|| async {
                Json(json!({
                    "status": "healthy",
                    "service": "release-janitor"
                }))
            }),
        )
        .route(
            "/ready",
            get(|| async {
                Json(json!({
                    "status": "ready",
                    "service": "release-janitor"
                }))
            }),
        );

    let tracing_layer = TraceLayer::new_for_http()
        .on_request(|request: &http::Request<_>, _span: &tracing::Span| {
            let method = request.method();
            let uri = request.uri();
            let matched_path = request
                .extensions()
                .get::<axum::extract::MatchedPath>()
                .map(|p| p.as_str())
                .unwrap_or("<unknown>");

            if uri.query().is_some() {
                info!("{} {} {}", method, matched_path, uri);
            } else {
                info!("{} {}", method, matched_path);
            }
        })
        .on_response(DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = Router::new().merge(health_route).layer(tracing_layer);

    let addr = "0.0.0.0:8004";
    info!("🏥 Health check server running on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
