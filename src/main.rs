mod config;
mod decrypt;
mod engine;
mod error;
mod facade;
mod format;
mod handlers;
mod lifecycle;
mod notify;
mod progress;
mod record;
mod registry;
mod seed;
mod state;
mod tasks;
mod upload;

#[cfg(test)]
mod testing;

use axum::{
    Router,
    routing::{get, post},
};
use local_ip_address::local_ip;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{Level, error, info, warn};

use crate::config::Settings;
use crate::engine::{Aria2Client, DownloadEngine};
use crate::facade::Orchestrator;
use crate::handlers::api;
use crate::lifecycle::LifecycleController;
use crate::notify::BroadcastNotifier;
use crate::progress::ProgressReporter;
use crate::registry::Registry;
use crate::seed::Seeder;
use crate::state::AppState;
use crate::tasks::TaskTags;
use crate::upload::{DriveBackend, UploadCoordinator};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let settings = Settings::new().expect("Failed to load configuration");

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    info!("Starting mirror relay...");

    if !settings.download_path.exists() {
        std::fs::create_dir_all(&settings.download_path)
            .expect("Failed to create download directory");
    }

    let Some(drive_token) = settings.drive_token.clone() else {
        error!("Mirroring needs an upload backend, set RELAY_DRIVE_TOKEN");
        return;
    };

    let local_ip = local_ip().unwrap_or("127.0.0.1".parse().unwrap());
    let host_url = format!("http://{}:{}", local_ip, settings.server_port);

    let client = Aria2Client::new(settings.aria2_rpc_url.clone(), settings.aria2_secret.clone());
    let engine: Arc<dyn DownloadEngine> = Arc::new(client.clone());
    let notifier = Arc::new(BroadcastNotifier::new(100));
    let tags = TaskTags::default();
    let registry = Arc::new(Registry::new(tags.clone()));
    let uploads = UploadCoordinator::new(
        Arc::new(DriveBackend::new(drive_token, settings.upload_chunk_size())),
        tags,
        settings.drive_parent_id.clone(),
        settings.index_link.clone(),
        settings.upload_attempts,
    );

    let lifecycle = LifecycleController::new(
        registry.clone(),
        engine.clone(),
        uploads.clone(),
        notifier.clone(),
        &settings,
    )
    .with_seeder(Seeder::new(settings.aria2_binary.clone(), settings.seed_timeout()));
    let reporter = ProgressReporter::new(
        registry.clone(),
        engine.clone(),
        uploads,
        notifier.clone(),
        &settings,
    );
    let orchestrator = Orchestrator::new(registry.clone(), engine.clone(), notifier.clone())
        .with_rpc_attempts(settings.rpc_attempts);

    // Engine watcher, lifecycle dispatcher, progress loop
    let stop = tasks::start_background_tasks(
        client,
        settings.poll_interval(),
        Arc::new(lifecycle),
        reporter,
    );

    let state = AppState {
        settings: settings.clone(),
        orchestrator: Arc::new(orchestrator),
        registry,
        notifier,
    };

    // --- Router Setup ---
    let app = create_app(state);

    let port = settings.server_port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);
    info!("Network address: {}", host_url);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    stop.cancel();
    if let Err(e) = engine.shutdown().await {
        warn!("Download engine did not shut down cleanly: {}", e);
    }
    info!("Mirror relay stopped.");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutting down...");
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/api/info", get(api::server_info))
        .route(
            "/api/downloads",
            get(api::list_downloads).post(api::add_download),
        )
        .route(
            "/api/downloads/{gid}",
            get(api::get_download).delete(api::remove_download),
        )
        .route("/api/downloads/{gid}/pause", post(api::pause_download))
        .route("/api/downloads/{gid}/cancel", post(api::cancel_mirror))
        .route("/events", get(api::sse_handler))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
