//! gatecount - Real-Time Line-Crossing People Counter
//!
//! Main entry point.

use gatecount::{
    auth::AuthService,
    camera_config::{CameraConfigService, CameraSettingsRepository},
    counting::CounterStats,
    cv_worker::CvWorker,
    event_store::EventStore,
    realtime_hub::{HubMessage, RealtimeHub, StatsMessage},
    state::{AppConfig, AppState},
    web_api,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Cadence of the live stats broadcast.
const STATS_INTERVAL: Duration = Duration::from_secs(2);
/// Cadence of the analytics snapshot broadcast.
const ANALYTICS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatecount=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting gatecount v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = AppConfig::from_env();
    tracing::info!(
        db_path = %config.db_path.display(),
        detector_url = %config.detector_url,
        stream_mode = config.stream_mode(),
        "Configuration loaded"
    );

    // Create database pool
    let connect_options = SqliteConnectOptions::new()
        .filename(&config.db_path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(60));
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(connect_options)
        .await?;
    tracing::info!("Database connected");

    // Initialize schema
    let store = EventStore::new(pool.clone());
    store.ensure_schema().await?;
    let settings_repo = CameraSettingsRepository::new(pool.clone());
    settings_repo.ensure_schema().await?;

    // Initialize components
    let config_service = CameraConfigService::new(
        config.stream_proxy_url.clone(),
        config.detector_url.clone(),
        config.gallery_path.clone(),
    );
    let auth = Arc::new(AuthService::new(
        config.admin_username.clone(),
        config.admin_password.clone(),
        config.admin_password_hash.clone(),
        config.jwt_secret.clone(),
    )?);
    let hub = Arc::new(RealtimeHub::new());

    // Resume the persisted configuration, if any. Without one the worker
    // idles until settings arrive through the API.
    let initial = match settings_repo.get_active().await? {
        Some(settings) => match config_service.worker_config(&settings) {
            Ok(worker_config) => {
                tracing::info!(settings_id = settings.id, "Resuming persisted camera settings");
                Some(worker_config)
            }
            Err(e) => {
                tracing::warn!(settings_id = settings.id, error = %e, "Persisted settings unusable, starting idle");
                None
            }
        },
        None => {
            tracing::info!("No camera settings configured, worker starts idle");
            None
        }
    };

    let worker = CvWorker::spawn(store.clone(), hub.clone(), initial);
    tracing::info!("CV worker spawned");

    // Create application state
    let state = AppState {
        pool,
        config,
        store,
        settings_repo,
        config_service,
        hub,
        worker,
        auth,
        started_at: Instant::now(),
    };

    // Stats broadcaster (off the CV worker thread)
    {
        let hub = state.hub.clone();
        let worker = state.worker.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_INTERVAL);
            loop {
                interval.tick().await;
                if hub.connection_count() == 0 {
                    continue;
                }
                let status = worker.status();
                hub.publish(HubMessage::Stats(StatsMessage::new(
                    CounterStats {
                        in_count: status.in_count,
                        out_count: status.out_count,
                        active_tracks: status.active_tracks,
                    },
                    status.camera_status.as_str(),
                    status.fps,
                )));
            }
        });
    }

    // Analytics snapshot broadcaster
    {
        let hub = state.hub.clone();
        let store = state.store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ANALYTICS_INTERVAL);
            loop {
                interval.tick().await;
                if hub.connection_count() == 0 {
                    continue;
                }
                match gatecount::analytics::snapshot(&store, chrono::Local::now()).await {
                    Ok(snapshot) => hub.publish(HubMessage::Analytics(snapshot)),
                    Err(e) => tracing::warn!(error = %e, "Analytics snapshot failed"),
                }
            }
        });
    }

    // Create router
    let app = web_api::create_router(state.clone())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    let worker = state.worker.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
            worker.shutdown().await;
        })
        .await?;

    Ok(())
}
