//! Depot Server
//!
//! Resumable chunked uploads into S3-compatible or local storage, with a
//! per-user soft quota.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use depot_server::config::{Config, SessionStoreKind, StorageBackend};
use depot_server::db::{self, SqliteSessionStore};
use depot_server::routes;
use depot_server::state::AppState;
use depot_server::storage::{LocalStorage, S3Storage, StorageAdapter};
use depot_server::upload::{MemorySessionStore, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Depot Server v{}", env!("CARGO_PKG_VERSION"));

    // Initialize storage backend
    let storage: Arc<dyn StorageAdapter> = match config.storage.backend {
        StorageBackend::S3 => {
            let s3 = config
                .storage
                .s3
                .as_ref()
                .context("STORAGE_BACKEND=s3 requires S3 settings")?;
            tracing::info!("S3 endpoint: {}", s3.endpoint);
            tracing::info!("S3 bucket: {}", s3.bucket);
            Arc::new(S3Storage::new(s3).await.context("Failed to initialize S3 storage")?)
        }
        StorageBackend::Local => {
            tokio::fs::create_dir_all(&config.storage.local_path)
                .await
                .with_context(|| format!("Failed to create {}", config.storage.local_path))?;
            tracing::info!("Local storage at {}", config.storage.local_path);
            Arc::new(LocalStorage::new(&config.storage.local_path))
        }
    };

    // Initialize database
    let db_pool = db::create_pool(&config.database.url)
        .await
        .context("Failed to initialize database")?;
    tracing::info!("Database initialized at {}", config.database.url);

    let session_store: Arc<dyn SessionStore> = match config.database.session_store {
        SessionStoreKind::Sqlite => Arc::new(SqliteSessionStore::new(db_pool.clone())),
        SessionStoreKind::Memory => {
            tracing::warn!("Using in-memory session store; sessions will not survive a restart");
            Arc::new(MemorySessionStore::new())
        }
    };

    // Create application state
    let app_state = AppState::new(config.clone(), db_pool, storage, session_store);

    // Background jobs
    let sweep = app_state.sessions().clone().start_cleanup_task();
    let reconcile = app_state.quota().clone().start_reconcile_task();

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build router
    let app = routes::router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server with graceful shutdown
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| format!("Invalid listen address {}:{}", config.server.host, config.server.port))?;
    tracing::info!("Depot Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    sweep.abort();
    reconcile.abort();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
