use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod services;

use config::Config;
use services::auth::AuthVerifier;
use services::bus::EventBus;
use services::providers::ProviderRegistry;

pub struct AppState {
    pub db: sqlx::SqlitePool,
    pub config: Config,
    pub bus: Arc<EventBus>,
    pub providers: Arc<ProviderRegistry>,
    pub auth: AuthVerifier,
}

// Exit codes: 0 clean, 1 configuration error, 2 dependency unavailable at
// startup, 3 unrecoverable runtime error.
const EXIT_CONFIG: i32 = 1;
const EXIT_DEPENDENCY: i32 = 2;
const EXIT_RUNTIME: i32 = 3;

/// Bounded HTTP connection pool per provider, for backpressure.
const PROVIDER_POOL_SIZE: usize = 32;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "notify_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!("Starting notification delivery service");

    // Initialize database
    let pool = match services::init::init_db(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Database unavailable: {:?}", e);
            std::process::exit(EXIT_DEPENDENCY);
        }
    };

    // Build provider adapters
    let providers = match ProviderRegistry::from_config(
        &config.providers,
        &config.limits,
        Duration::from_secs(config.dispatch.send_timeout_seconds),
        PROVIDER_POOL_SIZE,
    ) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!("Failed to build providers: {:?}", e);
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(
        "Dispatch bus: project {}, topic {}, subscription {}",
        config.bus.project,
        config.bus.topic,
        config.bus.subscription
    );
    let bus = Arc::new(EventBus::in_process(&config.bus));
    let auth = AuthVerifier::new(config.auth.clone());

    let app_state = Arc::new(AppState {
        db: pool,
        config: config.clone(),
        bus,
        providers,
        auth,
    });

    // Spawn background workers (dispatch pool + sweeper)
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    let worker_handles =
        services::init::spawn_background_workers(app_state.clone(), shutdown_tx.clone());

    // Build router
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .nest("/notify", routes::notify::router())
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn(
            middleware::headers::security_headers_middleware,
        ))
        .layer(TraceLayer::new_for_http());

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(EXIT_DEPENDENCY);
        }
    };
    tracing::info!("Server listening on {}", addr);

    let shutdown_for_server = shutdown_tx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutdown signal received");
        let _ = shutdown_for_server.send(());
    });

    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
        std::process::exit(EXIT_RUNTIME);
    }

    // Drain in-flight workers within the grace window. Anything that does
    // not finish keeps its lease until expiry, and the next sweep on another
    // instance re-admits it.
    let grace = Duration::from_secs(config.dispatch.shutdown_grace_seconds);
    let drain = futures::future::join_all(worker_handles);
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            "Workers did not drain within {:?}; unfinished leases will be swept after expiry",
            grace
        );
    }

    tracing::info!("Shutdown complete");
}
