//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, HttpTransferAdapter},
    config::Config,
    error::ApiError,
    jobs::{spawn_payout_job, spawn_validation_job},
    web::{rest::ApiDoc, router, state::AppState},
};
use axum::{extract::DefaultBodyLimit, http::Method, Router};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    let db_adapter = Arc::new(DbAdapter::new(db_pool));
    info!("Running database migrations...");
    db_adapter.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize the Transfer Provider ---
    let api_key = config.transfer_api_key.clone().unwrap_or_default();
    let transfer_adapter = HttpTransferAdapter::new(
        &config.transfer_api_url,
        &api_key,
        config.transfer_timeout,
    )
    .map_err(|e| ApiError::Internal(format!("Failed to build the transfer client: {}", e)))?;

    // --- 4. Build the Shared AppState ---
    let app_state = Arc::new(AppState::new(
        db_adapter,
        Arc::new(transfer_adapter),
        config.clone(),
    ));

    // --- 5. Start Background Jobs ---
    let shutdown = CancellationToken::new();
    let mut jobs = vec![spawn_validation_job(
        app_state.engagements.clone(),
        config.validation_batch_size,
        config.validation_interval,
        shutdown.clone(),
    )];
    if app_state.transfers_enabled {
        jobs.push(spawn_payout_job(
            app_state.executor.clone(),
            config.payout_interval,
            shutdown.clone(),
        ));
    } else {
        warn!("TRANSFER_API_KEY is not set; payout execution is disabled");
    }

    // --- 6. Create the Web Router ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    let app = Router::new()
        .merge(router(app_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(cors);

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let signal_token = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for the shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
            signal_token.cancel();
        })
        .await?;

    shutdown.cancel();
    for job in jobs {
        if let Err(e) = job.await {
            warn!("Background job ended abnormally: {}", e);
        }
    }
    info!("Server stopped.");
    Ok(())
}
