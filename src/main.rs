use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use cardmint_orchestrator::app_state::AppState;
use cardmint_orchestrator::config::AppConfig;
use cardmint_orchestrator::db;
use cardmint_orchestrator::routes;
use cardmint_orchestrator::services::persistence::{InMemoryResultStore, PgResultStore, ResultSink};
use cardmint_orchestrator::services::pipeline::DistributedPipeline;
use cardmint_orchestrator::services::remote::HttpTransport;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    // Load configuration from environment
    let config = AppConfig::from_env().expect("Failed to load configuration from environment");
    let pipeline_config = config.pipeline().expect("Invalid pipeline configuration");

    tracing::info!("Initializing cardmint orchestrator");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);
    routes::metrics::describe_metrics();

    // Result sink: PostgreSQL when configured, otherwise in-memory
    let (db_pool, sink) = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to PostgreSQL database");
            let pool = db::init_pool(url, pipeline_config.dispatcher.max_concurrency as u32)
                .await
                .expect("Failed to connect to database");

            tracing::info!("Running database migrations");
            db::run_migrations(&pool)
                .await
                .expect("Failed to run database migrations");

            let sink: Arc<dyn ResultSink> = Arc::new(PgResultStore::new(pool.clone()));
            (Some(pool), sink)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, results are kept in memory only");
            let sink: Arc<dyn ResultSink> = Arc::new(InMemoryResultStore::new());
            (None, sink)
        }
    };

    let transport = HttpTransport::new(pipeline_config.call_timeout)
        .expect("Failed to build HTTP client");

    let pipeline = Arc::new(DistributedPipeline::new(
        pipeline_config,
        Arc::new(transport),
        sink,
    ));
    pipeline.start().await.expect("Failed to start pipeline");

    let state = AppState::new(Arc::clone(&pipeline), db_pool);

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/api/v1/cards", post(routes::cards::submit_card))
        .route("/api/v1/cards/{work_id}", get(routes::cards::get_card))
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    pipeline.stop().await;
    tracing::info!("Shutdown complete");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received, draining");
}
