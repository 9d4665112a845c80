use axum::{routing::get, routing::post, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use pixelforge::app_state::AppState;
use pixelforge::config::AppConfig;
use pixelforge::db;
use pixelforge::providers::ProviderRegistry;
use pixelforge::routes;
use pixelforge::services::{
    credits::CreditLedger,
    notify::{LogNotifier, NotificationSink, WebhookNotifier},
    queue::JobQueue,
    rate_limit::{RateLimiter, TierLimits},
};

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

    tracing::info!("Initializing pixelforge API server");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    // Register application metrics
    metrics::describe_counter!(
        "generation_jobs_submitted_total",
        "Generation jobs admitted"
    );
    metrics::describe_counter!(
        "generation_jobs_completed_total",
        "Generation jobs that succeeded"
    );
    metrics::describe_counter!(
        "generation_jobs_failed_total",
        "Generation jobs that failed"
    );
    metrics::describe_counter!(
        "generation_rate_limited_total",
        "Submissions rejected by the rate limiter"
    );
    metrics::describe_counter!(
        "rate_limiter_degraded_total",
        "Rate limit checks that failed open"
    );
    metrics::describe_counter!(
        "credits_refunded_total",
        "Credits returned for failed jobs"
    );
    metrics::describe_histogram!(
        "generation_processing_seconds",
        "Time from job creation to success"
    );
    metrics::describe_gauge!(
        "generation_queue_depth",
        "Current number of pending jobs in the queue"
    );

    // Initialize database connection pool
    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Run database migrations
    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize Redis job queue and rate limiter
    tracing::info!("Connecting to Redis");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");
    let rate_limiter = RateLimiter::new(&config.redis_url, TierLimits::from_config(&config))
        .expect("Failed to initialize rate limiter");

    // Credit ledger and provider registry
    let ledger = CreditLedger::new(db_pool.clone());
    let providers = ProviderRegistry::from_config(&config);
    tracing::info!(
        providers = ?providers.names(),
        default = providers.default_name(),
        "Provider registry ready"
    );

    let notifier: Arc<dyn NotificationSink> = match &config.notification_webhook_url {
        Some(endpoint) => Arc::new(
            WebhookNotifier::new(endpoint).expect("Failed to initialize webhook notifier"),
        ),
        None => Arc::new(LogNotifier),
    };

    // Create shared application state
    let bind_addr = config.bind_addr.clone();
    let state = AppState::new(
        db_pool,
        config,
        queue,
        rate_limiter,
        ledger,
        providers,
        notifier,
    );

    // Build API routes
    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route(
            "/api/v1/generations",
            post(routes::generations::submit_generation),
        )
        .route(
            "/api/v1/generations/{job_id}",
            get(routes::generations::get_generation_status),
        )
        .route(
            "/api/v1/providers/health",
            get(routes::generations::provider_health),
        )
        .with_state(state)
        // Prometheus metrics endpoint (separate state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(256 * 1024)); // JSON bodies only

    tracing::info!("Starting pixelforge on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await.expect("Server error");
}
