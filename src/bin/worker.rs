use pixelforge::{
    app_state::AppState,
    config::AppConfig,
    db,
    providers::ProviderRegistry,
    services::{
        credits::CreditLedger,
        notify::{LogNotifier, NotificationSink, WebhookNotifier},
        orchestrator,
        queue::JobQueue,
        rate_limit::{RateLimiter, TierLimits},
    },
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL_MS: u64 = 1000; // 1 second
const SWEEP_INTERVAL_SECS: u64 = 3600; // hourly
const STALE_AFTER_HOURS: i64 = 24;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting generation worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    // Initialize services
    tracing::info!("Initializing services");
    let queue = JobQueue::new(&config.redis_url).expect("Failed to initialize job queue");
    let rate_limiter = RateLimiter::new(&config.redis_url, TierLimits::from_config(&config))
        .expect("Failed to initialize rate limiter");
    let ledger = CreditLedger::new(db_pool.clone());
    let providers = ProviderRegistry::from_config(&config);

    let notifier: Arc<dyn NotificationSink> = match &config.notification_webhook_url {
        Some(endpoint) => Arc::new(
            WebhookNotifier::new(endpoint).expect("Failed to initialize webhook notifier"),
        ),
        None => Arc::new(LogNotifier),
    };

    let state = AppState::new(
        db_pool,
        config,
        queue,
        rate_limiter,
        ledger,
        providers,
        notifier,
    );

    // Housekeeping sweep: jobs whose queue hand-off was lost stay PENDING
    // forever without this.
    let sweep_state = state.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            match orchestrator::sweep_stale_jobs(
                &sweep_state,
                chrono::Duration::hours(STALE_AFTER_HOURS),
            )
            .await
            {
                Ok(0) => tracing::debug!("Housekeeping sweep found no stale jobs"),
                Ok(count) => tracing::info!(count, "Housekeeping sweep failed stale jobs"),
                Err(err) => tracing::error!(error = %err, "Housekeeping sweep failed"),
            }
        }
    });

    tracing::info!("Worker ready, starting job processing loop");

    // Main processing loop
    loop {
        match process_next_job(&state).await {
            Ok(true) => {
                // Job processed, continue immediately
                tracing::debug!("Job processed, checking for next job");
            }
            Ok(false) => {
                // No job available, sleep before next poll
                tracing::trace!("No jobs available, sleeping");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing job, will retry");
                sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
            }
        }
    }
}

/// Process the next job from the queue.
/// Returns Ok(true) if a job was processed, Ok(false) if no job available.
async fn process_next_job(state: &AppState) -> Result<bool, Box<dyn std::error::Error>> {
    // Dequeue next job
    let job = match state.queue.dequeue().await? {
        Some(j) => j,
        None => {
            if let Ok(depth) = state.queue.queue_depth().await {
                metrics::gauge!("generation_queue_depth").set(depth as f64);
            }
            return Ok(false); // No job available
        }
    };

    tracing::info!(
        job_id = %job.job_id,
        account_id = %job.account_id,
        "Executing generation job"
    );

    // Run the job to a terminal state. Errors here are infrastructure
    // defects: the orchestrator already forced the job FAILED and reversed
    // its reservation before surfacing them.
    if let Err(err) = orchestrator::execute(state, job.job_id).await {
        tracing::error!(job_id = %job.job_id, error = %err, "Job execution error");
    }

    // Remove from the processing list either way; the job row is terminal.
    state.queue.complete(&job).await?;

    if let Ok(depth) = state.queue.queue_depth().await {
        metrics::gauge!("generation_queue_depth").set(depth as f64);
    }

    Ok(true)
}
