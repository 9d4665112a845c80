use sqlx::PgPool;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::providers::ProviderRegistry;
use crate::services::{
    credits::CreditLedger, notify::NotificationSink, queue::JobQueue, rate_limit::RateLimiter,
};

/// Shared application state passed to route handlers and the worker.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AppConfig>,
    pub queue: Arc<JobQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub ledger: Arc<CreditLedger>,
    pub providers: Arc<ProviderRegistry>,
    pub notifier: Arc<dyn NotificationSink>,
}

impl AppState {
    pub fn new(
        db: PgPool,
        config: AppConfig,
        queue: JobQueue,
        rate_limiter: RateLimiter,
        ledger: CreditLedger,
        providers: ProviderRegistry,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            db,
            config: Arc::new(config),
            queue: Arc::new(queue),
            rate_limiter: Arc::new(rate_limiter),
            ledger: Arc::new(ledger),
            providers: Arc::new(providers),
            notifier,
        }
    }
}
