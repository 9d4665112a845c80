use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::account::Account;
use crate::models::job::{GenerationJob, JobStatus};
use crate::models::request::{estimated_processing_time, required_credits, GenerateRequest};
use crate::providers::{Provider, ProviderError, ProviderRequest, ProviderResponse, UnknownProvider};
use crate::services::credits::CreditError;
use crate::services::queue::{QueueError, QueuedJob};

/// Returned to the caller immediately after admission; execution continues
/// asynchronously on a worker.
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub estimated_processing_time: &'static str,
    pub credits_used: i64,
    /// None for unmetered accounts.
    pub credits_remaining: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("Rate limit exceeded; resets at {reset_at}")]
    RateLimited {
        remaining: u32,
        reset_at: DateTime<Utc>,
    },

    #[error("Insufficient credits. Required: {required}, Available: {available}")]
    InsufficientCredits { required: i64, available: i64 },

    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Credit ledger error: {0}")]
    Ledger(CreditError),
}

/// Admit a validated generation request: rate limit, credit check, job row,
/// optimistic reservation, queue hand-off. Admission failures never leave
/// partial state behind.
pub async fn submit(
    state: &AppState,
    account: &Account,
    request: GenerateRequest,
) -> Result<SubmitReceipt, SubmitError> {
    // Resolve the provider before touching any state; an unknown name is a
    // configuration defect, not a user error.
    let provider = state.providers.get(request.provider.as_deref())?;
    let provider_name = provider.name().to_string();

    let decision = state.rate_limiter.check(account.id, account.tier).await;
    if !decision.allowed {
        metrics::counter!("generation_rate_limited_total").increment(1);
        return Err(SubmitError::RateLimited {
            remaining: decision.remaining,
            reset_at: decision.reset_at,
        });
    }

    if decision.remaining == 0 {
        // This admission used the last slot in the window.
        let limit = state.rate_limiter.limit(account.tier);
        if let Err(err) = state
            .notifier
            .notify_usage_warning(account.id, limit, limit)
            .await
        {
            tracing::warn!(account_id = %account.id, error = %err, "Failed to send usage warning");
        }
    }

    let required = required_credits(&request.settings, request.has_reference_image());

    match state
        .ledger
        .has_sufficient_credits(account.id, required)
        .await
    {
        Ok(true) => {}
        Ok(false) => {
            return Err(SubmitError::InsufficientCredits {
                required,
                available: account.credits_remaining,
            })
        }
        Err(err) => return Err(SubmitError::Ledger(err)),
    }

    let job = queries::create_job(&state.db, account.id, &request, &provider_name, required).await?;

    // Optimistic deduction: credits are consumed at admission, not at
    // success, so in-flight attempts are never free.
    let remaining = match state.ledger.reserve(account.id, required).await {
        Ok(balance) => balance,
        Err(CreditError::Insufficient {
            required,
            available,
        }) => {
            // Lost a race with a concurrent submission from the same account.
            let _ = queries::fail_job(&state.db, job.id, "Insufficient credits", None).await;
            return Err(SubmitError::InsufficientCredits {
                required,
                available,
            });
        }
        Err(err) => {
            let _ = queries::fail_job(&state.db, job.id, "Credit reservation failed", None).await;
            return Err(SubmitError::Ledger(err));
        }
    };

    if let Err(err) = state
        .queue
        .enqueue(&QueuedJob {
            job_id: job.id,
            account_id: account.id,
        })
        .await
    {
        // Hand-off failed: reverse the reservation, fail the job.
        if let Err(refund_err) = state.ledger.refund(account.id, required).await {
            tracing::error!(
                job_id = %job.id,
                error = %refund_err,
                "Failed to refund credits after enqueue failure"
            );
        }
        let _ = queries::fail_job(&state.db, job.id, "Failed to enqueue job", None).await;
        return Err(err.into());
    }

    metrics::counter!("generation_jobs_submitted_total").increment(1);
    tracing::info!(
        job_id = %job.id,
        account_id = %account.id,
        provider = %provider_name,
        credits = required,
        "Generation job admitted"
    );

    Ok(SubmitReceipt {
        job_id: job.id,
        status: job.status,
        estimated_processing_time: estimated_processing_time(&request.settings),
        credits_used: required,
        credits_remaining: (!account.tier.is_unmetered()).then_some(remaining),
        created_at: job.created_at,
    })
}

#[derive(Debug, thiserror::Error)]
pub enum ExecuteError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error(transparent)]
    UnknownProvider(#[from] UnknownProvider),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Execution exceeded the {0}s ceiling")]
    Timeout(u64),
}

/// Run a job to a terminal state. Bounded by the configured wall-clock
/// ceiling regardless of retry progress. Whatever goes wrong, the job ends
/// terminal and its reservation is settled or reversed exactly once.
pub async fn execute(state: &AppState, job_id: Uuid) -> Result<(), ExecuteError> {
    let ceiling = state.config.generation_timeout_seconds;

    let result = match timeout(Duration::from_secs(ceiling), execute_inner(state, job_id)).await {
        Ok(result) => result,
        Err(_) => Err(ExecuteError::Timeout(ceiling)),
    };

    if let Err(ref err) = result {
        // Errors escaping the documented retry/failure path still leave the
        // job terminal before surfacing to the worker's monitoring.
        force_fail(state, job_id, err).await;
    }

    result
}

async fn execute_inner(state: &AppState, job_id: Uuid) -> Result<(), ExecuteError> {
    let job = queries::get_job(&state.db, job_id)
        .await?
        .ok_or(ExecuteError::JobNotFound(job_id))?;

    if job.status != JobStatus::Pending {
        // The queue hands each job to exactly one consumer; a non-pending job
        // here is a duplicate or stale hand-off.
        tracing::warn!(job_id = %job.id, status = %job.status, "Skipping job not in PENDING");
        return Ok(());
    }

    let provider = match state.providers.get(Some(&job.provider)) {
        Ok(provider) => provider,
        Err(err) => {
            // Configuration changed between admission and execution.
            finalize_failure(state, &job, &err.to_string(), job.retry_count).await?;
            return Err(err.into());
        }
    };

    // Reference enrichment is best-effort: a failed fetch degrades to
    // no-reference generation rather than aborting the job.
    let reference_image = match &job.reference_image_url {
        Some(url) => fetch_reference_image(state, job.id, url).await,
        None => None,
    };
    let reference_url = reference_image
        .is_some()
        .then(|| job.reference_image_url.clone())
        .flatten();

    if !queries::mark_processing(&state.db, job.id).await? {
        tracing::warn!(job_id = %job.id, "Job left PENDING concurrently; skipping");
        return Ok(());
    }

    tracing::info!(job_id = %job.id, provider = %job.provider, "Processing generation job");

    let request = ProviderRequest {
        prompt: job.prompt.clone(),
        negative_prompt: job.negative_prompt.clone(),
        seed: job.seed,
        reference_image_url: reference_url,
        reference_image,
        settings: job.settings.clone(),
    };

    let max_retries = state.config.generation_max_retries;
    let outcome = generate_with_retries(provider.as_ref(), &request, max_retries, |attempt| {
        let db = state.db.clone();
        let job_id = job.id;
        async move {
            if let Err(err) = queries::record_retry(&db, job_id, attempt as i32).await {
                tracing::warn!(job_id = %job_id, error = %err, "Failed to record retry");
            }
        }
    })
    .await;

    match outcome {
        Ok(response) if !response.image_urls.is_empty() => {
            finalize_success(state, &job, &response).await?;
        }
        Ok(_) => {
            finalize_failure(state, &job, "No images generated", max_retries as i32).await?;
        }
        Err(err) => {
            let reason = format!(
                "Generation failed after {} attempts: {err}",
                max_retries + 1
            );
            finalize_failure(state, &job, &reason, max_retries as i32).await?;
        }
    }

    Ok(())
}

/// Exponential backoff: 1s, 2s, 4s, ...
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(16))
}

/// Call the provider up to `max_retries + 1` times, sleeping `2^attempt`
/// seconds between attempts and reporting each retry through `on_retry`.
pub async fn generate_with_retries<F, Fut>(
    provider: &dyn Provider,
    request: &ProviderRequest,
    max_retries: u32,
    mut on_retry: F,
) -> Result<ProviderResponse, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut attempt = 0;
    loop {
        match provider.generate(request).await {
            Ok(response) => return Ok(response),
            Err(err) if attempt < max_retries => {
                tracing::warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    error = %err,
                    "Generation attempt failed"
                );
                sleep(backoff_delay(attempt)).await;
                attempt += 1;
                on_retry(attempt).await;
            }
            Err(err) => {
                tracing::warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    error = %err,
                    "Generation attempt failed, retries exhausted"
                );
                return Err(err);
            }
        }
    }
}

async fn fetch_reference_image(state: &AppState, job_id: Uuid, url: &str) -> Option<Vec<u8>> {
    let fetch = async {
        let response = reqwest::get(url).await?.error_for_status()?;
        response.bytes().await
    };

    let timeout_secs = state.config.reference_fetch_timeout_seconds;
    match timeout(Duration::from_secs(timeout_secs), fetch).await {
        Ok(Ok(bytes)) => {
            if image::guess_format(&bytes).is_ok() {
                tracing::debug!(job_id = %job_id, bytes = bytes.len(), "Fetched reference image");
                Some(bytes.to_vec())
            } else {
                tracing::warn!(job_id = %job_id, url, "Reference is not a decodable image; continuing without it");
                None
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(job_id = %job_id, url, error = %err, "Reference image fetch failed; continuing without it");
            None
        }
        Err(_) => {
            tracing::warn!(job_id = %job_id, url, "Reference image fetch timed out; continuing without it");
            None
        }
    }
}

async fn finalize_success(
    state: &AppState,
    job: &GenerationJob,
    response: &ProviderResponse,
) -> Result<(), ExecuteError> {
    // Duration is measured from creation, queueing delay included; it is the
    // latency the account owner experienced.
    let processing_time_ms = (Utc::now() - job.created_at).num_milliseconds();
    let result_image_url = &response.image_urls[0];

    if !queries::complete_job(&state.db, job.id, result_image_url, processing_time_ms).await? {
        tracing::warn!(job_id = %job.id, "Job was not in PROCESSING at completion");
        return Ok(());
    }

    metrics::counter!("generation_jobs_completed_total").increment(1);
    metrics::histogram!("generation_processing_seconds")
        .record(processing_time_ms as f64 / 1000.0);

    tracing::info!(
        job_id = %job.id,
        images = response.image_urls.len(),
        processing_time_ms,
        "Generation succeeded"
    );

    Ok(())
}

async fn finalize_failure(
    state: &AppState,
    job: &GenerationJob,
    reason: &str,
    retry_count: i32,
) -> Result<(), ExecuteError> {
    if !queries::fail_job(&state.db, job.id, reason, Some(retry_count)).await? {
        // Already terminal; the reservation was settled by whoever got there
        // first.
        tracing::warn!(job_id = %job.id, "Job already terminal at failure finalization");
        return Ok(());
    }

    if job.credits_charged > 0 {
        if let Err(err) = state
            .ledger
            .refund(job.account_id, job.credits_charged)
            .await
        {
            tracing::error!(
                job_id = %job.id,
                account_id = %job.account_id,
                error = %err,
                "Failed to refund credits for failed job"
            );
        }
    }

    metrics::counter!("generation_jobs_failed_total").increment(1);

    if let Err(err) = state.notifier.notify_failure(job.account_id, job, reason).await {
        tracing::warn!(job_id = %job.id, error = %err, "Failed to deliver failure notification");
    }

    tracing::info!(job_id = %job.id, reason, "Generation failed");
    Ok(())
}

/// Last-resort failure path for errors that escaped the normal flow. The
/// status guard in `fail_job` makes the refund exactly-once even if the
/// normal path already finalized.
async fn force_fail(state: &AppState, job_id: Uuid, err: &ExecuteError) {
    let message = match err {
        ExecuteError::Timeout(secs) => format!("Generation timed out after {secs}s"),
        _ => "Internal error during generation".to_string(),
    };

    match queries::get_job(&state.db, job_id).await {
        Ok(Some(job)) if !job.status.is_terminal() => {
            if let Err(fail_err) = finalize_failure(state, &job, &message, job.retry_count).await {
                tracing::error!(
                    job_id = %job_id,
                    error = %fail_err,
                    "Failed to force-fail job"
                );
            }
        }
        Ok(_) => {}
        Err(db_err) => {
            tracing::error!(
                job_id = %job_id,
                error = %db_err,
                "Failed to load job while force-failing"
            );
        }
    }
}

/// Periodic housekeeping: any job still PENDING past `older_than` lost its
/// queue hand-off; force it FAILED and reverse its reservation. Returns the
/// number of jobs swept.
pub async fn sweep_stale_jobs(
    state: &AppState,
    older_than: chrono::Duration,
) -> Result<usize, sqlx::Error> {
    let cutoff = Utc::now() - older_than;
    let stale = queries::fail_stale_pending(
        &state.db,
        cutoff,
        "Generation timeout: exceeded 24 hour limit",
    )
    .await?;

    for job in &stale {
        if job.credits_charged > 0 {
            if let Err(err) = state
                .ledger
                .refund(job.account_id, job.credits_charged)
                .await
            {
                tracing::error!(
                    job_id = %job.id,
                    error = %err,
                    "Failed to refund credits for swept job"
                );
            }
        }
        metrics::counter!("generation_jobs_failed_total").increment(1);
    }

    if !stale.is_empty() {
        tracing::warn!(count = stale.len(), "Swept stale pending jobs");
    }

    Ok(stale.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::request::GenerationSettings;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fails every call before `succeed_on` (1-based), succeeds after.
    #[derive(Debug)]
    struct ScriptedProvider {
        calls: AtomicU32,
        succeed_on: Option<u32>,
    }

    impl ScriptedProvider {
        fn failing() -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on: None,
            }
        }

        fn succeeding_on(call: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_on: Some(call),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Provider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn is_healthy(&self) -> bool {
            true
        }

        async fn generate(
            &self,
            _request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match self.succeed_on {
                Some(n) if call >= n => Ok(ProviderResponse {
                    image_urls: vec!["https://cdn.example.com/result.png".to_string()],
                    metadata: None,
                }),
                _ => Err(ProviderError::Api {
                    status: 500,
                    message: "backend exploded".to_string(),
                }),
            }
        }
    }

    fn request() -> ProviderRequest {
        ProviderRequest {
            prompt: "a red fox".to_string(),
            negative_prompt: None,
            seed: None,
            reference_image_url: None,
            reference_image: None,
            settings: GenerationSettings::default(),
        }
    }

    #[test]
    fn backoff_doubles_and_never_decreases() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));

        for attempt in 1..10 {
            assert!(backoff_delay(attempt) >= backoff_delay(attempt - 1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn provider_is_called_at_most_max_retries_plus_one_times() {
        let provider = ScriptedProvider::failing();

        let result = generate_with_retries(&provider, &request(), 3, |_| async {}).await;

        assert!(result.is_err());
        assert_eq!(provider.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_second_attempt_records_one_retry_after_one_second() {
        let provider = ScriptedProvider::succeeding_on(2);
        let recorded = Arc::new(Mutex::new(Vec::new()));

        let start = tokio::time::Instant::now();
        let retries = recorded.clone();
        let result = generate_with_retries(&provider, &request(), 3, move |attempt| {
            let retries = retries.clone();
            async move {
                retries.lock().unwrap().push(attempt);
            }
        })
        .await
        .expect("second attempt succeeds");

        assert_eq!(result.image_urls.len(), 1);
        assert_eq!(provider.calls(), 2);
        assert_eq!(*recorded.lock().unwrap(), vec![1]);
        // Exactly one backoff sleep of 1s.
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_sleeps_the_full_backoff_schedule() {
        let provider = ScriptedProvider::failing();

        let start = tokio::time::Instant::now();
        let result = generate_with_retries(&provider, &request(), 3, |_| async {}).await;

        assert!(result.is_err());
        // 1s + 2s + 4s between the four attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_never_sleeps() {
        let provider = ScriptedProvider::succeeding_on(1);

        let start = tokio::time::Instant::now();
        let result = generate_with_retries(&provider, &request(), 3, |_| async {}).await;

        assert!(result.is_ok());
        assert_eq!(provider.calls(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
