use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool, Row};
use uuid::Uuid;

use crate::models::account::{Account, Tier};
use crate::models::job::{GenerationJob, JobStatus};
use crate::models::request::{GenerateRequest, GenerationSettings};

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<GenerationJob, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let settings: Json<GenerationSettings> = row.try_get("settings")?;

    Ok(GenerationJob {
        id: row.try_get("id")?,
        account_id: row.try_get("account_id")?,
        status: status.parse().unwrap_or(JobStatus::Pending),
        prompt: row.try_get("prompt")?,
        negative_prompt: row.try_get("negative_prompt")?,
        seed: row.try_get("seed")?,
        reference_image_url: row.try_get("reference_image_url")?,
        settings: settings.0,
        provider: row.try_get("provider")?,
        credits_charged: row.try_get("credits_charged")?,
        retry_count: row.try_get("retry_count")?,
        last_retry_at: row.try_get("last_retry_at")?,
        error_message: row.try_get("error_message")?,
        result_image_url: row.try_get("result_image_url")?,
        processing_time_ms: row.try_get("processing_time_ms")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

const JOB_COLUMNS: &str = r#"
    id, account_id, status, prompt, negative_prompt, seed, reference_image_url,
    settings, provider, credits_charged, retry_count, last_retry_at,
    error_message, result_image_url, processing_time_ms,
    created_at, updated_at, completed_at
"#;

/// Insert a new generation job in PENDING state.
pub async fn create_job(
    pool: &PgPool,
    account_id: Uuid,
    request: &GenerateRequest,
    provider: &str,
    credits_charged: i64,
) -> Result<GenerationJob, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO generation_jobs
            (account_id, prompt, negative_prompt, seed, reference_image_url,
             settings, provider, credits_charged)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        RETURNING {JOB_COLUMNS}
        "#
    ))
    .bind(account_id)
    .bind(&request.prompt)
    .bind(&request.negative_prompt)
    .bind(request.seed)
    .bind(&request.reference_image_url)
    .bind(Json(&request.settings))
    .bind(provider)
    .bind(credits_charged)
    .fetch_one(pool)
    .await?;

    job_from_row(&row)
}

/// Get a job by ID.
pub async fn get_job(pool: &PgPool, job_id: Uuid) -> Result<Option<GenerationJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1"
    ))
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Get a job by ID, scoped to its owning account.
pub async fn get_job_for_account(
    pool: &PgPool,
    job_id: Uuid,
    account_id: Uuid,
) -> Result<Option<GenerationJob>, sqlx::Error> {
    let row = sqlx::query(&format!(
        "SELECT {JOB_COLUMNS} FROM generation_jobs WHERE id = $1 AND account_id = $2"
    ))
    .bind(job_id)
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(job_from_row).transpose()
}

/// Transition PENDING -> PROCESSING. Returns false when the job was not in
/// PENDING, which keeps illegal transitions out of the store.
pub async fn mark_processing(pool: &PgPool, job_id: Uuid) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = 'PROCESSING', updated_at = NOW()
        WHERE id = $1 AND status = 'PENDING'
        "#,
    )
    .bind(job_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal transition PROCESSING -> SUCCEEDED. Result URL, duration, and
/// completion timestamp land in one statement.
pub async fn complete_job(
    pool: &PgPool,
    job_id: Uuid,
    result_image_url: &str,
    processing_time_ms: i64,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = 'SUCCEEDED',
            result_image_url = $2,
            processing_time_ms = $3,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status = 'PROCESSING'
        "#,
    )
    .bind(job_id)
    .bind(result_image_url)
    .bind(processing_time_ms)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Terminal transition to FAILED from either non-terminal state.
pub async fn fail_job(
    pool: &PgPool,
    job_id: Uuid,
    error_message: &str,
    retry_count: Option<i32>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = 'FAILED',
            error_message = $2,
            retry_count = COALESCE($3, retry_count),
            completed_at = NOW(),
            updated_at = NOW()
        WHERE id = $1 AND status IN ('PENDING', 'PROCESSING')
        "#,
    )
    .bind(job_id)
    .bind(error_message)
    .bind(retry_count)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Record a retry attempt on the job row.
pub async fn record_retry(
    pool: &PgPool,
    job_id: Uuid,
    retry_count: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE generation_jobs
        SET retry_count = $2, last_retry_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(retry_count)
    .execute(pool)
    .await?;

    Ok(())
}

/// A job killed by the housekeeping sweep; the caller refunds its reservation.
#[derive(Debug)]
pub struct StaleJob {
    pub id: Uuid,
    pub account_id: Uuid,
    pub credits_charged: i64,
}

/// Force-fail every job still PENDING past the cutoff. Guards against jobs
/// whose queue hand-off was lost.
pub async fn fail_stale_pending(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
    reason: &str,
) -> Result<Vec<StaleJob>, sqlx::Error> {
    let rows = sqlx::query(
        r#"
        UPDATE generation_jobs
        SET status = 'FAILED',
            error_message = $2,
            completed_at = NOW(),
            updated_at = NOW()
        WHERE status = 'PENDING' AND created_at < $1
        RETURNING id, account_id, credits_charged
        "#,
    )
    .bind(cutoff)
    .bind(reason)
    .fetch_all(pool)
    .await?;

    rows.iter()
        .map(|r| {
            Ok(StaleJob {
                id: r.try_get("id")?,
                account_id: r.try_get("account_id")?,
                credits_charged: r.try_get("credits_charged")?,
            })
        })
        .collect()
}

/// Fetch an account.
pub async fn get_account(pool: &PgPool, account_id: Uuid) -> Result<Option<Account>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, email, tier, credits_remaining, created_at
        FROM accounts
        WHERE id = $1
        "#,
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    Ok(match row {
        Some(r) => {
            let tier: String = r.try_get("tier")?;
            Some(Account {
                id: r.try_get("id")?,
                email: r.try_get("email")?,
                tier: tier.parse().unwrap_or(Tier::Free),
                credits_remaining: r.try_get("credits_remaining")?,
                created_at: r.try_get("created_at")?,
            })
        }
        None => None,
    })
}

/// Atomically deduct credits iff the balance covers the amount. Returns the
/// remaining balance, or None when the test-and-set condition failed (either
/// insufficient balance or no such metered account).
pub async fn try_reserve_credits(
    pool: &PgPool,
    account_id: Uuid,
    amount: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE accounts
        SET credits_remaining = credits_remaining - $2
        WHERE id = $1 AND tier <> 'ENTERPRISE' AND credits_remaining >= $2
        RETURNING credits_remaining
        "#,
    )
    .bind(account_id)
    .bind(amount)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("credits_remaining")).transpose()
}

/// Atomically add credits back to a metered account. Returns the new balance,
/// or None for unmetered/missing accounts.
pub async fn add_credits(
    pool: &PgPool,
    account_id: Uuid,
    amount: i64,
) -> Result<Option<i64>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        UPDATE accounts
        SET credits_remaining = credits_remaining + $2
        WHERE id = $1 AND tier <> 'ENTERPRISE'
        RETURNING credits_remaining
        "#,
    )
    .bind(account_id)
    .bind(amount)
    .fetch_optional(pool)
    .await?;

    row.map(|r| r.try_get("credits_remaining")).transpose()
}
