use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::db::queries;
use crate::models::request::GenerateRequest;
use crate::services::orchestrator::{self, SubmitError};

type ApiError = (StatusCode, Json<serde_json::Value>);

/// The excluded auth layer authenticates the caller and injects identity via
/// this header.
fn account_id_from_headers(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    headers
        .get("x-account-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Missing or invalid X-Account-Id header" })),
            )
        })
}

/// POST /api/v1/generations — validate and admit a generation request.
pub async fn submit_generation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> Result<Response, ApiError> {
    let account_id = account_id_from_headers(&headers)?;

    let request: GenerateRequest = serde_json::from_value(payload).map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid input", "detail": err.to_string() })),
        )
    })?;

    if let Err(report) = request.validate() {
        let details: Vec<serde_json::Value> = report
            .iter()
            .map(|(path, error)| json!({ "path": path.to_string(), "message": error.to_string() }))
            .collect();
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid input", "details": details })),
        ));
    }

    let account = queries::get_account(&state.db, account_id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "Failed to load account");
            internal_error()
        })?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Account not found" })),
            )
        })?;

    match orchestrator::submit(&state, &account, request).await {
        Ok(receipt) => Ok((StatusCode::ACCEPTED, Json(receipt)).into_response()),
        Err(SubmitError::RateLimited {
            remaining,
            reset_at,
        }) => Err((
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": format!(
                    "Rate limit exceeded for your tier ({}). Reset at {}",
                    account.tier,
                    reset_at.to_rfc3339()
                ),
                "remaining": remaining,
                "resetTime": reset_at,
            })),
        )),
        Err(SubmitError::InsufficientCredits {
            required,
            available,
        }) => Err((
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({
                "error": format!(
                    "Insufficient credits. Required: {required}, Available: {available}"
                ),
                "creditsRequired": required,
                "creditsAvailable": available,
            })),
        )),
        Err(SubmitError::UnknownProvider(err)) => {
            tracing::error!(error = %err, "Provider configuration defect");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            ))
        }
        Err(err) => {
            tracing::error!(error = %err, "Generation submission failed");
            Err(internal_error())
        }
    }
}

/// GET /api/v1/generations/:id — owner-scoped job status.
pub async fn get_generation_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(job_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let account_id = account_id_from_headers(&headers)?;

    let job = queries::get_job_for_account(&state.db, job_id, account_id)
        .await
        .map_err(|err| {
            tracing::error!(error = %err, "Failed to load generation job");
            internal_error()
        })?
        .ok_or_else(|| {
            (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "Generation not found" })),
            )
        })?;

    Ok(Json(json!({
        "jobId": job.id,
        "status": job.status,
        "progress": job.status.progress(),
        "prompt": job.prompt,
        "provider": job.provider,
        "resultImageUrl": job.result_image_url,
        "errorMessage": job.error_message,
        "retryCount": job.retry_count,
        "creditsCharged": job.credits_charged,
        "processingTimeMs": job.processing_time_ms,
        "createdAt": job.created_at,
        "completedAt": job.completed_at,
    })))
}

/// GET /api/v1/providers/health — bounded-time probe of every backend.
pub async fn provider_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let mut providers = Vec::new();
    for provider in state.providers.all() {
        let healthy = provider.is_healthy().await;
        providers.push(json!({ "name": provider.name(), "healthy": healthy }));
    }
    providers.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));

    Json(json!({
        "providers": providers,
        "default": state.providers.default_name(),
    }))
}

fn internal_error() -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
}
