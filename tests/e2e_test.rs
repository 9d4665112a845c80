//! End-to-end tests against a running API server.
//!
//! These require:
//! 1. PostgreSQL and Redis running (with migrations applied)
//! 2. The API server running on API_BASE_URL (default http://localhost:3000)
//! 3. Optionally a worker process, for jobs to reach a terminal state
//!
//! Run with: cargo test --test e2e_test -- --ignored --nocapture

use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

fn base_url() -> String {
    std::env::var("API_BASE_URL").unwrap_or_else(|_| "http://localhost:3000".to_string())
}

async fn seed_account(tier: &str, credits: i64) -> Uuid {
    dotenvy::dotenv().ok();
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"))
        .await
        .expect("Failed to connect to database");

    let row: (Uuid,) = sqlx::query_as(
        "INSERT INTO accounts (email, tier, credits_remaining) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(format!("e2e-{}@example.com", Uuid::new_v4()))
    .bind(tier)
    .bind(credits)
    .fetch_one(&pool)
    .await
    .expect("Failed to seed account");
    row.0
}

#[tokio::test]
#[ignore]
async fn health_endpoint_reports_dependencies() {
    let response = reqwest::get(format!("{}/health", base_url()))
        .await
        .expect("health request");
    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("health body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["checks"]["database"]["status"], "ok");
    assert_eq!(body["checks"]["redis"]["status"], "ok");
}

#[tokio::test]
#[ignore]
async fn submission_without_identity_is_unauthorized() {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/generations", base_url()))
        .json(&serde_json::json!({ "prompt": "a red fox" }))
        .send()
        .await
        .expect("submit request");

    assert_eq!(response.status().as_u16(), 401);
}

#[tokio::test]
#[ignore]
async fn invalid_input_enumerates_every_failing_field() {
    let account_id = seed_account("PRO", 100).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/generations", base_url()))
        .header("X-Account-Id", account_id.to_string())
        .json(&serde_json::json!({
            "prompt": "",
            "settings": { "width": 4096, "steps": 5 }
        }))
        .send()
        .await
        .expect("submit request");

    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.expect("error body");
    let details = body["details"].as_array().expect("details array");
    assert!(details.len() >= 3, "expected all failing fields, got {details:?}");
}

#[tokio::test]
#[ignore]
async fn accepted_submission_is_queryable_by_its_owner() {
    let account_id = seed_account("PRO", 100).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/generations", base_url()))
        .header("X-Account-Id", account_id.to_string())
        .json(&serde_json::json!({ "prompt": "a lighthouse at dusk" }))
        .send()
        .await
        .expect("submit request");

    assert_eq!(response.status().as_u16(), 202);
    let receipt: serde_json::Value = response.json().await.expect("receipt");
    let job_id = receipt["jobId"].as_str().expect("jobId").to_string();
    assert_eq!(receipt["creditsUsed"], 1);

    let status = client
        .get(format!("{}/api/v1/generations/{}", base_url(), job_id))
        .header("X-Account-Id", account_id.to_string())
        .send()
        .await
        .expect("status request");
    assert!(status.status().is_success());

    let body: serde_json::Value = status.json().await.expect("status body");
    assert_eq!(body["jobId"].as_str(), Some(job_id.as_str()));
    assert!(body["progress"].is_number());

    // Another account cannot see the job.
    let stranger = seed_account("PRO", 100).await;
    let forbidden = client
        .get(format!("{}/api/v1/generations/{}", base_url(), job_id))
        .header("X-Account-Id", stranger.to_string())
        .send()
        .await
        .expect("status request");
    assert_eq!(forbidden.status().as_u16(), 404);
}

#[tokio::test]
#[ignore]
async fn zero_balance_is_rejected_with_402() {
    let account_id = seed_account("FREE", 0).await;

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/v1/generations", base_url()))
        .header("X-Account-Id", account_id.to_string())
        .json(&serde_json::json!({ "prompt": "a red fox" }))
        .send()
        .await
        .expect("submit request");

    assert_eq!(response.status().as_u16(), 402);
    let body: serde_json::Value = response.json().await.expect("error body");
    assert_eq!(body["creditsRequired"], 1);
    assert_eq!(body["creditsAvailable"], 0);
}
