use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the job queue and rate-limit counters
    pub redis_url: String,

    /// Default provider when a request does not name one
    #[serde(default = "default_ai_provider")]
    pub ai_provider: String,

    /// OpenAI API key (direct-synthesis backend)
    #[serde(default)]
    pub openai_api_key: Option<String>,

    /// Replicate API key (submit-then-poll backend)
    #[serde(default)]
    pub replicate_api_key: Option<String>,

    /// Retries per job after the initial generation attempt
    #[serde(default = "default_max_retries")]
    pub generation_max_retries: u32,

    /// Wall-clock ceiling for one job execution, retries included
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_seconds: u64,

    /// Per-request timeout for provider HTTP calls
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout_seconds: u64,

    /// Timeout for fetching a reference image
    #[serde(default = "default_reference_fetch_timeout")]
    pub reference_fetch_timeout_seconds: u64,

    /// Per-tier rate limits: admitted requests per rolling window
    #[serde(default = "default_free_tier_limit")]
    pub free_tier_limit: u32,
    #[serde(default = "default_tier_window")]
    pub free_tier_window_seconds: u64,

    #[serde(default = "default_pro_tier_limit")]
    pub pro_tier_limit: u32,
    #[serde(default = "default_tier_window")]
    pub pro_tier_window_seconds: u64,

    #[serde(default = "default_enterprise_tier_limit")]
    pub enterprise_tier_limit: u32,
    #[serde(default = "default_tier_window")]
    pub enterprise_tier_window_seconds: u64,

    /// Endpoint of the email/webhook subsystem; notifications are logged
    /// locally when unset
    #[serde(default)]
    pub notification_webhook_url: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_ai_provider() -> String {
    "openai".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_generation_timeout() -> u64 {
    300
}

fn default_provider_timeout() -> u64 {
    60
}

fn default_reference_fetch_timeout() -> u64 {
    10
}

fn default_free_tier_limit() -> u32 {
    1
}

fn default_pro_tier_limit() -> u32 {
    100
}

fn default_enterprise_tier_limit() -> u32 {
    1000
}

fn default_tier_window() -> u64 {
    86400 // 24 hours
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
