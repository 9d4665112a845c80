use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::models::request::GenerationSettings;

pub mod openai;
pub mod replicate;

pub use openai::OpenAiProvider;
pub use replicate::ReplicateProvider;

/// Request handed to a backend. Reference image bytes are pre-fetched by the
/// orchestrator; a backend that cannot use them just ignores them.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub seed: Option<i64>,
    pub reference_image_url: Option<String>,
    pub reference_image: Option<Vec<u8>>,
    pub settings: GenerationSettings,
}

/// One or more hosted image locators plus backend-specific metadata.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub image_urls: Vec<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{0} API key not configured")]
    MissingApiKey(&'static str),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error: status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("generation failed: {0}")]
    Failed(String),

    #[error("generation did not complete within the polling window")]
    PollTimeout,
}

/// An interchangeable image-synthesis backend. `generate` is synchronous from
/// the caller's perspective; a submit-then-poll backend polls internally.
#[async_trait]
pub trait Provider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Bounded-time health probe; timeouts and transport errors read as
    /// unhealthy, never as an error.
    async fn is_healthy(&self) -> bool;

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// A provider name that no registered backend answers to. Configuration
/// defect: surfaced at lookup time, never silently defaulted.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Unknown provider: {0}")]
pub struct UnknownProvider(pub String);

/// Maps logical provider names to backends; falls back to the configured
/// default when a request names none.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_name: String,
}

impl ProviderRegistry {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_name: default_name.into(),
        }
    }

    /// Build the production registry from configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut registry = Self::new(&config.ai_provider);
        registry.register(Arc::new(OpenAiProvider::from_config(config)));
        registry.register(Arc::new(ReplicateProvider::from_config(config)));
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: Option<&str>) -> Result<Arc<dyn Provider>, UnknownProvider> {
        let name = name.unwrap_or(&self.default_name);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| UnknownProvider(name.to_string()))
    }

    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }
}
