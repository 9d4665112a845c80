use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::AppConfig;
use crate::models::request::GenerationSettings;

use super::{Provider, ProviderError, ProviderRequest, ProviderResponse};

const OPENAI_API_URL: &str = "https://api.openai.com/v1";
const OPENAI_MODEL: &str = "dall-e-2";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Direct-synthesis backend: one request, hosted URLs in the response.
#[derive(Debug)]
pub struct OpenAiProvider {
    http: Client,
    api_key: Option<String>,
    timeout: Duration,
}

#[derive(Serialize)]
struct ImageGenerationBody<'a> {
    model: &'a str,
    prompt: String,
    n: u32,
    size: &'a str,
}

#[derive(Deserialize)]
struct ImageGenerationResponse {
    data: Vec<GeneratedImage>,
}

#[derive(Deserialize)]
struct GeneratedImage {
    url: String,
}

impl OpenAiProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            http: Client::new(),
            api_key,
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.openai_api_key.clone(),
            Duration::from_secs(config.provider_timeout_seconds),
        )
    }

    /// The API accepts a fixed set of square sizes; pick the smallest that
    /// covers the requested canvas.
    fn size_for(settings: &GenerationSettings) -> &'static str {
        let side = settings.width.max(settings.height);
        if side >= 1024 {
            "1024x1024"
        } else if side >= 512 {
            "512x512"
        } else {
            "256x256"
        }
    }

    fn build_prompt(request: &ProviderRequest) -> String {
        let mut prompt = request.prompt.clone();
        if let Some(negative) = &request.negative_prompt {
            prompt.push_str(". Avoid: ");
            prompt.push_str(negative);
        }
        prompt
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn is_healthy(&self) -> bool {
        let Some(api_key) = &self.api_key else {
            tracing::warn!("OpenAI API key not configured");
            return false;
        };

        match self
            .http
            .get(format!("{OPENAI_API_URL}/models"))
            .bearer_auth(api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 500,
            Err(err) => {
                tracing::warn!(error = %err, "OpenAI health check failed");
                false
            }
        }
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(ProviderError::MissingApiKey("OpenAI"))?;

        let body = ImageGenerationBody {
            model: OPENAI_MODEL,
            prompt: Self::build_prompt(request),
            n: request.settings.num_variations,
            size: Self::size_for(&request.settings),
        };

        let response = self
            .http
            .post(format!("{OPENAI_API_URL}/images/generations"))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ImageGenerationResponse = response.json().await?;

        Ok(ProviderResponse {
            image_urls: parsed.data.into_iter().map(|d| d.url).collect(),
            metadata: Some(serde_json::json!({
                "model": OPENAI_MODEL,
                "provider": "openai",
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_snaps_to_the_smallest_covering_square() {
        let mut settings = GenerationSettings::default();
        assert_eq!(OpenAiProvider::size_for(&settings), "512x512");

        settings.width = 256;
        settings.height = 256;
        assert_eq!(OpenAiProvider::size_for(&settings), "256x256");

        settings.width = 768;
        assert_eq!(OpenAiProvider::size_for(&settings), "512x512");

        settings.height = 2048;
        assert_eq!(OpenAiProvider::size_for(&settings), "1024x1024");
    }

    #[test]
    fn negative_prompt_is_folded_into_the_prompt() {
        let request = ProviderRequest {
            prompt: "a red fox".to_string(),
            negative_prompt: Some("blurry".to_string()),
            seed: None,
            reference_image_url: None,
            reference_image: None,
            settings: GenerationSettings::default(),
        };

        assert_eq!(
            OpenAiProvider::build_prompt(&request),
            "a red fox. Avoid: blurry"
        );
    }
}
