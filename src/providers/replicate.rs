use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

use crate::config::AppConfig;

use super::{Provider, ProviderError, ProviderRequest, ProviderResponse};

const REPLICATE_API_URL: &str = "https://api.replicate.com/v1";
// Stable Diffusion 3
const MODEL_VERSION: &str = "db21e45d3f7023abc2a46ee38a6f7fdce7b08d3a54e41e541e9521c06d26f513";
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// Poll for up to 5 minutes.
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_POLL_ATTEMPTS: u32 = 60;

/// Submit-then-poll backend: create a prediction, then poll it until it
/// settles. A poll timeout surfaces as a generation failure; the
/// orchestrator's retry wraps the whole `generate` call.
#[derive(Debug)]
pub struct ReplicateProvider {
    http: Client,
    api_key: Option<String>,
}

#[derive(Serialize)]
struct CreatePredictionBody<'a> {
    version: &'a str,
    input: PredictionInput,
}

#[derive(Serialize)]
struct PredictionInput {
    prompt: String,
    negative_prompt: String,
    width: u32,
    height: u32,
    num_inference_steps: u32,
    guidance_scale: f64,
    num_outputs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<i64>,
    /// Reference image as a data URI, for image-to-image generation.
    #[serde(skip_serializing_if = "Option::is_none")]
    image: Option<String>,
}

#[derive(Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<Vec<String>>,
    #[serde(default)]
    error: Option<String>,
}

impl ReplicateProvider {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            http: Client::new(),
            api_key,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.replicate_api_key.clone())
    }

    fn reference_data_uri(bytes: &[u8]) -> String {
        let mime = match image::guess_format(bytes) {
            Ok(image::ImageFormat::Jpeg) => "image/jpeg",
            Ok(image::ImageFormat::WebP) => "image/webp",
            _ => "image/png",
        };
        format!(
            "data:{mime};base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    async fn poll_for_completion(
        &self,
        api_key: &str,
        prediction_id: &str,
    ) -> Result<Vec<String>, ProviderError> {
        for _ in 0..MAX_POLL_ATTEMPTS {
            let response = self
                .http
                .get(format!("{REPLICATE_API_URL}/predictions/{prediction_id}"))
                .bearer_auth(api_key)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await?;

            let prediction: Prediction = response.json().await?;

            match prediction.status.as_str() {
                "succeeded" => return Ok(prediction.output.unwrap_or_default()),
                "failed" | "canceled" => {
                    return Err(ProviderError::Failed(
                        prediction
                            .error
                            .unwrap_or_else(|| "prediction failed".to_string()),
                    ));
                }
                _ => sleep(POLL_INTERVAL).await,
            }
        }

        Err(ProviderError::PollTimeout)
    }
}

#[async_trait]
impl Provider for ReplicateProvider {
    fn name(&self) -> &str {
        "replicate"
    }

    async fn is_healthy(&self) -> bool {
        let Some(api_key) = &self.api_key else {
            tracing::warn!("Replicate API key not configured");
            return false;
        };

        match self
            .http
            .get(format!("{REPLICATE_API_URL}/account"))
            .bearer_auth(api_key)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().as_u16() < 500,
            Err(err) => {
                tracing::warn!(error = %err, "Replicate health check failed");
                false
            }
        }
    }

    async fn generate(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let api_key = self
            .api_key
            .as_ref()
            .ok_or(ProviderError::MissingApiKey("Replicate"))?;

        let body = CreatePredictionBody {
            version: MODEL_VERSION,
            input: PredictionInput {
                prompt: request.prompt.clone(),
                negative_prompt: request.negative_prompt.clone().unwrap_or_default(),
                width: request.settings.width,
                height: request.settings.height,
                num_inference_steps: request.settings.steps,
                guidance_scale: request.settings.guidance_scale,
                num_outputs: request.settings.num_variations,
                seed: request.seed,
                image: request
                    .reference_image
                    .as_deref()
                    .map(Self::reference_data_uri),
            },
        };

        let response = self
            .http
            .post(format!("{REPLICATE_API_URL}/predictions"))
            .bearer_auth(api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() != 201 {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let prediction: Prediction = response.json().await?;
        let image_urls = self.poll_for_completion(api_key, &prediction.id).await?;

        Ok(ProviderResponse {
            image_urls,
            metadata: Some(serde_json::json!({
                "model": "stable-diffusion-3",
                "provider": "replicate",
                "predictionId": prediction.id,
            })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_bytes_become_a_png_data_uri_by_default() {
        let uri = ReplicateProvider::reference_data_uri(b"not an image");
        assert!(uri.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn jpeg_reference_is_tagged_with_its_mime() {
        // Minimal JPEG magic bytes.
        let bytes = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46];
        let uri = ReplicateProvider::reference_data_uri(&bytes);
        assert!(uri.starts_with("data:image/jpeg;base64,"));
    }
}
