use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Encoding of the generated images.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, EnumString, Display,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    Jpeg,
    Webp,
}

/// Canonical generation parameters. Unspecified fields take the documented
/// defaults during deserialization; bounds are enforced by `garde`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    #[garde(range(min = 256, max = 2048))]
    pub width: u32,

    #[garde(range(min = 256, max = 2048))]
    pub height: u32,

    #[garde(range(min = 1.0, max = 20.0))]
    pub guidance_scale: f64,

    #[garde(range(min = 10, max = 150))]
    pub steps: u32,

    #[garde(range(min = 1, max = 4))]
    pub num_variations: u32,

    #[garde(skip)]
    pub format: OutputFormat,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            width: 512,
            height: 512,
            guidance_scale: 7.5,
            steps: 50,
            num_variations: 1,
            format: OutputFormat::Png,
        }
    }
}

/// A user-submitted generation request, as received by the HTTP layer.
///
/// `validate()` reports every failing field, not just the first.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    #[garde(length(min = 1, max = 1000))]
    pub prompt: String,

    #[garde(inner(length(max = 1000)))]
    pub negative_prompt: Option<String>,

    #[garde(inner(range(min = 0)))]
    pub seed: Option<i64>,

    #[garde(inner(url))]
    pub reference_image_url: Option<String>,

    #[serde(default)]
    #[garde(dive)]
    pub settings: GenerationSettings,

    /// Logical provider name; resolved against the registry at submission.
    #[garde(skip)]
    pub provider: Option<String>,
}

impl GenerateRequest {
    pub fn has_reference_image(&self) -> bool {
        self.reference_image_url.is_some()
    }
}

/// Credits debited for one generation: base cost 1, +1 for high resolution,
/// +1 per extra variation, +1 when a reference image is attached.
pub fn required_credits(settings: &GenerationSettings, has_reference_image: bool) -> i64 {
    let mut credits = 1;

    if settings.width > 1024 || settings.height > 1024 {
        credits += 1;
    }

    if settings.num_variations > 1 {
        credits += i64::from(settings.num_variations) - 1;
    }

    if has_reference_image {
        credits += 1;
    }

    credits
}

/// Rough wall-clock estimate surfaced in the submission receipt.
pub fn estimated_processing_time(settings: &GenerationSettings) -> &'static str {
    if settings.steps <= 20 {
        "10-15 seconds"
    } else if settings.steps <= 50 {
        "20-40 seconds"
    } else {
        "40-90 seconds"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: serde_json::Value) -> GenerateRequest {
        serde_json::from_value(value).expect("request should deserialize")
    }

    #[test]
    fn unspecified_settings_take_documented_defaults() {
        let req = parse(serde_json::json!({ "prompt": "a red fox" }));

        assert_eq!(req.settings.width, 512);
        assert_eq!(req.settings.height, 512);
        assert_eq!(req.settings.guidance_scale, 7.5);
        assert_eq!(req.settings.steps, 50);
        assert_eq!(req.settings.num_variations, 1);
        assert_eq!(req.settings.format, OutputFormat::Png);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn partial_settings_keep_defaults_for_the_rest() {
        let req = parse(serde_json::json!({
            "prompt": "a red fox",
            "settings": { "width": 1024, "steps": 30 }
        }));

        assert_eq!(req.settings.width, 1024);
        assert_eq!(req.settings.steps, 30);
        assert_eq!(req.settings.height, 512);
        assert_eq!(req.settings.num_variations, 1);
    }

    #[test]
    fn validation_reports_every_failing_field() {
        let req = parse(serde_json::json!({
            "prompt": "",
            "settings": { "width": 4096, "steps": 5 }
        }));

        let report = req.validate().unwrap_err();
        let paths: Vec<String> = report.iter().map(|(path, _)| path.to_string()).collect();

        assert!(paths.iter().any(|p| p.contains("prompt")));
        assert!(paths.iter().any(|p| p.contains("width")));
        assert!(paths.iter().any(|p| p.contains("steps")));
    }

    #[test]
    fn over_length_prompts_are_rejected() {
        let req = parse(serde_json::json!({
            "prompt": "x".repeat(1001),
            "negativePrompt": "y".repeat(1001),
        }));

        let report = req.validate().unwrap_err();
        let paths: Vec<String> = report.iter().map(|(path, _)| path.to_string()).collect();

        assert!(paths.iter().any(|p| p.contains("prompt")));
        assert!(paths.iter().any(|p| p.contains("negative_prompt")));
    }

    #[test]
    fn malformed_reference_url_is_rejected() {
        let req = parse(serde_json::json!({
            "prompt": "a red fox",
            "referenceImageUrl": "not a url"
        }));

        assert!(req.validate().is_err());
    }

    #[test]
    fn credit_cost_follows_the_pricing_table() {
        let base = GenerationSettings::default();
        assert_eq!(required_credits(&base, false), 1);

        // Reference image adds one.
        assert_eq!(required_credits(&base, true), 2);

        // High resolution adds one.
        let hires = GenerationSettings {
            width: 2048,
            ..Default::default()
        };
        assert_eq!(required_credits(&hires, false), 2);

        // Each extra variation adds one.
        let variations = GenerationSettings {
            num_variations: 4,
            ..Default::default()
        };
        assert_eq!(required_credits(&variations, false), 4);

        // Everything at once.
        let maxed = GenerationSettings {
            width: 2048,
            height: 2048,
            num_variations: 4,
            ..Default::default()
        };
        assert_eq!(required_credits(&maxed, true), 6);
    }

    #[test]
    fn estimate_bands_follow_step_count() {
        let fast = GenerationSettings {
            steps: 15,
            ..Default::default()
        };
        let medium = GenerationSettings::default();
        let slow = GenerationSettings {
            steps: 100,
            ..Default::default()
        };

        assert_eq!(estimated_processing_time(&fast), "10-15 seconds");
        assert_eq!(estimated_processing_time(&medium), "20-40 seconds");
        assert_eq!(estimated_processing_time(&slow), "40-90 seconds");
    }
}
