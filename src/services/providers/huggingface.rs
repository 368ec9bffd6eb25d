use super::{Caption, CaptionProvider, ProviderError, http_client};
use crate::models::ProviderConfig;
use crate::services::imaging;
use crate::services::prompt::PromptContext;
use async_trait::async_trait;
use image::RgbImage;
use serde_json::Value;

const HOSTED_INFERENCE_URL: &str = "https://api-inference.huggingface.co/models";

/// Image-to-text backend that posts raw PNG bytes to an inference endpoint.
///
/// Without an explicit `endpoint` the hosted Hugging Face inference API is
/// used; pointing `endpoint` at a local server runs the model on-box.
/// Image-to-text pipelines take no prompt, so template and examples are unused.
pub struct HuggingFaceProvider {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HuggingFaceProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let url = match &config.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                if config.model.trim().is_empty() {
                    return Err(ProviderError::ConfigurationError(
                        "Hugging Face provider requires a model identifier or endpoint".to_string(),
                    ));
                }
                format!("{}/{}", HOSTED_INFERENCE_URL, config.model.trim())
            }
        };

        let api_key = Some(config.api_key.trim())
            .filter(|key| !key.is_empty())
            .map(str::to_string);

        Ok(Self {
            client: http_client()?,
            url,
            api_key,
        })
    }
}

/// Accepts `[{"generated_text": ...}]`, `{"generated_text": ...}` or `{"error": ...}`
fn parse_response(body: &str) -> Result<Caption, ProviderError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| ProviderError::GenerationError(format!("Malformed response: {e}")))?;

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        return Err(ProviderError::GenerationError(error.to_string()));
    }

    let first = match &value {
        Value::Array(items) => items.first(),
        other => Some(other),
    };

    first
        .and_then(|item| item.get("generated_text"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(Caption::new)
        .ok_or_else(|| ProviderError::GenerationError("Response contained no caption".to_string()))
}

#[async_trait]
impl CaptionProvider for HuggingFaceProvider {
    fn name(&self) -> &str {
        "huggingface"
    }

    async fn generate_caption(
        &self,
        image: &RgbImage,
        _prompt: &PromptContext,
    ) -> Result<Caption, ProviderError> {
        let png = imaging::encode_png(image)
            .map_err(|e| ProviderError::GenerationError(format!("PNG encoding: {e}")))?;

        let mut request = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "image/png")
            .body(png);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::GenerationError(format!("Request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::GenerationError(format!("Reading response: {e}")))?;

        if !status.is_success() {
            // Inference servers usually explain themselves in an {"error"} body
            return match parse_response(&body) {
                Err(e) => Err(e),
                Ok(_) => Err(ProviderError::GenerationError(format!("HTTP {status}"))),
            };
        }

        parse_response(&body)
    }
}
