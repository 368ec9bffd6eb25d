use super::{Caption, CaptionProvider, ProviderError, http_client};
use crate::models::ProviderConfig;
use crate::services::imaging;
use crate::services::prompt::PromptContext;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose};
use image::RgbImage;
use serde::Deserialize;
use serde_json::{Value, json};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat-completions backend that sends the image as a JPEG data URL
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u64,
}

impl OpenAiProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.trim().is_empty() {
            return Err(ProviderError::ConfigurationError(
                "OpenAI provider requires an API key".to_string(),
            ));
        }
        if config.model.trim().is_empty() {
            return Err(ProviderError::ConfigurationError(
                "OpenAI provider requires a model identifier".to_string(),
            ));
        }

        Ok(Self {
            client: http_client()?,
            base_url: config
                .endpoint
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    fn request_body(&self, image_jpeg: &[u8], prompt: &PromptContext) -> Value {
        let data_url = format!(
            "data:image/jpeg;base64,{}",
            general_purpose::STANDARD.encode(image_jpeg)
        );

        json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": prompt.render() },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "Please caption this image:" },
                        { "type": "image_url", "image_url": { "url": data_url } }
                    ]
                }
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        })
    }
}

fn parse_response(body: &str) -> Result<Caption, ProviderError> {
    let response: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ProviderError::GenerationError(format!("Malformed response: {e}")))?;

    let text = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.message.content)
        .map(|content| content.trim().to_string())
        .filter(|content| !content.is_empty())
        .ok_or_else(|| {
            ProviderError::GenerationError("Response contained no caption".to_string())
        })?;

    Ok(Caption {
        text,
        total_tokens: response.usage.map(|usage| usage.total_tokens),
    })
}

#[async_trait]
impl CaptionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate_caption(
        &self,
        image: &RgbImage,
        prompt: &PromptContext,
    ) -> Result<Caption, ProviderError> {
        let jpeg = imaging::encode_jpeg(image)
            .map_err(|e| ProviderError::GenerationError(format!("JPEG encoding: {e}")))?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(&jpeg, prompt))
            .send()
            .await
            .map_err(|e| ProviderError::GenerationError(format!("Request failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::GenerationError(format!("Reading response: {e}")))?;

        if !status.is_success() {
            return Err(ProviderError::GenerationError(format!(
                "HTTP {status}: {}",
                body.chars().take(300).collect::<String>()
            )));
        }

        parse_response(&body)
    }
}
