//! Caption providers.
//!
//! A [`CaptionProvider`] turns a normalised RGB image plus prompt context into
//! a caption. Concrete backends are selected by the `provider` field of
//! [`ProviderConfig`] through a [`ProviderFactory`]; the batch orchestrator
//! only ever sees `Arc<dyn CaptionProvider>`.
//!
//! - [`openai::OpenAiProvider`]: hosted chat-completions API with image input
//! - [`huggingface::HuggingFaceProvider`]: image-to-text model behind an
//!   inference endpoint (Hugging Face hosted or a local server)

pub mod huggingface;
pub mod openai;

use crate::models::{ProviderConfig, ProviderKind};
use crate::services::prompt::PromptContext;
use async_trait::async_trait;
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use huggingface::HuggingFaceProvider;
pub use openai::OpenAiProvider;

/// Per-call timeout applied by the HTTP backends
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors raised while configuring or calling a provider
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Provider configuration error: {0}")]
    ConfigurationError(String),

    #[error("Caption generation failed: {0}")]
    GenerationError(String),
}

/// A generated caption and, when the backend reports it, its token usage
#[derive(Debug, Clone, PartialEq)]
pub struct Caption {
    pub text: String,
    pub total_tokens: Option<u64>,
}

impl Caption {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            total_tokens: None,
        }
    }

    /// Cost of this caption at `cost_per_token`
    pub fn cost(&self, cost_per_token: f64) -> f64 {
        self.total_tokens.unwrap_or(0) as f64 * cost_per_token
    }
}

/// Backend capable of captioning a single image
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptionProvider: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Generate a caption for `image`, steered by the prompt template and examples.
    async fn generate_caption(
        &self,
        image: &RgbImage,
        prompt: &PromptContext,
    ) -> Result<Caption, ProviderError>;
}

/// Turns a [`ProviderConfig`] into a ready-to-use provider
pub trait ProviderFactory: Send + Sync {
    fn configure(&self, config: &ProviderConfig) -> Result<Arc<dyn CaptionProvider>, ProviderError>;
}

/// Factory for the built-in HTTP backends
#[derive(Debug, Clone, Default)]
pub struct BackendFactory;

impl BackendFactory {
    /// Configure by provider identifier, as received from an outer layer.
    pub fn configure_named(
        &self,
        provider: &str,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn CaptionProvider>, ProviderError> {
        let kind: ProviderKind = provider.parse()?;
        self.configure(&ProviderConfig {
            provider: kind,
            ..config.clone()
        })
    }
}

impl ProviderFactory for BackendFactory {
    fn configure(
        &self,
        config: &ProviderConfig,
    ) -> Result<Arc<dyn CaptionProvider>, ProviderError> {
        tracing::info!(
            "Configuring {} provider with model {}",
            config.provider,
            config.model
        );

        let provider: Arc<dyn CaptionProvider> = match config.provider {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config)?),
            ProviderKind::HuggingFace => Arc::new(HuggingFaceProvider::new(config)?),
        };

        Ok(provider)
    }
}

/// Shared HTTP client construction for the backends
pub(crate) fn http_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::ConfigurationError(format!("HTTP client: {e}")))
}
