use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::services::providers::ProviderError;

/// How the batch loop reacts to a failed image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorHandling {
    /// Record the failure and keep going
    #[default]
    Continue,
    /// Record the failure and end the run
    Stop,
}

impl fmt::Display for ErrorHandling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => f.write_str("continue"),
            Self::Stop => f.write_str("stop"),
        }
    }
}

impl FromStr for ErrorHandling {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "stop" => Ok(Self::Stop),
            other => Err(format!("unknown error handling policy: {other}")),
        }
    }
}

/// Per-run processing settings. Immutable once a run has started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Number of images considered before pause/stop is re-checked
    pub batch_size: usize,

    pub error_handling: ErrorHandling,

    /// Upper bound on simultaneously in-flight provider calls
    pub concurrency_limit: usize,

    /// Optional token prepended to every persisted caption
    pub trigger_word: Option<String>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            error_handling: ErrorHandling::Continue,
            concurrency_limit: 2,
            trigger_word: None,
        }
    }
}

impl ProcessingConfig {
    /// Check that the numeric limits are usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be greater than zero".to_string());
        }
        if self.concurrency_limit == 0 {
            return Err("concurrency_limit must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Known captioning backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ProviderKind {
    /// Hosted chat-completions API with vision input
    #[default]
    OpenAi,
    /// Image-to-text model behind an inference endpoint (local or self-hosted)
    HuggingFace,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::HuggingFace => "huggingface",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "huggingface" => Ok(Self::HuggingFace),
            other => Err(ProviderError::UnsupportedProvider(other.to_string())),
        }
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = ProviderError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProviderKind> for String {
    fn from(kind: ProviderKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Settings handed to a provider when it is configured for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    pub model: String,
    pub api_key: String,

    /// Override for the backend URL (self-hosted inference servers, proxies)
    pub endpoint: Option<String>,

    /// Price of one token, used to accumulate run cost
    pub cost_per_token: f64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            api_key: String::new(),
            endpoint: None,
            cost_per_token: 0.0,
            max_tokens: 300,
            temperature: 0.7,
        }
    }
}

/// Prompt template and few-shot example sources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptSettings {
    /// Template text; may reference `{example_captions}` and `{trigger_word}`
    pub template: Option<String>,

    /// Folder of example images with caption sidecars
    pub examples_folder: Option<Utf8PathBuf>,
}

/// User configuration from `AutoCaption Config.yaml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserConfig {
    pub provider: ProviderConfig,
    pub processing: ProcessingConfig,
    pub prompt: PromptSettings,
    pub debug_mode: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_config_defaults() {
        let config = ProcessingConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.concurrency_limit, 2);
        assert_eq!(config.error_handling, ErrorHandling::Continue);
        assert!(config.trigger_word.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_processing_config_rejects_zero_limits() {
        let config = ProcessingConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ProcessingConfig {
            concurrency_limit: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!(
            "HuggingFace".parse::<ProviderKind>().unwrap(),
            ProviderKind::HuggingFace
        );

        let err = "anthropic".parse::<ProviderKind>().unwrap_err();
        assert!(matches!(err, ProviderError::UnsupportedProvider(ref p) if p == "anthropic"));
    }

    #[test]
    fn test_unknown_provider_rejected_in_yaml() {
        let yaml = "provider: replicate\nmodel: x\n";
        let result: Result<ProviderConfig, _> = serde_yaml_ng::from_str(yaml);
        let message = result.unwrap_err().to_string();
        assert!(message.contains("replicate"));
    }

    #[test]
    fn test_error_handling_yaml_names() {
        let yaml = "batch_size: 10\nerror_handling: stop\n";
        let config: ProcessingConfig = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.error_handling, ErrorHandling::Stop);
        assert_eq!(config.concurrency_limit, 2);
    }
}
