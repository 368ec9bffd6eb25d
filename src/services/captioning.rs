use crate::metrics::Metrics;
use crate::models::ItemOutcome;
use crate::services::enumerator::caption_path;
use crate::services::imaging;
use crate::services::prompt::PromptContext;
use crate::services::providers::{Caption, CaptionProvider, ProviderError};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

/// Reasons a single image can fail to be captioned
#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("Failed to read image {path}: {source}")]
    Read {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: Utf8PathBuf,
        source: image::ImageError,
    },

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Failed to write caption {path}: {source}")]
    WriteSidecar {
        path: Utf8PathBuf,
        source: std::io::Error,
    },

    #[error("Image decoding task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Prefix `caption` with the trigger word, if one is set.
pub fn apply_trigger_word(caption: &str, trigger_word: Option<&str>) -> String {
    match trigger_word.map(str::trim).filter(|word| !word.is_empty()) {
        Some(word) => format!("{} {}", word, caption),
        None => caption.to_string(),
    }
}

/// Per-item captioning task shared by every worker of a run.
///
/// Cheap to clone; the provider and prompt are reference counted.
#[derive(Clone)]
pub struct CaptioningService {
    provider: Arc<dyn CaptionProvider>,
    prompt: Arc<PromptContext>,
    cost_per_token: f64,
    metrics: Arc<Metrics>,
}

impl CaptioningService {
    pub fn new(provider: Arc<dyn CaptionProvider>, prompt: Arc<PromptContext>) -> Self {
        Self {
            provider,
            prompt,
            cost_per_token: 0.0,
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_cost_per_token(mut self, cost_per_token: f64) -> Self {
        self.cost_per_token = cost_per_token;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Load, normalise and caption one image without persisting anything.
    pub async fn generate(&self, image_path: &Utf8Path) -> Result<Caption, CaptionError> {
        let bytes = tokio::fs::read(image_path)
            .await
            .map_err(|source| CaptionError::Read {
                path: image_path.to_path_buf(),
                source,
            })?;

        // Decoding is CPU bound; keep it off the async workers
        let image = tokio::task::spawn_blocking(move || imaging::decode_normalized(&bytes))
            .await?
            .map_err(|source| CaptionError::Decode {
                path: image_path.to_path_buf(),
                source,
            })?;

        let caption = self.provider.generate_caption(&image, &self.prompt).await?;
        Ok(caption)
    }

    /// Caption one image and write the result to its sidecar.
    ///
    /// Returns the persisted caption text and the cost of the call.
    pub async fn caption_image(
        &self,
        image_path: &Utf8Path,
    ) -> Result<(String, f64), CaptionError> {
        let caption = self.generate(image_path).await?;

        if let Some(tokens) = caption.total_tokens {
            self.metrics.record_tokens(tokens);
        }

        let text = apply_trigger_word(&caption.text, self.prompt.trigger_word.as_deref());
        let sidecar = caption_path(image_path);
        tokio::fs::write(&sidecar, &text)
            .await
            .map_err(|source| CaptionError::WriteSidecar {
                path: sidecar.clone(),
                source,
            })?;

        Ok((text, caption.cost(self.cost_per_token)))
    }

    /// Run the per-item task. Never fails: errors become an error outcome.
    pub async fn process(&self, image_path: Utf8PathBuf) -> ItemOutcome {
        let started = Instant::now();
        let filename = image_path.file_name().unwrap_or(image_path.as_str()).to_string();

        tracing::debug!("Captioning {}", image_path);

        let (result, cost) = match self.caption_image(&image_path).await {
            Ok((caption, cost)) => {
                self.metrics.record_image_captioned();
                tracing::debug!("Captioned {}: {}", filename, caption);
                (Ok(caption), cost)
            }
            Err(e) => {
                self.metrics.record_image_failed();
                tracing::warn!("Failed to caption {}: {}", filename, e);
                (Err(e.to_string()), 0.0)
            }
        };

        self.metrics.record_caption_time(started.elapsed());

        ItemOutcome {
            filename,
            source_path: image_path,
            result,
            cost,
            completed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::providers::MockCaptionProvider;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn temp_folder() -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let folder = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        (temp_dir, folder)
    }

    fn write_png(path: &Utf8Path, pixel: Rgba<u8>) {
        RgbaImage::from_pixel(2, 2, pixel)
            .save_with_format(path, ImageFormat::Png)
            .unwrap();
    }

    fn service(mock: MockCaptionProvider, trigger_word: Option<&str>) -> CaptioningService {
        let prompt = PromptContext {
            trigger_word: trigger_word.map(str::to_string),
            ..Default::default()
        };
        CaptioningService::new(Arc::new(mock), Arc::new(prompt))
    }

    #[test]
    fn test_apply_trigger_word() {
        assert_eq!(apply_trigger_word("a cat", Some("ohwx")), "ohwx a cat");
        assert_eq!(apply_trigger_word("a cat", Some("  ")), "a cat");
        assert_eq!(apply_trigger_word("a cat", None), "a cat");
    }

    #[tokio::test]
    async fn test_success_writes_sidecar() {
        let (_guard, folder) = temp_folder();
        let image = folder.join("photo.png");
        write_png(&image, Rgba([0, 0, 0, 0]));

        let mut mock = MockCaptionProvider::new();
        mock.expect_generate_caption()
            .times(1)
            .withf(|image, _| image.get_pixel(0, 0).0 == [255, 255, 255])
            .returning(|_, _| {
                Ok(Caption {
                    text: "a blank square".to_string(),
                    total_tokens: Some(100),
                })
            });

        let service = service(mock, Some("ohwx")).with_cost_per_token(0.01);
        let outcome = service.process(image.clone()).await;

        assert_eq!(outcome.filename, "photo.png");
        assert_eq!(outcome.result, Ok("ohwx a blank square".to_string()));
        assert!((outcome.cost - 1.0).abs() < 1e-9);
        assert_eq!(
            std::fs::read_to_string(folder.join("photo.txt")).unwrap(),
            "ohwx a blank square"
        );
    }

    #[tokio::test]
    async fn test_provider_failure_becomes_error_outcome() {
        let (_guard, folder) = temp_folder();
        let image = folder.join("bad.png");
        write_png(&image, Rgba([10, 10, 10, 255]));

        let mut mock = MockCaptionProvider::new();
        mock.expect_generate_caption()
            .returning(|_, _| Err(ProviderError::GenerationError("rate limited".to_string())));

        let metrics = Arc::new(Metrics::new());
        let service = service(mock, None).with_metrics(metrics.clone());
        let outcome = service.process(image).await;

        assert!(outcome.is_error());
        assert!(outcome.result.unwrap_err().contains("rate limited"));
        assert_eq!(outcome.cost, 0.0);
        assert!(!folder.join("bad.txt").exists());
        assert_eq!(metrics.images_failed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_undecodable_image_skips_provider() {
        let (_guard, folder) = temp_folder();
        let image = folder.join("broken.jpg");
        std::fs::write(&image, b"not really a jpeg").unwrap();

        let mut mock = MockCaptionProvider::new();
        mock.expect_generate_caption().never();

        let err = service(mock, None).caption_image(&image).await.unwrap_err();
        assert!(matches!(err, CaptionError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let (_guard, folder) = temp_folder();

        let mut mock = MockCaptionProvider::new();
        mock.expect_generate_caption().never();

        let err = service(mock, None)
            .generate(&folder.join("gone.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptionError::Read { .. }));
    }

    #[tokio::test]
    async fn test_generate_does_not_persist() {
        let (_guard, folder) = temp_folder();
        let image = folder.join("single.png");
        write_png(&image, Rgba([1, 2, 3, 255]));

        let mut mock = MockCaptionProvider::new();
        mock.expect_generate_caption()
            .returning(|_, _| Ok(Caption::new("three dots")));

        let caption = service(mock, Some("ohwx")).generate(&image).await.unwrap();

        assert_eq!(caption.text, "three dots");
        assert!(!folder.join("single.txt").exists());
    }
}
