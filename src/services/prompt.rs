use crate::services::enumerator::{is_image_file, read_caption, utf8_file_name};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::LazyLock;

/// Template used when none is configured
pub const DEFAULT_TEMPLATE: &str =
    "Generate a detailed caption for this image that describes its key features and content.";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_]+)\}").expect("Invalid placeholder regex"));

/// A prior (image, caption) pair used to steer a provider's style
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamplePair {
    pub image_path: Utf8PathBuf,
    pub caption: String,
}

/// Template and few-shot examples shared by every item of a run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    pub template: Option<String>,
    pub examples: Vec<ExamplePair>,
    pub trigger_word: Option<String>,
}

impl PromptContext {
    /// Build from settings, loading examples from disk when a folder is set.
    pub fn from_settings(settings: &crate::models::PromptSettings) -> Result<Self> {
        let examples = match &settings.examples_folder {
            Some(folder) => load_examples(folder)?,
            None => Vec::new(),
        };

        Ok(Self {
            template: settings.template.clone(),
            examples,
            trigger_word: None,
        })
    }

    /// Render the instruction text a provider should send.
    pub fn render(&self) -> String {
        render_template(
            self.template.as_deref().unwrap_or(DEFAULT_TEMPLATE),
            &self.examples,
            self.trigger_word.as_deref(),
        )
    }
}

/// Load every image in `folder` that has a caption sidecar, sorted by filename.
pub fn load_examples(folder: &Utf8Path) -> Result<Vec<ExamplePair>> {
    let mut examples = Vec::new();

    let entries = fs::read_dir(folder)
        .with_context(|| format!("Failed to read examples folder: {}", folder))?;

    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", folder))?;
        let Some(name) = utf8_file_name(&entry, folder) else {
            continue;
        };
        if !is_image_file(&name) {
            continue;
        }

        let image_path = folder.join(&name);
        let Some(caption) = read_caption(&image_path) else {
            tracing::debug!("Example {} has no caption, skipping", image_path);
            continue;
        };

        examples.push(ExamplePair {
            image_path,
            caption,
        });
    }

    examples.sort_by(|a, b| a.image_path.cmp(&b.image_path));
    tracing::info!("Loaded {} caption examples from {}", examples.len(), folder);

    Ok(examples)
}

/// Substitute `{example_captions}` and `{trigger_word}` in `template`.
///
/// Unknown placeholders are left untouched.
pub fn render_template(
    template: &str,
    examples: &[ExamplePair],
    trigger_word: Option<&str>,
) -> String {
    let mut variables: IndexMap<&str, String> = IndexMap::new();
    variables.insert(
        "example_captions",
        examples
            .iter()
            .map(|example| format!("Example Caption: {}", example.caption))
            .collect::<Vec<_>>()
            .join("\n\n"),
    );
    variables.insert("trigger_word", trigger_word.unwrap_or_default().to_string());

    PLACEHOLDER
        .replace_all(template, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}
