//! AutoCaption - Batch image captioning with pluggable caption providers
//!
//! Main entry point for the command-line application.
//!
//! # Execution Flow
//!
//! 1. Parse arguments and load `AutoCaption Config.yaml` (plus `AUTOCAPTION__*` overrides)
//! 2. Initialize logging → logs/autocaption.<date>
//! 3. Create a tokio runtime and a [`BatchOrchestrator`]
//! 4. Start a run on the requested folder
//! 5. Poll `status()` until the run ends; Ctrl-C stops it
//! 6. Log a results and metrics summary, shut the runtime down

use anyhow::{Context, Result};
use autocaption::models::{ErrorHandling, UserConfig};
use autocaption::services::{BackendFactory, PromptContext};
use autocaption::{APP_NAME, BatchOrchestrator, ConfigManager, RunOutcome, VERSION};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "autocaption", version, about = "Caption every image in a folder")]
struct Cli {
    /// Folder containing the images to caption
    folder: Utf8PathBuf,

    /// Directory holding AutoCaption Config.yaml
    #[arg(long, default_value = "AutoCaption Data")]
    config_dir: Utf8PathBuf,

    /// Caption images that already have a caption file
    #[arg(long)]
    reprocess: bool,

    /// Images per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Maximum concurrent provider calls
    #[arg(long)]
    concurrency: Option<usize>,

    /// What to do when an image fails: continue or stop
    #[arg(long)]
    error_handling: Option<ErrorHandling>,

    /// Seconds between progress reports
    #[arg(long, default_value_t = 2)]
    poll_interval: u64,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

impl Cli {
    /// Command-line flags win over the config file
    fn apply_overrides(&self, config: &mut UserConfig) {
        if let Some(batch_size) = self.batch_size {
            config.processing.batch_size = batch_size;
        }
        if let Some(concurrency) = self.concurrency {
            config.processing.concurrency_limit = concurrency;
        }
        if let Some(error_handling) = self.error_handling {
            config.processing.error_handling = error_handling;
        }
        config.debug_mode |= self.debug;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_manager = ConfigManager::new(&cli.config_dir)?;
    let mut user_config = config_manager.load_user_config()?;
    cli.apply_overrides(&mut user_config);

    let _log_guard = autocaption::logging::setup_logging_with_console(
        Utf8Path::new("logs"),
        "autocaption",
        user_config.debug_mode,
        true,
    )?;

    tracing::info!("Starting {} v{}", APP_NAME, VERSION);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("autocaption-worker")
        .build()?;

    let result = runtime.block_on(run(&cli, &user_config, runtime.handle().clone()));

    runtime.shutdown_timeout(Duration::from_secs(5));
    tracing::info!("Shutdown complete");

    result
}

async fn run(cli: &Cli, config: &UserConfig, handle: tokio::runtime::Handle) -> Result<()> {
    let orchestrator = Arc::new(BatchOrchestrator::new(Arc::new(BackendFactory), handle));

    let prompt = PromptContext::from_settings(&config.prompt)
        .context("Failed to load prompt settings")?;
    orchestrator.set_prompt(prompt);

    orchestrator
        .start(
            &cli.folder,
            &config.provider,
            Some(config.processing.clone()),
            cli.reprocess,
        )
        .with_context(|| format!("Could not start captioning {}", cli.folder))?;

    let ctrl_c = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted - stopping run");
                orchestrator.stop();
            }
        })
    };

    let mut ticker = tokio::time::interval(Duration::from_secs(cli.poll_interval.max(1)));
    loop {
        ticker.tick().await;
        let status = orchestrator.status();
        if !status.is_processing {
            break;
        }

        tracing::info!(
            "Progress: {}/{} ({} errors), batch {}, {:.1} images/min, ETA {}, cost ${:.4}{}",
            status.processed_count,
            status.total_count,
            status.error_count,
            status.current_batch,
            status.processing_speed.unwrap_or(0.0),
            status
                .estimated_completion
                .map(|eta| eta.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "-".to_string()),
            status.total_cost,
            if status.is_paused { " [paused]" } else { "" }
        );
    }

    // Let a stopped run finish its in-flight items before exiting
    orchestrator.wait().await;
    ctrl_c.abort();

    let status = orchestrator.status();
    tracing::info!(
        "Run finished ({:?}): {} processed, {} errors, cost ${:.4}",
        status.outcome,
        status.processed_count,
        status.error_count,
        status.total_cost
    );

    for item in orchestrator.results().iter().filter(|item| item.error_message.is_some()) {
        tracing::warn!(
            "#{} {}: {}",
            item.id,
            item.filename,
            item.error_message.as_deref().unwrap_or_default()
        );
    }

    orchestrator.metrics().log_summary();

    match status.outcome {
        Some(RunOutcome::Failed) => anyhow::bail!("Captioning run failed"),
        _ => Ok(()),
    }
}
