//! Batch orchestrator.
//!
//! [`BatchOrchestrator`] owns the run state machine:
//!
//! ```text
//! Idle -> Running <-> Paused -> Completed | StoppedByPolicy | StoppedByUser | Failed -> Idle
//! ```
//!
//! `start()` validates its inputs, enumerates the folder, configures the
//! provider and spawns a supervised batch loop on the runtime before
//! returning. The loop splits the work into chunks of `batch_size` and runs
//! each chunk through the bounded pool with `concurrency_limit` workers.
//! Pause and resume take effect between chunks; stop cancels admission right
//! away and lets in-flight items finish without recording them.
//!
//! Every state write from the loop goes through a run id, so a stopped loop
//! that is still draining can never touch the state of a newer run.

pub mod progress;

use crate::metrics::Metrics;
use crate::models::{
    ErrorHandling, ItemOutcome, ProcessedItem, ProcessingConfig, ProgressSnapshot,
    ProviderConfig, RunOutcome,
};
use crate::services::captioning::{CaptionError, CaptioningService};
use crate::services::enumerator::{self, EnumerateError};
use crate::services::pool::{self, PoolError};
use crate::services::prompt::PromptContext;
use crate::services::providers::{Caption, ProviderError, ProviderFactory};
use crate::state::{StateChange, StateManager};
use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Reasons `start()` refuses to create a run
#[derive(Error, Debug)]
pub enum StartError {
    #[error("A captioning run is already in progress")]
    AlreadyRunning,

    #[error("Folder not found: {0}")]
    FolderNotFound(Utf8PathBuf),

    #[error("No images to caption in {0}")]
    NoWorkFound(Utf8PathBuf),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Invalid processing configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Enumerate(EnumerateError),
}

impl From<EnumerateError> for StartError {
    fn from(error: EnumerateError) -> Self {
        match error {
            EnumerateError::FolderNotFound(path) => Self::FolderNotFound(path),
            EnumerateError::NoWorkFound(path) => Self::NoWorkFound(path),
            other => Self::Enumerate(other),
        }
    }
}

/// Control handles of the most recently started run
struct ActiveRun {
    run_id: u64,
    cancel_tx: Arc<watch::Sender<bool>>,
    pause_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

/// Drives batch captioning runs and answers control and status calls.
///
/// All methods are safe to call concurrently with a running batch loop.
pub struct BatchOrchestrator {
    state: StateManager,
    factory: Arc<dyn ProviderFactory>,
    runtime: Handle,
    metrics: Arc<Metrics>,
    prompt: RwLock<PromptContext>,
    active: Mutex<Option<ActiveRun>>,
}

impl BatchOrchestrator {
    pub fn new(factory: Arc<dyn ProviderFactory>, runtime: Handle) -> Self {
        Self {
            state: StateManager::new(),
            factory,
            runtime,
            metrics: Arc::new(Metrics::new()),
            prompt: RwLock::new(PromptContext::default()),
            active: Mutex::new(None),
        }
    }

    /// Replace the prompt template and examples used by subsequent runs.
    pub fn set_prompt(&self, prompt: PromptContext) {
        *self.prompt.write().unwrap_or_else(PoisonError::into_inner) = prompt;
    }

    pub fn prompt(&self) -> PromptContext {
        self.prompt
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Subscribe to run lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state.subscribe()
    }

    /// Start captioning the images in `folder`.
    ///
    /// Returns as soon as the batch loop has been spawned. Nothing is mutated
    /// when an error is returned.
    ///
    /// # Errors
    /// - [`StartError::AlreadyRunning`] while another run is processing
    /// - [`StartError::InvalidConfig`] for a zero batch size or concurrency limit
    /// - [`StartError::FolderNotFound`] / [`StartError::NoWorkFound`] from enumeration
    /// - [`StartError::Provider`] if the provider cannot be configured
    pub fn start(
        &self,
        folder: &Utf8Path,
        provider_config: &ProviderConfig,
        processing_config: Option<ProcessingConfig>,
        reprocess: bool,
    ) -> Result<(), StartError> {
        // Held until the run is registered so concurrent starts serialize here
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if self.state.read(|state| state.is_processing) {
            return Err(StartError::AlreadyRunning);
        }

        let config = processing_config.unwrap_or_default();
        config.validate().map_err(StartError::InvalidConfig)?;

        let files = enumerator::enumerate(folder, reprocess)?;
        let provider = self.factory.configure(provider_config)?;

        let mut prompt = self.prompt();
        prompt.trigger_word = config.trigger_word.clone();

        let service = CaptioningService::new(provider, Arc::new(prompt))
            .with_cost_per_token(provider_config.cost_per_token)
            .with_metrics(Arc::clone(&self.metrics));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (pause_tx, pause_rx) = watch::channel(false);

        let total = files.len();
        let run_id = self.state.begin_run(folder.to_path_buf(), total);
        self.metrics.record_run_started();

        tracing::info!(
            "Starting run {} on {}: {} images, batch size {}, concurrency {}, on error {}",
            run_id,
            folder,
            total,
            config.batch_size,
            config.concurrency_limit,
            config.error_handling
        );

        let batch_loop = BatchLoop {
            run_id,
            state: self.state.clone(),
            service,
            metrics: Arc::clone(&self.metrics),
            folder: folder.to_path_buf(),
            files,
            config,
            cancel_tx: Arc::clone(&cancel_tx),
            cancel_rx,
            pause_rx,
        };

        let state = self.state.clone();
        let handle = self
            .runtime
            .spawn(supervise(state, run_id, batch_loop.run()));

        *active = Some(ActiveRun {
            run_id,
            cancel_tx,
            pause_tx,
            handle: Some(handle),
        });

        Ok(())
    }

    /// Stop the active run. Returns `false` if nothing was running.
    ///
    /// Admission of new items stops immediately; items already in flight
    /// finish but are not added to the results log.
    pub fn stop(&self) -> bool {
        // Held across both steps so a concurrent start() cannot slip in between
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(run_id) = self.state.stop_run() else {
            return false;
        };

        cancel_run(active.as_ref(), run_id);
        tracing::info!("Run {} stopped by user", run_id);
        true
    }

    /// Pause at the next chunk boundary. Returns whether anything changed.
    pub fn pause(&self) -> bool {
        self.set_paused(true)
    }

    /// Resume a paused run. Returns whether anything changed.
    pub fn resume(&self) -> bool {
        self.set_paused(false)
    }

    fn set_paused(&self, paused: bool) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        let changed = self.state.set_paused(paused);
        if changed {
            if let Some(active) = active.as_ref() {
                active.pause_tx.send_replace(paused);
            }
            tracing::info!("Run {}", if paused { "paused" } else { "resumed" });
        }
        changed
    }

    /// Current progress. Never fails, also when idle.
    pub fn status(&self) -> ProgressSnapshot {
        self.state
            .read(|state| progress::compute_snapshot(state, Utc::now()))
    }

    /// The whole results log of the current or last run
    pub fn results(&self) -> Vec<ProcessedItem> {
        self.state.read(|state| state.results.clone())
    }

    /// Results after the first `n`, for incremental consumers
    pub fn results_since(&self, n: usize) -> Vec<ProcessedItem> {
        self.state
            .read(|state| state.results.get(n..).map(<[_]>::to_vec).unwrap_or_default())
    }

    /// Wait until the most recently started batch loop has exited.
    ///
    /// After a stop this includes draining in-flight items.
    pub async fn wait(&self) {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .and_then(|active| active.handle.take());

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Batch loop task ended abnormally: {}", e);
            }
        }
    }

    /// Caption a single image outside of any run.
    ///
    /// Uses the current prompt but neither touches the run state nor writes a
    /// caption sidecar.
    pub async fn caption_single(
        &self,
        image_path: &Utf8Path,
        provider_config: &ProviderConfig,
    ) -> Result<Caption, CaptionError> {
        let provider = self.factory.configure(provider_config)?;
        let service = CaptioningService::new(provider, Arc::new(self.prompt()))
            .with_metrics(Arc::clone(&self.metrics));

        service.generate(image_path).await
    }
}

/// Flip the cancel signal of `active` if it belongs to `run_id`.
fn cancel_run(active: Option<&ActiveRun>, run_id: u64) -> bool {
    match active {
        Some(active) if active.run_id == run_id => {
            active.cancel_tx.send_replace(true);
            true
        }
        _ => false,
    }
}

/// Run `batch_loop`, turning an error or panic into [`RunOutcome::Failed`].
async fn supervise<F>(state: StateManager, run_id: u64, batch_loop: F)
where
    F: Future<Output = Result<Option<RunOutcome>>>,
{
    match AssertUnwindSafe(batch_loop).catch_unwind().await {
        Ok(Ok(Some(outcome))) => {
            let (captioned, failed) =
                state.read(|state| (state.success_count(), state.error_count()));
            tracing::info!(
                "Run {} finished: {:?} ({} captioned, {} failed)",
                run_id,
                outcome,
                captioned,
                failed
            );
        }
        Ok(Ok(None)) => {
            tracing::info!("Run {} ended after being stopped", run_id);
        }
        Ok(Err(e)) => {
            tracing::error!("Run {} failed: {:#}", run_id, e);
            state.finish_run(run_id, RunOutcome::Failed);
        }
        Err(_) => {
            tracing::error!("Run {} batch loop panicked", run_id);
            state.finish_run(run_id, RunOutcome::Failed);
        }
    }
}

/// Everything the background batch loop of one run needs
struct BatchLoop {
    run_id: u64,
    state: StateManager,
    service: CaptioningService,
    metrics: Arc<Metrics>,
    folder: Utf8PathBuf,
    files: Vec<String>,
    config: ProcessingConfig,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    pause_rx: watch::Receiver<bool>,
}

impl BatchLoop {
    /// Returns the outcome this loop recorded, or `None` if the run was
    /// ended from outside.
    async fn run(mut self) -> Result<Option<RunOutcome>> {
        let files = std::mem::take(&mut self.files);

        for chunk in files.chunks(self.config.batch_size) {
            if !self.state.is_active(self.run_id) {
                return Ok(None);
            }

            self.wait_while_paused().await;

            let Some(batch_index) = self.state.start_batch(self.run_id) else {
                return Ok(None);
            };

            tracing::info!(
                "Run {}: batch {} ({} images)",
                self.run_id,
                batch_index,
                chunk.len()
            );

            if self.run_chunk(chunk).await? {
                tracing::warn!(
                    "Run {}: stopping after a failed image (error handling: stop)",
                    self.run_id
                );
                return Ok(Some(RunOutcome::StoppedByPolicy));
            }

            self.metrics.log_periodic();
        }

        if self.state.finish_run(self.run_id, RunOutcome::Completed) {
            Ok(Some(RunOutcome::Completed))
        } else {
            Ok(None)
        }
    }

    /// Block at a chunk boundary while paused. A stop wakes it.
    async fn wait_while_paused(&mut self) {
        let paused = *self.pause_rx.borrow_and_update();
        if !paused {
            return;
        }

        tracing::info!("Run {} paused at a batch boundary", self.run_id);

        tokio::select! {
            biased;
            _ = pool::cancelled(self.cancel_rx.clone()) => {}
            _ = self.pause_rx.wait_for(|&paused| !paused) => {}
        }
    }

    /// Run one chunk through the pool, recording results as they complete.
    ///
    /// Returns `true` if the error policy ended the run. Fails if the pool
    /// stopped reporting before every item was processed without a cancel.
    async fn run_chunk(&self, chunk: &[String]) -> Result<bool> {
        let paths: Vec<Utf8PathBuf> = chunk.iter().map(|name| self.folder.join(name)).collect();

        let service = self.service.clone();
        let mut run = pool::spawn_bounded(
            paths.clone(),
            self.config.concurrency_limit,
            self.cancel_rx.clone(),
            move |path| {
                let service = service.clone();
                async move { service.process(path).await }
            },
        );

        let mut stopped_by_policy = false;
        let mut reported = 0;

        // Drain every admitted worker, even after a stop
        while let Some(completion) = run.next().await {
            reported += 1;
            let outcome = match completion.output {
                Ok(outcome) => outcome,
                Err(PoolError::Panicked(message)) => {
                    panicked_outcome(&paths[completion.index], &message)
                }
            };
            let failed = outcome.is_error();

            let Some(item) = self.state.record_item(self.run_id, outcome) else {
                self.metrics.record_result_discarded();
                continue;
            };

            tracing::debug!("Run {}: recorded #{} {}", self.run_id, item.id, item.filename);

            if failed && self.config.error_handling == ErrorHandling::Stop {
                self.cancel_tx.send_replace(true);
                if self.state.finish_run(self.run_id, RunOutcome::StoppedByPolicy) {
                    stopped_by_policy = true;
                }
            }
        }

        ensure_drained(reported, run.total(), *self.cancel_rx.borrow())?;
        Ok(stopped_by_policy)
    }
}

/// A chunk that ends early without a cancel means the pool lost items.
fn ensure_drained(reported: usize, total: usize, cancelled: bool) -> Result<()> {
    if reported < total && !cancelled {
        anyhow::bail!("Task pool reported {reported} of {total} items without being cancelled");
    }
    Ok(())
}

fn panicked_outcome(path: &Utf8Path, message: &str) -> ItemOutcome {
    tracing::error!("Captioning task for {} panicked: {}", path, message);
    ItemOutcome {
        filename: path.file_name().unwrap_or(path.as_str()).to_string(),
        source_path: path.to_path_buf(),
        result: Err(format!("Captioning task panicked: {message}")),
        cost: 0.0,
        completed_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemStatus;
    use crate::services::providers::{CaptionProvider, MockCaptionProvider};
    use image::{ImageFormat, Rgb, RgbImage};
    use tempfile::TempDir;

    fn begin(state: &StateManager) -> u64 {
        state.begin_run(Utf8PathBuf::from("/images"), 3)
    }

    /// Hands out mocks that caption every image as "ok"
    struct MockFactory;

    impl ProviderFactory for MockFactory {
        fn configure(
            &self,
            _config: &ProviderConfig,
        ) -> Result<Arc<dyn CaptionProvider>, ProviderError> {
            let mut mock = MockCaptionProvider::new();
            mock.expect_generate_caption()
                .returning(|_, _| Ok(Caption::new("ok")));
            Ok(Arc::new(mock))
        }
    }

    fn image_folder(count: usize) -> (TempDir, Utf8PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let folder = Utf8PathBuf::try_from(temp_dir.path().to_path_buf()).unwrap();
        for i in 0..count {
            RgbImage::from_pixel(2, 2, Rgb([1, 2, 3]))
                .save_with_format(folder.join(format!("img{i}.png")), ImageFormat::Png)
                .unwrap();
        }
        (temp_dir, folder)
    }

    fn one_per_batch() -> ProcessingConfig {
        ProcessingConfig {
            batch_size: 1,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_supervisor_marks_error_as_failed() {
        let state = StateManager::new();
        let run_id = begin(&state);

        supervise(state.clone(), run_id, async {
            Err(anyhow::anyhow!("state went missing"))
        })
        .await;

        let snapshot = state.snapshot();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.outcome, Some(RunOutcome::Failed));
    }

    #[tokio::test]
    async fn test_supervisor_marks_panic_as_failed() {
        let state = StateManager::new();
        let run_id = begin(&state);

        supervise(state.clone(), run_id, async {
            if run_id > 0 {
                panic!("batch loop blew up");
            }
            Ok(None)
        })
        .await;

        let snapshot = state.snapshot();
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.outcome, Some(RunOutcome::Failed));
    }

    #[tokio::test]
    async fn test_supervisor_keeps_user_stop() {
        let state = StateManager::new();
        let run_id = begin(&state);
        assert_eq!(state.stop_run(), Some(run_id));

        supervise(state.clone(), run_id, async { Ok(None) }).await;

        assert_eq!(state.snapshot().outcome, Some(RunOutcome::StoppedByUser));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_aimed_at_old_run_leaves_new_run_alone() {
        let (_dir, folder) = image_folder(3);
        let orchestrator = BatchOrchestrator::new(Arc::new(MockFactory), Handle::current());
        let provider = ProviderConfig::default();

        orchestrator
            .start(&folder, &provider, Some(one_per_batch()), false)
            .unwrap();
        orchestrator.wait().await;
        let first_run = orchestrator.state().read(|state| state.run_id);

        orchestrator
            .start(&folder, &provider, Some(one_per_batch()), true)
            .unwrap();
        let second_run = orchestrator.state().read(|state| state.run_id);
        assert_ne!(first_run, second_run);

        {
            let active = orchestrator.active.lock().unwrap();
            assert!(!cancel_run(active.as_ref(), first_run));
        }
        orchestrator.wait().await;

        let status = orchestrator.status();
        assert_eq!(status.outcome, Some(RunOutcome::Completed));
        assert_eq!(status.processed_count, 3);
        assert!(!orchestrator.stop());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_cancels_the_run_it_ended() {
        let (_dir, folder) = image_folder(1);
        let orchestrator = BatchOrchestrator::new(Arc::new(MockFactory), Handle::current());

        orchestrator
            .start(&folder, &ProviderConfig::default(), Some(one_per_batch()), false)
            .unwrap();
        let run_id = orchestrator.state().read(|state| state.run_id);

        let active = orchestrator.active.lock().unwrap();
        assert!(cancel_run(active.as_ref(), run_id));
        assert!(*active.as_ref().unwrap().cancel_tx.borrow());
    }

    #[test]
    fn test_early_drain_without_cancel_is_an_error() {
        assert!(ensure_drained(3, 3, false).is_ok());
        assert!(ensure_drained(1, 3, true).is_ok());
        assert!(ensure_drained(0, 0, false).is_ok());

        let err = ensure_drained(1, 3, false).unwrap_err();
        assert!(err.to_string().contains("1 of 3"));
    }

    #[test]
    fn test_enumerate_errors_map_to_start_errors() {
        let missing = StartError::from(EnumerateError::FolderNotFound("/nope".into()));
        assert!(matches!(missing, StartError::FolderNotFound(path) if path == "/nope"));

        let empty = StartError::from(EnumerateError::NoWorkFound("/done".into()));
        assert!(matches!(empty, StartError::NoWorkFound(_)));
    }

    #[test]
    fn test_panicked_outcome_is_error() {
        let outcome = panicked_outcome(Utf8Path::new("/images/a.png"), "boom");

        assert_eq!(outcome.filename, "a.png");
        assert!(outcome.is_error());

        let mut state = crate::models::RunState::default();
        let item = state.push_result(outcome);
        assert_eq!(item.status, ItemStatus::Error);
        assert!(item.error_message.as_deref().unwrap().contains("boom"));
    }
}
