use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of a single captioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Error,
}

/// How the most recent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every enumerated image was attempted
    Completed,
    /// A failed image ended the run under `ErrorHandling::Stop`
    StoppedByPolicy,
    /// `stop()` was called
    StoppedByUser,
    /// The batch loop itself errored or panicked
    Failed,
}

/// What the per-item task hands back to the batch loop.
///
/// It has no id yet: ids are assigned when the outcome is appended to the
/// results log, so they follow completion order.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    pub filename: String,
    pub source_path: Utf8PathBuf,
    /// Persisted caption on success, failure message on error
    pub result: Result<String, String>,
    pub cost: f64,
    pub completed_at: DateTime<Utc>,
}

impl ItemOutcome {
    pub fn is_error(&self) -> bool {
        self.result.is_err()
    }
}

/// One attempted image in the results log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedItem {
    /// 1-based, in completion order
    pub id: usize,
    pub filename: String,
    pub source_path: Utf8PathBuf,
    /// Empty on failure
    pub caption: String,
    pub status: ItemStatus,
    /// Set iff `status == Error`
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub cost: f64,
}

/// State of the current (or most recent) batch run.
///
/// Wrapped by [`crate::state::StateManager`]; the batch loop is the only
/// writer of the results log, control calls only flip flags.
#[derive(Debug, Clone, Default)]
pub struct RunState {
    /// Generation counter, bumped on every `start()`
    pub run_id: u64,

    pub is_processing: bool,
    pub is_paused: bool,
    pub current_folder: Option<Utf8PathBuf>,
    pub start_time: Option<DateTime<Utc>>,
    pub current_batch_index: usize,

    /// Size of the enumerated work set of the active run
    pub total_count: usize,

    pub results: Vec<ProcessedItem>,
    pub total_cost: f64,
    pub outcome: Option<RunOutcome>,
}

impl RunState {
    /// Reset everything for a new run and mark it as processing.
    pub fn begin(&mut self, folder: Utf8PathBuf, total_count: usize, now: DateTime<Utc>) -> u64 {
        let run_id = self.run_id + 1;
        *self = Self {
            run_id,
            is_processing: true,
            is_paused: false,
            current_folder: Some(folder),
            start_time: Some(now),
            current_batch_index: 0,
            total_count,
            results: Vec::new(),
            total_cost: 0.0,
            outcome: None,
        };
        run_id
    }

    /// Append an outcome to the results log, assigning the next id.
    pub fn push_result(&mut self, outcome: ItemOutcome) -> &ProcessedItem {
        let id = self.results.len() + 1;
        self.total_cost += outcome.cost;

        let (caption, status, error_message) = match outcome.result {
            Ok(caption) => (caption, ItemStatus::Success, None),
            Err(message) => (String::new(), ItemStatus::Error, Some(message)),
        };

        self.results.push(ProcessedItem {
            id,
            filename: outcome.filename,
            source_path: outcome.source_path,
            caption,
            status,
            error_message,
            timestamp: outcome.completed_at,
            cost: outcome.cost,
        });

        &self.results[id - 1]
    }

    /// Mark the run as over. Keeps the results log for later inspection.
    pub fn finish(&mut self, outcome: RunOutcome) {
        self.is_processing = false;
        self.is_paused = false;
        self.outcome = Some(outcome);
    }

    pub fn error_count(&self) -> usize {
        self.results
            .iter()
            .filter(|item| item.status == ItemStatus::Error)
            .count()
    }

    pub fn success_count(&self) -> usize {
        self.results.len() - self.error_count()
    }
}

/// Derived view of a run, computed on every `status()` call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub is_processing: bool,
    pub is_paused: bool,
    pub processed_count: usize,
    pub total_count: usize,
    pub error_count: usize,
    pub current_batch: usize,
    pub current_folder: Option<Utf8PathBuf>,
    pub start_time: Option<DateTime<Utc>>,

    /// Items per minute
    pub processing_speed: Option<f64>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub total_cost: f64,
    pub outcome: Option<RunOutcome>,
}
