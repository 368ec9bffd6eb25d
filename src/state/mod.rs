// State management module
//
// This module provides the StateManager which wraps RunState with thread-safe access
// using Arc<RwLock<T>> and emits change events for push-style consumers.

use crate::models::{ItemOutcome, ItemStatus, ProcessedItem, RunOutcome, RunState};
use camino::Utf8PathBuf;
use chrono::Utc;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::broadcast;

/// Change events emitted when run state is modified
#[derive(Clone, Debug, PartialEq)]
pub enum StateChange {
    /// A new run has been started
    RunStarted {
        run_id: u64,
        total: usize,
    },

    /// The batch loop moved on to the next chunk
    BatchStarted {
        batch_index: usize,
    },

    /// An item was appended to the results log
    ItemProcessed {
        id: usize,
        filename: String,
        status: ItemStatus,
    },

    Paused,

    Resumed,

    /// The run is no longer processing
    RunFinished {
        outcome: Option<RunOutcome>,
        processed: usize,
        errors: usize,
    },
}

/// The fields of [`RunState`] that change detection compares.
///
/// The results log is append-only within a run, so its length is enough.
#[derive(Clone, Copy)]
struct Observed {
    run_id: u64,
    is_processing: bool,
    is_paused: bool,
    current_batch_index: usize,
    result_count: usize,
}

impl From<&RunState> for Observed {
    fn from(state: &RunState) -> Self {
        Self {
            run_id: state.run_id,
            is_processing: state.is_processing,
            is_paused: state.is_paused,
            current_batch_index: state.current_batch_index,
            result_count: state.results.len(),
        }
    }
}

/// Thread-safe run state with event emission
///
/// - [`read()`](Self::read) / [`snapshot()`](Self::snapshot) for readers such as `status()`
/// - [`update()`](Self::update) for mutations with automatic event emission
/// - run-scoped helpers (`record_item`, `start_batch`, `finish_run`) that ignore
///   writes from a run that is no longer the current one
#[derive(Clone)]
pub struct StateManager {
    state: Arc<RwLock<RunState>>,

    /// Broadcast channel for emitting state change events
    state_tx: broadcast::Sender<StateChange>,
}

impl StateManager {
    /// Create a new StateManager with an idle run state
    ///
    /// # Returns
    /// A new StateManager with a broadcast channel buffer of 256 events
    pub fn new() -> Self {
        let (state_tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(RunState::default())),
            state_tx,
        }
    }

    /// Clone the whole run state
    pub fn snapshot(&self) -> RunState {
        self.read(|state| state.clone())
    }

    /// Execute a function with read access to the state
    ///
    /// A poisoned lock is recovered rather than propagated, so readers never panic.
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&RunState) -> R,
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&state)
    }

    /// Update the state and emit change events
    ///
    /// # Returns
    /// The events that were emitted
    pub fn update<F>(&self, update_fn: F) -> Vec<StateChange>
    where
        F: FnOnce(&mut RunState),
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let old_state = Observed::from(&*state);

        update_fn(&mut state);

        let changes = Self::detect_changes(&old_state, &state);
        for change in &changes {
            // Nobody listening is fine
            let _ = self.state_tx.send(change.clone());
        }

        changes
    }

    /// Subscribe to state change events
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.state_tx.subscribe()
    }

    fn detect_changes(old: &Observed, new: &RunState) -> Vec<StateChange> {
        let mut changes = Vec::new();

        if !old.is_processing && new.is_processing {
            changes.push(StateChange::RunStarted {
                run_id: new.run_id,
                total: new.total_count,
            });
        }

        if new.current_batch_index > old.current_batch_index && new.run_id == old.run_id {
            changes.push(StateChange::BatchStarted {
                batch_index: new.current_batch_index,
            });
        }

        if new.run_id == old.run_id && new.results.len() > old.result_count {
            for item in &new.results[old.result_count..] {
                changes.push(StateChange::ItemProcessed {
                    id: item.id,
                    filename: item.filename.clone(),
                    status: item.status,
                });
            }
        }

        if new.is_processing && old.is_paused != new.is_paused {
            changes.push(if new.is_paused {
                StateChange::Paused
            } else {
                StateChange::Resumed
            });
        }

        if old.is_processing && !new.is_processing {
            changes.push(StateChange::RunFinished {
                outcome: new.outcome,
                processed: new.results.len(),
                errors: new.error_count(),
            });
        }

        changes
    }

    // Run-scoped helpers

    /// Reset the state for a new run and return its generation id
    pub fn begin_run(&self, folder: Utf8PathBuf, total: usize) -> u64 {
        let mut run_id = 0;
        self.update(|state| {
            run_id = state.begin(folder, total, Utc::now());
        });
        run_id
    }

    /// Whether `run_id` is the current run and still processing
    pub fn is_active(&self, run_id: u64) -> bool {
        self.read(|state| state.run_id == run_id && state.is_processing)
    }

    /// Apply `f` only while `run_id` is the current, still-processing run
    fn update_active<F, R>(&self, run_id: u64, f: F) -> Option<R>
    where
        F: FnOnce(&mut RunState) -> R,
    {
        let mut result = None;
        self.update(|state| {
            if state.run_id == run_id && state.is_processing {
                result = Some(f(state));
            }
        });
        result
    }

    /// Advance the batch counter, returning the new 1-based batch index
    pub fn start_batch(&self, run_id: u64) -> Option<usize> {
        self.update_active(run_id, |state| {
            state.current_batch_index += 1;
            state.current_batch_index
        })
    }

    /// Append an item to the results log
    ///
    /// Returns `None` (and drops the outcome) once the run has been stopped.
    pub fn record_item(&self, run_id: u64, outcome: ItemOutcome) -> Option<ProcessedItem> {
        self.update_active(run_id, |state| state.push_result(outcome).clone())
    }

    /// End the run with `outcome` unless something else ended it first
    pub fn finish_run(&self, run_id: u64, outcome: RunOutcome) -> bool {
        self.update_active(run_id, |state| state.finish(outcome))
            .is_some()
    }

    /// End whatever run is active as stopped by the user
    ///
    /// Returns the id of the run that was ended, if any.
    pub fn stop_run(&self) -> Option<u64> {
        let mut stopped = None;
        self.update(|state| {
            if state.is_processing {
                state.finish(RunOutcome::StoppedByUser);
                stopped = Some(state.run_id);
            }
        });
        stopped
    }

    /// Set the pause flag of the active run, returning whether it changed
    pub fn set_paused(&self, paused: bool) -> bool {
        let mut changed = false;
        self.update(|state| {
            if state.is_processing && state.is_paused != paused {
                state.is_paused = paused;
                changed = true;
            }
        });
        changed
    }
}

impl Default for StateManager {
    fn default() -> Self {
        Self::new()
    }
}
