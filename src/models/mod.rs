//! Data models for the AutoCaption application.
//!
//! - [`RunState`]: state of the current batch run (flags, results log, cost)
//! - [`ProcessedItem`]: one attempted image in the results log
//! - [`ProgressSnapshot`]: derived progress view returned by `status()`
//! - [`ProcessingConfig`], [`ProviderConfig`], [`PromptSettings`]: per-run settings
//! - [`UserConfig`]: everything loaded from `AutoCaption Config.yaml`

pub mod config;
pub mod run_state;

pub use config::{
    ErrorHandling, ProcessingConfig, PromptSettings, ProviderConfig, ProviderKind, UserConfig,
};
pub use run_state::{
    ItemOutcome, ItemStatus, ProcessedItem, ProgressSnapshot, RunOutcome, RunState,
};
