// AutoCaption - Batch image captioning with pluggable caption providers
//
// This is the library crate containing the orchestrator, services and data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use metrics::Metrics;
pub use models::{
    ErrorHandling, ProcessedItem, ProcessingConfig, ProgressSnapshot, ProviderConfig, RunOutcome,
    UserConfig,
};
pub use orchestrator::{BatchOrchestrator, StartError};
pub use state::{StateChange, StateManager};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
