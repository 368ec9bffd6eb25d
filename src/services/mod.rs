//! Services module - The pieces a batch captioning run is assembled from.
//!
//! Everything here is independent of the orchestrator's state machine and can
//! be tested on its own.
//!
//! # Components
//!
//! - [`enumerator`]: Lists the images of a folder that still need a caption and
//!   derives caption sidecar paths.
//! - [`pool`]: Bounded-concurrency task pool with ordered admission,
//!   cooperative cancellation and per-item panic isolation.
//! - [`imaging`]: Decoding and colour normalisation (alpha flattened onto
//!   white) plus the encoders providers need.
//! - [`prompt`]: Prompt templates and few-shot caption examples.
//! - [`providers`]: The [`CaptionProvider`] trait and its HTTP backends.
//! - [`captioning`]: The per-item task: load, caption, write sidecar. Always
//!   resolves to an [`ItemOutcome`](crate::models::ItemOutcome).
//!
//! # Usage Example
//!
//! ```ignore
//! use autocaption::services::{BackendFactory, CaptioningService, ProviderFactory};
//!
//! let provider = BackendFactory.configure(&user_config.provider)?;
//! let service = CaptioningService::new(provider, Arc::new(prompt));
//!
//! let outcome = service.process("images/cat.png".into()).await;
//! ```

pub mod captioning;
pub mod enumerator;
pub mod imaging;
pub mod pool;
pub mod prompt;
pub mod providers;

pub use captioning::{CaptionError, CaptioningService, apply_trigger_word};
pub use enumerator::{EnumerateError, caption_path, enumerate, is_image_file, read_caption};
pub use pool::{BoundedRun, Completion, PoolError, run_bounded, spawn_bounded};
pub use prompt::{ExamplePair, PromptContext, load_examples};
pub use providers::{
    BackendFactory, Caption, CaptionProvider, ProviderError, ProviderFactory,
};
