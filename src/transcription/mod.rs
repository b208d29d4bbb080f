//! # Transcription Module
//!
//! Everything between "a request wants a model" and "the model produced text".
//!
//! ## Key Components:
//! - **engine**: the loader/model traits and the request-independent types
//! - **lifecycle**: lazy, single-flight model loading with retry after failure
//! - **worker**: the dedicated inference thread behind every model handle
//! - **model**: the candle Whisper implementation of the engine traits
//!
//! The lifecycle manager and the worker never see candle types, so the
//! concurrency guarantees are tested against stub engines.

pub mod engine;
pub mod lifecycle;
pub mod model;
pub mod worker;

#[cfg(test)]
pub mod testing;

pub use engine::{DecodeOptions, ModelSettings, RequestId};
pub use lifecycle::LifecycleManager;
pub use model::WhisperLoader;
