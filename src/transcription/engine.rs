//! # Inference Engine Contract
//!
//! The lifecycle manager and the request pipeline only talk to speech models
//! through the two traits in this module. The candle Whisper implementation
//! lives in [`crate::transcription::model`]; tests plug in stubs.
//!
//! ## Contract:
//! - [`ModelLoader::load`] is slow and may fail. It is called at most once per
//!   load attempt.
//! - [`TranscriptionModel::transcribe`] takes `&mut self`: engines are not
//!   assumed to be reentrant, and every call is funnelled through a single
//!   inference worker.
//! - Engines return ordered text segments that already carry their own
//!   spacing. Callers join them without a separator.

use crate::device::{DevicePreference, Precision};
use async_trait::async_trait;
use std::fmt;

/// Beam width used for every request.
pub const BEAM_SIZE: usize = 5;

/// Number of alternatives expanded per hypothesis at every decoding step.
pub const BEST_OF: usize = 5;

/// Per-request correlation id, used only for log tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Where and how to load a model. Resolved when a load attempt begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSettings {
    /// Local model directory or Hugging Face repo id.
    pub path: String,
    pub device: DevicePreference,
    pub precision: Precision,
}

/// Decoding parameters. Static for the lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeOptions {
    /// ISO 639-1 language hint ("uz", "en", ...). `None` lets the model decide.
    pub language: Option<String>,
    pub beam_size: usize,
    pub best_of: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            language: None,
            beam_size: BEAM_SIZE,
            best_of: BEST_OF,
        }
    }
}

/// A loaded speech model.
pub trait TranscriptionModel: Send + 'static {
    /// Transcribe an encoded audio file into ordered text segments.
    fn transcribe(&mut self, audio: &[u8], options: &DecodeOptions) -> anyhow::Result<Vec<String>>;
}

/// Builds a [`TranscriptionModel`] from [`ModelSettings`].
#[async_trait]
pub trait ModelLoader: Send + Sync + 'static {
    async fn load(&self, settings: ModelSettings) -> anyhow::Result<Box<dyn TranscriptionModel>>;
}

/// A model load attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadError {
    pub reason: String,
}

impl LoadError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for LoadError {}

/// Keeps the top-level message only; the full chain is logged where the
/// error is first observed.
impl From<anyhow::Error> for LoadError {
    fn from(err: anyhow::Error) -> Self {
        LoadError::new(err.to_string())
    }
}

/// A single inference call failed. Never changes the lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionError {
    pub reason: String,
}

impl TranscriptionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.reason)
    }
}

impl std::error::Error for TranscriptionError {}

impl From<anyhow::Error> for TranscriptionError {
    fn from(err: anyhow::Error) -> Self {
        TranscriptionError::new(err.to_string())
    }
}
