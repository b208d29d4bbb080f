//! # Audio Processing Module
//!
//! Front end of the Whisper engine: decoding uploads into model-rate PCM and
//! the mel filter bank used to build log-mel features.
//!
//! ## Audio Format Requirements (after decoding):
//! - **Sample Rate**: 16kHz
//! - **Channels**: Mono
//! - **Encoding**: `f32` in `[-1.0, 1.0]`

pub mod mel;
pub mod processor;

pub use processor::{decode_to_mono_16k, TARGET_SAMPLE_RATE};
