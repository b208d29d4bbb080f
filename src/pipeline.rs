//! # Transcription Request Pipeline
//!
//! Turns one inbound request into one outcome:
//!
//! ```text
//! Received ─► Authenticated ─► ModelAcquired ─► Transcribed ─► Responded
//!     │             │                │               │
//!     └─────────────┴────── Rejected(reason) ────────┘
//! ```
//!
//! The pipeline keeps no per-request state between calls. The only shared
//! pieces are the correlation counter and the lifecycle manager. Nothing is
//! retried automatically.

use crate::error::{AppError, AppResult};
use crate::transcription::{DecodeOptions, LifecycleManager, RequestId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Successful response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptionResult {
    pub text: String,
}

pub struct TranscriptionPipeline {
    api_token: String,
    options: DecodeOptions,
    manager: Arc<LifecycleManager>,
    next_id: AtomicU64,
}

impl TranscriptionPipeline {
    /// An empty `api_token` disables the auth gate.
    pub fn new(api_token: impl Into<String>, options: DecodeOptions, manager: Arc<LifecycleManager>) -> Self {
        Self {
            api_token: api_token.into(),
            options,
            manager,
            next_id: AtomicU64::new(0),
        }
    }

    /// Auth gate plus correlation id assignment.
    ///
    /// The key is compared byte-for-byte. Rejected requests never reach the
    /// lifecycle manager and do not consume a correlation id.
    pub fn authorize(&self, api_key: Option<&[u8]>) -> AppResult<RequestId> {
        if !self.api_token.is_empty() && api_key != Some(self.api_token.as_bytes()) {
            warn!(key_present = api_key.is_some(), "rejected request with invalid API key");
            return Err(AppError::Unauthorized("Invalid or missing API key".to_string()));
        }

        Ok(RequestId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1))
    }

    /// Acquire the model (loading it if needed) and transcribe `audio`.
    pub async fn transcribe(&self, request_id: RequestId, audio: Vec<u8>) -> AppResult<TranscriptionResult> {
        let span = info_span!("transcription", %request_id);
        self.run(request_id, audio).instrument(span).await
    }

    async fn run(&self, request_id: RequestId, audio: Vec<u8>) -> AppResult<TranscriptionResult> {
        info!(audio_bytes = audio.len(), "transcription request accepted");

        let handle = self.manager.acquire(request_id).await.map_err(|err| {
            error!(%request_id, reason = %err, "model unavailable");
            AppError::ModelUnavailable(err.reason)
        })?;

        let started = Instant::now();
        let segments = handle
            .transcribe(request_id, audio, self.options.clone())
            .await
            .map_err(|err| {
                error!(%request_id, reason = %err, "transcription failed");
                AppError::TranscriptionFailed(err.reason)
            })?;

        let text = segments.concat();
        info!(
            segments = segments.len(),
            chars = text.chars().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "transcription completed"
        );

        Ok(TranscriptionResult { text })
    }

    /// Number of requests that passed the auth gate.
    pub fn accepted_requests(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    pub fn manager(&self) -> &LifecycleManager {
        &self.manager
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_token.is_empty()
    }
}
