//! # Inference Worker
//!
//! A loaded model is moved onto a dedicated OS thread and fed through a job
//! queue. [`ModelHandle`] is the only way to reach it, so inference calls on
//! one model never overlap, and the async runtime never blocks on a forward
//! pass.
//!
//! ## Cancellation:
//! A job that has started always runs to completion. Jobs whose caller went
//! away before the worker picked them up are skipped.

use crate::transcription::engine::{DecodeOptions, RequestId, TranscriptionError, TranscriptionModel};
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info_span, warn};

type Reply = oneshot::Sender<Result<Vec<String>, TranscriptionError>>;

struct Job {
    request_id: RequestId,
    audio: Vec<u8>,
    options: DecodeOptions,
    reply: Reply,
}

/// Shared reference to a loaded model.
///
/// Cloned out of the lifecycle manager as `Arc<ModelHandle>`; dropping the
/// last reference closes the queue and stops the worker thread.
#[derive(Debug)]
pub struct ModelHandle {
    generation: u64,
    jobs: mpsc::UnboundedSender<Job>,
}

impl ModelHandle {
    /// Move `model` onto a new worker thread.
    pub fn spawn(generation: u64, model: Box<dyn TranscriptionModel>) -> std::io::Result<Self> {
        let (jobs, queue) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("inference-{}", generation))
            .spawn(move || run_worker(generation, model, queue))?;

        Ok(Self { generation, jobs })
    }

    /// Which load attempt produced this handle.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue one inference call and wait for its segments.
    pub async fn transcribe(
        &self,
        request_id: RequestId,
        audio: Vec<u8>,
        options: DecodeOptions,
    ) -> Result<Vec<String>, TranscriptionError> {
        let (reply, response) = oneshot::channel();
        self.jobs
            .send(Job {
                request_id,
                audio,
                options,
                reply,
            })
            .map_err(|_| TranscriptionError::new("Inference worker is not running"))?;

        response
            .await
            .map_err(|_| TranscriptionError::new("Inference worker stopped before replying"))?
    }
}

fn run_worker(generation: u64, mut model: Box<dyn TranscriptionModel>, mut queue: mpsc::UnboundedReceiver<Job>) {
    debug!(generation, "inference worker started");

    while let Some(job) = queue.blocking_recv() {
        let span = info_span!("inference", request_id = %job.request_id, generation);
        let _entered = span.enter();

        if job.reply.is_closed() {
            debug!("caller disconnected before inference started, skipping");
            continue;
        }

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| model.transcribe(&job.audio, &job.options)));
        let result = match outcome {
            Ok(Ok(segments)) => {
                debug!(
                    segments = segments.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "inference finished"
                );
                Ok(segments)
            }
            Ok(Err(err)) => {
                error!(request_id = %job.request_id, "inference failed: {:#}", err);
                Err(TranscriptionError::from(err))
            }
            Err(_) => {
                error!(request_id = %job.request_id, "inference panicked");
                Err(TranscriptionError::new("Inference engine panicked"))
            }
        };

        if job.reply.send(result).is_err() {
            warn!("caller disconnected during inference, result discarded");
        }
    }

    debug!(generation, "inference worker stopped");
}
