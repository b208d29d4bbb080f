//! # Model Lifecycle Manager
//!
//! Owns the one speech model of the process and its state machine:
//!
//! ```text
//! Uninitialized ──► Loading ──► Ready
//!                     │
//!                     └──────► Failed ──► Loading (next acquire)
//! ```
//!
//! ## Single-flight loading:
//! The caller that finds the state `Uninitialized` or `Failed` starts a load
//! attempt and parks in `Loading` a `watch` receiver for its outcome. Every
//! caller arriving while the attempt runs clones that receiver and waits on
//! it, so all racers observe the same result and the loader runs once.
//!
//! ## Cancellation:
//! The attempt runs in its own task. If the caller that started it goes away,
//! the load still finishes and publishes for everybody else. If the task
//! itself is dropped before finishing (its runtime shut down), the attempt
//! is recorded as `Failed` so the next caller starts a fresh one.
//!
//! ## Locking:
//! The state mutex is only held for the transitions themselves, never across
//! an `.await`, so status reads stay cheap while a load or an inference runs.

use crate::transcription::engine::{LoadError, ModelLoader, ModelSettings, RequestId};
use crate::transcription::worker::ModelHandle;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, Instrument};

/// Produces the model settings when a load attempt begins.
pub type SettingsSource = Arc<dyn Fn() -> anyhow::Result<ModelSettings> + Send + Sync>;

type LoadOutcome = Result<Arc<ModelHandle>, LoadError>;

enum LifecycleState {
    Uninitialized,
    Loading {
        attempt: u64,
        outcome: watch::Receiver<Option<LoadOutcome>>,
    },
    Ready(Arc<ModelHandle>),
    Failed(LoadError),
}

/// Point-in-time view of the lifecycle state, for the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LifecycleStatus {
    Uninitialized,
    Loading { attempt: u64 },
    Ready { generation: u64 },
    Failed { reason: String },
}

pub struct LifecycleManager {
    loader: Arc<dyn ModelLoader>,
    settings: SettingsSource,
    state: Arc<Mutex<LifecycleState>>,
    attempts: AtomicU64,
    /// Settings resolved by the most recent attempt
    last_settings: Arc<Mutex<Option<ModelSettings>>>,
}

fn lock(state: &Mutex<LifecycleState>) -> MutexGuard<'_, LifecycleState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LifecycleManager {
    /// Create a manager in the `Uninitialized` state. Nothing is loaded and
    /// `settings` is not consulted until the first [`acquire`](Self::acquire).
    pub fn new(loader: Arc<dyn ModelLoader>, settings: SettingsSource) -> Self {
        Self {
            loader,
            settings,
            state: Arc::new(Mutex::new(LifecycleState::Uninitialized)),
            attempts: AtomicU64::new(0),
            last_settings: Arc::new(Mutex::new(None)),
        }
    }

    /// Get the loaded model, loading it first if nobody has yet.
    ///
    /// ## Behaviour by state:
    /// - `Ready`: returns the published handle immediately
    /// - `Loading`: waits for the in-flight attempt and shares its outcome
    /// - `Uninitialized` / `Failed`: starts a new attempt and waits for it
    ///
    /// A failed attempt is not retried within this call; the next call retries.
    pub async fn acquire(&self, request_id: RequestId) -> Result<Arc<ModelHandle>, LoadError> {
        let (attempt, mut outcome) = {
            let mut state = lock(&self.state);
            match &*state {
                LifecycleState::Ready(handle) => return Ok(Arc::clone(handle)),
                LifecycleState::Loading { attempt, outcome } => {
                    debug!(%request_id, attempt, "waiting for in-flight model load");
                    (*attempt, outcome.clone())
                }
                LifecycleState::Uninitialized | LifecycleState::Failed(_) => {
                    if let LifecycleState::Failed(previous) = &*state {
                        info!(%request_id, previous = %previous, "retrying model load after failure");
                    }
                    let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    let (publish, outcome) = watch::channel(None);
                    *state = LifecycleState::Loading {
                        attempt,
                        outcome: outcome.clone(),
                    };
                    self.spawn_attempt(request_id, attempt, publish);
                    (attempt, outcome)
                }
            }
        };

        let published = match outcome.wait_for(Option::is_some).await {
            Ok(published) => published,
            Err(_) => {
                let err = LoadError::new("Model load ended without publishing a result");
                settle_state(&self.state, attempt, &Err(err.clone()));
                return Err(err);
            }
        };

        match &*published {
            Some(result) => result.clone(),
            None => Err(LoadError::new("Model load ended without publishing a result")),
        }
    }

    fn spawn_attempt(&self, request_id: RequestId, attempt: u64, publish: watch::Sender<Option<LoadOutcome>>) {
        let loader = Arc::clone(&self.loader);
        let settings = Arc::clone(&self.settings);
        let last_settings = Arc::clone(&self.last_settings);
        let guard = AttemptGuard {
            state: Arc::clone(&self.state),
            publish,
            attempt,
            finished: false,
        };
        let span = info_span!("model_load", attempt, initiated_by = %request_id);

        tokio::spawn(
            async move {
                let started = Instant::now();
                let load = load_attempt(loader, settings, last_settings, attempt);

                // The inner task isolates loader panics so waiters always get an answer.
                let result = match tokio::spawn(load.in_current_span()).await {
                    Ok(result) => result,
                    Err(join_error) => {
                        error!("model loader aborted: {}", join_error);
                        Err(LoadError::new("Model loader panicked"))
                    }
                };

                match &result {
                    Ok(_) => info!(elapsed_ms = started.elapsed().as_millis() as u64, "model ready"),
                    Err(err) => error!(elapsed_ms = started.elapsed().as_millis() as u64, reason = %err, "model load failed"),
                }

                guard.finish(result);
            }
            .instrument(span),
        );
    }

    pub fn status(&self) -> LifecycleStatus {
        match &*lock(&self.state) {
            LifecycleState::Uninitialized => LifecycleStatus::Uninitialized,
            LifecycleState::Loading { attempt, .. } => LifecycleStatus::Loading { attempt: *attempt },
            LifecycleState::Ready(handle) => LifecycleStatus::Ready {
                generation: handle.generation(),
            },
            LifecycleState::Failed(err) => LifecycleStatus::Failed {
                reason: err.reason.clone(),
            },
        }
    }

    /// Number of load attempts started since the process began.
    pub fn load_attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Settings the most recent attempt resolved, `None` before the first
    /// load or when resolving them failed.
    pub fn last_settings(&self) -> Option<ModelSettings> {
        self.last_settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Move `attempt` out of `Loading`. A newer attempt's state is left alone.
fn settle_state(state: &Mutex<LifecycleState>, attempt: u64, result: &LoadOutcome) {
    let mut state = lock(state);
    if matches!(&*state, LifecycleState::Loading { attempt: current, .. } if *current == attempt) {
        *state = match result {
            Ok(handle) => LifecycleState::Ready(Arc::clone(handle)),
            Err(err) => LifecycleState::Failed(err.clone()),
        };
    }
}

/// Owned by the attempt task. Publishes a failure if the task is dropped
/// before it reaches [`finish`](Self::finish).
struct AttemptGuard {
    state: Arc<Mutex<LifecycleState>>,
    publish: watch::Sender<Option<LoadOutcome>>,
    attempt: u64,
    finished: bool,
}

impl AttemptGuard {
    fn finish(mut self, result: LoadOutcome) {
        self.settle(result);
        self.finished = true;
    }

    fn settle(&self, result: LoadOutcome) {
        settle_state(&self.state, self.attempt, &result);
        self.publish.send_replace(Some(result));
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.finished {
            error!(attempt = self.attempt, "model load interrupted before it finished");
            self.settle(Err(LoadError::new("Model load was interrupted before it finished")));
        }
    }
}

async fn load_attempt(
    loader: Arc<dyn ModelLoader>,
    settings: SettingsSource,
    last_settings: Arc<Mutex<Option<ModelSettings>>>,
    attempt: u64,
) -> LoadOutcome {
    let resolved = (settings)();
    *last_settings.lock().unwrap_or_else(PoisonError::into_inner) = resolved.as_ref().ok().cloned();
    let settings = resolved.map_err(|err| {
        error!("failed to resolve model settings: {:#}", err);
        LoadError::from(err)
    })?;

    info!(
        path = %settings.path,
        device = %settings.device,
        precision = %settings.precision,
        "loading speech model"
    );

    let model = loader.load(settings).await.map_err(|err| {
        error!("model loader failed: {:#}", err);
        LoadError::from(err)
    })?;

    let handle = ModelHandle::spawn(attempt, model)
        .map_err(|err| LoadError::new(format!("Failed to start inference worker: {}", err)))?;

    Ok(Arc::new(handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DevicePreference, Precision};
    use crate::transcription::testing::{manager_with, StubLoader, StubModel};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Notify;

    async fn wait_until_loading(manager: &LifecycleManager) {
        for _ in 0..200 {
            if matches!(manager.status(), LifecycleStatus::Loading { .. }) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("manager never entered Loading");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_acquires_load_once() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])).gated(gate.clone()));
        let manager = manager_with(&loader);

        let mut tasks = Vec::new();
        for i in 0..16 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.acquire(RequestId(i)).await }));
        }

        wait_until_loading(&manager).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(loader.load_count(), 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        assert_eq!(manager.status(), LifecycleStatus::Ready { generation: 1 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_acquires_share_failure() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(
            StubLoader::new(StubModel::segments(&["x"]))
                .failing_first(1)
                .gated(gate.clone()),
        );
        let manager = manager_with(&loader);

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move { manager.acquire(RequestId(i)).await }));
        }

        wait_until_loading(&manager).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.reason, "device unavailable");
        }
        assert_eq!(loader.load_count(), 1);
        assert_eq!(
            manager.status(),
            LifecycleStatus::Failed {
                reason: "device unavailable".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_ready_returns_same_handle_without_reload() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let manager = manager_with(&loader);

        let first = manager.acquire(RequestId(1)).await.unwrap();
        for i in 2..10 {
            let again = manager.acquire(RequestId(i)).await.unwrap();
            assert!(Arc::ptr_eq(&first, &again));
        }

        assert_eq!(loader.load_count(), 1);
        assert_eq!(manager.load_attempts(), 1);
    }

    #[tokio::test]
    async fn test_failed_load_retries_on_next_call() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])).failing_first(1));
        let manager = manager_with(&loader);

        let err = manager.acquire(RequestId(1)).await.unwrap_err();
        assert_eq!(err.reason, "device unavailable");
        assert_eq!(loader.load_count(), 1);

        let handle = manager.acquire(RequestId(2)).await.unwrap();
        assert_eq!(loader.load_count(), 2);
        assert_eq!(handle.generation(), 2);
        assert_eq!(manager.status(), LifecycleStatus::Ready { generation: 2 });
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_after_failure_is_single_flight() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(
            StubLoader::new(StubModel::segments(&["x"]))
                .failing_first(1)
                .gated(gate.clone()),
        );
        let manager = manager_with(&loader);

        gate.notify_one();
        assert!(manager.acquire(RequestId(1)).await.is_err());

        let a = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire(RequestId(2)).await }
        });
        let b = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire(RequestId(3)).await }
        });

        wait_until_loading(&manager).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_initiator_does_not_strand_waiters() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])).gated(gate.clone()));
        let manager = manager_with(&loader);

        let initiator = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire(RequestId(1)).await }
        });
        wait_until_loading(&manager).await;
        initiator.abort();
        assert!(initiator.await.unwrap_err().is_cancelled());

        let waiter = tokio::spawn({
            let manager = Arc::clone(&manager);
            async move { manager.acquire(RequestId(2)).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(loader.load_count(), 1);
    }

    #[test]
    fn test_load_interrupted_by_runtime_shutdown_is_retried() {
        let gate = Arc::new(Notify::new());
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])).gated(gate.clone()));
        let manager = manager_with(&loader);

        let first = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        first.block_on(async {
            let initiator = Arc::clone(&manager);
            tokio::spawn(async move { initiator.acquire(RequestId(1)).await });
            for _ in 0..200 {
                if loader.load_count() == 1 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
        assert_eq!(loader.load_count(), 1);
        drop(first);

        assert!(matches!(manager.status(), LifecycleStatus::Failed { .. }));

        let second = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        gate.notify_one();
        let handle = second.block_on(manager.acquire(RequestId(2))).unwrap();

        assert_eq!(handle.generation(), 2);
        assert_eq!(loader.load_count(), 2);
        assert_eq!(manager.status(), LifecycleStatus::Ready { generation: 2 });
    }

    #[tokio::test]
    async fn test_last_settings_reflect_the_latest_attempt() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let manager = manager_with(&loader);
        assert_eq!(manager.last_settings(), None);

        manager.acquire(RequestId(1)).await.unwrap();
        let settings = manager.last_settings().unwrap();
        assert_eq!(settings.path, "stub-model");
        assert_eq!(settings.device, DevicePreference::Cpu);
    }

    #[tokio::test]
    async fn test_loader_panic_becomes_load_error() {
        let loader = Arc::new(StubLoader::new(StubModel::segments(&["x"])).panicking_first(1));
        let manager = manager_with(&loader);

        let err = manager.acquire(RequestId(1)).await.unwrap_err();
        assert!(err.reason.contains("panicked"));
        assert!(matches!(manager.status(), LifecycleStatus::Failed { .. }));

        assert!(manager.acquire(RequestId(2)).await.is_ok());
    }

    #[tokio::test]
    async fn test_settings_resolved_when_load_starts() {
        let resolved = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&resolved);
        let settings: SettingsSource = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ModelSettings {
                path: "stub-model".to_string(),
                device: DevicePreference::Cpu,
                precision: Precision::F32,
            })
        });
        let loader: Arc<dyn ModelLoader> = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let manager = LifecycleManager::new(loader, settings);

        assert_eq!(resolved.load(Ordering::SeqCst), 0);
        assert_eq!(manager.status(), LifecycleStatus::Uninitialized);

        manager.acquire(RequestId(1)).await.unwrap();
        manager.acquire(RequestId(2)).await.unwrap();
        assert_eq!(resolved.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_settings_error_fails_the_attempt() {
        let settings: SettingsSource = Arc::new(|| Err(anyhow::anyhow!("Unknown precision: f8")));
        let stub = Arc::new(StubLoader::new(StubModel::segments(&["x"])));
        let loader: Arc<dyn ModelLoader> = stub.clone();
        let manager = LifecycleManager::new(loader, settings);

        let err = manager.acquire(RequestId(1)).await.unwrap_err();
        assert_eq!(err.reason, "Unknown precision: f8");
        assert_eq!(stub.load_count(), 0);
    }
}
