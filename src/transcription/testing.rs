//! Stub engines shared by the unit tests.

use crate::device::{DevicePreference, Precision};
use crate::transcription::engine::{DecodeOptions, ModelLoader, ModelSettings, TranscriptionModel};
use crate::transcription::lifecycle::{LifecycleManager, SettingsSource};
use anyhow::bail;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Call accounting shared by every clone of a [`StubModel`].
#[derive(Debug, Default)]
pub struct CallCounters {
    pub calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

#[derive(Debug, Clone)]
pub struct StubModel {
    output: Result<Vec<String>, String>,
    delay: Duration,
    counters: Arc<CallCounters>,
}

impl StubModel {
    pub fn segments(segments: &[&str]) -> Self {
        Self {
            output: Ok(segments.iter().map(|s| s.to_string()).collect()),
            delay: Duration::ZERO,
            counters: Arc::default(),
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            output: Err(reason.to_string()),
            delay: Duration::ZERO,
            counters: Arc::default(),
        }
    }

    pub fn with_delay_ms(mut self, millis: u64) -> Self {
        self.delay = Duration::from_millis(millis);
        self
    }

    pub fn counters(&self) -> Arc<CallCounters> {
        Arc::clone(&self.counters)
    }
}

impl TranscriptionModel for StubModel {
    fn transcribe(&mut self, _audio: &[u8], _options: &DecodeOptions) -> anyhow::Result<Vec<String>> {
        let counters = &self.counters;
        counters.calls.fetch_add(1, Ordering::SeqCst);
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        match &self.output {
            Ok(segments) => Ok(segments.clone()),
            Err(reason) => bail!("{}", reason),
        }
    }
}

/// Panics on its first call, answers "recovered" afterwards.
#[derive(Debug, Default)]
pub struct PanicOnceModel {
    panicked: bool,
}

impl TranscriptionModel for PanicOnceModel {
    fn transcribe(&mut self, _audio: &[u8], _options: &DecodeOptions) -> anyhow::Result<Vec<String>> {
        if !self.panicked {
            self.panicked = true;
            panic!("decoder state corrupted");
        }
        Ok(vec!["recovered".to_string()])
    }
}

/// Loader stub that counts loads and can fail, panic or wait on a gate.
pub struct StubLoader {
    loads: AtomicUsize,
    failures: AtomicUsize,
    panics: AtomicUsize,
    gate: Option<Arc<Notify>>,
    model: StubModel,
}

impl StubLoader {
    pub fn new(model: StubModel) -> Self {
        Self {
            loads: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            panics: AtomicUsize::new(0),
            gate: None,
            model,
        }
    }

    /// The next `count` loads fail with "device unavailable".
    pub fn failing_first(self, count: usize) -> Self {
        self.failures.store(count, Ordering::SeqCst);
        self
    }

    pub fn panicking_first(self, count: usize) -> Self {
        self.panics.store(count, Ordering::SeqCst);
        self
    }

    /// Every load waits for one `notify_one` on `gate` before finishing.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl ModelLoader for StubLoader {
    async fn load(&self, _settings: ModelSettings) -> anyhow::Result<Box<dyn TranscriptionModel>> {
        self.loads.fetch_add(1, Ordering::SeqCst);

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if take_one(&self.panics) {
            panic!("loader exploded");
        }
        if take_one(&self.failures) {
            bail!("device unavailable");
        }

        Ok(Box::new(self.model.clone()))
    }
}

pub fn cpu_settings() -> SettingsSource {
    Arc::new(|| {
        Ok(ModelSettings {
            path: "stub-model".to_string(),
            device: DevicePreference::Cpu,
            precision: Precision::F32,
        })
    })
}

pub fn manager_with(loader: &Arc<StubLoader>) -> Arc<LifecycleManager> {
    let loader: Arc<dyn ModelLoader> = loader.clone();
    Arc::new(LifecycleManager::new(loader, cpu_settings()))
}
