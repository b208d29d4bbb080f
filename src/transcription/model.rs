//! # Whisper Model (candle)
//!
//! The production implementation of [`ModelLoader`] and [`TranscriptionModel`].
//!
//! ## Model Loading Process:
//! 1. Locate `config.json`, `tokenizer.json` and `model.safetensors`, either in
//!    a local directory or by downloading them from the Hugging Face hub
//! 2. Pick the compute device and precision
//! 3. Memory-map the weights and build the network
//! 4. Run one second of silence through the model as a smoke test
//!
//! ## Transcription:
//! Audio is decoded to 16 kHz mono, converted to log-mel features and cut
//! into 30-second windows that overlap their neighbours by 5 seconds on
//! each side. Each window is beam-search decoded, the token sequences of
//! neighbouring windows are stitched where they agree, and each window's
//! share becomes one text segment. Segments keep the leading space the
//! tokenizer produces, so they can be joined as-is.

use crate::audio::{self, mel};
use crate::device::DeviceManager;
use crate::transcription::engine::{DecodeOptions, ModelLoader, ModelSettings, TranscriptionModel};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, Config};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;

/// Mel frames shared with each neighbouring window (5 s at 100 frames/s).
const STRIDE_FRAMES: usize = 5 * m::SAMPLE_RATE / m::HOP_LENGTH;

/// Loads Whisper checkpoints in the Hugging Face layout.
#[derive(Debug, Default, Clone)]
pub struct WhisperLoader;

#[async_trait]
impl ModelLoader for WhisperLoader {
    async fn load(&self, settings: ModelSettings) -> Result<Box<dyn TranscriptionModel>> {
        let files = ModelFiles::locate(&settings.path).await?;
        let model = tokio::task::spawn_blocking(move || WhisperModel::from_files(&files, &settings))
            .await
            .context("Model loading task failed")??;
        Ok(Box::new(model))
    }
}

/// Paths of the three artifacts a checkpoint needs.
#[derive(Debug, Clone)]
struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

impl ModelFiles {
    async fn locate(path: &str) -> Result<Self> {
        let dir = Path::new(path);
        if dir.is_dir() {
            let files = Self {
                config: dir.join("config.json"),
                tokenizer: dir.join("tokenizer.json"),
                weights: dir.join("model.safetensors"),
            };
            for file in [&files.config, &files.tokenizer, &files.weights] {
                if !file.is_file() {
                    bail!("Model directory is missing {}", file.display());
                }
            }
            tracing::info!(path = %dir.display(), "using local model directory");
            return Ok(files);
        }

        Self::download(path).await
    }

    /// Fetch the artifacts from the hub, honouring `HF_TOKEN`, `HF_HUB_CACHE`
    /// and `HF_HOME`. Files already in the cache are not downloaded again.
    async fn download(repo_id: &str) -> Result<Self> {
        use hf_hub::api::tokio::ApiBuilder;

        let mut builder = ApiBuilder::new()
            .with_progress(false)
            .with_token(std::env::var("HF_TOKEN").ok());

        if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
            builder = builder.with_cache_dir(cache_dir.into());
        } else if let Ok(hf_home) = std::env::var("HF_HOME") {
            builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
        }

        let api = builder.build().context("Failed to create Hugging Face API client")?;
        let repo = api.model(repo_id.to_string());

        tracing::info!(repo = repo_id, "fetching model files from Hugging Face");
        let config = repo
            .get("config.json")
            .await
            .with_context(|| format!("Failed to download config.json from {}", repo_id))?;
        let tokenizer = repo
            .get("tokenizer.json")
            .await
            .with_context(|| format!("Failed to download tokenizer.json from {}", repo_id))?;
        let weights = repo
            .get("model.safetensors")
            .await
            .with_context(|| format!("Failed to download model.safetensors from {}", repo_id))?;

        Ok(Self {
            config,
            tokenizer,
            weights,
        })
    }
}

/// Token ids the decoder prompt is built from.
#[derive(Debug, Clone, Copy)]
struct SpecialTokens {
    sot: u32,
    eot: u32,
    transcribe: u32,
    no_timestamps: u32,
}

impl SpecialTokens {
    fn from_tokenizer(tokenizer: &Tokenizer) -> Result<Self> {
        Ok(Self {
            sot: token_id(tokenizer, m::SOT_TOKEN)?,
            eot: token_id(tokenizer, m::EOT_TOKEN)?,
            transcribe: token_id(tokenizer, m::TRANSCRIBE_TOKEN)?,
            no_timestamps: token_id(tokenizer, m::NO_TIMESTAMPS_TOKEN)?,
        })
    }
}

fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| anyhow!("Tokenizer has no id for {}", token))
}

/// One beam-search hypothesis: prompt plus generated tokens.
#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<u32>,
    logprob: f32,
}

/// A loaded Whisper model ready for transcription.
///
/// Not reentrant: the decoder keeps per-call caches, hence `&mut self`.
pub struct WhisperModel {
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    mel_filters: Vec<f32>,
    device: Device,
    dtype: DType,
}

impl WhisperModel {
    fn from_files(files: &ModelFiles, settings: &ModelSettings) -> Result<Self> {
        let started = Instant::now();

        let config: Config = serde_json::from_reader(
            std::fs::File::open(&files.config).with_context(|| format!("Failed to open {}", files.config.display()))?,
        )
        .context("Invalid model config.json")?;
        let tokenizer =
            Tokenizer::from_file(&files.tokenizer).map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;
        let tokens = SpecialTokens::from_tokenizer(&tokenizer)?;

        let device = DeviceManager::get_device(settings.device)?;
        let dtype = settings.precision.dtype();
        tracing::info!(
            device = DeviceManager::get_device_info(&device),
            precision = %settings.precision,
            "loading model weights"
        );

        // SAFETY: the weights file is memory-mapped read-only and is not
        // modified while the model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &device)? };
        let model = m::model::Whisper::load(&vb, config.clone()).context("Failed to build Whisper network")?;
        let mel_filters = mel::filter_bank(config.num_mel_bins, m::N_FFT, m::SAMPLE_RATE);

        let mut whisper_model = Self {
            model,
            config,
            tokenizer,
            tokens,
            mel_filters,
            device,
            dtype,
        };
        whisper_model.validate()?;

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Whisper model loaded and validated"
        );
        Ok(whisper_model)
    }

    /// Run one second of silence through the network.
    fn validate(&mut self) -> Result<()> {
        let silence = vec![0.0f32; audio::TARGET_SAMPLE_RATE as usize];
        let options = DecodeOptions {
            beam_size: 1,
            best_of: 1,
            ..DecodeOptions::default()
        };
        let segments = self
            .transcribe_pcm(&silence, &options)
            .context("Model validation failed")?;
        tracing::debug!(?segments, "model validation output");
        Ok(())
    }

    fn transcribe_pcm(&mut self, pcm: &[f32], options: &DecodeOptions) -> Result<Vec<String>> {
        if pcm.is_empty() {
            bail!("Audio contains no samples");
        }

        let n_mels = self.config.num_mel_bins;
        let mel = m::audio::pcm_to_mel(&self.config, pcm, &self.mel_filters);
        let total_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, total_frames), &self.device)?.to_dtype(self.dtype)?;

        let content_frames = (pcm.len() / m::HOP_LENGTH).clamp(1, total_frames);
        let prompt = self.prompt(options.language.as_deref())?;

        let advance = m::N_FRAMES - 2 * STRIDE_FRAMES;
        let mut windows = Vec::new();
        let mut seek = 0;
        loop {
            let window = (total_frames - seek).min(m::N_FRAMES);
            let features = self.model.encoder.forward(&mel.narrow(2, seek, window)?, true)?;
            let generated = self.beam_search(&features, &prompt, options)?;
            tracing::debug!(seek, window, tokens = generated.len(), "decoded window");
            windows.push(generated);

            if seek + m::N_FRAMES >= content_frames {
                break;
            }
            seek += advance;
        }

        stitch_windows(&windows)
            .into_iter()
            .map(|tokens| {
                self.tokenizer
                    .decode(tokens, true)
                    .map_err(|e| anyhow!("Tokenizer decode error: {}", e))
            })
            .collect()
    }

    fn prompt(&self, language: Option<&str>) -> Result<Vec<u32>> {
        let mut prompt = vec![self.tokens.sot];
        if let Some(language) = language {
            let id = self
                .tokenizer
                .token_to_id(&format!("<|{}|>", language.to_lowercase()))
                .ok_or_else(|| anyhow!("Language '{}' is not supported by this model", language))?;
            prompt.push(id);
        }
        prompt.push(self.tokens.transcribe);
        prompt.push(self.tokens.no_timestamps);
        Ok(prompt)
    }

    /// Beam search over one window.
    ///
    /// `beam_size` hypotheses survive each step; each is expanded with its
    /// `best_of` most likely next tokens. Finished hypotheses are ranked by
    /// length-normalised log probability.
    fn beam_search(&mut self, features: &Tensor, prompt: &[u32], options: &DecodeOptions) -> Result<Vec<u32>> {
        let beam_size = options.beam_size.max(1);
        let expansions = options.best_of.max(1);
        let max_steps = self.config.max_target_positions / 2;

        let mut beams = vec![Hypothesis {
            tokens: prompt.to_vec(),
            logprob: 0.0,
        }];
        let mut finished = Vec::new();

        for _ in 0..max_steps {
            let mut candidates = Vec::with_capacity(beams.len() * expansions);
            for beam in &beams {
                let logprobs = self.next_token_logprobs(features, &beam.tokens)?;
                for (token, logprob) in top_k(&logprobs, expansions) {
                    let mut tokens = beam.tokens.clone();
                    tokens.push(token);
                    candidates.push(Hypothesis {
                        tokens,
                        logprob: beam.logprob + logprob,
                    });
                }
            }
            candidates.sort_by(|a, b| b.logprob.total_cmp(&a.logprob));

            beams.clear();
            for candidate in candidates {
                if beams.len() >= beam_size {
                    break;
                }
                if candidate.tokens.last() == Some(&self.tokens.eot) {
                    finished.push(candidate);
                } else {
                    beams.push(candidate);
                }
            }

            if beams.is_empty() || finished.len() >= beam_size {
                break;
            }
        }

        finished.extend(beams);
        let best = best_hypothesis(&finished, prompt.len())
            .ok_or_else(|| anyhow!("Decoder produced no hypotheses"))?;

        Ok(best.tokens[prompt.len()..]
            .iter()
            .copied()
            .filter(|&t| t != self.tokens.eot)
            .collect())
    }

    fn next_token_logprobs(&mut self, features: &Tensor, tokens: &[u32]) -> Result<Vec<f32>> {
        let tokens_t = Tensor::new(tokens, &self.device)?.unsqueeze(0)?;
        let ys = self.model.decoder.forward(&tokens_t, features, true)?;
        let (_, seq_len, _) = ys.dims3()?;
        let logits = self
            .model
            .decoder
            .final_linear(&ys.i((..1, seq_len - 1..))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?;
        let mut logprobs = candle_nn::ops::log_softmax(&logits, D::Minus1)?.to_vec1::<f32>()?;

        // no timestamps, no configured suppressions
        let first_timestamp = self.tokens.no_timestamps as usize + 1;
        for logprob in logprobs.iter_mut().skip(first_timestamp) {
            *logprob = f32::NEG_INFINITY;
        }
        for &token in &self.config.suppress_tokens {
            if let Some(logprob) = logprobs.get_mut(token as usize) {
                *logprob = f32::NEG_INFINITY;
            }
        }
        Ok(logprobs)
    }
}

impl TranscriptionModel for WhisperModel {
    fn transcribe(&mut self, audio: &[u8], options: &DecodeOptions) -> Result<Vec<String>> {
        let pcm = audio::decode_to_mono_16k(audio)?;
        tracing::debug!(
            seconds = pcm.len() as f64 / audio::TARGET_SAMPLE_RATE as f64,
            "decoded upload"
        );
        self.transcribe_pcm(&pcm, options)
    }
}

/// The `k` most likely finite entries, best first.
fn top_k(logprobs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = logprobs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(i, &lp)| (i as u32, lp))
        .collect();

    if k < ranked.len() {
        ranked.select_nth_unstable_by(k, |a, b| b.1.total_cmp(&a.1));
        ranked.truncate(k);
    }
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    ranked
}

/// Where two overlapping token sequences should be cut so their shared
/// stretch is kept once: `(end of left, start of right)`.
///
/// Every relative offset is scored by the fraction of aligned tokens that
/// agree; the cut falls in the middle of the best-scoring overlap. `None`
/// when no offset has at least two agreeing tokens.
fn overlap_cut(left: &[u32], right: &[u32]) -> Option<(usize, usize)> {
    let (l, r) = (left.len(), right.len());
    let mut best = None;
    let mut best_score = 0.0;

    for offset in 1..l + r {
        let left_start = l.saturating_sub(offset);
        let left_stop = (l + r - offset).min(l);
        let right_start = offset.saturating_sub(l);
        let right_stop = offset.min(r);

        let matches = left[left_start..left_stop]
            .iter()
            .zip(&right[right_start..right_stop])
            .filter(|(a, b)| a == b)
            .count();
        // small bias towards longer overlaps on ties
        let score = matches as f64 / offset as f64 + offset as f64 / 10_000.0;
        if matches > 1 && score > best_score {
            best_score = score;
            best = Some(((left_start + left_stop) / 2, (right_start + right_stop) / 2));
        }
    }

    best
}

/// Trim each window's tokens so consecutive windows do not repeat the
/// audio they share.
fn stitch_windows(windows: &[Vec<u32>]) -> Vec<&[u32]> {
    let mut bounds: Vec<(usize, usize)> = windows.iter().map(|w| (0, w.len())).collect();
    for i in 1..windows.len() {
        if let Some((left_end, right_start)) = overlap_cut(&windows[i - 1], &windows[i]) {
            bounds[i - 1].1 = left_end.max(bounds[i - 1].0);
            bounds[i].0 = right_start;
        }
    }

    windows
        .iter()
        .zip(bounds)
        .map(|(tokens, (start, end))| &tokens[start..end])
        .collect()
}

fn best_hypothesis(hypotheses: &[Hypothesis], prompt_len: usize) -> Option<&Hypothesis> {
    let score = |h: &Hypothesis| h.logprob / (h.tokens.len().saturating_sub(prompt_len).max(1) as f32);
    hypotheses.iter().max_by(|a, b| score(a).total_cmp(&score(b)))
}
