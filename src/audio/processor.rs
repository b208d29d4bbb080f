//! # Audio Decoding and Conversion
//!
//! Turns an uploaded audio file into the 16 kHz mono `f32` samples Whisper
//! expects.
//!
//! ## Supported input:
//! - Containers: WAV, FLAC, MP3, Ogg, MP4/M4A, Matroska/WebM
//! - Codecs: PCM, FLAC, MP3, AAC, Vorbis
//! - Any channel count (down-mixed by averaging) and any sample rate
//!   (linearly resampled)
//!
//! The container is detected from the bytes themselves; uploads carry no
//! reliable file extension.

use anyhow::{anyhow, bail, Context, Result};
use std::io::Cursor;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::debug;

/// Sample rate the speech model is trained on.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Decode an uploaded file into 16 kHz mono samples in `[-1.0, 1.0]`.
pub fn decode_to_mono_16k(bytes: &[u8]) -> Result<Vec<f32>> {
    let stream = MediaSourceStream::new(Box::new(Cursor::new(bytes.to_vec())), Default::default());

    let detected = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .context("Unsupported or malformed audio file")?;
    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| anyhow!("Audio file contains no audio track"))?;
    let track_id = track.id;
    let source_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| anyhow!("Audio track does not declare a sample rate"))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .context("Unsupported audio codec")?;

    let mut mono = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(anyhow!("Failed to read audio packet: {}", e)),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                debug!("skipping corrupt audio packet: {}", e);
                continue;
            }
            Err(e) => return Err(anyhow!("Failed to decode audio: {}", e)),
        };

        let spec = *decoded.spec();
        let mut samples = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        samples.copy_interleaved_ref(decoded);
        mono.extend(downmix(samples.samples(), spec.channels.count()));
    }

    if mono.is_empty() {
        bail!("Audio file contains no samples");
    }

    Ok(resample_linear(&mono, source_rate, TARGET_SAMPLE_RATE))
}

/// Average interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Linear-interpolation resampler. Good enough for speech; no anti-aliasing.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index = (position.floor() as usize).min(last);
            let next = (index + 1).min(last);
            let fraction = (position - index as f64) as f32;
            samples[index] * (1.0 - fraction) + samples[next] * fraction
        })
        .collect()
}
