//! Mel filter bank for Whisper's log-mel front end.
//!
//! Slaney-scale triangular filters with area normalisation, laid out
//! row-major as `n_mels x (n_fft / 2 + 1)`, the layout candle's `pcm_to_mel`
//! consumes.

const MIN_LOG_HZ: f64 = 1_000.0;
const F_SP: f64 = 200.0 / 3.0;

fn min_log_mel() -> f64 {
    MIN_LOG_HZ / F_SP
}

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

pub fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / F_SP
    } else {
        min_log_mel() + (hz / MIN_LOG_HZ).ln() / log_step()
    }
}

pub fn mel_to_hz(mel: f64) -> f64 {
    if mel < min_log_mel() {
        mel * F_SP
    } else {
        MIN_LOG_HZ * ((mel - min_log_mel()) * log_step()).exp()
    }
}

/// Build the filter bank for `n_mels` bands over an `n_fft`-point FFT.
pub fn filter_bank(n_mels: usize, n_fft: usize, sample_rate: usize) -> Vec<f32> {
    let n_freqs = n_fft / 2 + 1;
    let fft_freqs: Vec<f64> = (0..n_freqs)
        .map(|k| k as f64 * sample_rate as f64 / n_fft as f64)
        .collect();

    let mel_max = hz_to_mel(sample_rate as f64 / 2.0);
    let band_edges: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_max * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_freqs];
    for m in 0..n_mels {
        let (lower, center, upper) = (band_edges[m], band_edges[m + 1], band_edges[m + 2]);
        let norm = 2.0 / (upper - lower);
        for (k, &freq) in fft_freqs.iter().enumerate() {
            let rising = (freq - lower) / (center - lower);
            let falling = (upper - freq) / (upper - center);
            let weight = rising.min(falling).max(0.0);
            filters[m * n_freqs + k] = (weight * norm) as f32;
        }
    }
    filters
}
