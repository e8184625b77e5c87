//! Linear magnitude spectrogram.
//!
//! This is the feature the voice conversion graph takes as input: a
//! non-centered STFT of the reflect-padded signal with a periodic Hann
//! window, reported as `sqrt(re² + im² + 1e-6)`. Layout is
//! `[n_fft / 2 + 1, n_frames]`, frequency-major.

use crate::error::AppResult;
use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use std::f32::consts::PI;

/// STFT parameters, taken from the model hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpectrogramConfig {
    /// FFT size (`filter_length` in the hyper-parameters)
    pub n_fft: usize,
    pub hop_length: usize,
    pub win_length: usize,
}

/// A computed spectrogram, frequency-major.
#[derive(Debug, Clone)]
pub struct Spectrogram {
    pub data: Vec<f32>,
    pub n_freqs: usize,
    pub n_frames: usize,
}

impl Spectrogram {
    /// Shape `[1, n_freqs, n_frames]` on `device`.
    pub fn to_tensor(&self, device: &Device) -> AppResult<Tensor> {
        Ok(Tensor::from_slice(&self.data, (1, self.n_freqs, self.n_frames), device)?)
    }

    /// Magnitude at one bin / frame.
    #[cfg(test)]
    pub fn get(&self, freq: usize, frame: usize) -> f32 {
        self.data[freq * self.n_frames + frame]
    }
}

pub struct SpectrogramExtractor {
    config: SpectrogramConfig,
    /// Hann window of `win_length`, zero-padded to `n_fft` around the centre
    window: Vec<f32>,
}

impl SpectrogramExtractor {
    pub fn new(config: SpectrogramConfig) -> Self {
        let window = Self::padded_hann_window(config.win_length, config.n_fft);
        Self { config, window }
    }

    /// Compute the spectrogram of a normalised waveform.
    ///
    /// Reflect padding needs more samples than the pad width; shorter inputs
    /// are zero-padded instead, and the signal is always extended to at
    /// least one full FFT window so a frame is produced.
    pub fn compute(&self, samples: &[f32]) -> Spectrogram {
        let n_fft = self.config.n_fft;
        let hop = self.config.hop_length;
        let n_freqs = n_fft / 2 + 1;

        let padded = self.pad(samples);
        let n_frames = (padded.len() - n_fft) / hop + 1;

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n_fft);
        let mut buffer = vec![Complex::new(0.0f32, 0.0); n_fft];
        let mut data = vec![0.0f32; n_freqs * n_frames];

        for frame in 0..n_frames {
            let start = frame * hop;
            for (j, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(padded[start + j] * self.window[j], 0.0);
            }

            fft.process(&mut buffer);

            for (freq, value) in buffer.iter().take(n_freqs).enumerate() {
                data[freq * n_frames + frame] = (value.norm_sqr() + 1e-6).sqrt();
            }
        }

        Spectrogram { data, n_freqs, n_frames }
    }

    fn pad(&self, samples: &[f32]) -> Vec<f32> {
        let n_fft = self.config.n_fft;
        let pad = n_fft.saturating_sub(self.config.hop_length) / 2;

        let mut padded = Vec::with_capacity(samples.len() + 2 * pad + n_fft);
        if pad > 0 && samples.len() > pad {
            // Reflect without repeating the edge sample
            padded.extend(samples[1..=pad].iter().rev());
            padded.extend_from_slice(samples);
            padded.extend(samples[samples.len() - 1 - pad..samples.len() - 1].iter().rev());
        } else {
            padded.resize(pad, 0.0);
            padded.extend_from_slice(samples);
            padded.resize(padded.len() + pad, 0.0);
        }

        if padded.len() < n_fft {
            padded.resize(n_fft, 0.0);
        }
        padded
    }

    /// Periodic Hann window of `win_length`, centred inside `n_fft`.
    fn padded_hann_window(win_length: usize, n_fft: usize) -> Vec<f32> {
        let win_length = win_length.min(n_fft);
        let offset = (n_fft - win_length) / 2;
        let mut window = vec![0.0f32; n_fft];
        for i in 0..win_length {
            window[offset + i] = 0.5 * (1.0 - (2.0 * PI * i as f32 / win_length as f32).cos());
        }
        window
    }
}
