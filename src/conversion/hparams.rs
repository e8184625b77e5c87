//! Model hyper-parameters.
//!
//! The checkpoint ships with a JSON file describing how it was trained. Only
//! the `data` section matters at inference time; `train`, `model` and any
//! other sections are accepted and ignored.

use crate::audio::spectrogram::SpectrogramConfig;
use crate::audio::SAMPLE_RATE;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct HParams {
    pub data: DataParams,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DataParams {
    /// Divisor for input normalisation and scale for the output waveform
    #[serde(default = "default_max_wav_value")]
    pub max_wav_value: f32,
    pub sampling_rate: u32,
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub n_speakers: usize,
}

fn default_max_wav_value() -> f32 {
    32768.0
}

impl HParams {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model configuration {}", path.display()))?;
        let hparams = Self::from_json(&text)
            .with_context(|| format!("Invalid model configuration {}", path.display()))?;
        Ok(hparams)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let hparams: HParams = serde_json::from_str(text)?;
        hparams.validate()?;
        Ok(hparams)
    }

    /// Reject models the wire format cannot feed.
    pub fn validate(&self) -> Result<()> {
        let data = &self.data;

        if data.sampling_rate != SAMPLE_RATE {
            return Err(anyhow!(
                "model expects {} Hz audio, the channel carries {} Hz",
                data.sampling_rate,
                SAMPLE_RATE
            ));
        }

        if !(data.max_wav_value.is_finite() && data.max_wav_value > 0.0) {
            return Err(anyhow!("max_wav_value must be positive, got {}", data.max_wav_value));
        }

        if data.filter_length == 0 || data.hop_length == 0 || data.win_length == 0 {
            return Err(anyhow!("filter_length, hop_length and win_length must be non-zero"));
        }

        if data.win_length > data.filter_length {
            return Err(anyhow!(
                "win_length {} exceeds filter_length {}",
                data.win_length,
                data.filter_length
            ));
        }

        if data.n_speakers == 0 {
            return Err(anyhow!("n_speakers must be greater than 0"));
        }

        Ok(())
    }

    pub fn spectrogram_config(&self) -> SpectrogramConfig {
        SpectrogramConfig {
            n_fft: self.data.filter_length,
            hop_length: self.data.hop_length,
            win_length: self.data.win_length,
        }
    }

    pub fn max_wav_value(&self) -> f32 {
        self.data.max_wav_value
    }

    pub fn n_speakers(&self) -> usize {
        self.data.n_speakers
    }
}
