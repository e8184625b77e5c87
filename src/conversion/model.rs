//! # Voice Conversion Model
//!
//! The network itself is an external collaborator: this crate never
//! implements its layers. It only knows the shape of the call:
//!
//! ```text
//! voice_conversion(spec [1, F, T], spec_lengths [1], sid_src [1], sid_tgt [1])
//!     -> waveform [1, 1, samples]  (floats, roughly in [-1, 1])
//! ```
//!
//! Tensors arrive already placed on the device the request was routed to, so
//! a backend only has to run its graph there.
//!
//! ## Supported checkpoints:
//! - **`.onnx`**: an exported voice-conversion graph with inputs `spec`,
//!   `spec_lengths`, `sid_src`, `sid_tgt`, evaluated through candle-onnx
//!   (cargo feature `onnx`)

use anyhow::{anyhow, Result};
use candle_core::Tensor;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Graph input names every backend receives.
pub const INPUT_SPEC: &str = "spec";
pub const INPUT_SPEC_LENGTHS: &str = "spec_lengths";
pub const INPUT_SID_SRC: &str = "sid_src";
pub const INPUT_SID_TGT: &str = "sid_tgt";

/// Inputs of one conversion, all on the same device.
pub struct ModelInputs<'a> {
    /// Linear magnitude spectrogram, `[1, n_freqs, n_frames]`, f32
    pub spec: &'a Tensor,
    /// `[1]`, i64, number of valid frames
    pub spec_lengths: &'a Tensor,
    /// `[1]`, i64
    pub sid_src: &'a Tensor,
    /// `[1]`, i64
    pub sid_tgt: &'a Tensor,
}

/// A loaded, inference-only voice conversion network.
///
/// Implementations are shared across every connection behind an `Arc` and
/// must not need `&mut self` to run.
pub trait VoiceConversionModel: Send + Sync {
    /// Short description for logs and `/health`.
    fn name(&self) -> &str;

    /// Convert the speaker of the spectrogram from `sid_src` to `sid_tgt`.
    ///
    /// Returns a float waveform; any leading singleton dimensions are allowed.
    fn voice_conversion(&self, inputs: &ModelInputs<'_>) -> Result<Tensor>;
}

/// Load the checkpoint at `path`, picking the backend from its extension.
pub fn load_model(path: &Path) -> Result<Arc<dyn VoiceConversionModel>> {
    if !path.exists() {
        return Err(anyhow!("Model checkpoint not found: {}", path.display()));
    }

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    info!(path = %path.display(), format = %extension, "Loading voice conversion model");

    match extension.as_str() {
        "onnx" => load_onnx(path),
        other => Err(anyhow!(
            "Unsupported checkpoint format '{}' for {}; export the generator to ONNX",
            other,
            path.display()
        )),
    }
}

#[cfg(feature = "onnx")]
fn load_onnx(path: &Path) -> Result<Arc<dyn VoiceConversionModel>> {
    let model = crate::conversion::onnx::OnnxVoiceModel::load(path)?;
    Ok(Arc::new(model))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(path: &Path) -> Result<Arc<dyn VoiceConversionModel>> {
    Err(anyhow!(
        "{} is an ONNX graph but this build has no ONNX support; rebuild with `--features onnx`",
        path.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_checkpoint() {
        let err = load_model(Path::new("/nope/G_latest.onnx")).err().unwrap();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("G_latest.pth");
        std::fs::write(&path, b"not a graph").unwrap();

        let err = load_model(&path).err().unwrap();
        assert!(err.to_string().contains("Unsupported checkpoint format 'pth'"));
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn test_onnx_needs_feature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("G_latest.onnx");
        std::fs::write(&path, b"").unwrap();

        let err = load_model(&path).err().unwrap();
        assert!(err.to_string().contains("--features onnx"));
    }
}
