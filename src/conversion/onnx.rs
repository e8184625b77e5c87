//! ONNX-backed voice conversion.
//!
//! Evaluates an exported generator graph with candle-onnx. The graph must
//! take the four inputs named in `conversion::model` and produce the
//! waveform as its first output.

use crate::conversion::model::{
    ModelInputs, VoiceConversionModel, INPUT_SID_SRC, INPUT_SID_TGT, INPUT_SPEC, INPUT_SPEC_LENGTHS,
};
use anyhow::{anyhow, Context, Result};
use candle_core::Tensor;
use candle_onnx::onnx::ModelProto;
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

pub struct OnnxVoiceModel {
    model: ModelProto,
    output_name: String,
    name: String,
}

impl OnnxVoiceModel {
    pub fn load(path: &Path) -> Result<Self> {
        let start = std::time::Instant::now();
        let model = candle_onnx::read_file(path)
            .with_context(|| format!("Failed to read ONNX graph {}", path.display()))?;

        let graph = model
            .graph
            .as_ref()
            .ok_or_else(|| anyhow!("{} contains no graph", path.display()))?;

        for required in [INPUT_SPEC, INPUT_SPEC_LENGTHS, INPUT_SID_SRC, INPUT_SID_TGT] {
            if !graph.input.iter().any(|input| input.name == required) {
                return Err(anyhow!(
                    "ONNX graph {} has no input named '{}'",
                    path.display(),
                    required
                ));
            }
        }

        let output_name = graph
            .output
            .first()
            .map(|output| output.name.clone())
            .ok_or_else(|| anyhow!("ONNX graph {} has no outputs", path.display()))?;

        let name = format!(
            "onnx:{}",
            path.file_name().and_then(|n| n.to_str()).unwrap_or("model")
        );

        info!(
            model = %name,
            nodes = graph.node.len(),
            output = %output_name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "ONNX graph loaded"
        );

        Ok(Self { model, output_name, name })
    }
}

impl VoiceConversionModel for OnnxVoiceModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn voice_conversion(&self, inputs: &ModelInputs<'_>) -> Result<Tensor> {
        let feeds: HashMap<String, Tensor> = HashMap::from([
            (INPUT_SPEC.to_string(), inputs.spec.clone()),
            (INPUT_SPEC_LENGTHS.to_string(), inputs.spec_lengths.clone()),
            (INPUT_SID_SRC.to_string(), inputs.sid_src.clone()),
            (INPUT_SID_TGT.to_string(), inputs.sid_tgt.clone()),
        ]);

        let mut outputs = candle_onnx::simple_eval(&self.model, feeds)?;
        outputs
            .remove(&self.output_name)
            .ok_or_else(|| anyhow!("graph produced no '{}' output", self.output_name))
    }
}
