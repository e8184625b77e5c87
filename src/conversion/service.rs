//! # Conversion Service
//!
//! The inference handler. Owns the process-wide model and everything needed
//! to feed it, and is shared read-only by every connection.
//!
//! ## Pipeline:
//! 1. **Decode** the PCM16 payload (odd lengths are rejected)
//! 2. **Validate** speaker ids against the model's speaker table
//! 3. **Dump** the decoded input when diagnostics are on
//! 4. **Route** to CPU or an accelerator
//! 5. **Featurise** into a spectrogram on that device
//! 6. **Convert** through the model
//! 7. **Encode**: scale by `max_wav_value`, clamp, little-endian PCM16
//!
//! This is synchronous and CPU/GPU bound; callers on the async side run it
//! on the blocking pool.

use crate::audio::dump::InputDump;
use crate::audio::pcm;
use crate::audio::spectrogram::SpectrogramExtractor;
use crate::conversion::hparams::HParams;
use crate::conversion::model::{ModelInputs, VoiceConversionModel};
use crate::conversion::{ConversionRequest, ConversionResponse};
use crate::device::{DeviceManager, DeviceSummary};
use crate::error::{AppError, AppResult};
use candle_core::{DType, Device, Tensor};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

pub struct ConversionService {
    model: Arc<dyn VoiceConversionModel>,
    hparams: HParams,
    extractor: SpectrogramExtractor,
    devices: DeviceManager,
    dump: InputDump,
}

impl ConversionService {
    pub fn new(
        model: Arc<dyn VoiceConversionModel>,
        hparams: HParams,
        devices: DeviceManager,
        dump: InputDump,
    ) -> Self {
        let extractor = SpectrogramExtractor::new(hparams.spectrogram_config());
        Self {
            model,
            hparams,
            extractor,
            devices,
            dump,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn n_speakers(&self) -> usize {
        self.hparams.n_speakers()
    }

    pub fn device_summary(&self) -> DeviceSummary {
        self.devices.summary()
    }

    /// Convert one request. The response always carries the request's
    /// timestamp unchanged.
    pub fn convert(&self, request: &ConversionRequest) -> AppResult<ConversionResponse> {
        let start = Instant::now();

        let samples = pcm::decode_pcm16(&request.payload)?;
        self.check_speaker("source", request.source_speaker_id)?;
        self.check_speaker("target", request.target_speaker_id)?;

        self.dump.record(&samples);

        if samples.is_empty() {
            return Ok(ConversionResponse {
                timestamp: request.timestamp,
                payload: Vec::new(),
            });
        }

        let (target, device) = self.devices.resolve(request.device_selector)?;
        let waveform = self.run_model(&samples, request, &device)?;
        let payload = pcm::waveform_to_bytes(&waveform, self.hparams.max_wav_value());

        debug!(
            timestamp = request.timestamp,
            source = request.source_speaker_id,
            target = request.target_speaker_id,
            device = %target,
            input_samples = samples.len(),
            output_samples = waveform.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Conversion finished"
        );

        Ok(ConversionResponse {
            timestamp: request.timestamp,
            payload,
        })
    }

    fn check_speaker(&self, role: &str, id: i64) -> AppResult<()> {
        let n_speakers = self.hparams.n_speakers();
        match usize::try_from(id) {
            Ok(index) if index < n_speakers => Ok(()),
            _ => Err(AppError::Validation(format!(
                "{} speaker id {} is outside 0..{}",
                role, id, n_speakers
            ))),
        }
    }

    fn run_model(
        &self,
        samples: &[i16],
        request: &ConversionRequest,
        device: &Device,
    ) -> AppResult<Vec<f32>> {
        let normalized = pcm::normalize(samples, self.hparams.max_wav_value());
        let spectrogram = self.extractor.compute(&normalized);

        let spec = spectrogram.to_tensor(device)?;
        let spec_lengths = Tensor::new(&[spectrogram.n_frames as i64], device)?;
        let sid_src = Tensor::new(&[request.source_speaker_id], device)?;
        let sid_tgt = Tensor::new(&[request.target_speaker_id], device)?;

        let output = self
            .model
            .voice_conversion(&ModelInputs {
                spec: &spec,
                spec_lengths: &spec_lengths,
                sid_src: &sid_src,
                sid_tgt: &sid_tgt,
            })
            .map_err(|e| AppError::Inference(format!("{:#}", e)))?;

        let waveform = output.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?;
        Ok(waveform)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::conversion::hparams::tests::SAMPLE_CONFIG;
    use crate::device::{AcceleratorKind, ComputeTarget};
    use std::sync::Mutex;

    /// Emits `hop_length` samples of `level` per spectrogram frame and
    /// remembers what it was called with.
    pub(crate) struct ConstantModel {
        pub level: f32,
        pub hop_length: usize,
        pub calls: Mutex<Vec<(i64, i64, usize)>>,
    }

    impl ConstantModel {
        pub(crate) fn new(level: f32) -> Self {
            Self {
                level,
                hop_length: 128,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl VoiceConversionModel for ConstantModel {
        fn name(&self) -> &str {
            "constant"
        }

        fn voice_conversion(&self, inputs: &ModelInputs<'_>) -> anyhow::Result<Tensor> {
            let frames = inputs.spec.dim(2)?;
            let src = inputs.sid_src.to_vec1::<i64>()?[0];
            let tgt = inputs.sid_tgt.to_vec1::<i64>()?[0];
            self.calls.lock().unwrap().push((src, tgt, frames));

            let len = frames * self.hop_length;
            Ok(Tensor::full(self.level, (1, 1, len), inputs.spec.device())?)
        }
    }

    struct FailingModel;

    impl VoiceConversionModel for FailingModel {
        fn name(&self) -> &str {
            "failing"
        }

        fn voice_conversion(&self, _inputs: &ModelInputs<'_>) -> anyhow::Result<Tensor> {
            Err(anyhow::anyhow!("shape mismatch in decoder"))
        }
    }

    pub(crate) fn service_with(model: Arc<dyn VoiceConversionModel>) -> ConversionService {
        let hparams = HParams::from_json(SAMPLE_CONFIG).unwrap();
        ConversionService::new(model, hparams, DeviceManager::cpu_only(), InputDump::disabled())
    }

    fn request(payload: Vec<u8>) -> ConversionRequest {
        ConversionRequest {
            device_selector: -1,
            source_speaker_id: 3,
            target_speaker_id: 7,
            timestamp: 42,
            payload,
        }
    }

    #[test]
    fn test_short_request_scenario() {
        let model = Arc::new(ConstantModel::new(0.25));
        let service = service_with(model.clone());

        let response = service.convert(&request(vec![0x01, 0x00, 0x02, 0x00])).unwrap();

        assert_eq!(response.timestamp, 42);
        assert!(!response.payload.is_empty());
        assert_eq!(response.payload.len() % 2, 0);
        assert_eq!(*model.calls.lock().unwrap(), vec![(3, 7, 1)]);

        let samples = pcm::decode_pcm16(&response.payload).unwrap();
        assert!(samples.iter().all(|&s| s == 8192));
    }

    #[test]
    fn test_timestamp_is_echoed() {
        let service = service_with(Arc::new(ConstantModel::new(0.0)));
        for timestamp in [0, -5, 1_700_000_000_000, i64::MAX] {
            let mut req = request(vec![0; 960]);
            req.timestamp = timestamp;
            assert_eq!(service.convert(&req).unwrap().timestamp, timestamp);
        }
    }

    #[test]
    fn test_odd_payload_fails() {
        let model = Arc::new(ConstantModel::new(0.25));
        let service = service_with(model.clone());

        let err = service.convert(&request(vec![0x01, 0x00, 0x02])).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(model.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_output_is_clamped() {
        let service = service_with(Arc::new(ConstantModel::new(-8.0)));
        let response = service.convert(&request(vec![0; 4800])).unwrap();
        let samples = pcm::decode_pcm16(&response.payload).unwrap();
        assert!(samples.iter().all(|&s| s == i16::MIN));
    }

    #[test]
    fn test_speaker_out_of_range() {
        let service = service_with(Arc::new(ConstantModel::new(0.0)));

        let mut req = request(vec![0; 4]);
        req.target_speaker_id = 110;
        assert!(matches!(service.convert(&req).unwrap_err(), AppError::Validation(_)));

        let mut req = request(vec![0; 4]);
        req.source_speaker_id = -1;
        assert!(matches!(service.convert(&req).unwrap_err(), AppError::Validation(_)));
    }

    #[test]
    fn test_empty_payload_skips_model() {
        let model = Arc::new(ConstantModel::new(0.5));
        let service = service_with(model.clone());

        let response = service.convert(&request(Vec::new())).unwrap();
        assert_eq!(response.timestamp, 42);
        assert!(response.payload.is_empty());
        assert!(model.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_model_failure_is_inference_error() {
        let service = service_with(Arc::new(FailingModel));
        let err = service.convert(&request(vec![0; 480])).unwrap_err();
        assert!(matches!(err, AppError::Inference(_)));
        assert!(err.to_string().contains("shape mismatch"));
    }

    #[test]
    fn test_selector_on_cpu_only_host_runs_on_cpu() {
        let service = service_with(Arc::new(ConstantModel::new(0.1)));
        let mut req = request(vec![0; 480]);
        req.device_selector = 0;
        assert!(service.convert(&req).is_ok());
        assert_eq!(crate::device::route(5, 0).unwrap(), ComputeTarget::Cpu);
    }

    #[test]
    fn test_missing_accelerator_is_device_error() {
        let hparams = HParams::from_json(SAMPLE_CONFIG).unwrap();
        let service = ConversionService::new(
            Arc::new(ConstantModel::new(0.1)),
            hparams,
            DeviceManager::with_accelerators(AcceleratorKind::Cuda, 1),
            InputDump::disabled(),
        );

        let mut req = request(vec![0; 480]);
        req.device_selector = 1;
        assert!(matches!(service.convert(&req).unwrap_err(), AppError::Device(_)));
    }
}
