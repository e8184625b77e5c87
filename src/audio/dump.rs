//! Diagnostic WAV dump.
//!
//! When enabled, the decoded input of each request is written to a fixed
//! path as a 24 kHz mono 16-bit WAV. The file is overwritten every time; it is
//! a debug hook for listening to what the server actually received, not an
//! audit log.

use crate::audio::{BITS_PER_SAMPLE, CHANNELS, SAMPLE_RATE};
use crate::config::DiagnosticsConfig;
use crate::error::AppResult;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Writes request audio to disk when diagnostics are switched on.
#[derive(Debug, Clone)]
pub struct InputDump {
    path: Option<PathBuf>,
}

impl InputDump {
    pub fn from_config(config: &DiagnosticsConfig) -> Self {
        Self {
            path: config.dump_input.then(|| config.dump_path.clone()),
        }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.path.is_some()
    }

    /// Dump `samples`, logging instead of failing. A broken debug hook must
    /// not turn into a failed conversion.
    pub fn record(&self, samples: &[i16]) {
        let Some(path) = &self.path else {
            return;
        };

        match write_wav(path, samples) {
            Ok(()) => debug!(path = %path.display(), samples = samples.len(), "Wrote input dump"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write input dump"),
        }
    }
}

/// Write mono PCM16 samples at the wire sample rate, replacing `path`.
pub fn write_wav(path: &Path, samples: &[i16]) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let header =
        wav::Header::new(wav::header::WAV_FORMAT_PCM, CHANNELS, SAMPLE_RATE, BITS_PER_SAMPLE);
    let track = wav::BitDepth::Sixteen(samples.to_vec());
    let mut writer = BufWriter::new(File::create(path)?);
    wav::write(header, &track, &mut writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_wav_round_trips_through_reader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("received_data.wav");
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];

        write_wav(&path, &samples).unwrap();

        let mut file = File::open(&path).unwrap();
        let (header, data) = wav::read(&mut file).unwrap();
        assert_eq!(header.sampling_rate, SAMPLE_RATE);
        assert_eq!(header.channel_count, 1);
        assert_eq!(header.bits_per_sample, 16);
        assert_eq!(data.as_sixteen(), Some(&samples));
    }

    #[test]
    fn test_record_overwrites_previous_dump() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.wav");
        let dump = InputDump::from_config(&DiagnosticsConfig {
            dump_input: true,
            dump_path: path.clone(),
        });

        dump.record(&vec![7i16; 1000]);
        let first = std::fs::metadata(&path).unwrap().len();
        dump.record(&[1, 2]);
        let second = std::fs::metadata(&path).unwrap().len();
        assert!(second < first);
    }

    #[test]
    fn test_disabled_dump_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.wav");
        let dump = InputDump::from_config(&DiagnosticsConfig {
            dump_input: false,
            dump_path: path.clone(),
        });

        assert!(!dump.is_enabled());
        dump.record(&[1, 2, 3]);
        assert!(!path.exists());
    }
}
