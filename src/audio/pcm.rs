//! # PCM16 Conversion
//!
//! Converts between the wire representation (little-endian signed 16-bit
//! bytes) and sample vectors, and between integer and float waveforms.

use crate::error::{AppError, AppResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Bytes per encoded sample.
pub const SAMPLE_WIDTH: usize = 2;

/// Decode a little-endian PCM16 payload.
///
/// ## Validation Checks:
/// - **Data length**: must be a multiple of 2. An odd trailing byte is an
///   error, never silently dropped.
///
/// An empty payload decodes to an empty vector.
pub fn decode_pcm16(data: &[u8]) -> AppResult<Vec<i16>> {
    if data.len() % SAMPLE_WIDTH != 0 {
        return Err(AppError::Validation(format!(
            "payload length {} is not a multiple of {} bytes",
            data.len(),
            SAMPLE_WIDTH
        )));
    }

    let mut samples = vec![0i16; data.len() / SAMPLE_WIDTH];
    let mut cursor = Cursor::new(data);
    cursor
        .read_i16_into::<LittleEndian>(&mut samples)
        .map_err(|e| AppError::Validation(format!("Failed to decode PCM16 payload: {}", e)))?;

    Ok(samples)
}

/// Encode samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * SAMPLE_WIDTH);
    for &sample in samples {
        // Writing into a Vec cannot fail
        let _ = out.write_i16::<LittleEndian>(sample);
    }
    out
}

/// Normalise integer samples into floats by dividing by `max_wav_value`.
///
/// With the usual `max_wav_value` of 32768 the result lies in `[-1.0, 1.0)`.
pub fn normalize(samples: &[i16], max_wav_value: f32) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / max_wav_value).collect()
}

/// Scale a float waveform back into the 16-bit integer range.
///
/// Each value is multiplied by `max_wav_value`, clamped to
/// `[i16::MIN, i16::MAX]` and truncated toward zero. Non-finite values become
/// silence.
pub fn scale_to_pcm16(waveform: &[f32], max_wav_value: f32) -> Vec<i16> {
    waveform
        .iter()
        .map(|&sample| {
            let scaled = sample * max_wav_value;
            if !scaled.is_finite() {
                return 0;
            }
            scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16
        })
        .collect()
}

/// Scale, clamp and encode in one step.
pub fn waveform_to_bytes(waveform: &[f32], max_wav_value: f32) -> Vec<u8> {
    encode_pcm16(&scale_to_pcm16(waveform, max_wav_value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_little_endian() {
        let samples = decode_pcm16(&[0x01, 0x00, 0x02, 0x00, 0xff, 0xff, 0x00, 0x80]).unwrap();
        assert_eq!(samples, vec![1, 2, -1, i16::MIN]);
    }

    #[test]
    fn test_decode_rejects_odd_length() {
        let err = decode_pcm16(&[0x01, 0x00, 0x02]).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(err.to_string().contains("multiple of 2"));
    }

    #[test]
    fn test_empty_payload() {
        assert!(decode_pcm16(&[]).unwrap().is_empty());
        assert!(encode_pcm16(&[]).is_empty());
    }

    #[test]
    fn test_reencode_preserves_bytes() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let samples = decode_pcm16(&bytes).unwrap();
        assert_eq!(encode_pcm16(&samples), bytes);
    }

    #[test]
    fn test_scale_clamps_to_i16_range() {
        let waveform = [0.0, 0.5, -0.5, 1.0, -1.0, 3.7, -12.0, f32::NAN, f32::INFINITY];
        let samples = scale_to_pcm16(&waveform, 32768.0);
        assert_eq!(samples, vec![0, 16384, -16384, 32767, -32768, 32767, -32768, 0, 0]);
    }

    #[test]
    fn test_normalize_then_scale() {
        let pcm = vec![0i16, 16384, -16384, 32767, -32768];
        let float = normalize(&pcm, 32768.0);
        let back = scale_to_pcm16(&float, 32768.0);
        for (original, converted) in pcm.iter().zip(back.iter()) {
            assert!((original - converted).abs() <= 1, "{} vs {}", original, converted);
        }
    }

    #[test]
    fn test_waveform_to_bytes_matches_encode() {
        let waveform = [0.25f32, -0.25, 2.0];
        let expected = encode_pcm16(&scale_to_pcm16(&waveform, 32768.0));
        assert_eq!(waveform_to_bytes(&waveform, 32768.0), expected);
        assert_eq!(expected.len() % SAMPLE_WIDTH, 0);
    }
}
