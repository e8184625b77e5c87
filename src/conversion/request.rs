//! Conversion request and response records.

/// One conversion request, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    /// Negative ⇒ CPU, otherwise an accelerator index
    pub device_selector: i64,
    pub source_speaker_id: i64,
    pub target_speaker_id: i64,
    /// Opaque correlation token, echoed back unchanged
    pub timestamp: i64,
    /// Little-endian PCM16, mono, 24 kHz
    pub payload: Vec<u8>,
}

/// The converted audio, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionResponse {
    pub timestamp: i64,
    /// Little-endian PCM16, mono, 24 kHz
    pub payload: Vec<u8>,
}
