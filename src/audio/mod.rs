//! # Audio Processing Module
//!
//! Everything the conversion path does to samples before and after the model.
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 24kHz (24,000 Hz)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers
//!
//! ## Key Components:
//! - **pcm**: byte ↔ sample conversion, normalisation and clamped rescaling
//! - **spectrogram**: the linear magnitude spectrogram the model consumes
//! - **dump**: optional diagnostic WAV writer

pub mod dump;
pub mod pcm;
pub mod spectrogram;

/// Sample rate of every payload on the wire.
pub const SAMPLE_RATE: u32 = 24_000;

/// Mono audio only.
pub const CHANNELS: u16 = 1;

pub const BITS_PER_SAMPLE: u16 = 16;
