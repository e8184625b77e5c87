//! # Conversion Module
//!
//! Turns one [`ConversionRequest`] into one [`ConversionResponse`].
//!
//! ## Key Components:
//! - **hparams**: the model's JSON hyper-parameters
//! - **model**: the `VoiceConversionModel` trait and checkpoint loading
//! - **onnx**: candle-onnx backend (feature `onnx`)
//! - **service**: decode → route → featurise → convert → encode

pub mod hparams;
pub mod model;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod request;
pub mod service;

pub use request::{ConversionRequest, ConversionResponse};
pub use service::ConversionService;
