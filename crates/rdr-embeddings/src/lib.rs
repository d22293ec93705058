//! Text-encoder seam for the topic matcher.
//!
//! The reference path tokenizes with `tokenizers`, runs a local ONNX model
//! and mean-pools over the attention mask (feature `onnx`). The hashing
//! encoder is the deterministic stand-in for tests and offline runs.

pub mod encoder;
#[cfg(feature = "onnx")]
pub mod onnx;
pub mod similarity;

pub use encoder::{HashingEncoder, TextEncoder};
#[cfg(feature = "onnx")]
pub use onnx::OnnxEncoder;
