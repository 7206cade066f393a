//! # Hyperion
//!
//! Lightweight inference runtime for small language models that run in a
//! fraction of their natural memory footprint.
//!
//! Weights are stored as packed low-bit codes (1, 2, 3, 4, 8 or 16 bits)
//! with a per-buffer scale and zero point, and are dequantized layer by
//! layer during the forward pass.
//!
//! ## Features
//!
//! - **Quantization codecs**: asymmetric, symmetric, logarithmic, binary and ternary
//! - **Mixed precision**: per-layer bit widths chosen from weight sensitivity under a memory budget
//! - **Dynamic quantization**: per-call or moving-average activation ranges
//! - **Model packages**: single checksummed file, plus a legacy two-file format
//! - **Generation**: greedy, temperature, top-k and nucleus sampling with reproducible seeds
//!
//! ## Example
//!
//! ```rust
//! use hyperion::quantize::{quantize_asymmetric, BitWidth};
//!
//! let weights = [-1.0_f32, -0.5, 0.0, 0.5, 2.0];
//! let q = quantize_asymmetric(&weights, BitWidth::Four).unwrap();
//!
//! // Five 4-bit codes pack into three bytes
//! assert_eq!(q.memory_bytes(), 3);
//! for (orig, back) in weights.iter().zip(q.dequantize()) {
//!     assert!((orig - back).abs() <= q.scale());
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! quantize ─┬─ stats
//!           └─ model ── generate
//! format ───── model::loader
//! ```
//!
//! The crate is synchronous and single-threaded. Run one [`model::Model`]
//! per thread; [`model::Model::fork`] shares weights between them.

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)] // code <-> zero point arithmetic
#![allow(clippy::cast_precision_loss)] // usize -> f32 precision loss is acceptable
#![allow(clippy::cast_possible_truncation)] // rounded f32 -> code conversions are clamped
#![allow(clippy::cast_sign_loss)] // codes are clamped to [0, max_code] first
#![allow(clippy::too_many_lines)]
#![allow(clippy::must_use_candidate)] // Not all methods need #[must_use]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)] // Prefer explicit format args
#![allow(clippy::missing_panics_doc)] // Allow missing Panics doc sections
#![allow(clippy::float_cmp)] // Allow float comparisons in tests
#![allow(clippy::cast_lossless)]
#![allow(clippy::manual_range_contains)] // Allow manual range checks

/// Runtime configuration loaded from JSON
pub mod config;
pub mod error;
/// Single-file model package format
///
/// Header, metadata block, weights section and trailing CRC32, with
/// independent verification flags for magic, version, truncation and checksum.
pub mod format;
/// Autoregressive generation and token sampling
pub mod generate;
/// Model, layer graph, forward pass and loaders
pub mod model;
/// Quantized buffer codecs and strategies
///
/// Asymmetric/symmetric affine codecs, logarithmic, binary and ternary
/// codecs, mixed-precision bit-width selection and dynamic activation
/// quantization.
pub mod quantize;
/// Buffer statistics and calibration
pub mod stats;
/// Vocabulary collaborator interface
pub mod vocab;

// Re-exports for convenience
pub use error::{HyperionError, Result};
pub use generate::{generate_text, GenerationParams, GenerationStyle, SamplingMethod};
pub use model::{destroy_model, load_model, Model};
pub use quantize::{BitWidth, QuantizedBuffer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
