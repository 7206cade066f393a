//! Logarithmic quantization
//!
//! Each value is encoded as a sign bit plus a rounded index into a uniform
//! grid over `log2(|x| + ε)`. The top bit of each `b`-bit code is the sign,
//! the remaining `b - 1` bits hold the exponent index. The grid step is kept
//! as the buffer scale and the grid origin (minimum exponent) is returned
//! alongside it in [`LogQuantized::offset`].

use super::{BitWidth, QuantizedBuffer};
use crate::error::{HyperionError, Result};

/// Added to `|x|` before taking the logarithm
pub const LOG_EPSILON: f32 = 1e-8;

/// Result of [`quantize_log`]
#[derive(Debug, Clone, PartialEq)]
pub struct LogQuantized {
    /// Packed codes; `scale` is the exponent step, `zero_point` is 0
    pub buffer: QuantizedBuffer,
    /// Minimum exponent (grid origin)
    pub offset: f32,
}

impl LogQuantized {
    /// Exponent step between adjacent indices
    pub fn step(&self) -> f32 {
        self.buffer.scale()
    }

    /// Recover floats
    pub fn dequantize(&self) -> Vec<f32> {
        dequantize_log(&self.buffer, self.offset)
    }
}

/// Quantize `values` on a log2 grid
///
/// # Errors
///
/// Returns error if `values` is empty or `bit_width` is 1 bit (no room for
/// an exponent index next to the sign bit).
pub fn quantize_log(values: &[f32], bit_width: BitWidth) -> Result<LogQuantized> {
    if values.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: "quantize_log: input must not be empty".to_string(),
        });
    }
    if bit_width == BitWidth::One {
        return Err(HyperionError::UnsupportedOperation {
            operation: "quantize_log".to_string(),
            reason: "logarithmic codes need at least 2 bits (sign + exponent)".to_string(),
        });
    }

    let exponent_bits = bit_width.bits() - 1;
    let levels = 1u32 << exponent_bits;
    let sign_bit = 1u32 << exponent_bits;

    let exponents: Vec<f32> = values.iter().map(|x| (x.abs() + LOG_EPSILON).log2()).collect();
    let min_exp = exponents.iter().copied().fold(f32::MAX, f32::min);
    let max_exp = exponents.iter().copied().fold(f32::MIN, f32::max);

    let range = (max_exp - min_exp).max(LOG_EPSILON);
    let step = range / (levels - 1) as f32;

    let codes: Vec<u32> = values
        .iter()
        .zip(&exponents)
        .map(|(&x, &e)| {
            let index = ((e - min_exp) / step).round().clamp(0.0, (levels - 1) as f32) as u32;
            if x < 0.0 {
                index | sign_bit
            } else {
                index
            }
        })
        .collect();

    Ok(LogQuantized {
        buffer: QuantizedBuffer::from_codes(&codes, bit_width, step, 0)?,
        offset: min_exp,
    })
}

/// Invert [`quantize_log`]: `±(2^(offset + index * step) - ε)`
pub fn dequantize_log(buffer: &QuantizedBuffer, offset: f32) -> Vec<f32> {
    let bits = buffer.bit_width().bits();
    if bits < 2 {
        return vec![0.0; buffer.len()];
    }
    let sign_bit = 1u32 << (bits - 1);
    let step = buffer.scale();

    buffer
        .codes()
        .into_iter()
        .map(|code| {
            let index = code & (sign_bit - 1);
            let magnitude = ((offset + index as f32 * step).exp2() - LOG_EPSILON).max(0.0);
            if code & sign_bit != 0 {
                -magnitude
            } else {
                magnitude
            }
        })
        .collect()
}
