//! Sign-only codecs: binary (1-bit) and ternary ({-1, 0, +1})

use super::{pack_codes, BitWidth, QuantizedBuffer};
use crate::error::{HyperionError, Result};

/// Result of [`quantize_binary`]
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryQuantized {
    /// One bit per value, set iff the value is `>= 0`; `scale` is mean `|x|`
    pub buffer: QuantizedBuffer,
}

impl BinaryQuantized {
    /// Shared magnitude
    pub fn scale(&self) -> f32 {
        self.buffer.scale()
    }
}

/// Result of [`quantize_ternary`]
#[derive(Debug, Clone, PartialEq)]
pub struct TernaryQuantized {
    /// Codes in {-1, 0, +1}
    pub codes: Vec<i8>,
    /// Mean `|x|` over values beyond the threshold, or 1.0 if there are none
    pub scale: f32,
    /// Threshold used
    pub threshold: f32,
}

impl TernaryQuantized {
    /// Pack as 2-bit codes with `zero_point = 1` (0 → -1, 1 → 0, 2 → +1)
    pub fn to_buffer(&self) -> QuantizedBuffer {
        let codes: Vec<u32> = self.codes.iter().map(|&c| (i32::from(c) + 1) as u32).collect();
        QuantizedBuffer {
            data: pack_codes(&codes, BitWidth::Two),
            len: codes.len(),
            bit_width: BitWidth::Two,
            scale: self.scale,
            zero_point: 1,
        }
    }
}

/// Binary quantization: bit `i` set iff `values[i] >= 0`
///
/// Eight values per byte, low bit first. The shared scale is the mean
/// absolute value.
///
/// # Errors
///
/// Returns error if `values` is empty.
pub fn quantize_binary(values: &[f32]) -> Result<BinaryQuantized> {
    if values.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: "quantize_binary: input must not be empty".to_string(),
        });
    }
    let scale = values.iter().map(|x| x.abs()).sum::<f32>() / values.len() as f32;
    let codes: Vec<u32> = values.iter().map(|&x| u32::from(x >= 0.0)).collect();
    Ok(BinaryQuantized {
        buffer: QuantizedBuffer::from_codes(&codes, BitWidth::One, scale, 0)?,
    })
}

/// `+scale` for set bits, `-scale` otherwise
pub fn dequantize_binary(quantized: &BinaryQuantized) -> Vec<f32> {
    let scale = quantized.scale();
    quantized
        .buffer
        .codes()
        .into_iter()
        .map(|bit| if bit == 1 { scale } else { -scale })
        .collect()
}

/// Ternary quantization with threshold `t`
///
/// `+1` if `x > t`, `-1` if `x < -t`, else `0`.
///
/// # Errors
///
/// Returns error if `values` is empty or `threshold` is negative or NaN.
pub fn quantize_ternary(values: &[f32], threshold: f32) -> Result<TernaryQuantized> {
    if values.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: "quantize_ternary: input must not be empty".to_string(),
        });
    }
    if threshold < 0.0 || threshold.is_nan() {
        return Err(HyperionError::InvalidConfiguration(format!(
            "quantize_ternary: threshold must be non-negative, got {threshold}"
        )));
    }

    let (sum, count) = values
        .iter()
        .filter(|x| x.abs() > threshold)
        .fold((0.0f32, 0usize), |(s, c), x| (s + x.abs(), c + 1));
    let scale = if count > 0 { sum / count as f32 } else { 1.0 };

    let codes = values
        .iter()
        .map(|&x| {
            if x > threshold {
                1
            } else if x < -threshold {
                -1
            } else {
                0
            }
        })
        .collect();

    Ok(TernaryQuantized {
        codes,
        scale,
        threshold,
    })
}

/// `scale * code`
pub fn dequantize_ternary(quantized: &TernaryQuantized) -> Vec<f32> {
    quantized
        .codes
        .iter()
        .map(|&c| quantized.scale * f32::from(c))
        .collect()
}
