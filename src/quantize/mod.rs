//! Quantization and dequantization of float buffers
//!
//! Every quantizer produces a [`QuantizedBuffer`]: packed codes at a declared
//! [`BitWidth`] plus the affine parameters needed to recover floats:
//!
//! ```text
//! value ≈ scale * (code - zero_point)
//! ```
//!
//! ## Codecs
//!
//! - **Asymmetric** (`quantize_asymmetric`): min/max clipped to the 1st/99th
//!   percentile and widened to include 0, `scale = range / (levels - 1)`,
//!   zero point rounded and clamped into `[0, levels - 1]`
//! - **Symmetric** (`quantize_symmetric`): `scale = max|x| / (2^(b-1) - 1)`,
//!   codes stored with a `2^(b-1)` offset
//! - **Logarithmic** ([`log`]): sign bit plus rounded exponent index
//! - **Binary / Ternary** ([`sign`]): sign-only codes with one shared scale
//!
//! ## Packing
//!
//! Sub-byte codes are packed low-to-high within a byte in index order. A
//! buffer of `N` values at `b` bits is exactly `ceil(N * b / 8)` bytes.
//! See [`pack`] for details.

use serde::{Deserialize, Serialize};

use crate::error::{HyperionError, Result};
use crate::stats;

pub mod dynamic;
pub mod log;
pub mod mixed;
pub mod pack;
pub mod sign;

pub use dynamic::{DynamicQuantConfig, DynamicQuantizer, RunningStats};
pub use log::{dequantize_log, quantize_log, LogQuantized};
pub use mixed::{
    memory_savings, quantize_layers, select_bit_widths, select_bit_widths_calibrated,
    LayerQuantization, MixedPrecisionAssignment, MixedPrecisionConfig, MixedPrecisionResult,
    QuantMethod,
};
pub use pack::{pack_codes, unpack_codes};
pub use sign::{
    dequantize_binary, dequantize_ternary, quantize_binary, quantize_ternary, BinaryQuantized,
    TernaryQuantized,
};

/// Percentile used for outlier clipping in asymmetric quantization
pub const CLIP_PERCENTILE: usize = 1;

/// Supported code widths
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BitWidth {
    /// 1 bit per value
    One,
    /// 2 bits per value
    Two,
    /// 3 bits per value
    Three,
    /// 4 bits per value (two per byte)
    Four,
    /// 8 bits per value
    Eight,
    /// 16 bits per value (little-endian)
    Sixteen,
}

impl BitWidth {
    /// All widths, narrowest first
    pub const ALL: [BitWidth; 6] = [
        BitWidth::One,
        BitWidth::Two,
        BitWidth::Three,
        BitWidth::Four,
        BitWidth::Eight,
        BitWidth::Sixteen,
    ];

    /// Parse from a bit count
    ///
    /// # Errors
    ///
    /// Returns error for bit counts other than 1, 2, 3, 4, 8 or 16.
    pub fn from_bits(bits: u32) -> Result<Self> {
        match bits {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            16 => Ok(Self::Sixteen),
            other => Err(HyperionError::InvalidConfiguration(format!(
                "Unsupported bit width: {other} (expected 1, 2, 3, 4, 8 or 16)"
            ))),
        }
    }

    /// Number of bits per value
    pub const fn bits(self) -> u32 {
        match self {
            Self::One => 1,
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }

    /// Number of representable codes (`2^bits`)
    pub const fn levels(self) -> u32 {
        1 << self.bits()
    }

    /// Largest code value (`levels - 1`)
    pub const fn max_code(self) -> u32 {
        self.levels() - 1
    }

    /// Packed byte length of `count` values: `ceil(count * bits / 8)`
    pub const fn packed_len(self, count: usize) -> usize {
        (count * self.bits() as usize + 7) / 8
    }

    /// Next narrower width used by the mixed-precision budget loop
    ///
    /// 16 → 8 → 4 → 3 → 2. Returns `None` at 2 bits and below.
    pub const fn downgrade(self) -> Option<Self> {
        match self {
            Self::Sixteen => Some(Self::Eight),
            Self::Eight => Some(Self::Four),
            Self::Four => Some(Self::Three),
            Self::Three => Some(Self::Two),
            Self::Two | Self::One => None,
        }
    }
}

impl TryFrom<u32> for BitWidth {
    type Error = HyperionError;

    fn try_from(bits: u32) -> Result<Self> {
        Self::from_bits(bits)
    }
}

impl From<BitWidth> for u32 {
    fn from(width: BitWidth) -> Self {
        width.bits()
    }
}

impl std::fmt::Display for BitWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Packed quantized values with their affine parameters
///
/// Immutable once produced; requantization always builds a new buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct QuantizedBuffer {
    data: Vec<u8>,
    len: usize,
    bit_width: BitWidth,
    scale: f32,
    zero_point: i32,
}

impl QuantizedBuffer {
    /// Wrap already-packed bytes
    ///
    /// # Errors
    ///
    /// Returns error if `data.len() != ceil(len * bits / 8)`.
    pub fn from_packed(
        data: Vec<u8>,
        len: usize,
        bit_width: BitWidth,
        scale: f32,
        zero_point: i32,
    ) -> Result<Self> {
        let expected = bit_width.packed_len(len);
        if data.len() != expected {
            return Err(HyperionError::InvalidShape {
                reason: format!(
                    "Packed length {} does not match {} values at {} (expected {} bytes)",
                    data.len(),
                    len,
                    bit_width,
                    expected
                ),
            });
        }
        Ok(Self {
            data,
            len,
            bit_width,
            scale,
            zero_point,
        })
    }

    /// Pack unpacked codes
    ///
    /// # Errors
    ///
    /// Returns error if any code exceeds the width's largest code.
    pub fn from_codes(
        codes: &[u32],
        bit_width: BitWidth,
        scale: f32,
        zero_point: i32,
    ) -> Result<Self> {
        if let Some(&bad) = codes.iter().find(|&&c| c > bit_width.max_code()) {
            return Err(HyperionError::InvalidShape {
                reason: format!("Code {bad} does not fit in {bit_width}"),
            });
        }
        Ok(Self {
            data: pack_codes(codes, bit_width),
            len: codes.len(),
            bit_width,
            scale,
            zero_point,
        })
    }

    /// Packed bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume and return the packed bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of logical values
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the buffer holds no values
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Code width
    pub fn bit_width(&self) -> BitWidth {
        self.bit_width
    }

    /// Scale factor
    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Zero point
    pub fn zero_point(&self) -> i32 {
        self.zero_point
    }

    /// Size of the packed payload in bytes
    pub fn memory_bytes(&self) -> usize {
        self.data.len()
    }

    /// Unpacked codes in index order
    pub fn codes(&self) -> Vec<u32> {
        // Length is validated at construction
        unpack_codes(&self.data, self.len, self.bit_width).unwrap_or_default()
    }

    /// Recover floats as `scale * (code - zero_point)`
    pub fn dequantize(&self) -> Vec<f32> {
        self.codes()
            .into_iter()
            .map(|c| self.scale * (c as i64 - i64::from(self.zero_point)) as f32)
            .collect()
    }
}

fn require_non_empty(values: &[f32], op: &str) -> Result<()> {
    if values.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: format!("{op}: input must not be empty"),
        });
    }
    Ok(())
}

/// Affine parameters `(scale, zero_point)` for the range `[min, max]`
///
/// The encoded interval is widened to include 0, so the zero point always
/// lands inside `[0, levels - 1]` and a one-signed range keeps every level.
/// Degenerate ranges (`max <= min`) yield `(1.0, 0)`.
pub fn affine_params(min: f32, max: f32, bit_width: BitWidth) -> (f32, i32) {
    if max - min <= 0.0 || min.is_nan() || max.is_nan() {
        return (1.0, 0);
    }
    let min = min.min(0.0);
    let max = max.max(0.0);
    let range = max - min;
    let max_code = bit_width.max_code() as f32;
    let scale = range / max_code;
    let zero_point = (-min / scale).round().clamp(0.0, max_code) as i32;
    (scale, zero_point)
}

/// Quantize one value with the given affine parameters, clamped to the code range
#[inline]
pub fn quantize_value(x: f32, scale: f32, zero_point: i32, bit_width: BitWidth) -> u32 {
    let max_code = i64::from(bit_width.max_code());
    let q = (x / scale).round() as i64 + i64::from(zero_point);
    q.clamp(0, max_code) as u32
}

/// Uniform asymmetric quantization with percentile outlier clipping
///
/// The range is taken from the 1st and 99th percentile of `values` (which
/// keeps the exact min/max for fewer than 100 values) and widened to
/// include 0. Values outside the representable interval saturate.
///
/// # Errors
///
/// Returns error if `values` is empty.
pub fn quantize_asymmetric(values: &[f32], bit_width: BitWidth) -> Result<QuantizedBuffer> {
    require_non_empty(values, "quantize_asymmetric")?;

    let (min, max) = stats::clipped_min_max(values, CLIP_PERCENTILE);
    if max <= min || max.is_nan() || min.is_nan() {
        return QuantizedBuffer::from_packed(
            vec![0u8; bit_width.packed_len(values.len())],
            values.len(),
            bit_width,
            1.0,
            0,
        );
    }

    let (scale, zero_point) = affine_params(min, max, bit_width);
    let codes: Vec<u32> = values
        .iter()
        .map(|&x| quantize_value(x, scale, zero_point, bit_width))
        .collect();

    QuantizedBuffer::from_codes(&codes, bit_width, scale, zero_point)
}

/// Uniform symmetric quantization around zero
///
/// Codes are `round(x / scale)` clamped to `[-2^(b-1), 2^(b-1) - 1]` and
/// stored offset by `zero_point = 2^(b-1)`, so [`QuantizedBuffer::dequantize`]
/// applies unchanged. All-zero input yields `scale = 1` and zero values.
///
/// # Errors
///
/// Returns error if `values` is empty or `bit_width` is 1 bit.
pub fn quantize_symmetric(values: &[f32], bit_width: BitWidth) -> Result<QuantizedBuffer> {
    require_non_empty(values, "quantize_symmetric")?;
    if bit_width == BitWidth::One {
        return Err(HyperionError::UnsupportedOperation {
            operation: "quantize_symmetric".to_string(),
            reason: "1-bit symmetric quantization has no magnitude levels; use quantize_binary"
                .to_string(),
        });
    }

    let bias = 1i64 << (bit_width.bits() - 1);
    let max_level = bias - 1;
    let max_abs = values.iter().fold(0.0f32, |acc, x| acc.max(x.abs()));

    if max_abs < 1e-8 {
        let codes = vec![bias as u32; values.len()];
        return QuantizedBuffer::from_codes(&codes, bit_width, 1.0, bias as i32);
    }

    let scale = max_abs / max_level as f32;
    let codes: Vec<u32> = values
        .iter()
        .map(|&x| {
            let q = ((x / scale).round() as i64).clamp(-max_level - 1, max_level);
            (q + bias) as u32
        })
        .collect();

    QuantizedBuffer::from_codes(&codes, bit_width, scale, bias as i32)
}

/// Dequantize raw packed bytes
///
/// Exact inverse of the affine mapping; performs no clipping.
///
/// # Errors
///
/// Returns error if `count` is zero or `data` is too short.
pub fn dequantize(
    data: &[u8],
    count: usize,
    bit_width: BitWidth,
    scale: f32,
    zero_point: i32,
) -> Result<Vec<f32>> {
    if count == 0 {
        return Err(HyperionError::InvalidShape {
            reason: "dequantize: count must be non-zero".to_string(),
        });
    }
    let codes = unpack_codes(data, count, bit_width)?;
    Ok(codes
        .into_iter()
        .map(|c| scale * (c as i64 - i64::from(zero_point)) as f32)
        .collect())
}

/// Simulate a quantize/dequantize round trip in floating point
///
/// Each value is rounded with `(scale, zero_point)`, clamped to the code
/// range, and mapped back. Nothing is packed.
///
/// # Errors
///
/// Returns error if `values` is empty or `scale` is not positive and finite.
pub fn fake_quantize(
    values: &[f32],
    bit_width: BitWidth,
    scale: f32,
    zero_point: i32,
) -> Result<Vec<f32>> {
    require_non_empty(values, "fake_quantize")?;
    if scale <= 0.0 || !scale.is_finite() {
        return Err(HyperionError::InvalidConfiguration(format!(
            "fake_quantize: scale must be positive and finite, got {scale}"
        )));
    }
    Ok(values
        .iter()
        .map(|&x| {
            let q = quantize_value(x, scale, zero_point, bit_width);
            scale * (q as i64 - i64::from(zero_point)) as f32
        })
        .collect())
}

/// Multiply two quantized matrices, requantizing the product at 8 bits
///
/// `a` is `m×k`, `b` is `k×n`, both row-major. Operands are dequantized,
/// multiplied in f32, and the `m×n` result is quantized asymmetrically.
///
/// # Errors
///
/// Returns error if a dimension is zero or an operand has the wrong length.
pub fn quantized_matmul(
    a: &QuantizedBuffer,
    b: &QuantizedBuffer,
    m: usize,
    n: usize,
    k: usize,
) -> Result<QuantizedBuffer> {
    if m == 0 || n == 0 || k == 0 {
        return Err(HyperionError::InvalidShape {
            reason: format!("quantized_matmul: zero dimension in {m}x{k} * {k}x{n}"),
        });
    }
    if a.len() != m * k {
        return Err(HyperionError::DataShapeMismatch {
            data_size: a.len(),
            shape: vec![m, k],
            expected: m * k,
        });
    }
    if b.len() != k * n {
        return Err(HyperionError::DataShapeMismatch {
            data_size: b.len(),
            shape: vec![k, n],
            expected: k * n,
        });
    }

    let lhs = a.dequantize();
    let rhs = b.dequantize();
    let mut result = vec![0.0f32; m * n];
    for row in 0..m {
        for col in 0..n {
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += lhs[row * k + i] * rhs[i * n + col];
            }
            result[row * n + col] = acc;
        }
    }

    quantize_asymmetric(&result, BitWidth::Eight)
}
