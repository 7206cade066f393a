//! Mixed-precision quantization
//!
//! Layers are ranked by sensitivity (mean absolute weight) and given an
//! initial width from fixed thresholds:
//!
//! | mean \|w\| | width |
//! |------------|-------|
//! | > 0.75     | 8     |
//! | > 0.4      | 4     |
//! | > 0.2      | 3     |
//! | otherwise  | 2     |
//!
//! With a memory budget, the least sensitive layer still above 2 bits is
//! downgraded one step at a time (8 → 4 → 3 → 2) until the encoded size fits
//! `32 * total_weights * budget`. Equal sensitivities resolve to the lowest
//! layer index, so the assignment is fully deterministic.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{log, quantize_asymmetric, quantize_symmetric, BitWidth, QuantizedBuffer};
use crate::error::{HyperionError, Result};

/// Mean-square calibration activation above which a layer keeps at least 4 bits
pub const CALIBRATION_VARIANCE_THRESHOLD: f32 = 0.5;

/// Quantization method applied to each layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantMethod {
    /// [`quantize_asymmetric`]
    #[default]
    Asymmetric,
    /// [`quantize_symmetric`]
    Symmetric,
    /// [`log::quantize_log`]
    Logarithmic,
}

/// Settings for [`quantize_layers`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixedPrecisionConfig {
    /// Fraction of the f32 size the quantized layers may use; `None` disables the budget loop
    pub memory_budget: Option<f32>,
    /// Per-layer codec
    pub method: QuantMethod,
    /// Width used when no assignment is computed
    pub default_bit_width: BitWidth,
    /// Compute an assignment with [`select_bit_widths`] when none is supplied
    pub auto_assign: bool,
}

impl Default for MixedPrecisionConfig {
    fn default() -> Self {
        Self {
            memory_budget: None,
            method: QuantMethod::Asymmetric,
            default_bit_width: BitWidth::Four,
            auto_assign: true,
        }
    }
}

/// Per-layer widths and the sensitivity scores they were derived from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MixedPrecisionAssignment {
    /// Chosen width per layer
    pub bit_widths: Vec<BitWidth>,
    /// Mean absolute weight per layer
    pub sensitivities: Vec<f32>,
}

impl MixedPrecisionAssignment {
    /// Average bits per layer (unweighted)
    pub fn average_bits(&self) -> f32 {
        if self.bit_widths.is_empty() {
            return 32.0;
        }
        let total: u32 = self.bit_widths.iter().map(|w| w.bits()).sum();
        total as f32 / self.bit_widths.len() as f32
    }

    /// Average bits per weight, weighted by layer sizes
    pub fn weighted_average_bits(&self, layer_sizes: &[usize]) -> f32 {
        let weights: usize = layer_sizes.iter().sum();
        if weights == 0 {
            return self.average_bits();
        }
        let bits: usize = self
            .bit_widths
            .iter()
            .zip(layer_sizes)
            .map(|(w, &n)| w.bits() as usize * n)
            .sum();
        bits as f32 / weights as f32
    }
}

fn initial_width(sensitivity: f32) -> BitWidth {
    if sensitivity > 0.75 {
        BitWidth::Eight
    } else if sensitivity > 0.4 {
        BitWidth::Four
    } else if sensitivity > 0.2 {
        BitWidth::Three
    } else {
        BitWidth::Two
    }
}

fn validate_layers(layers: &[&[f32]], op: &str) -> Result<()> {
    if layers.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: format!("{op}: at least one layer is required"),
        });
    }
    if let Some(idx) = layers.iter().position(|l| l.is_empty()) {
        return Err(HyperionError::InvalidShape {
            reason: format!("{op}: layer {idx} has no weights"),
        });
    }
    Ok(())
}

/// Assign a width to every layer, optionally fitting a memory budget
///
/// # Errors
///
/// Returns error if `layers` is empty, a layer has no weights, or the budget
/// is not a positive finite fraction.
pub fn select_bit_widths(
    layers: &[&[f32]],
    memory_budget: Option<f32>,
) -> Result<MixedPrecisionAssignment> {
    select_bit_widths_calibrated(layers, memory_budget, &[])
}

/// [`select_bit_widths`] with calibration activations
///
/// After the budget loop, if the mean square of all calibration values
/// exceeds [`CALIBRATION_VARIANCE_THRESHOLD`], every layer below 4 bits is
/// raised to 4 bits. An empty `calibration` slice skips this step.
///
/// # Errors
///
/// Same as [`select_bit_widths`].
pub fn select_bit_widths_calibrated(
    layers: &[&[f32]],
    memory_budget: Option<f32>,
    calibration: &[&[f32]],
) -> Result<MixedPrecisionAssignment> {
    validate_layers(layers, "select_bit_widths")?;
    if let Some(budget) = memory_budget {
        if budget <= 0.0 || !budget.is_finite() {
            return Err(HyperionError::InvalidConfiguration(format!(
                "memory budget must be a positive fraction, got {budget}"
            )));
        }
    }

    let sensitivities: Vec<f32> = layers
        .iter()
        .map(|l| (l.iter().map(|x| f64::from(x.abs())).sum::<f64>() / l.len() as f64) as f32)
        .collect();
    let mut bit_widths: Vec<BitWidth> = sensitivities.iter().map(|&s| initial_width(s)).collect();

    if let Some(budget) = memory_budget {
        let original_bits: f64 = layers.iter().map(|l| l.len() as f64 * 32.0).sum();
        let mut quant_bits: f64 = layers
            .iter()
            .zip(&bit_widths)
            .map(|(l, w)| l.len() as f64 * f64::from(w.bits()))
            .sum();

        let mut target = original_bits * f64::from(budget);
        if target < 1.0 {
            target = original_bits * 0.5;
        }

        while quant_bits > target {
            let mut best: Option<usize> = None;
            for (idx, width) in bit_widths.iter().enumerate() {
                if width.bits() <= 2 {
                    continue;
                }
                if best.map_or(true, |b| sensitivities[idx] < sensitivities[b]) {
                    best = Some(idx);
                }
            }
            let Some(idx) = best else { break };
            let Some(narrower) = bit_widths[idx].downgrade() else {
                break;
            };
            quant_bits -= layers[idx].len() as f64
                * f64::from(bit_widths[idx].bits() - narrower.bits());
            bit_widths[idx] = narrower;
        }

        debug!(
            target_bits = target,
            encoded_bits = quant_bits,
            "mixed-precision budget loop finished"
        );
    }

    let cal_count: usize = calibration.iter().map(|s| s.len()).sum();
    if cal_count > 0 {
        let sum_sq: f64 = calibration
            .iter()
            .flat_map(|s| s.iter())
            .map(|&x| f64::from(x) * f64::from(x))
            .sum();
        let mean_sq = (sum_sq / cal_count as f64) as f32;
        if mean_sq > CALIBRATION_VARIANCE_THRESHOLD {
            for width in &mut bit_widths {
                if *width < BitWidth::Four {
                    *width = BitWidth::Four;
                }
            }
        }
    }

    Ok(MixedPrecisionAssignment {
        bit_widths,
        sensitivities,
    })
}

/// One quantized layer
#[derive(Debug, Clone, PartialEq)]
pub struct LayerQuantization {
    /// Packed weights
    pub buffer: QuantizedBuffer,
    /// Exponent origin for logarithmic codes
    pub log_offset: Option<f32>,
}

/// Output of [`quantize_layers`]
#[derive(Debug, Clone, PartialEq)]
pub struct MixedPrecisionResult {
    /// Quantized layers, in input order
    pub layers: Vec<LayerQuantization>,
    /// Width used per layer
    pub bit_widths: Vec<BitWidth>,
    /// Total f32 size in bytes
    pub original_bytes: usize,
    /// Total packed size in bytes
    pub quantized_bytes: usize,
}

impl MixedPrecisionResult {
    /// `original_bytes / quantized_bytes`
    pub fn compression_ratio(&self) -> f32 {
        if self.quantized_bytes == 0 {
            return 1.0;
        }
        self.original_bytes as f32 / self.quantized_bytes as f32
    }
}

/// Quantize every layer at its assigned width
///
/// Widths come from `assignment` if given, else from [`select_bit_widths`]
/// when `config.auto_assign` is set, else `config.default_bit_width`. Any
/// failure discards every layer quantized so far.
///
/// # Errors
///
/// Returns error if the inputs are malformed, the assignment length does
/// not match, or a layer cannot be encoded with the configured method.
pub fn quantize_layers(
    layers: &[&[f32]],
    config: &MixedPrecisionConfig,
    assignment: Option<&MixedPrecisionAssignment>,
) -> Result<MixedPrecisionResult> {
    validate_layers(layers, "quantize_layers")?;

    let bit_widths = match assignment {
        Some(a) if a.bit_widths.len() != layers.len() => {
            return Err(HyperionError::InvalidShape {
                reason: format!(
                    "assignment covers {} layers, got {}",
                    a.bit_widths.len(),
                    layers.len()
                ),
            });
        },
        Some(a) => a.bit_widths.clone(),
        None if config.auto_assign => select_bit_widths(layers, config.memory_budget)?.bit_widths,
        None => vec![config.default_bit_width; layers.len()],
    };

    let mut out = Vec::with_capacity(layers.len());
    let mut original_bytes = 0;
    let mut quantized_bytes = 0;

    for (weights, &width) in layers.iter().zip(&bit_widths) {
        let layer = match config.method {
            QuantMethod::Asymmetric => LayerQuantization {
                buffer: quantize_asymmetric(weights, width)?,
                log_offset: None,
            },
            QuantMethod::Symmetric => LayerQuantization {
                buffer: quantize_symmetric(weights, width)?,
                log_offset: None,
            },
            QuantMethod::Logarithmic => {
                let q = log::quantize_log(weights, width)?;
                LayerQuantization {
                    buffer: q.buffer,
                    log_offset: Some(q.offset),
                }
            },
        };
        original_bytes += weights.len() * std::mem::size_of::<f32>();
        quantized_bytes += layer.buffer.memory_bytes();
        out.push(layer);
    }

    Ok(MixedPrecisionResult {
        layers: out,
        bit_widths,
        original_bytes,
        quantized_bytes,
    })
}

/// Estimated `(quantized_bytes, compression_ratio)` for `original_bytes` of f32 data
///
/// The ratio is `32 / average_bits`, using the assignment's average width
/// when present and `default_bit_width` otherwise.
pub fn memory_savings(
    original_bytes: usize,
    assignment: Option<&MixedPrecisionAssignment>,
    default_bit_width: BitWidth,
) -> (usize, f32) {
    let avg_bits = assignment.map_or(default_bit_width.bits() as f32, |a| a.average_bits());
    let quantized = (original_bytes as f64 * f64::from(avg_bits) / 32.0) as usize;
    (quantized, 32.0 / avg_bits)
}
