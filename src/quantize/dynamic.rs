//! Dynamic activation quantization
//!
//! By default every call derives scale/zero-point from the buffer being
//! quantized. With running statistics enabled, each layer keeps an
//! exponential moving average of the activation range and quantizes against
//! the smoothed range instead.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{affine_params, quantize_asymmetric, quantize_value, BitWidth, QuantizedBuffer};
use crate::error::{HyperionError, Result};
use crate::stats::compute_stats;

/// Settings for [`DynamicQuantizer`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicQuantConfig {
    /// Keep a per-layer moving average of the activation range
    pub use_running_stats: bool,
    /// Weight of the previous average, in `[0, 1)`
    pub momentum: f32,
}

impl Default for DynamicQuantConfig {
    fn default() -> Self {
        Self {
            use_running_stats: false,
            momentum: 0.9,
        }
    }
}

/// Per-layer running statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningStats {
    /// Smoothed minimum
    pub min: f32,
    /// Smoothed maximum
    pub max: f32,
    /// Smoothed mean
    pub mean: f32,
    /// Smoothed variance
    pub variance: f32,
    /// Number of buffers folded in
    pub samples: u64,
}

/// Activation quantizer with optional per-layer smoothing
#[derive(Debug, Clone, Default)]
pub struct DynamicQuantizer {
    config: DynamicQuantConfig,
    running: HashMap<usize, RunningStats>,
}

impl DynamicQuantizer {
    /// Create a quantizer
    ///
    /// # Errors
    ///
    /// Returns error if `momentum` is outside `[0, 1)`.
    pub fn new(config: DynamicQuantConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.momentum) {
            return Err(HyperionError::InvalidConfiguration(format!(
                "momentum must be in [0, 1), got {}",
                config.momentum
            )));
        }
        Ok(Self {
            config,
            running: HashMap::new(),
        })
    }

    /// Current settings
    pub fn config(&self) -> &DynamicQuantConfig {
        &self.config
    }

    /// Running statistics recorded for `layer`
    pub fn running_stats(&self, layer: usize) -> Option<&RunningStats> {
        self.running.get(&layer)
    }

    /// Forget all running statistics
    pub fn reset(&mut self) {
        self.running.clear();
    }

    /// Quantize `activations` produced by `layer`
    ///
    /// # Errors
    ///
    /// Returns error if `activations` is empty.
    pub fn quantize(
        &mut self,
        layer: usize,
        activations: &[f32],
        bit_width: BitWidth,
    ) -> Result<QuantizedBuffer> {
        if !self.config.use_running_stats {
            return quantize_asymmetric(activations, bit_width);
        }

        let current = compute_stats(activations, 0)?;
        let momentum = self.config.momentum;
        let entry = self
            .running
            .entry(layer)
            .and_modify(|r| {
                let blend = |old: f32, new: f32| momentum * old + (1.0 - momentum) * new;
                r.min = blend(r.min, current.min);
                r.max = blend(r.max, current.max);
                r.mean = blend(r.mean, current.mean);
                r.variance = blend(r.variance, current.variance);
                r.samples += 1;
            })
            .or_insert(RunningStats {
                min: current.min,
                max: current.max,
                mean: current.mean,
                variance: current.variance,
                samples: 1,
            });

        let (scale, zero_point) = affine_params(entry.min, entry.max, bit_width);
        let codes: Vec<u32> = if entry.max > entry.min {
            activations
                .iter()
                .map(|&x| quantize_value(x, scale, zero_point, bit_width))
                .collect()
        } else {
            vec![0; activations.len()]
        };
        QuantizedBuffer::from_codes(&codes, bit_width, scale, zero_point)
    }
}
