//! Runtime configuration
//!
//! JSON document with two optional sections; every missing field takes its
//! default.
//!
//! ```json
//! {
//!   "generation": { "max_tokens": 64, "sampling_method": "top_k", "top_k": 10 },
//!   "quantization": { "method": "symmetric", "default_bit_width": 8 }
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{HyperionError, Result};
use crate::generate::{GenerationParams, GenerationStyle, SamplingMethod};
use crate::quantize::{BitWidth, DynamicQuantConfig, MixedPrecisionConfig, QuantMethod};

/// Generation defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationDefaults {
    /// Token limit
    pub max_tokens: usize,
    /// Sampling strategy
    pub sampling_method: SamplingMethod,
    /// Softmax temperature
    pub temperature: f32,
    /// Top-k candidate count
    pub top_k: usize,
    /// Nucleus mass
    pub top_p: f32,
    /// RNG seed (0 = time-derived)
    pub seed: u64,
    /// Style override
    pub style: GenerationStyle,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        let p = GenerationParams::default();
        Self {
            max_tokens: p.max_tokens,
            sampling_method: p.sampling_method,
            temperature: p.temperature,
            top_k: p.top_k,
            top_p: p.top_p,
            seed: p.seed,
            style: p.style,
        }
    }
}

impl GenerationDefaults {
    /// Parameters with no prompt
    pub fn to_params(&self) -> GenerationParams {
        GenerationParams {
            max_tokens: self.max_tokens,
            sampling_method: self.sampling_method,
            temperature: self.temperature,
            top_k: self.top_k,
            top_p: self.top_p,
            seed: self.seed,
            prompt: Vec::new(),
            style: self.style,
        }
    }
}

/// Quantization defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantizationDefaults {
    /// Per-layer method
    pub method: QuantMethod,
    /// Width used when bit widths are not assigned automatically
    pub default_bit_width: BitWidth,
    /// Fraction of the FP32 size to fit into, if any
    pub memory_budget: Option<f32>,
    /// Pick widths per layer from weight sensitivity
    pub auto_assign: bool,
    /// Activation quantization
    pub dynamic: DynamicQuantConfig,
    /// Histogram bins for statistics (0 disables)
    pub histogram_bins: usize,
}

impl Default for QuantizationDefaults {
    fn default() -> Self {
        Self {
            method: QuantMethod::Asymmetric,
            default_bit_width: BitWidth::Four,
            memory_budget: None,
            auto_assign: true,
            dynamic: DynamicQuantConfig::default(),
            histogram_bins: 0,
        }
    }
}

impl QuantizationDefaults {
    /// Settings for [`crate::quantize::quantize_layers`]
    pub fn to_mixed_precision(&self) -> MixedPrecisionConfig {
        MixedPrecisionConfig {
            memory_budget: self.memory_budget,
            method: self.method,
            default_bit_width: self.default_bit_width,
            auto_assign: self.auto_assign,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Generation defaults
    pub generation: GenerationDefaults,
    /// Quantization defaults
    pub quantization: QuantizationDefaults,
}

impl RuntimeConfig {
    /// Parse and validate a JSON document
    ///
    /// # Errors
    ///
    /// Returns error if the JSON is malformed or a value is out of range.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| HyperionError::IoError {
            message: format!("Failed to read config '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Serialize as pretty-printed JSON
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check value ranges
    ///
    /// # Errors
    ///
    /// Returns [`HyperionError::InvalidConfiguration`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        let g = &self.generation;
        if g.max_tokens == 0 {
            return Err(invalid("generation.max_tokens must be at least 1"));
        }
        if !g.temperature.is_finite() {
            return Err(invalid("generation.temperature must be finite"));
        }
        if !(0.0..=1.0).contains(&g.top_p) {
            return Err(invalid("generation.top_p must be in [0, 1]"));
        }

        let q = &self.quantization;
        if let Some(budget) = q.memory_budget {
            if budget <= 0.0 || budget > 1.0 || budget.is_nan() {
                return Err(invalid("quantization.memory_budget must be in (0, 1]"));
            }
        }
        if !(0.0..1.0).contains(&q.dynamic.momentum) {
            return Err(invalid("quantization.dynamic.momentum must be in [0, 1)"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> HyperionError {
    HyperionError::InvalidConfiguration(message.to_string())
}
