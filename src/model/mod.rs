//! Model and layer graph
//!
//! A [`Model`] is an append-only sequence of [`LayerDescriptor`]s executed
//! in insertion order, plus two activation buffers used as a ping-pong pair
//! across layer boundaries.
//!
//! Layer descriptors are reference counted. [`Model::fork`] creates a second
//! model that shares every weight buffer but owns fresh activation buffers,
//! so independent generations can run on separate threads. Replacing a
//! layer's weights copies the descriptor first if it is shared.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{HyperionError, Result};
use crate::quantize::{quantize_asymmetric, BitWidth, QuantizedBuffer};
use crate::vocab::Vocabulary;

pub mod forward;
pub mod loader;

pub use loader::{
    decode_weights_section, encode_weights_section, load_legacy, load_model,
    load_model_with_vocabulary, load_package, save_package, write_legacy,
};

/// Largest activation buffer a model may allocate, in f32 values (256 MiB)
pub const MAX_ACTIVATION_ELEMENTS: usize = 1 << 26;

/// Grow `buffer` to `needed` zeroed values without aborting on failure
fn grow_activation_buffer(buffer: &mut Vec<f32>, needed: usize) -> Result<()> {
    if needed > MAX_ACTIVATION_ELEMENTS {
        return Err(HyperionError::OutOfMemory {
            needed,
            reason: format!("activation limit is {MAX_ACTIVATION_ELEMENTS} values"),
        });
    }
    if buffer.len() >= needed {
        return Ok(());
    }
    buffer
        .try_reserve_exact(needed - buffer.len())
        .map_err(|e| HyperionError::OutOfMemory {
            needed,
            reason: e.to_string(),
        })?;
    buffer.resize(needed, 0.0);
    Ok(())
}

/// Layer type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// Token id → weight row lookup
    Embedding,
    /// `input × weight + bias`
    Dense,
    /// Pass-through placeholder; weights are carried but not executed
    Attention,
    /// Per-position normalization with scale/shift taken from the bias
    LayerNorm,
    /// Final projection to logits
    Output,
}

impl LayerKind {
    /// On-disk tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::Embedding => 0,
            Self::Dense => 1,
            Self::Attention => 3,
            Self::LayerNorm => 4,
            Self::Output => 5,
        }
    }

    /// Parse an on-disk tag
    ///
    /// Tag 2 (a recurrent cell) is reserved and never executed.
    ///
    /// # Errors
    ///
    /// Returns error for reserved or unknown tags.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::Embedding),
            1 => Ok(Self::Dense),
            3 => Ok(Self::Attention),
            4 => Ok(Self::LayerNorm),
            5 => Ok(Self::Output),
            other => Err(HyperionError::FormatError {
                reason: format!("Unsupported layer type tag {other}"),
            }),
        }
    }
}

/// Activation applied to a layer's output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Activation {
    /// Identity
    #[default]
    None,
    /// `max(0, x)`
    ReLU,
    /// Logistic sigmoid
    Sigmoid,
    /// Hyperbolic tangent
    Tanh,
    /// GELU, tanh approximation
    Gelu,
}

impl Activation {
    /// On-disk tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::None => 0,
            Self::ReLU => 1,
            Self::Sigmoid => 2,
            Self::Tanh => 3,
            Self::Gelu => 4,
        }
    }

    /// Parse an on-disk tag
    ///
    /// # Errors
    ///
    /// Returns error for unknown tags.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::None),
            1 => Ok(Self::ReLU),
            2 => Ok(Self::Sigmoid),
            3 => Ok(Self::Tanh),
            4 => Ok(Self::Gelu),
            other => Err(HyperionError::FormatError {
                reason: format!("Unsupported activation tag {other}"),
            }),
        }
    }

    /// Apply to one value
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            Self::None => x,
            Self::ReLU => x.max(0.0),
            Self::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Self::Tanh => x.tanh(),
            Self::Gelu => {
                // sqrt(2/π)
                const SQRT_2_OVER_PI: f32 = 0.797_884_6;
                0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044_715 * x * x * x)).tanh())
            },
        }
    }

    /// Apply in place
    pub fn apply_slice(self, values: &mut [f32]) {
        if self == Self::None {
            return;
        }
        for v in values {
            *v = self.apply(*v);
        }
    }
}

/// Model architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelArch {
    /// Single-vector path over the last token
    RecurrentSequential,
    /// Per-position path over the whole window
    Transformer,
}

impl ModelArch {
    /// On-disk tag
    pub const fn tag(self) -> u32 {
        match self {
            Self::RecurrentSequential => 0,
            Self::Transformer => 1,
        }
    }

    /// Parse an on-disk tag
    ///
    /// # Errors
    ///
    /// Returns error for unknown tags.
    pub fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(Self::RecurrentSequential),
            1 => Ok(Self::Transformer),
            other => Err(HyperionError::FormatError {
                reason: format!("Unsupported model type tag {other}"),
            }),
        }
    }
}

/// One layer: shape, activation, quantized weights and optional bias
#[derive(Debug, Clone, PartialEq)]
pub struct LayerDescriptor {
    kind: LayerKind,
    input_size: usize,
    output_size: usize,
    activation: Activation,
    weights: Option<QuantizedBuffer>,
    bias: Option<Vec<f32>>,
}

impl LayerDescriptor {
    /// Create a layer with no weights
    ///
    /// # Errors
    ///
    /// Returns error if either size is zero.
    pub fn new(
        kind: LayerKind,
        input_size: usize,
        output_size: usize,
        activation: Activation,
    ) -> Result<Self> {
        if input_size == 0 || output_size == 0 {
            return Err(HyperionError::InvalidShape {
                reason: format!("{kind:?} layer needs non-zero sizes, got {input_size}x{output_size}"),
            });
        }
        Ok(Self {
            kind,
            input_size,
            output_size,
            activation,
            weights: None,
            bias: None,
        })
    }

    /// Layer type
    pub fn kind(&self) -> LayerKind {
        self.kind
    }

    /// Input width (vocabulary rows for embeddings)
    pub fn input_size(&self) -> usize {
        self.input_size
    }

    /// Output width
    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Activation function
    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Quantized weights (`input_size × output_size`, row-major by input)
    pub fn weights(&self) -> Option<&QuantizedBuffer> {
        self.weights.as_ref()
    }

    /// Bias vector
    pub fn bias(&self) -> Option<&[f32]> {
        self.bias.as_deref()
    }

    /// Width of the activations this layer produces
    ///
    /// LayerNorm keeps its input width.
    pub fn produced_width(&self) -> usize {
        match self.kind {
            LayerKind::LayerNorm | LayerKind::Attention => self.input_size,
            _ => self.output_size,
        }
    }

    /// Replace weights and bias
    ///
    /// The buffer is taken by value; the previous buffer is dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the buffer does not hold `input_size * output_size`
    /// values or the bias length is not `output_size`.
    pub fn set_weights(&mut self, weights: QuantizedBuffer, bias: Option<Vec<f32>>) -> Result<()> {
        let expected = self.input_size * self.output_size;
        if weights.len() != expected {
            return Err(HyperionError::DataShapeMismatch {
                data_size: weights.len(),
                shape: vec![self.input_size, self.output_size],
                expected,
            });
        }
        if let Some(b) = &bias {
            if b.len() != self.output_size {
                return Err(HyperionError::InvalidShape {
                    reason: format!(
                        "Bias length {} does not match output size {}",
                        b.len(),
                        self.output_size
                    ),
                });
            }
        }
        self.weights = Some(weights);
        self.bias = bias;
        Ok(())
    }

    /// Number of weight and bias parameters
    pub fn parameter_count(&self) -> usize {
        self.input_size * self.output_size + self.output_size
    }
}

/// A loaded model
pub struct Model {
    arch: ModelArch,
    hidden_size: usize,
    context_size: usize,
    vocab: Arc<dyn Vocabulary>,
    layers: Vec<Arc<LayerDescriptor>>,
    activations: [Vec<f32>; 2],
    active: usize,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("arch", &self.arch)
            .field("hidden_size", &self.hidden_size)
            .field("context_size", &self.context_size)
            .field("vocab_size", &self.vocab.token_count())
            .field("layers", &self.layers.len())
            .finish_non_exhaustive()
    }
}

impl Model {
    /// Create an empty model
    ///
    /// # Errors
    ///
    /// Returns error if `hidden_size` or `context_size` is zero, or the
    /// activation buffers would exceed [`MAX_ACTIVATION_ELEMENTS`].
    pub fn new(
        arch: ModelArch,
        hidden_size: usize,
        context_size: usize,
        vocab: Arc<dyn Vocabulary>,
    ) -> Result<Self> {
        if hidden_size == 0 || context_size == 0 {
            return Err(HyperionError::InvalidShape {
                reason: format!(
                    "Model needs non-zero hidden and context size, got hidden={hidden_size} context={context_size}"
                ),
            });
        }
        let capacity = hidden_size
            .checked_mul(context_size)
            .ok_or_else(|| HyperionError::InvalidShape {
                reason: format!("Activation buffer {hidden_size}x{context_size} overflows"),
            })?;
        let mut activations = [Vec::new(), Vec::new()];
        for buffer in &mut activations {
            grow_activation_buffer(buffer, capacity)?;
        }
        Ok(Self {
            arch,
            hidden_size,
            context_size,
            vocab,
            layers: Vec::new(),
            activations,
            active: 0,
        })
    }

    /// Architecture
    pub fn arch(&self) -> ModelArch {
        self.arch
    }

    /// Hidden width
    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }

    /// Maximum token window
    pub fn context_size(&self) -> usize {
        self.context_size
    }

    /// Shared vocabulary handle
    pub fn vocabulary(&self) -> &Arc<dyn Vocabulary> {
        &self.vocab
    }

    /// Number of layers
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Layer at `index`
    pub fn layer(&self, index: usize) -> Option<&LayerDescriptor> {
        self.layers.get(index).map(Arc::as_ref)
    }

    /// All layers, in execution order
    pub fn layers(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter().map(Arc::as_ref)
    }

    /// Capacity of each activation buffer, in floats
    pub fn activation_capacity(&self) -> usize {
        self.activations[0].len()
    }

    /// Total weight and bias parameters
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    /// Packed weight bytes held by all layers
    pub fn weight_bytes(&self) -> usize {
        self.layers
            .iter()
            .filter_map(|l| l.weights().map(QuantizedBuffer::memory_bytes))
            .sum()
    }

    /// Append a layer and return its index
    ///
    /// Activation buffers grow to `context_size * max(hidden, widest layer)`.
    ///
    /// # Errors
    ///
    /// Returns error if either size is zero, or the activation buffers would
    /// exceed [`MAX_ACTIVATION_ELEMENTS`] or cannot be allocated. The model
    /// is unchanged in that case.
    pub fn add_layer(
        &mut self,
        kind: LayerKind,
        input_size: usize,
        output_size: usize,
        activation: Activation,
    ) -> Result<usize> {
        let layer = LayerDescriptor::new(kind, input_size, output_size, activation)?;
        let width = input_size.max(output_size).max(self.hidden_size);
        let needed = width
            .checked_mul(self.context_size)
            .ok_or_else(|| HyperionError::InvalidShape {
                reason: format!("Activation buffer {width}x{} overflows", self.context_size),
            })?;
        let previous = self.activations[0].len();
        let grown = self
            .activations
            .iter_mut()
            .try_for_each(|buffer| grow_activation_buffer(buffer, needed));
        if let Err(e) = grown {
            for buffer in &mut self.activations {
                buffer.truncate(previous);
                buffer.shrink_to_fit();
            }
            return Err(e);
        }
        self.layers.push(Arc::new(layer));
        Ok(self.layers.len() - 1)
    }

    /// Replace a layer's weights, taking ownership of `weights`
    ///
    /// # Errors
    ///
    /// Returns error if the index is out of range or the shapes do not match.
    pub fn set_layer_weights(
        &mut self,
        index: usize,
        weights: QuantizedBuffer,
        bias: Option<Vec<f32>>,
    ) -> Result<()> {
        let count = self.layers.len();
        let layer = self
            .layers
            .get_mut(index)
            .ok_or_else(|| HyperionError::InvalidShape {
                reason: format!("Layer index {index} out of range ({count} layers)"),
            })?;
        Arc::make_mut(layer).set_weights(weights, bias)
    }

    /// Quantize float weights asymmetrically and install them
    ///
    /// # Errors
    ///
    /// Returns error if quantization fails or the shapes do not match.
    pub fn quantize_layer_weights(
        &mut self,
        index: usize,
        weights: &[f32],
        bit_width: BitWidth,
        bias: Option<Vec<f32>>,
    ) -> Result<()> {
        let buffer = quantize_asymmetric(weights, bit_width)?;
        self.set_layer_weights(index, buffer, bias)
    }

    /// A model sharing this model's layers with fresh activation buffers
    pub fn fork(&self) -> Self {
        let capacity = self.activation_capacity();
        Self {
            arch: self.arch,
            hidden_size: self.hidden_size,
            context_size: self.context_size,
            vocab: Arc::clone(&self.vocab),
            layers: self.layers.clone(),
            activations: [vec![0.0; capacity], vec![0.0; capacity]],
            active: 0,
        }
    }

    /// Requantize every layer at one width
    ///
    /// # Errors
    ///
    /// Returns error if a layer has no weights; no layer is changed in that case.
    pub fn requantize(&mut self, bit_width: BitWidth) -> Result<()> {
        let widths = vec![bit_width; self.layers.len()];
        self.requantize_mixed(&widths)
    }

    /// Requantize each layer at its own width
    ///
    /// All new buffers are built before any layer is updated.
    ///
    /// # Errors
    ///
    /// Returns error if `bit_widths` has the wrong length or a layer has no weights.
    pub fn requantize_mixed(&mut self, bit_widths: &[BitWidth]) -> Result<()> {
        if bit_widths.len() != self.layers.len() {
            return Err(HyperionError::InvalidShape {
                reason: format!(
                    "Got {} bit widths for {} layers",
                    bit_widths.len(),
                    self.layers.len()
                ),
            });
        }

        let mut rebuilt = Vec::with_capacity(self.layers.len());
        for (idx, (layer, &width)) in self.layers.iter().zip(bit_widths).enumerate() {
            let weights = layer.weights().ok_or_else(|| HyperionError::InvalidConfiguration(
                format!("Layer {idx} has no weights to requantize"),
            ))?;
            rebuilt.push(quantize_asymmetric(&weights.dequantize(), width)?);
        }

        for (layer, buffer) in self.layers.iter_mut().zip(rebuilt) {
            Arc::make_mut(layer).weights = Some(buffer);
        }
        info!(layers = self.layers.len(), "requantized model");
        Ok(())
    }

    /// Float weights of every layer, for bit-width selection
    pub fn dequantized_weights(&self) -> Vec<Vec<f32>> {
        self.layers
            .iter()
            .map(|l| l.weights().map(QuantizedBuffer::dequantize).unwrap_or_default())
            .collect()
    }
}

/// Release a model
///
/// Every weight buffer, bias and activation buffer is dropped. The
/// vocabulary handle is released but the vocabulary itself is not destroyed
/// while other handles exist.
pub fn destroy_model(model: Model) {
    debug!(layers = model.layer_count(), "destroying model");
    drop(model);
}

#[cfg(test)]
mod tests;
