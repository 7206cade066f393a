//! Forward pass executor
//!
//! Each layer reads the active activation buffer and writes the other one,
//! then the pair is swapped. Weights are dequantized per layer on demand.
//!
//! ## Architectures
//!
//! - [`ModelArch::RecurrentSequential`]: embeds only the last token of the
//!   window and carries a single vector through every layer. Attention and
//!   LayerNorm layers are not supported on this path.
//! - [`ModelArch::Transformer`]: embeds every position in the window and
//!   applies Dense/LayerNorm per position. The Output layer projects only
//!   the last position.
//!
//! Windows longer than the context size are cut to their most recent
//! `context_size` tokens.

use tracing::trace;

use super::{LayerDescriptor, LayerKind, Model, ModelArch};
use crate::error::{HyperionError, Result};
use crate::vocab::{TokenId, TOKEN_UNKNOWN};

/// LayerNorm variance epsilon
pub const LAYER_NORM_EPS: f32 = 1e-5;

impl Model {
    /// Run the model over `tokens` and return logits for the next token
    ///
    /// The returned vector has exactly `vocabulary().token_count()` entries.
    ///
    /// # Errors
    ///
    /// Returns error if `tokens` is empty, a layer's input width does not
    /// match the activations it receives, a layer that needs weights has
    /// none, the architecture does not support a layer kind, or the final
    /// activations are narrower than the vocabulary. No logits are produced
    /// on error.
    pub fn forward(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(HyperionError::InvalidShape {
                reason: "forward: token sequence must not be empty".to_string(),
            });
        }
        if self.layers.is_empty() {
            return Err(HyperionError::InvalidShape {
                reason: "forward: model has no layers".to_string(),
            });
        }

        let start = tokens.len().saturating_sub(self.context_size);
        let window = &tokens[start..];
        let positions = match self.arch {
            ModelArch::RecurrentSequential => &window[window.len() - 1..],
            ModelArch::Transformer => window,
        };
        let vocab_size = self.vocab.token_count();
        let arch = self.arch;

        let [first, second] = &mut self.activations;
        let (mut input, mut output) = (first, second);
        let mut active = 0;
        let mut seq = positions.len();
        let mut width = 0usize;

        for (idx, layer) in self.layers.iter().enumerate() {
            let layer: &LayerDescriptor = layer;
            check_arch(arch, layer, idx)?;

            let (next_seq, next_width) = match layer.kind() {
                LayerKind::Embedding => {
                    embed(layer, idx, positions, vocab_size, output)?;
                    (positions.len(), layer.output_size())
                },
                LayerKind::Dense => {
                    expect_width(layer, idx, width)?;
                    dense(layer, idx, &input[..seq * width], seq, output)?;
                    (seq, layer.output_size())
                },
                LayerKind::Attention => {
                    expect_width(layer, idx, width)?;
                    output[..seq * width].copy_from_slice(&input[..seq * width]);
                    (seq, width)
                },
                LayerKind::LayerNorm => {
                    expect_width(layer, idx, width)?;
                    layer_norm(&input[..seq * width], seq, width, layer.bias(), output);
                    (seq, width)
                },
                LayerKind::Output => {
                    expect_width(layer, idx, width)?;
                    let last = &input[(seq - 1) * width..seq * width];
                    dense(layer, idx, last, 1, output)?;
                    (1, layer.output_size())
                },
            };

            seq = next_seq;
            width = next_width;
            layer.activation().apply_slice(&mut output[..seq * width]);
            trace!(layer = idx, kind = ?layer.kind(), seq, width, "layer done");

            std::mem::swap(&mut input, &mut output);
            active ^= 1;
        }
        self.active = active;

        if width < vocab_size {
            return Err(HyperionError::InvalidShape {
                reason: format!(
                    "Final activations have width {width}, narrower than vocabulary {vocab_size}"
                ),
            });
        }
        let last = &input[(seq - 1) * width..seq * width];
        Ok(last[..vocab_size].to_vec())
    }

    /// Activations left by the most recent forward pass
    pub fn last_activations(&self) -> &[f32] {
        &self.activations[self.active]
    }
}

fn check_arch(arch: ModelArch, layer: &LayerDescriptor, idx: usize) -> Result<()> {
    if arch == ModelArch::RecurrentSequential
        && matches!(layer.kind(), LayerKind::Attention | LayerKind::LayerNorm)
    {
        return Err(HyperionError::UnsupportedOperation {
            operation: "forward".to_string(),
            reason: format!(
                "{:?} layer {idx} is not supported by the recurrent architecture",
                layer.kind()
            ),
        });
    }
    Ok(())
}

fn expect_width(layer: &LayerDescriptor, idx: usize, width: usize) -> Result<()> {
    if layer.input_size() != width {
        return Err(HyperionError::InvalidShape {
            reason: format!(
                "{:?} layer {idx} expects input width {}, got {width}",
                layer.kind(),
                layer.input_size()
            ),
        });
    }
    Ok(())
}

fn dequantized_weights(layer: &LayerDescriptor, idx: usize) -> Result<Vec<f32>> {
    layer
        .weights()
        .map(|w| w.dequantize())
        .ok_or_else(|| HyperionError::InvalidShape {
            reason: format!("{:?} layer {idx} has no weights", layer.kind()),
        })
}

/// Copy the weight row of each token into `output`
///
/// Row `t` starts at `t * output_size`; ids outside the vocabulary or the
/// table map to [`TOKEN_UNKNOWN`].
fn embed(
    layer: &LayerDescriptor,
    idx: usize,
    tokens: &[TokenId],
    vocab_size: usize,
    output: &mut [f32],
) -> Result<()> {
    let table = dequantized_weights(layer, idx)?;
    let rows = layer.input_size();
    let dim = layer.output_size();
    for (pos, &token) in tokens.iter().enumerate() {
        let id = token as usize;
        let row = if id >= vocab_size || id >= rows {
            TOKEN_UNKNOWN as usize
        } else {
            id
        };
        output[pos * dim..(pos + 1) * dim].copy_from_slice(&table[row * dim..(row + 1) * dim]);
    }
    Ok(())
}

/// `output[p, j] = bias[j] + Σ_k input[p, k] · W[k, j]`
fn dense(
    layer: &LayerDescriptor,
    idx: usize,
    input: &[f32],
    seq: usize,
    output: &mut [f32],
) -> Result<()> {
    let weights = dequantized_weights(layer, idx)?;
    let in_dim = layer.input_size();
    let out_dim = layer.output_size();

    for p in 0..seq {
        let x = &input[p * in_dim..(p + 1) * in_dim];
        let y = &mut output[p * out_dim..(p + 1) * out_dim];
        match layer.bias() {
            Some(bias) => y.copy_from_slice(bias),
            None => y.fill(0.0),
        }
        for (k, &xk) in x.iter().enumerate() {
            if xk == 0.0 {
                continue;
            }
            let row = &weights[k * out_dim..(k + 1) * out_dim];
            for (yj, &w) in y.iter_mut().zip(row) {
                *yj += xk * w;
            }
        }
    }
    Ok(())
}

/// Per-position normalization
///
/// Scale and shift come from the bias halves `bias[k]` and
/// `bias[width + k]` when the bias holds both; otherwise the normalized
/// values are written unscaled.
fn layer_norm(input: &[f32], seq: usize, width: usize, bias: Option<&[f32]>, output: &mut [f32]) {
    let affine = bias.filter(|b| b.len() >= 2 * width);
    for p in 0..seq {
        let x = &input[p * width..(p + 1) * width];
        let y = &mut output[p * width..(p + 1) * width];
        let n = width as f32;
        let mean = x.iter().sum::<f32>() / n;
        let variance = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (variance + LAYER_NORM_EPS).sqrt();
        for (k, (yk, &xk)) in y.iter_mut().zip(x).enumerate() {
            let normed = (xk - mean) * inv_std;
            *yk = match affine {
                Some(b) => normed * b[k] + b[width + k],
                None => normed,
            };
        }
    }
}
