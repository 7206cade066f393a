//! Token sampling
//!
//! Every sampler takes a probability vector and a uniform draw
//! `rng_value` in `[0, 1)`, so callers control the random stream and
//! results are reproducible under a fixed seed.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{HyperionError, Result};

/// Smallest temperature used as a divisor
pub const MIN_TEMPERATURE: f32 = 1e-6;

/// Scale logits by `1 / temperature`
///
/// Temperatures `<= 0` are replaced by 1.0; the divisor is never below
/// [`MIN_TEMPERATURE`].
pub fn apply_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let t = if temperature <= 0.0 || temperature.is_nan() {
        1.0
    } else {
        temperature.max(MIN_TEMPERATURE)
    };
    logits.iter().map(|&x| x / t).collect()
}

/// Numerically stable softmax
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).collect()
    } else {
        vec![1.0 / logits.len() as f32; logits.len()]
    }
}

/// Index of the largest value; the first one wins ties
pub fn sample_greedy(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

/// Inverse-CDF draw from `probs` (need not be normalized)
pub fn sample_from_distribution(probs: &[f32], rng_value: f32) -> usize {
    let total: f32 = probs.iter().sum();
    let target = rng_value.clamp(0.0, 1.0) * total;
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_positive = i;
        if target < cumulative {
            return i;
        }
    }
    last_positive
}

/// Indices sorted by descending probability; ties keep index order
fn ranked(probs: &[f32]) -> Vec<(usize, f32)> {
    let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    indexed
}

/// Sample among the `k` most probable tokens
///
/// `k == 0` is greedy; `k >= probs.len()` samples the full distribution.
pub fn sample_top_k(probs: &[f32], k: usize, rng_value: f32) -> usize {
    if k == 0 {
        return sample_greedy(probs);
    }
    if k >= probs.len() {
        return sample_from_distribution(probs, rng_value);
    }
    let top: Vec<(usize, f32)> = ranked(probs).into_iter().take(k).collect();
    let weights: Vec<f32> = top.iter().map(|&(_, p)| p).collect();
    top[sample_from_distribution(&weights, rng_value)].0
}

/// Nucleus sampling
///
/// Keeps the most probable tokens until their cumulative mass reaches `p`.
/// At least one token is always kept; `p >= 1` samples the full distribution.
pub fn sample_top_p(probs: &[f32], p: f32, rng_value: f32) -> usize {
    if p >= 1.0 {
        return sample_from_distribution(probs, rng_value);
    }
    let sorted = ranked(probs);
    let mut cumulative = 0.0;
    let mut cutoff = sorted.len();
    for (i, &(_, prob)) in sorted.iter().enumerate() {
        cumulative += prob;
        if cumulative >= p {
            cutoff = i + 1;
            break;
        }
    }
    let nucleus = &sorted[..cutoff.max(1)];
    let weights: Vec<f32> = nucleus.iter().map(|&(_, prob)| prob).collect();
    nucleus[sample_from_distribution(&weights, rng_value)].0
}

/// How the next token is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingMethod {
    /// Most probable token
    Greedy,
    /// Full tempered distribution
    Temperature,
    /// Top-k tokens
    TopK,
    /// Nucleus
    #[default]
    TopP,
}

/// Pick the next token from raw logits
///
/// Logits are tempered, passed through softmax, then sampled with `method`.
///
/// # Errors
///
/// Returns error if `logits` is empty.
pub fn sample_token(
    logits: &[f32],
    method: SamplingMethod,
    temperature: f32,
    top_k: usize,
    top_p: f32,
    rng_value: f32,
) -> Result<usize> {
    if logits.is_empty() {
        return Err(HyperionError::InvalidShape {
            reason: "sample_token: logits must not be empty".to_string(),
        });
    }
    let probs = softmax(&apply_temperature(logits, temperature));
    Ok(match method {
        SamplingMethod::Greedy => sample_greedy(&probs),
        SamplingMethod::Temperature => sample_from_distribution(&probs, rng_value),
        SamplingMethod::TopK => sample_top_k(&probs, top_k, rng_value),
        SamplingMethod::TopP => sample_top_p(&probs, top_p, rng_value),
    })
}
