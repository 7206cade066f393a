//! Autoregressive text generation
//!
//! [`generate_text`] seeds the sequence with the prompt (or
//! [`TOKEN_BOS`]), then repeatedly runs the model over the most recent
//! context window, samples one token and appends it. Generation stops at
//! [`TOKEN_EOS`] (which is not written) or when `min(max_tokens, capacity)`
//! tokens are in the buffer.
//!
//! Randomness comes from a [`Generator`] seeded once per call. Seed 0 is
//! replaced by a time-derived seed; any other seed gives a reproducible run.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HyperionError, Result};
use crate::model::Model;
use crate::vocab::{TokenId, TOKEN_BOS, TOKEN_EOS};

pub mod sampler;

pub use sampler::{
    apply_temperature, sample_from_distribution, sample_greedy, sample_token, sample_top_k,
    sample_top_p, softmax, SamplingMethod,
};

/// Declarative adjustment applied to a copy of the parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStyle {
    /// No change
    #[default]
    Neutral,
    /// Near-deterministic
    Formal,
    /// Hotter, wider sampling
    Creative,
    /// At most 20 tokens, narrow sampling
    Concise,
    /// At least 100 tokens
    Descriptive,
}

/// Parameters for [`generate_text`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Upper bound on tokens in the output, prompt included
    pub max_tokens: usize,
    /// Sampling strategy
    pub sampling_method: SamplingMethod,
    /// Softmax temperature; values `<= 0` mean 1.0
    pub temperature: f32,
    /// Candidate count for top-k
    pub top_k: usize,
    /// Probability mass for nucleus sampling
    pub top_p: f32,
    /// RNG seed; 0 derives one from the clock
    pub seed: u64,
    /// Prompt tokens copied to the front of the output
    pub prompt: Vec<TokenId>,
    /// Style override
    pub style: GenerationStyle,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            sampling_method: SamplingMethod::TopP,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.9,
            seed: 0,
            prompt: Vec::new(),
            style: GenerationStyle::Neutral,
        }
    }
}

impl GenerationParams {
    /// Set the prompt
    #[must_use]
    pub fn with_prompt(mut self, prompt: Vec<TokenId>) -> Self {
        self.prompt = prompt;
        self
    }

    /// Set the sampling method
    #[must_use]
    pub fn with_sampling(mut self, method: SamplingMethod) -> Self {
        self.sampling_method = method;
        self
    }

    /// Set the seed
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the style
    #[must_use]
    pub fn with_style(mut self, style: GenerationStyle) -> Self {
        self.style = style;
        self
    }

    /// Set the token limit
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Working copy of `params` with its style applied
pub fn apply_style(params: &GenerationParams) -> GenerationParams {
    let mut p = params.clone();
    match params.style {
        GenerationStyle::Neutral => {},
        GenerationStyle::Formal => {
            p.temperature = 0.5;
            p.top_k = 1;
            p.top_p = 0.0;
        },
        GenerationStyle::Creative => {
            p.temperature = 1.2;
            p.top_k = 50;
            p.top_p = 0.95;
        },
        GenerationStyle::Concise => {
            p.max_tokens = p.max_tokens.min(20);
            p.temperature = 0.6;
            p.top_k = 5;
            p.top_p = 0.8;
        },
        GenerationStyle::Descriptive => {
            p.max_tokens = p.max_tokens.max(100);
            p.temperature = 0.9;
            p.top_k = 0;
            p.top_p = 0.9;
        },
    }
    p
}

/// Seeded sampling stream
#[derive(Debug, Clone)]
pub struct Generator {
    rng: StdRng,
    seed: u64,
}

impl Generator {
    /// Create a generator; seed 0 derives a seed from the clock
    pub fn new(seed: u64) -> Self {
        let seed = if seed == 0 { time_seed() } else { seed };
        Self {
            rng: StdRng::seed_from_u64(seed),
            seed,
        }
    }

    /// Seed in use
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform draw in `[0, 1)`
    pub fn next_unit(&mut self) -> f32 {
        self.rng.gen::<f32>()
    }

    /// Sample the next token from raw logits
    ///
    /// # Errors
    ///
    /// Returns error if `logits` is empty.
    pub fn sample(&mut self, logits: &[f32], params: &GenerationParams) -> Result<TokenId> {
        let draw = self.next_unit();
        let index = sample_token(
            logits,
            params.sampling_method,
            params.temperature,
            params.top_k,
            params.top_p,
            draw,
        )?;
        TokenId::try_from(index).map_err(|_| HyperionError::InvalidShape {
            reason: format!("Token index {index} does not fit a token id"),
        })
    }
}

fn time_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
        .max(1)
}

/// Generate tokens into `output`, returning how many were written
///
/// The prompt (or [`TOKEN_BOS`]) occupies the front of `output`. Sampling
/// continues until `min(max_tokens, output.len())` tokens are in the buffer,
/// so a prompt already at that length is returned unchanged.
///
/// # Errors
///
/// Returns error if `output` is empty, `max_tokens` is zero, the prompt is
/// longer than `output`, or a forward pass fails.
pub fn generate_text(
    model: &mut Model,
    params: &GenerationParams,
    output: &mut [TokenId],
) -> Result<usize> {
    let params = apply_style(params);
    let capacity = output.len();
    if capacity == 0 || params.max_tokens == 0 {
        return Err(HyperionError::InvalidConfiguration(format!(
            "generation needs a non-empty output buffer and token limit (capacity={capacity}, max_tokens={})",
            params.max_tokens
        )));
    }
    if params.prompt.len() > capacity {
        return Err(HyperionError::ContextLimitExceeded {
            provided: params.prompt.len(),
            maximum: capacity,
        });
    }
    let limit = params.max_tokens.min(capacity);

    let mut generator = Generator::new(params.seed);
    let mut len = if params.prompt.is_empty() {
        output[0] = TOKEN_BOS;
        1
    } else {
        output[..params.prompt.len()].copy_from_slice(&params.prompt);
        params.prompt.len()
    };

    let context = model.context_size();
    while len < limit {
        let start = len.saturating_sub(context);
        let logits = model.forward(&output[start..len])?;
        let token = generator.sample(&logits, &params)?;
        if token == TOKEN_EOS {
            break;
        }
        output[len] = token;
        len += 1;
    }

    debug!(
        tokens = len,
        seed = generator.seed(),
        method = ?params.sampling_method,
        "generation finished"
    );
    Ok(len)
}
