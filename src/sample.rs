//! Autoregressive sampling with temperature and top-k.
//!
//! Each step crops the running sequence to its last `block_size` tokens, runs
//! the model, and picks the next token from the logits of the last position:
//!
//! - divide by `temperature`
//! - with `top_k = Some(k)`: every logit below the k-th largest becomes -inf
//!   (ties with the k-th largest survive)
//! - softmax, then draw from the distribution (`do_sample`) or take the
//!   argmax, lowest index first on ties
//!
//! Greedy decoding is fully deterministic; stochastic decoding is
//! deterministic for a given random stream.

use crate::error::{Error, Result};
use crate::model::{forward_sequence, Parameters};
use crate::tensor::{argmax, softmax_in_place};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Decoding options
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleOptions {
    /// Logits are divided by this; must be positive
    pub temperature: f32,
    /// Keep only the k highest-scoring tokens
    pub top_k: Option<usize>,
    /// Draw from the distribution instead of taking the argmax
    pub do_sample: bool,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: None,
            do_sample: false,
        }
    }
}

impl SampleOptions {
    pub fn greedy() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.temperature > 0.0 && self.temperature.is_finite()) {
            return Err(Error::Config(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.top_k == Some(0) {
            return Err(Error::Config("top_k must be at least 1".into()));
        }
        Ok(())
    }
}

/// Choose the next token from one row of logits (modified in place)
pub fn select_token<R: Rng>(logits: &mut [f32], options: &SampleOptions, rng: &mut R) -> usize {
    // shift before scaling: a tiny temperature must not push the maximum to +inf
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    for l in logits.iter_mut() {
        *l = (*l - max) / options.temperature;
    }

    if let Some(k) = options.top_k {
        if k < logits.len() {
            let mut sorted = logits.to_vec();
            sorted.sort_by(|a, b| b.total_cmp(a));
            let threshold = sorted[k - 1];
            for l in logits.iter_mut() {
                if *l < threshold {
                    *l = f32::NEG_INFINITY;
                }
            }
        }
    }

    softmax_in_place(logits);

    if !options.do_sample {
        return argmax(logits);
    }

    let r: f32 = rng.random();
    let mut cdf = 0.0f32;
    for (i, &p) in logits.iter().enumerate() {
        cdf += p;
        if r < cdf {
            return i;
        }
    }
    // rounding left the cdf just below r: take the last token still allowed
    logits.iter().rposition(|&p| p > 0.0).unwrap_or(0)
}

/// Extend `prompt` by exactly `steps` tokens
pub fn sample(
    params: &Parameters,
    prompt: &[usize],
    steps: usize,
    options: &SampleOptions,
    rng: &mut StdRng,
) -> Result<Vec<usize>> {
    options.validate()?;
    if prompt.is_empty() {
        return Err(Error::Shape("empty prompt".into()));
    }
    let config = &params.config;
    if let Some(&token) = prompt.iter().find(|&&t| t >= config.vocab_size) {
        return Err(Error::TokenOutOfRange {
            token,
            vocab_size: config.vocab_size,
        });
    }

    let mut tokens = prompt.to_vec();
    tokens.reserve(steps);
    for _ in 0..steps {
        let start = tokens.len().saturating_sub(config.block_size);
        let (logits, _) = forward_sequence(params, &tokens[start..], None)?;
        let last = logits.rows() - 1;
        let mut row = logits.row(last).to_vec();
        tokens.push(select_token(&mut row, options, rng));
    }
    Ok(tokens)
}

/// Sample several prompts in order, sharing one random stream
pub fn sample_batch(
    params: &Parameters,
    prompts: &[Vec<usize>],
    steps: usize,
    options: &SampleOptions,
    rng: &mut StdRng,
) -> Result<Vec<Vec<usize>>> {
    prompts
        .iter()
        .map(|prompt| sample(params, prompt, steps, options, rng))
        .collect()
}
