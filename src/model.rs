//! GPT Model: Configuration, Parameters, Forward and Backward
//!
//! The model is a decoder-only transformer:
//!
//! ```text
//! Input tokens [seq_len]
//!     ↓
//! Token Embedding [seq_len, n_embd]
//!     + Position Embedding (rows 0..seq_len)
//!     ↓ dropout
//! Transformer Block 1 … N
//!     ↓
//! Layer Norm
//!     ↓
//! Linear head (no bias) → logits [seq_len, vocab_size]
//! ```
//!
//! ## Parameters as a value
//!
//! All learned tensors live in [`Parameters`], an explicit value that is
//! passed into every forward and backward call. Nothing here keeps hidden
//! state: inference borrows the parameters immutably, and only the optimizer
//! step mutates them, bumping [`Parameters::version`] each time.
//!
//! ## Training vs. evaluation
//!
//! [`forward_sequence`] takes an optional random source. With `Some(rng)`
//! dropout is active (training); with `None` the pass is deterministic.
//!
//! ## Example
//!
//! ```rust
//! use picogpt::model::{forward, init_params, ModelConfig};
//!
//! let config = ModelConfig::tiny(10, 8);
//! let params = init_params(&config, 42).unwrap();
//! let logits = forward(&params, &[vec![1, 2, 3], vec![4, 5, 6]]).unwrap();
//! assert_eq!(logits.shape, vec![2, 3, 10]);
//! ```

use crate::error::{Error, Result};
use crate::gradients::Gradients;
use crate::layers::{
    BlockCache, Dropout, DropoutCache, Embedding, LayerNorm, LayerNormCache, Linear, LinearCache,
    Parameterized, TransformerBlock,
};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Model architecture configuration
///
/// - `vocab_size`: number of distinct token ids
/// - `block_size`: maximum sequence length (context window)
/// - `n_layers`: number of transformer blocks
/// - `n_heads`: attention heads per block, must divide `n_embd`
/// - `n_embd`: embedding width
/// - `embd_pdrop` / `attn_pdrop` / `resid_pdrop`: dropout after the
///   embeddings, on attention weights, and on each sub-layer output
///
/// # Parameter Count
///
/// ```text
/// embeddings = (vocab_size + block_size) × n_embd
/// per_layer  = 12 × n_embd² + 13 × n_embd
/// head       = n_embd × vocab_size (+ final LayerNorm 2 × n_embd)
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub block_size: usize,
    pub n_layers: usize,
    pub n_heads: usize,
    pub n_embd: usize,
    pub embd_pdrop: f32,
    pub attn_pdrop: f32,
    pub resid_pdrop: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::addition(2)
    }
}

impl ModelConfig {
    /// 2-layer, 4-head, 128-wide model for `ndigit`-digit addition
    ///
    /// Ten digit tokens; a sample is `a`, `b` and the `ndigit + 1` digits of
    /// the sum, minus the last token, so the context is `3 × ndigit`.
    pub fn addition(ndigit: usize) -> Self {
        Self {
            vocab_size: 10,
            block_size: 3 * ndigit,
            n_layers: 2,
            n_heads: 4,
            n_embd: 128,
            embd_pdrop: 0.1,
            attn_pdrop: 0.1,
            resid_pdrop: 0.1,
        }
    }

    /// Very small model for tests and quick experiments, dropout disabled
    pub fn tiny(vocab_size: usize, block_size: usize) -> Self {
        Self {
            vocab_size,
            block_size,
            n_layers: 2,
            n_heads: 2,
            n_embd: 16,
            embd_pdrop: 0.0,
            attn_pdrop: 0.0,
            resid_pdrop: 0.0,
        }
    }

    /// Check every structural constraint
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size == 0 {
            return Err(Error::Config("vocab_size must be positive".into()));
        }
        if self.block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        if self.n_layers == 0 || self.n_heads == 0 || self.n_embd == 0 {
            return Err(Error::Config(format!(
                "n_layers ({}), n_heads ({}) and n_embd ({}) must all be positive",
                self.n_layers, self.n_heads, self.n_embd
            )));
        }
        if self.n_embd % self.n_heads != 0 {
            return Err(Error::Config(format!(
                "n_embd ({}) must be divisible by n_heads ({})",
                self.n_embd, self.n_heads
            )));
        }
        for (name, p) in [
            ("embd_pdrop", self.embd_pdrop),
            ("attn_pdrop", self.attn_pdrop),
            ("resid_pdrop", self.resid_pdrop),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::Config(format!("{} must be in [0, 1), got {}", name, p)));
            }
        }
        Ok(())
    }

    /// Check that `tokens` is a non-empty sequence the model can consume
    pub fn check_sequence(&self, tokens: &[usize]) -> Result<()> {
        if tokens.is_empty() {
            return Err(Error::Shape("empty token sequence".into()));
        }
        if tokens.len() > self.block_size {
            return Err(Error::ContextTooLong {
                len: tokens.len(),
                block_size: self.block_size,
            });
        }
        if let Some(&token) = tokens.iter().find(|&&t| t >= self.vocab_size) {
            return Err(Error::TokenOutOfRange {
                token,
                vocab_size: self.vocab_size,
            });
        }
        Ok(())
    }
}

/// The full set of learned tensors
#[derive(Clone, Debug)]
pub struct Parameters {
    pub config: ModelConfig,
    /// Number of optimizer updates applied so far
    pub version: u64,
    pub token_embedding: Embedding,
    pub position_embedding: Embedding,
    pub embd_dropout: Dropout,
    pub blocks: Vec<TransformerBlock>,
    pub ln_f: LayerNorm,
    pub head: Linear,
}

/// Deterministically initialize parameters from `seed`
///
/// Linear and token-embedding weights ~ N(0, 0.02), biases 0, LayerNorm
/// gain 1 and shift 0, position embedding 0. The same seed and config give
/// bit-identical parameters.
pub fn init_params(config: &ModelConfig, seed: u64) -> Result<Parameters> {
    config.validate()?;
    let mut rng = StdRng::seed_from_u64(seed);

    let token_embedding = Embedding::new(config.vocab_size, config.n_embd, &mut rng);
    let position_embedding = Embedding::zeros(config.block_size, config.n_embd);
    let blocks = (0..config.n_layers)
        .map(|_| {
            TransformerBlock::new(
                config.n_embd,
                config.n_heads,
                config.attn_pdrop,
                config.resid_pdrop,
                &mut rng,
            )
        })
        .collect();
    let head = Linear::new(config.n_embd, config.vocab_size, false, &mut rng);

    let params = Parameters {
        config: config.clone(),
        version: 0,
        token_embedding,
        position_embedding,
        embd_dropout: Dropout::new(config.embd_pdrop),
        blocks,
        ln_f: LayerNorm::new(config.n_embd),
        head,
    };
    log::debug!(
        "initialized {} parameters from seed {}",
        params.num_parameters(),
        seed
    );
    Ok(params)
}

impl Parameterized for Parameters {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        self.token_embedding.visit(f);
        self.position_embedding.visit(f);
        for block in &self.blocks {
            block.visit(f);
        }
        self.ln_f.visit(f);
        self.head.visit(f);
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        self.token_embedding.visit_mut(f);
        self.position_embedding.visit_mut(f);
        for block in &mut self.blocks {
            block.visit_mut(f);
        }
        self.ln_f.visit_mut(f);
        self.head.visit_mut(f);
    }
}

impl Parameters {
    /// All tensors in canonical order
    pub fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.visit(&mut |t, _| out.push(t));
        out
    }

    /// All tensors in canonical order, mutably
    pub fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = Vec::new();
        self.visit_mut(&mut |t, _| out.push(t));
        out
    }

    /// Whether each tensor (canonical order) receives weight decay
    pub fn decay_flags(&self) -> Vec<bool> {
        let mut out = Vec::new();
        self.visit(&mut |_, decay| out.push(decay));
        out
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.tensors().iter().map(|t| t.len()).sum()
    }
}

/// Values kept from [`forward_sequence`] for [`backward`]
pub struct ModelCache {
    pub tokens: Vec<usize>,
    pub embd_dropout_cache: DropoutCache,
    pub block_caches: Vec<BlockCache>,
    pub ln_f_cache: LayerNormCache,
    pub head_cache: LinearCache,
}

/// Forward pass for one sequence, returning `[seq_len, vocab_size]` logits
///
/// `rng` enables dropout; pass `None` for evaluation.
pub fn forward_sequence(
    params: &Parameters,
    tokens: &[usize],
    mut rng: Option<&mut StdRng>,
) -> Result<(Tensor, ModelCache)> {
    params.config.check_sequence(tokens)?;

    let positions: Vec<usize> = (0..tokens.len()).collect();
    let x = params
        .token_embedding
        .forward(tokens)
        .add(&params.position_embedding.forward(&positions));
    let (mut x, embd_dropout_cache) = params.embd_dropout.forward(&x, rng.as_deref_mut());

    let mut block_caches = Vec::with_capacity(params.blocks.len());
    for block in &params.blocks {
        let (y, cache) = block.forward(&x, rng.as_deref_mut());
        block_caches.push(cache);
        x = y;
    }

    let (x, ln_f_cache) = params.ln_f.forward(&x);
    let (logits, head_cache) = params.head.forward(&x);

    let cache = ModelCache {
        tokens: tokens.to_vec(),
        embd_dropout_cache,
        block_caches,
        ln_f_cache,
        head_cache,
    };
    Ok((logits, cache))
}

/// Evaluation forward pass over a batch, returning `[batch, seq_len, vocab_size]`
///
/// All sequences must share one length `1..=block_size`. Sequences run in
/// parallel; the result does not depend on the thread count.
pub fn forward(params: &Parameters, batch: &[Vec<usize>]) -> Result<Tensor> {
    let seq_len = check_batch(batch)?;

    let logits: Vec<Tensor> = batch
        .par_iter()
        .map(|tokens| forward_sequence(params, tokens, None).map(|(logits, _)| logits))
        .collect::<Result<_>>()?;

    let vocab_size = params.config.vocab_size;
    let mut data = Vec::with_capacity(batch.len() * seq_len * vocab_size);
    for l in logits {
        data.extend(l.data);
    }
    Ok(Tensor::new(data, vec![batch.len(), seq_len, vocab_size]))
}

/// Require a non-empty, rectangular batch; returns its sequence length
pub(crate) fn check_batch(batch: &[Vec<usize>]) -> Result<usize> {
    let first = batch
        .first()
        .ok_or_else(|| Error::Shape("empty batch".into()))?;
    let seq_len = first.len();
    if let Some(other) = batch.iter().find(|s| s.len() != seq_len) {
        return Err(Error::Shape(format!(
            "ragged batch: sequence lengths {} and {}",
            seq_len,
            other.len()
        )));
    }
    Ok(seq_len)
}

/// Backward pass for one sequence
///
/// `grad_logits` is the loss gradient with respect to the `[seq_len,
/// vocab_size]` logits of [`forward_sequence`]. Returns gradients for every
/// parameter tensor in canonical order.
pub fn backward(params: &Parameters, cache: &ModelCache, grad_logits: &Tensor) -> Gradients {
    let head = params.head.backward(grad_logits, &cache.head_cache);
    let ln_f = params.ln_f.backward(&head.x, &cache.ln_f_cache);

    let mut grad_x = ln_f.x.clone();
    let mut block_grads = Vec::with_capacity(params.blocks.len());
    for (block, block_cache) in params.blocks.iter().zip(&cache.block_caches).rev() {
        let grads = block.backward(&grad_x, block_cache);
        grad_x = grads.x.clone();
        block_grads.push(grads);
    }
    block_grads.reverse();

    let grad_embd = params
        .embd_dropout
        .backward(&grad_x, &cache.embd_dropout_cache);
    let positions: Vec<usize> = (0..cache.tokens.len()).collect();

    let mut tensors = Vec::new();
    tensors.push(params.token_embedding.backward(&grad_embd, &cache.tokens));
    tensors.push(params.position_embedding.backward(&grad_embd, &positions));
    for grads in block_grads {
        grads.flatten_into(&mut tensors);
    }
    ln_f.flatten_into(&mut tensors);
    head.flatten_into(&mut tensors);

    Gradients { tensors }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_validate_rejects_indivisible_heads() {
        let mut config = ModelConfig::tiny(10, 8);
        config.n_heads = 3;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        assert!(init_params(&config, 0).is_err());
    }

    #[test]
    fn test_validate_rejects_empty_vocabulary() {
        let config = ModelConfig::tiny(0, 8);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_init_is_deterministic() {
        let config = ModelConfig::tiny(11, 6);
        let a = init_params(&config, 1234).unwrap();
        let b = init_params(&config, 1234).unwrap();
        let c = init_params(&config, 1235).unwrap();
        assert_eq!(a.tensors(), b.tensors());
        assert_ne!(a.tensors(), c.tensors());
    }

    #[test]
    fn test_init_distribution() {
        let params = init_params(&ModelConfig::addition(2), 0).unwrap();
        assert!(params.position_embedding.weight.data.iter().all(|&x| x == 0.0));
        assert!(params.ln_f.gamma.data.iter().all(|&x| x == 1.0));
        assert!(params.head.bias.is_none());

        let w = &params.blocks[0].mlp.fc.weight.data;
        let mean = w.iter().sum::<f32>() / w.len() as f32;
        let std = (w.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / w.len() as f32).sqrt();
        assert!(mean.abs() < 2e-3);
        assert!((std - 0.02).abs() < 2e-3);
    }

    #[test]
    fn test_num_parameters() {
        let config = ModelConfig::tiny(10, 8);
        let params = init_params(&config, 0).unwrap();
        let c = config.n_embd;
        let expected = (10 + 8) * c + 2 * (12 * c * c + 13 * c) + 2 * c + c * 10;
        assert_eq!(params.num_parameters(), expected);
        assert_eq!(params.tensors().len(), params.decay_flags().len());
    }

    #[test]
    fn test_forward_errors() {
        let params = init_params(&ModelConfig::tiny(10, 4), 0).unwrap();
        assert!(matches!(
            forward(&params, &[vec![1, 2, 3, 4, 5]]),
            Err(Error::ContextTooLong { len: 5, block_size: 4 })
        ));
        assert!(matches!(
            forward(&params, &[vec![1, 10]]),
            Err(Error::TokenOutOfRange { token: 10, vocab_size: 10 })
        ));
        assert!(matches!(forward(&params, &[vec![1, 2], vec![3]]), Err(Error::Shape(_))));
        assert!(matches!(forward(&params, &[vec![]]), Err(Error::Shape(_))));
        assert!(matches!(forward(&params, &[]), Err(Error::Shape(_))));
    }

    #[test]
    fn test_gradients_match_parameter_shapes() {
        let params = init_params(&ModelConfig::tiny(7, 5), 3).unwrap();
        let (logits, cache) = forward_sequence(&params, &[1, 2, 3], None).unwrap();
        let grads = backward(&params, &cache, &Tensor::full(logits.shape.clone(), 0.1));
        let shapes: Vec<_> = params.tensors().iter().map(|t| t.shape.clone()).collect();
        let grad_shapes: Vec<_> = grads.tensors.iter().map(|t| t.shape.clone()).collect();
        assert_eq!(shapes, grad_shapes);
    }

    #[test]
    fn test_causality_property() {
        // Perturbing token j must not change logits at any position i < j.
        let config = ModelConfig {
            vocab_size: 13,
            block_size: 9,
            n_layers: 2,
            n_heads: 4,
            n_embd: 16,
            ..ModelConfig::default()
        };
        let params = init_params(&config, 5).unwrap();
        let mut rng = StdRng::seed_from_u64(99);

        for _ in 0..20 {
            let len = rng.random_range(2..=config.block_size);
            let tokens: Vec<usize> = (0..len).map(|_| rng.random_range(0..13)).collect();
            let j = rng.random_range(1..len);
            let mut perturbed = tokens.clone();
            perturbed[j] = (perturbed[j] + 1 + rng.random_range(0..12)) % 13;

            let a = forward(&params, &[tokens]).unwrap();
            let b = forward(&params, &[perturbed]).unwrap();
            let v = config.vocab_size;
            assert_eq!(a.data[..j * v], b.data[..j * v]);
            assert_ne!(a.data[j * v..], b.data[j * v..]);
        }
    }

    #[test]
    fn test_forward_batch_matches_single_sequences() {
        let params = init_params(&ModelConfig::tiny(9, 6), 8).unwrap();
        let batch = vec![vec![1, 2, 3], vec![8, 0, 4]];
        let logits = forward(&params, &batch).unwrap();
        let (single, _) = forward_sequence(&params, &batch[1], None).unwrap();
        assert_eq!(logits.data[3 * 9..], single.data[..]);
    }
}
