//! Transformer Block
//!
//! Pre-normalization residual block:
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → MLP → (+) → output
//! │                             ↑   │                  ↑
//! └─────────────────────────────┘   └──────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! At each residual connection the gradient splits: it flows unchanged along
//! the skip path and through the sub-layer, and the two are summed.

use super::attention::{AttentionCache, AttentionGradients, CausalSelfAttention};
use super::layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
use super::mlp::{Mlp, MlpCache, MlpGradients};
use super::Parameterized;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Transformer block combining attention and MLP with residuals
#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: CausalSelfAttention,
    pub ln2: LayerNorm,
    pub mlp: Mlp,
}

impl TransformerBlock {
    pub fn new(
        n_embd: usize,
        n_heads: usize,
        attn_pdrop: f32,
        resid_pdrop: f32,
        rng: &mut StdRng,
    ) -> Self {
        Self {
            ln1: LayerNorm::new(n_embd),
            attn: CausalSelfAttention::new(n_embd, n_heads, attn_pdrop, resid_pdrop, rng),
            ln2: LayerNorm::new(n_embd),
            mlp: Mlp::new(n_embd, resid_pdrop, rng),
        }
    }

    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut StdRng>) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, rng.as_deref_mut());
        let x_after_attn = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (mlp_out, mlp_cache) = self.mlp.forward(&ln2_out, rng);
        let y = x_after_attn.add(&mlp_out);

        let cache = BlockCache {
            ln1_cache,
            attn_cache,
            ln2_cache,
            mlp_cache,
        };
        (y, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        // second residual: skip path + MLP path
        let mlp = self.mlp.backward(grad_out, &cache.mlp_cache);
        let ln2 = self.ln2.backward(&mlp.x, &cache.ln2_cache);
        let mut grad_x_after_attn = grad_out.clone();
        grad_x_after_attn.add_assign(&ln2.x);

        // first residual: skip path + attention path
        let attn = self.attn.backward(&grad_x_after_attn, &cache.attn_cache);
        let ln1 = self.ln1.backward(&attn.x, &cache.ln1_cache);
        let mut x = grad_x_after_attn;
        x.add_assign(&ln1.x);

        BlockGradients {
            ln1,
            attn,
            ln2,
            mlp,
            x,
        }
    }
}

impl Parameterized for TransformerBlock {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        self.ln1.visit(f);
        self.attn.visit(f);
        self.ln2.visit(f);
        self.mlp.visit(f);
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        self.ln1.visit_mut(f);
        self.attn.visit_mut(f);
        self.ln2.visit_mut(f);
        self.mlp.visit_mut(f);
    }
}

/// Cache for transformer block backward pass
pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln2_cache: LayerNormCache,
    pub mlp_cache: MlpCache,
}

/// Gradients for transformer block
pub struct BlockGradients {
    pub ln1: LayerNormGradients,
    pub attn: AttentionGradients,
    pub ln2: LayerNormGradients,
    pub mlp: MlpGradients,
    pub x: Tensor,
}

impl BlockGradients {
    pub fn flatten_into(self, out: &mut Vec<Tensor>) {
        self.ln1.flatten_into(out);
        self.attn.flatten_into(out);
        self.ln2.flatten_into(out);
        self.mlp.flatten_into(out);
    }
}
