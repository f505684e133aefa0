//! Multi-Head Causal Self-Attention
//!
//! Each position attends to itself and every earlier position, never to a
//! later one. The input is projected to queries, keys and values; the
//! embedding width is split into `n_heads` column groups and every head runs
//! scaled dot-product attention independently:
//!
//! ```text
//! Q, K, V = x @ W_q + b_q, x @ W_k + b_k, x @ W_v + b_v       [T, C]
//! for head h (columns h·d .. (h+1)·d, d = C / n_heads):
//!     scores_h = Q_h @ K_h^T / √d                               [T, T]
//!     scores_h[i, j] = -inf            for j > i                (causal mask)
//!     att_h    = softmax_rows(scores_h)
//!     y_h      = dropout(att_h) @ V_h                           [T, d]
//! y = concat_h(y_h) @ W_o + b_o, then dropout                  [T, C]
//! ```
//!
//! ## Causal Mask
//!
//! The diagonal is never masked, so every row of `scores_h` keeps at least one
//! finite entry and the softmax is always well defined. Masked entries come
//! out of the softmax as exact zeros, which also zeroes their gradient.
//!
//! ## Backward Pass
//!
//! 1. output dropout and projection
//! 2. per head: `grad_V_h = att_h^T @ grad_y_h`, `grad_att_h = grad_y_h @ V_h^T`
//! 3. attention dropout, then softmax per row:
//!    `grad_scores = att * (grad_att - sum(grad_att * att))`
//! 4. `grad_Q_h = grad_scores @ K_h / √d`, `grad_K_h = grad_scores^T @ Q_h / √d`
//! 5. the three input projections; their input gradients are summed

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::Parameterized;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Multi-head causal self-attention
#[derive(Clone, Debug)]
pub struct CausalSelfAttention {
    pub q_proj: Linear,
    pub k_proj: Linear,
    pub v_proj: Linear,
    pub out_proj: Linear,
    pub attn_dropout: Dropout,
    pub resid_dropout: Dropout,
    pub n_heads: usize,
}

impl CausalSelfAttention {
    /// `n_embd` must be divisible by `n_heads`; `ModelConfig::validate` checks it
    pub fn new(
        n_embd: usize,
        n_heads: usize,
        attn_pdrop: f32,
        resid_pdrop: f32,
        rng: &mut StdRng,
    ) -> Self {
        debug_assert_eq!(n_embd % n_heads, 0);
        Self {
            q_proj: Linear::new(n_embd, n_embd, true, rng),
            k_proj: Linear::new(n_embd, n_embd, true, rng),
            v_proj: Linear::new(n_embd, n_embd, true, rng),
            out_proj: Linear::new(n_embd, n_embd, true, rng),
            attn_dropout: Dropout::new(attn_pdrop),
            resid_dropout: Dropout::new(resid_pdrop),
            n_heads,
        }
    }

    fn head_dim(&self) -> usize {
        self.q_proj.weight.shape[1] / self.n_heads
    }

    /// Forward pass over `[seq_len, n_embd]`
    pub fn forward(&self, x: &Tensor, mut rng: Option<&mut StdRng>) -> (Tensor, AttentionCache) {
        let seq_len = x.rows();
        let n_embd = x.cols();
        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let (q, q_cache) = self.q_proj.forward(x);
        let (k, k_cache) = self.k_proj.forward(x);
        let (v, v_cache) = self.v_proj.forward(x);

        let mask = causal_mask(seq_len);
        let mut merged = Tensor::zeros(vec![seq_len, n_embd]);
        let mut heads = Vec::with_capacity(self.n_heads);

        for h in 0..self.n_heads {
            let cols = h * head_dim..(h + 1) * head_dim;
            let q_h = q.slice_cols(cols.start, cols.end);
            let k_h = k.slice_cols(cols.start, cols.end);
            let v_h = v.slice_cols(cols.start, cols.end);

            let scores = q_h.matmul(&k_h.transpose()).mul_scalar(scale);
            let att = scores.masked_fill(&mask, f32::NEG_INFINITY).softmax_rows();
            let (att_dropped, dropout_cache) = self.attn_dropout.forward(&att, rng.as_deref_mut());

            let y_h = att_dropped.matmul(&v_h);
            merged.set_cols(cols.start, &y_h);

            heads.push(HeadCache {
                q: q_h,
                k: k_h,
                v: v_h,
                att,
                att_dropped,
                dropout_cache,
            });
        }

        let (y_proj, out_cache) = self.out_proj.forward(&merged);
        let (y, resid_dropout_cache) = self.resid_dropout.forward(&y_proj, rng);

        let cache = AttentionCache {
            heads,
            q_cache,
            k_cache,
            v_cache,
            out_cache,
            resid_dropout_cache,
        };
        (y, cache)
    }

    /// Backward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let head_dim = self.head_dim();
        let scale = 1.0 / (head_dim as f32).sqrt();

        let grad_y_proj = self
            .resid_dropout
            .backward(grad_out, &cache.resid_dropout_cache);
        let out = self.out_proj.backward(&grad_y_proj, &cache.out_cache);

        let mut grad_q = out.x.zeros_like();
        let mut grad_k = out.x.zeros_like();
        let mut grad_v = out.x.zeros_like();

        for (h, head) in cache.heads.iter().enumerate() {
            let start = h * head_dim;
            let grad_y_h = out.x.slice_cols(start, start + head_dim);

            let grad_v_h = head.att_dropped.transpose().matmul(&grad_y_h);
            let grad_att_dropped = grad_y_h.matmul(&head.v.transpose());
            let grad_att = self
                .attn_dropout
                .backward(&grad_att_dropped, &head.dropout_cache);

            let grad_scores = softmax_backward(&head.att, &grad_att);

            let grad_q_h = grad_scores.matmul(&head.k).mul_scalar(scale);
            let grad_k_h = grad_scores.transpose().matmul(&head.q).mul_scalar(scale);

            grad_q.set_cols(start, &grad_q_h);
            grad_k.set_cols(start, &grad_k_h);
            grad_v.set_cols(start, &grad_v_h);
        }

        let q = self.q_proj.backward(&grad_q, &cache.q_cache);
        let k = self.k_proj.backward(&grad_k, &cache.k_cache);
        let v = self.v_proj.backward(&grad_v, &cache.v_cache);

        // Q, K and V all read the same input
        let mut x = q.x.clone();
        x.add_assign(&k.x);
        x.add_assign(&v.x);

        AttentionGradients { q, k, v, out, x }
    }
}

impl Parameterized for CausalSelfAttention {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        self.q_proj.visit(f);
        self.k_proj.visit(f);
        self.v_proj.visit(f);
        self.out_proj.visit(f);
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        self.q_proj.visit_mut(f);
        self.k_proj.visit_mut(f);
        self.v_proj.visit_mut(f);
        self.out_proj.visit_mut(f);
    }
}

/// `[seq_len, seq_len]` mask with 1.0 strictly above the diagonal
pub fn causal_mask(seq_len: usize) -> Tensor {
    let mut mask = vec![0.0; seq_len * seq_len];
    for i in 0..seq_len {
        for j in i + 1..seq_len {
            mask[i * seq_len + j] = 1.0;
        }
    }
    Tensor::new(mask, vec![seq_len, seq_len])
}

/// Row-wise softmax backward: `att * (grad - sum(grad * att))`
fn softmax_backward(att: &Tensor, grad_att: &Tensor) -> Tensor {
    let n = att.cols();
    let mut data = Vec::with_capacity(att.len());
    for (a_row, g_row) in att.data.chunks(n).zip(grad_att.data.chunks(n)) {
        let dot: f32 = a_row.iter().zip(g_row).map(|(a, g)| a * g).sum();
        data.extend(a_row.iter().zip(g_row).map(|(a, g)| a * (g - dot)));
    }
    Tensor::new(data, att.shape.clone())
}

/// Per-head values kept for the backward pass
pub struct HeadCache {
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Attention weights before dropout
    pub att: Tensor,
    pub att_dropped: Tensor,
    pub dropout_cache: DropoutCache,
}

/// Cache for attention backward pass
pub struct AttentionCache {
    pub heads: Vec<HeadCache>,
    pub q_cache: LinearCache,
    pub k_cache: LinearCache,
    pub v_cache: LinearCache,
    pub out_cache: LinearCache,
    pub resid_dropout_cache: DropoutCache,
}

/// Gradients for attention
pub struct AttentionGradients {
    pub q: LinearGradients,
    pub k: LinearGradients,
    pub v: LinearGradients,
    pub out: LinearGradients,
    pub x: Tensor,
}

impl AttentionGradients {
    pub fn flatten_into(self, out: &mut Vec<Tensor>) {
        self.q.flatten_into(out);
        self.k.flatten_into(out);
        self.v.flatten_into(out);
        self.out.flatten_into(out);
    }
}
