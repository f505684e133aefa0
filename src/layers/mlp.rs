//! Feed-Forward Sub-Layer
//!
//! ```text
//! x → fc (n_embd → 4·n_embd) → GELU → proj (4·n_embd → n_embd) → dropout → y
//! ```

use super::activation::{gelu_backward, gelu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::Parameterized;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// Width multiplier of the hidden layer
pub const MLP_EXPANSION: usize = 4;

/// Two-layer perceptron with GELU activation
#[derive(Clone, Debug)]
pub struct Mlp {
    pub fc: Linear,
    pub proj: Linear,
    pub resid_dropout: Dropout,
}

impl Mlp {
    pub fn new(n_embd: usize, resid_pdrop: f32, rng: &mut StdRng) -> Self {
        let hidden = n_embd * MLP_EXPANSION;
        Self {
            fc: Linear::new(n_embd, hidden, true, rng),
            proj: Linear::new(hidden, n_embd, true, rng),
            resid_dropout: Dropout::new(resid_pdrop),
        }
    }

    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, MlpCache) {
        let (h, fc_cache) = self.fc.forward(x);
        let h_act = gelu_forward(&h);
        let (y_proj, proj_cache) = self.proj.forward(&h_act);
        let (y, dropout_cache) = self.resid_dropout.forward(&y_proj, rng);

        (
            y,
            MlpCache {
                fc_cache,
                h,
                proj_cache,
                dropout_cache,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &MlpCache) -> MlpGradients {
        let grad_y_proj = self.resid_dropout.backward(grad_out, &cache.dropout_cache);
        let proj = self.proj.backward(&grad_y_proj, &cache.proj_cache);
        let grad_h = gelu_backward(&proj.x, &cache.h);
        let fc = self.fc.backward(&grad_h, &cache.fc_cache);
        let x = fc.x.clone();

        MlpGradients { fc, proj, x }
    }
}

impl Parameterized for Mlp {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        self.fc.visit(f);
        self.proj.visit(f);
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        self.fc.visit_mut(f);
        self.proj.visit_mut(f);
    }
}

/// Cache for MLP backward pass
pub struct MlpCache {
    pub fc_cache: LinearCache,
    /// Pre-activation, needed for the GELU backward
    pub h: Tensor,
    pub proj_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

/// Gradients for MLP
pub struct MlpGradients {
    pub fc: LinearGradients,
    pub proj: LinearGradients,
    pub x: Tensor,
}

impl MlpGradients {
    pub fn flatten_into(self, out: &mut Vec<Tensor>) {
        self.fc.flatten_into(out);
        self.proj.flatten_into(out);
    }
}
