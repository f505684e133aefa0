//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, the standard optimizer for transformer
//! training.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # Weight decay (weight matrices only)
//! m = β₁ * m + (1 - β₁) * g        # First moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²       # Second moment (variance)
//! m_hat = m / (1 - β₁^t)           # Bias correction
//! v_hat = v / (1 - β₂^t)           # Bias correction
//! θ = θ - α * m_hat / (√v_hat + ε) # Parameter update
//! ```
//!
//! with α the scheduled learning rate, λ the weight decay (0.1 by default),
//! β = (0.9, 0.95) and ε = 1e-8.
//!
//! ## Selective Weight Decay
//!
//! Decay applies only to the weight matrices of linear layers. Biases,
//! LayerNorm parameters and both embedding tables are left undecayed; the
//! flags come from [`Parameters::decay_flags`].
//!
//! ## Token Counter
//!
//! The state also carries the running count of supervised tokens processed,
//! which drives the learning-rate schedule. It lives here because it shares
//! the optimizer's lifetime: created with the parameters and never reset.

use crate::gradients::Gradients;
use crate::model::Parameters;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Tensors above this many elements are updated in parallel
const PAR_UPDATE_THRESHOLD: usize = 1000;

/// AdamW moment estimates plus the training token counter
#[derive(Clone, Debug)]
pub struct OptimizerState {
    /// First moments, one per parameter tensor in canonical order
    pub m: Vec<Tensor>,
    /// Second moments, one per parameter tensor in canonical order
    pub v: Vec<Tensor>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Number of updates applied (for bias correction)
    pub step: u64,
    /// Supervised tokens processed so far
    pub tokens: u64,
}

impl OptimizerState {
    /// Zero moments shaped like `params`
    pub fn new(params: &Parameters, betas: (f32, f32)) -> Self {
        let zeros: Vec<Tensor> = params.tensors().iter().map(|t| t.zeros_like()).collect();
        Self {
            m: zeros.clone(),
            v: zeros,
            beta1: betas.0,
            beta2: betas.1,
            epsilon: 1e-8,
            step: 0,
            tokens: 0,
        }
    }
}

/// Apply one AdamW step to every parameter tensor
///
/// Bumps both `state.step` and `params.version`.
pub fn adamw_update(
    params: &mut Parameters,
    grads: &Gradients,
    state: &mut OptimizerState,
    lr: f32,
    weight_decay: f32,
) {
    state.step += 1;
    let step = state.step as i32;

    let bias_correction1 = 1.0 - state.beta1.powi(step);
    let bias_correction2 = 1.0 - state.beta2.powi(step);
    let (beta1, beta2, epsilon) = (state.beta1, state.beta2, state.epsilon);

    let decay_flags = params.decay_flags();
    let tensors = params.tensors_mut();
    assert_eq!(tensors.len(), grads.tensors.len(), "gradient count mismatch");

    let update = |param: &mut f32, g: f32, m: &mut f32, v: &mut f32, decay: bool| {
        if decay {
            *param *= 1.0 - lr * weight_decay;
        }
        *m = beta1 * *m + (1.0 - beta1) * g;
        *v = beta2 * *v + (1.0 - beta2) * g * g;
        let m_hat = *m / bias_correction1;
        let v_hat = *v / bias_correction2;
        *param -= lr * m_hat / (v_hat.sqrt() + epsilon);
    };

    for ((((param, grad), m), v), &decay) in tensors
        .into_iter()
        .zip(&grads.tensors)
        .zip(state.m.iter_mut())
        .zip(state.v.iter_mut())
        .zip(&decay_flags)
    {
        if param.len() > PAR_UPDATE_THRESHOLD {
            param
                .data
                .par_iter_mut()
                .zip(grad.data.par_iter())
                .zip(m.data.par_iter_mut().zip(v.data.par_iter_mut()))
                .for_each(|((p, &g), (m, v))| update(p, g, m, v, decay));
        } else {
            for (((p, &g), m), v) in param
                .data
                .iter_mut()
                .zip(&grad.data)
                .zip(m.data.iter_mut())
                .zip(v.data.iter_mut())
            {
                update(p, g, m, v, decay);
            }
        }
    }

    params.version += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{init_params, ModelConfig};

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // With bias correction the first Adam step is lr * sign(g).
        let mut params = init_params(&ModelConfig::tiny(5, 4), 0).unwrap();
        let before = params.clone();
        let mut grads = Gradients::zeros_like(&params);
        for t in &mut grads.tensors {
            t.data.iter_mut().for_each(|g| *g = 0.5);
        }
        let mut state = OptimizerState::new(&params, (0.9, 0.95));
        adamw_update(&mut params, &grads, &mut state, 0.01, 0.0);

        assert_eq!(params.version, 1);
        assert_eq!(state.step, 1);
        for (a, b) in before.tensors().iter().zip(params.tensors()) {
            for (&x, &y) in a.data.iter().zip(&b.data) {
                assert!((x - y - 0.01).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_weight_decay_only_on_linear_weights() {
        let mut params = init_params(&ModelConfig::tiny(5, 4), 0).unwrap();
        let before = params.clone();
        let grads = Gradients::zeros_like(&params);
        let mut state = OptimizerState::new(&params, (0.9, 0.95));
        adamw_update(&mut params, &grads, &mut state, 0.1, 0.5);

        // zero gradients: only decay moves anything
        assert_eq!(params.token_embedding.weight, before.token_embedding.weight);
        assert_eq!(params.ln_f.gamma, before.ln_f.gamma);
        let w0 = before.head.weight.data[0];
        assert!((params.head.weight.data[0] - w0 * 0.95).abs() < 1e-7);
    }
}
