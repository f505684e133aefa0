//! GELU Activation
//!
//! The feed-forward sub-layer of every block uses GELU, in its tanh
//! approximation:
//!
//! ```text
//! GELU(x) ≈ 0.5 × x × (1 + tanh(√(2/π) × (x + 0.044715 × x³)))
//! ```
//!
//! The derivative follows from the product rule and `tanh' = 1 - tanh²`:
//!
//! ```text
//! GELU'(x) = 0.5 × (1 + t) + 0.5 × x × (1 - t²) × √(2/π) × (1 + 3 × 0.044715 × x²)
//! ```
//!
//! where `t` is the tanh term of the forward pass.

use crate::tensor::{Tensor, PAR_THRESHOLD};
use rayon::prelude::*;

const GELU_COEFF: f32 = 0.044715;

#[inline]
fn inner(x: f32) -> f32 {
    (2.0 / std::f32::consts::PI).sqrt() * (x + GELU_COEFF * x * x * x)
}

#[inline]
fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + inner(x).tanh())
}

#[inline]
fn gelu_grad(x: f32) -> f32 {
    let sqrt_2_pi = (2.0 / std::f32::consts::PI).sqrt();
    let t = inner(x).tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * sqrt_2_pi * (1.0 + 3.0 * GELU_COEFF * x * x)
}

/// GELU activation (forward pass), element-wise
pub fn gelu_forward(x: &Tensor) -> Tensor {
    x.map(gelu)
}

/// GELU backward: `grad_x = grad_out * GELU'(x)` where `x` is the forward input
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let data: Vec<f32> = if x.len() >= PAR_THRESHOLD {
        x.data
            .par_iter()
            .zip(&grad_out.data)
            .map(|(&x_val, &g)| g * gelu_grad(x_val))
            .collect()
    } else {
        x.data
            .iter()
            .zip(&grad_out.data)
            .map(|(&x_val, &g)| g * gelu_grad(x_val))
            .collect()
    };
    Tensor::new(data, x.shape.clone())
}
