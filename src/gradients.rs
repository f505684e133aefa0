//! Gradient Utilities
//!
//! [`Gradients`] holds one tensor per model parameter, in the canonical order
//! of [`Parameters::tensors`](crate::model::Parameters::tensors). Per-sequence
//! gradients are summed into it and the result is clipped before the
//! optimizer step.
//!
//! ## Gradient Clipping
//!
//! ```text
//! norm = √(Σ gradient²)  // L2 norm over every parameter
//! if norm > max_norm:
//!     gradients *= (max_norm / norm)
//! ```
//!
//! All gradients are scaled by the same factor, so the update direction is
//! preserved while its magnitude is bounded.

use crate::model::Parameters;
use crate::tensor::Tensor;

/// Gradients for every parameter tensor, canonical order
#[derive(Clone, Debug, PartialEq)]
pub struct Gradients {
    pub tensors: Vec<Tensor>,
}

impl Gradients {
    /// All-zero gradients shaped like `params`
    pub fn zeros_like(params: &Parameters) -> Self {
        Self {
            tensors: params.tensors().iter().map(|t| t.zeros_like()).collect(),
        }
    }

    /// Element-wise `self += other`
    pub fn accumulate(&mut self, other: &Gradients) {
        assert_eq!(self.tensors.len(), other.tensors.len());
        for (acc, g) in self.tensors.iter_mut().zip(&other.tensors) {
            acc.add_assign(g);
        }
    }
}

/// L2 norm over all gradient values: √(Σ g²)
pub fn compute_grad_norm(grads: &Gradients) -> f32 {
    grads
        .tensors
        .iter()
        .map(|t| t.sum_squares())
        .sum::<f32>()
        .sqrt()
}

/// Scale gradients down so their global norm is at most `max_norm`
///
/// Returns the norm measured before clipping.
pub fn clip_gradients(grads: &mut Gradients, max_norm: f32) -> f32 {
    let norm = compute_grad_norm(grads);
    if norm > max_norm {
        let scale = max_norm / norm;
        for t in &mut grads.tensors {
            t.scale_assign(scale);
        }
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grads(values: &[f32]) -> Gradients {
        Gradients {
            tensors: vec![
                Tensor::new(values[..2].to_vec(), vec![2]),
                Tensor::new(values[2..].to_vec(), vec![values.len() - 2]),
            ],
        }
    }

    #[test]
    fn test_norm_spans_all_tensors() {
        assert!((compute_grad_norm(&grads(&[3.0, 0.0, 0.0, 4.0])) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_clip_scales_to_max_norm() {
        let mut g = grads(&[3.0, 0.0, 0.0, 4.0]);
        let before = clip_gradients(&mut g, 1.0);
        assert!((before - 5.0).abs() < 1e-6);
        assert!((compute_grad_norm(&g) - 1.0).abs() < 1e-5);
        assert!((g.tensors[0].data[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_clip_leaves_small_gradients_alone() {
        let mut g = grads(&[0.1, 0.2, 0.2, 0.1]);
        let original = g.clone();
        clip_gradients(&mut g, 1.0);
        assert_eq!(g, original);
    }
}
