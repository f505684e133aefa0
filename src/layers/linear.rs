//! Linear Layer (Fully Connected)
//!
//! Performs an affine transformation: y = x @ W + b
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  x [seq_len, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]            (optional)
//! Output: y = x @ W + b [seq_len, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! ## Initialization
//!
//! Weights are drawn from N(0, 0.02) and biases start at zero, the GPT
//! recipe. The language-model head is built without a bias.

use super::Parameterized;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Standard deviation used for every weight matrix and embedding table
pub const INIT_STD: f32 = 0.02;

/// Draw `size` values from N(0, [`INIT_STD`])
pub fn normal_init(size: usize, rng: &mut StdRng) -> Vec<f32> {
    let normal = Normal::new(0.0f32, INIT_STD).expect("INIT_STD is a valid standard deviation");
    (0..size).map(|_| normal.sample(rng)).collect()
}

/// Linear layer (fully connected)
#[derive(Clone, Debug)]
pub struct Linear {
    /// Weight matrix [in_features, out_features]
    pub weight: Tensor,
    /// Bias vector [out_features], absent for the output head
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a new linear layer with weights ~ N(0, 0.02)
    ///
    /// # Arguments
    ///
    /// * `in_features` - Input dimension
    /// * `out_features` - Output dimension
    /// * `bias` - Whether the layer carries a (zero-initialized) bias
    /// * `rng` - Seeded random source for the weights
    pub fn new(in_features: usize, out_features: usize, bias: bool, rng: &mut StdRng) -> Self {
        Self {
            weight: Tensor::new(
                normal_init(in_features * out_features, rng),
                vec![in_features, out_features],
            ),
            bias: bias.then(|| Tensor::zeros(vec![out_features])),
        }
    }

    /// Forward pass
    ///
    /// Computes y = x @ W + b and caches x for the backward pass
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = x.matmul(&self.weight);
        let y = match &self.bias {
            Some(bias) => y.add(bias),
            None => y,
        };
        (y, LinearCache { x: x.clone() })
    }

    /// Backward pass
    ///
    /// Computes gradients for weights, bias, and input
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        // grad_W = x^T @ grad_out
        let weight = cache.x.transpose().matmul(grad_out);

        // grad_b = column sums of grad_out
        let bias = self.bias.as_ref().map(|_| grad_out.sum_rows());

        // grad_x = grad_out @ W^T
        let x = grad_out.matmul(&self.weight.transpose());

        LinearGradients { weight, bias, x }
    }
}

impl Parameterized for Linear {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        f(&self.weight, true);
        if let Some(bias) = &self.bias {
            f(bias, false);
        }
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        f(&mut self.weight, true);
        if let Some(bias) = &mut self.bias {
            f(bias, false);
        }
    }
}

/// Cache for linear layer backward pass
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for linear layer
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub x: Tensor, // Gradient to pass to previous layer
}

impl LinearGradients {
    /// Append parameter gradients in the same order as [`Parameterized::visit`]
    pub fn flatten_into(self, out: &mut Vec<Tensor>) {
        out.push(self.weight);
        if let Some(bias) = self.bias {
            out.push(bias);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_init_is_seeded() {
        let a = Linear::new(4, 3, true, &mut StdRng::seed_from_u64(7));
        let b = Linear::new(4, 3, true, &mut StdRng::seed_from_u64(7));
        assert_eq!(a.weight, b.weight);
        assert!(a.bias.as_ref().is_some_and(|b| b.data.iter().all(|&x| x == 0.0)));
    }

    #[test]
    fn test_backward_shapes_without_bias() {
        let layer = Linear::new(4, 3, false, &mut StdRng::seed_from_u64(1));
        let x = Tensor::new((0..8).map(|i| i as f32 * 0.1).collect(), vec![2, 4]);
        let (y, cache) = layer.forward(&x);
        assert_eq!(y.shape, vec![2, 3]);

        let grads = layer.backward(&Tensor::full(vec![2, 3], 1.0), &cache);
        assert_eq!(grads.weight.shape, vec![4, 3]);
        assert!(grads.bias.is_none());
        assert_eq!(grads.x.shape, vec![2, 4]);

        // each weight column receives sum_i x[i, r]
        let expected = x.data[0] + x.data[4];
        assert!((grads.weight.data[0] - expected).abs() < 1e-6);
    }
}
