//! Layer Normalization
//!
//! Normalizes each row of activations to zero mean and unit variance, then
//! applies a learnable scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. mean = sum(x) / N
//! 2. var = sum((x - mean)²) / N
//! 3. x_norm = (x - mean) / √(var + ε)
//! 4. y = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum(grad_y * x_norm)
//! grad_β = sum(grad_y)
//! grad_x_norm = grad_y * γ
//! grad_x = (grad_x_norm - E[grad_x_norm] - x_norm * E[grad_x_norm * x_norm]) / √(var + ε)
//! ```
//!
//! The two expectation terms account for every element of a row feeding the
//! row's mean and variance.

use super::Parameterized;
use crate::tensor::Tensor;

/// Layer normalization layer
#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Tensor, // Scale parameter [n_embd]
    pub beta: Tensor,  // Shift parameter [n_embd]
    pub eps: f32,
}

impl LayerNorm {
    /// Create a layer norm with gamma = 1, beta = 0 and eps = 1e-5
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![normalized_shape], 1.0),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: 1e-5,
        }
    }

    /// Forward pass over a `[seq_len, n_embd]` tensor
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n_embd = x.cols();
        let mean = x.mean_rows();
        let var = x.var_rows();

        let std: Vec<f32> = var.data.iter().map(|&v| (v + self.eps).sqrt()).collect();

        let mut x_norm = Vec::with_capacity(x.len());
        for (i, row) in x.data.chunks(n_embd).enumerate() {
            x_norm.extend(row.iter().map(|&val| (val - mean.data[i]) / std[i]));
        }
        let x_norm = Tensor::new(x_norm, x.shape.clone());

        let y = x_norm.mul(&self.gamma).add(&self.beta);

        (y, LayerNormCache { x_norm, std })
    }

    /// Backward pass
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let n_embd = self.gamma.len();
        let seq_len = grad_out.rows();

        let mut grad_gamma = vec![0.0; n_embd];
        let mut grad_beta = vec![0.0; n_embd];
        for i in 0..seq_len {
            for j in 0..n_embd {
                let idx = i * n_embd + j;
                grad_gamma[j] += grad_out.data[idx] * cache.x_norm.data[idx];
                grad_beta[j] += grad_out.data[idx];
            }
        }

        let grad_x_norm = grad_out.mul(&self.gamma);

        let mut grad_x = vec![0.0; seq_len * n_embd];
        for i in 0..seq_len {
            let range = i * n_embd..(i + 1) * n_embd;
            let g_row = &grad_x_norm.data[range.clone()];
            let xn_row = &cache.x_norm.data[range.clone()];

            let mean_g: f32 = g_row.iter().sum::<f32>() / n_embd as f32;
            let mean_gx: f32 =
                g_row.iter().zip(xn_row).map(|(g, x)| g * x).sum::<f32>() / n_embd as f32;

            for (j, out) in grad_x[range].iter_mut().enumerate() {
                *out = (g_row[j] - mean_g - xn_row[j] * mean_gx) / cache.std[i];
            }
        }

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![n_embd]),
            beta: Tensor::new(grad_beta, vec![n_embd]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

impl Parameterized for LayerNorm {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        f(&self.gamma, false);
        f(&self.beta, false);
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        f(&mut self.gamma, false);
        f(&mut self.beta, false);
    }
}

/// Cache for layer norm backward pass
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// √(var + ε) per row
    pub std: Vec<f32>,
}

/// Gradients for layer norm
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl LayerNormGradients {
    pub fn flatten_into(self, out: &mut Vec<Tensor>) {
        out.push(self.gamma);
        out.push(self.beta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rows_are_normalized() {
        let ln = LayerNorm::new(4);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, -2.0, 0.0, 2.0, 8.0], vec![2, 4]);
        let (y, _) = ln.forward(&x);
        for row in y.data.chunks(4) {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_input_gradient_sums_to_zero_per_row() {
        // Shifting a whole row leaves the output unchanged, so the input
        // gradient of every row must sum to zero.
        let ln = LayerNorm::new(3);
        let x = Tensor::new(vec![0.5, -1.0, 2.0, 3.0, 1.0, 0.0], vec![2, 3]);
        let (_, cache) = ln.forward(&x);
        let grads = ln.backward(&Tensor::new(vec![1.0, 0.3, -0.2, 0.7, 0.1, 0.4], vec![2, 3]), &cache);
        for row in grads.x.data.chunks(3) {
            assert!(row.iter().sum::<f32>().abs() < 1e-5);
        }
    }
}
