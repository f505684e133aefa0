//! Embedding Tables
//!
//! An embedding is a lookup table: row `i` of the weight matrix is the vector
//! for id `i`. The model keeps two of them, one indexed by token id and one by
//! absolute position, and adds the two lookups together.
//!
//! ## Backward Pass
//!
//! Looking up a row is a selection, so its gradient is a scatter-add: the
//! gradient of output row `t` is added to weight row `ids[t]`. A token that
//! occurs several times in a sequence accumulates several contributions.

use super::linear::normal_init;
use super::Parameterized;
use crate::tensor::Tensor;
use rand::rngs::StdRng;

/// A learned `[num_embeddings, dim]` lookup table
#[derive(Clone, Debug)]
pub struct Embedding {
    pub weight: Tensor,
}

impl Embedding {
    /// Table with rows drawn from N(0, 0.02)
    pub fn new(num_embeddings: usize, dim: usize, rng: &mut StdRng) -> Self {
        Self {
            weight: Tensor::new(normal_init(num_embeddings * dim, rng), vec![num_embeddings, dim]),
        }
    }

    /// Table initialized to zero (used for positions)
    pub fn zeros(num_embeddings: usize, dim: usize) -> Self {
        Self {
            weight: Tensor::zeros(vec![num_embeddings, dim]),
        }
    }

    /// Number of rows
    pub fn num_embeddings(&self) -> usize {
        self.weight.shape[0]
    }

    /// Gather rows `ids` into a `[ids.len(), dim]` tensor
    ///
    /// Callers validate ids; an out-of-range id is a programming error.
    pub fn forward(&self, ids: &[usize]) -> Tensor {
        let dim = self.weight.cols();
        let mut data = Vec::with_capacity(ids.len() * dim);
        for &id in ids {
            data.extend_from_slice(self.weight.row(id));
        }
        Tensor::new(data, vec![ids.len(), dim])
    }

    /// Scatter-add `grad_out` rows back into a zero table
    pub fn backward(&self, grad_out: &Tensor, ids: &[usize]) -> Tensor {
        let dim = self.weight.cols();
        let mut grad = self.weight.zeros_like();
        for (t, &id) in ids.iter().enumerate() {
            let dst = &mut grad.data[id * dim..(id + 1) * dim];
            for (g, &d) in dst.iter_mut().zip(grad_out.row(t)) {
                *g += d;
            }
        }
        grad
    }
}

impl Parameterized for Embedding {
    fn visit<'a>(&'a self, f: &mut dyn FnMut(&'a Tensor, bool)) {
        f(&self.weight, false);
    }

    fn visit_mut<'a>(&'a mut self, f: &mut dyn FnMut(&'a mut Tensor, bool)) {
        f(&mut self.weight, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_ids_accumulate() {
        let emb = Embedding {
            weight: Tensor::new((0..6).map(|i| i as f32).collect(), vec![3, 2]),
        };
        let out = emb.forward(&[2, 0, 2]);
        assert_eq!(out.data, vec![4.0, 5.0, 0.0, 1.0, 4.0, 5.0]);

        let grad = emb.backward(&Tensor::full(vec![3, 2], 1.0), &[2, 0, 2]);
        assert_eq!(grad.data, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }
}
