//! Dropout
//!
//! During training, zeroes each activation with probability `rate` and scales
//! the survivors by `1 / (1 - rate)` so the expected value is unchanged.
//! Without a random source (evaluation and sampling) it is the identity.
//!
//! The random source is passed in explicitly, so a training step is
//! reproducible from its seed.

use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::Rng;

/// Dropout with a fixed drop probability in `[0, 1)`
#[derive(Clone, Copy, Debug)]
pub struct Dropout {
    pub rate: f32,
}

impl Dropout {
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0.0, 1.0)"
        );
        Self { rate }
    }

    /// Forward pass; `rng == None` means evaluation mode
    pub fn forward(&self, x: &Tensor, rng: Option<&mut StdRng>) -> (Tensor, DropoutCache) {
        let rng = match rng {
            Some(rng) if self.rate > 0.0 => rng,
            _ => return (x.clone(), DropoutCache { mask: None, scale: 1.0 }),
        };

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.len());
        let mut output = x.zeros_like();

        for (out, &val) in output.data.iter_mut().zip(&x.data) {
            let keep = rng.random::<f32>() >= self.rate;
            mask.push(keep);
            if keep {
                *out = val * scale;
            }
        }

        (
            output,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Backward pass: route the gradient through the kept units only
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_output
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_output.shape.clone())
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for dropout backward pass
pub struct DropoutCache {
    /// true = kept; None if dropout was not applied
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_identity_without_rng() {
        let d = Dropout::new(0.5);
        let x = Tensor::new(vec![1.0, 2.0, 3.0], vec![3]);
        let (y, cache) = d.forward(&x, None);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_mask_is_reproducible_and_reused_in_backward() {
        let d = Dropout::new(0.5);
        let x = Tensor::full(vec![64], 1.0);
        let (y1, cache) = d.forward(&x, Some(&mut StdRng::seed_from_u64(3)));
        let (y2, _) = d.forward(&x, Some(&mut StdRng::seed_from_u64(3)));
        assert_eq!(y1, y2);

        let g = d.backward(&Tensor::full(vec![64], 1.0), &cache);
        for (&out, &grad) in y1.data.iter().zip(&g.data) {
            assert_eq!(out, grad);
            assert!(out == 0.0 || out == 2.0);
        }
    }
}
