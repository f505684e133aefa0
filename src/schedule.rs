//! Learning-Rate Schedule
//!
//! The rate is a pure function of how many supervised tokens the trainer has
//! processed so far:
//!
//! ```text
//! decay off:                 lr = base
//! tokens < warmup:           lr = base × tokens / warmup
//! warmup ≤ tokens:           p  = clamp((tokens - warmup) / (final - warmup), 0, 1)
//!                            lr = base × (0.1 + 0.9 × 0.5 × (1 + cos(π p)))
//! ```
//!
//! The cosine ends at 10% of the base rate and stays there past
//! `final_tokens`, so the optimizer never stalls at zero.
//!
//! The counter lives in [`OptimizerState::tokens`](crate::optimizer::OptimizerState)
//! and is never reset between epochs. Each step advances it by
//! [`Batch::supervised_tokens`](crate::train::Batch::supervised_tokens), the
//! number of target positions that are not `IGNORE_INDEX`, after the rate for
//! that step has been read. Size `final_tokens` in the same unit with
//! [`final_tokens`].

use crate::train::TrainConfig;
use std::f64::consts::PI;

/// Fraction of the base rate the decay bottoms out at
pub const MIN_LR_FRACTION: f64 = 0.1;

/// Multiplier applied to the base rate after `tokens` supervised tokens
pub fn lr_multiplier(tokens: u64, warmup_tokens: u64, final_tokens: u64) -> f64 {
    if tokens < warmup_tokens {
        return tokens as f64 / warmup_tokens.max(1) as f64;
    }
    let span = final_tokens.saturating_sub(warmup_tokens).max(1) as f64;
    let progress = ((tokens - warmup_tokens) as f64 / span).clamp(0.0, 1.0);
    MIN_LR_FRACTION + (1.0 - MIN_LR_FRACTION) * 0.5 * (1.0 + (PI * progress).cos())
}

/// Effective learning rate for the current token count
pub fn learning_rate(tokens: u64, config: &TrainConfig) -> f32 {
    if !config.lr_decay {
        return config.learning_rate;
    }
    (config.learning_rate as f64 * lr_multiplier(tokens, config.warmup_tokens, config.final_tokens))
        as f32
}

/// Decay horizon covering `epochs` passes over `samples` samples that each
/// supervise `supervised_per_sample` positions
pub fn final_tokens(epochs: usize, samples: usize, supervised_per_sample: usize) -> u64 {
    (epochs * samples * supervised_per_sample) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> TrainConfig {
        TrainConfig {
            learning_rate: 1e-3,
            lr_decay: true,
            warmup_tokens: 1_000,
            final_tokens: 11_000,
            ..TrainConfig::default()
        }
    }

    #[test]
    fn test_warmup_endpoints() {
        let c = config();
        assert_eq!(learning_rate(0, &c), 0.0);
        assert!((learning_rate(500, &c) - 5e-4).abs() < 1e-9);
        assert!((learning_rate(1_000, &c) - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn test_decay_floor() {
        let c = config();
        assert!((learning_rate(11_000, &c) - 1e-4).abs() < 1e-9);
        assert!((learning_rate(1_000_000, &c) - 1e-4).abs() < 1e-9);
        assert!((learning_rate(6_000, &c) - 5.5e-4).abs() < 1e-8);
    }

    #[test]
    fn test_non_increasing_after_warmup() {
        let c = config();
        let mut prev = learning_rate(1_000, &c);
        for tokens in (1_000..20_000).step_by(37) {
            let lr = learning_rate(tokens, &c);
            assert!(lr <= prev + 1e-12);
            prev = lr;
        }
    }

    #[test]
    fn test_constant_without_decay() {
        let c = TrainConfig {
            lr_decay: false,
            ..config()
        };
        for tokens in [0, 1, 999, 1_000, 50_000, u64::MAX] {
            assert_eq!(learning_rate(tokens, &c), 1e-3);
        }
    }

    #[test]
    fn test_zero_warmup_starts_at_base_rate() {
        assert_eq!(lr_multiplier(0, 0, 100), 1.0);
    }

    #[test]
    fn test_final_tokens() {
        assert_eq!(final_tokens(50, 8_000, 3), 1_200_000);
    }
}
