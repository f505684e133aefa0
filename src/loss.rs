//! Masked Cross-Entropy Loss
//!
//! Next-token cross-entropy averaged over the *supervised* target positions
//! only. A target equal to [`IGNORE_INDEX`] marks a position whose token was
//! given as context and must not be predicted.
//!
//! ```text
//! loss = Σ_{supervised (b, t)} -log softmax(logits[b, t])[target[b, t]]
//!        ─────────────────────────────────────────────────────────────
//!                      number of supervised positions
//! ```
//!
//! A batch without a single supervised position has loss 0. A sequence
//! without supervised positions adds nothing to either sum.
//!
//! ## Gradient
//!
//! ```text
//! grad_logits[b, t] = (softmax(logits[b, t]) - onehot(target[b, t])) / N
//! ```
//!
//! at supervised positions and zero elsewhere, with `N` the supervised count
//! of the whole batch.

use crate::error::{Error, Result};
use crate::tensor::{softmax_in_place, Tensor};

/// Target value excluded from the loss
///
/// Lies outside `[0, vocab_size)` for every representable vocabulary.
pub const IGNORE_INDEX: usize = usize::MAX;

/// Number of supervised positions in a target sequence
pub fn supervised_count(targets: &[usize]) -> usize {
    targets.iter().filter(|&&t| t != IGNORE_INDEX).count()
}

/// Check that every target is either supervised and in range, or ignored
pub fn check_targets(targets: &[usize], vocab_size: usize) -> Result<()> {
    match targets
        .iter()
        .find(|&&t| t != IGNORE_INDEX && t >= vocab_size)
    {
        Some(&token) => Err(Error::TokenOutOfRange { token, vocab_size }),
        None => Ok(()),
    }
}

/// `-log p[target]` for one row of logits
fn row_nll(logits: &[f32], target: usize) -> f32 {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let log_sum_exp = logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln() + max;
    log_sum_exp - logits[target]
}

/// Summed negative log-likelihood over the supervised rows of `[seq_len, vocab]` logits
///
/// Returns `(sum, supervised_count)`.
pub fn sequence_nll(logits: &Tensor, targets: &[usize]) -> (f32, usize) {
    let mut sum = 0.0;
    let mut count = 0;
    for (t, &target) in targets.iter().enumerate() {
        if target != IGNORE_INDEX {
            sum += row_nll(logits.row(t), target);
            count += 1;
        }
    }
    (sum, count)
}

/// Gradient of `sequence_nll(...).0 / normalizer` with respect to the logits
pub fn sequence_nll_backward(logits: &Tensor, targets: &[usize], normalizer: usize) -> Tensor {
    let vocab = logits.cols();
    let mut grad = logits.zeros_like();
    if normalizer == 0 {
        return grad;
    }
    let inv = 1.0 / normalizer as f32;

    for (t, &target) in targets.iter().enumerate() {
        if target == IGNORE_INDEX {
            continue;
        }
        let row = &mut grad.data[t * vocab..(t + 1) * vocab];
        row.copy_from_slice(logits.row(t));
        softmax_in_place(row);
        row[target] -= 1.0;
        for g in row.iter_mut() {
            *g *= inv;
        }
    }
    grad
}

/// Mean cross-entropy over the supervised positions of a batch
///
/// `logits` is `[batch, seq_len, vocab]`, `targets` holds `batch` sequences of
/// `seq_len` entries each.
pub fn cross_entropy(logits: &Tensor, targets: &[Vec<usize>]) -> Result<f32> {
    if logits.shape.len() != 3 {
        return Err(Error::Shape(format!(
            "expected [batch, seq_len, vocab] logits, got {:?}",
            logits.shape
        )));
    }
    let (batch, seq_len, vocab) = (logits.shape[0], logits.shape[1], logits.shape[2]);
    if targets.len() != batch || targets.iter().any(|t| t.len() != seq_len) {
        return Err(Error::Shape(format!(
            "targets do not match logits of shape {:?}",
            logits.shape
        )));
    }

    let mut sum = 0.0;
    let mut count = 0;
    for (b, seq_targets) in targets.iter().enumerate() {
        check_targets(seq_targets, vocab)?;
        let start = b * seq_len * vocab;
        let seq_logits = Tensor::new(
            logits.data[start..start + seq_len * vocab].to_vec(),
            vec![seq_len, vocab],
        );
        let (s, c) = sequence_nll(&seq_logits, seq_targets);
        sum += s;
        count += c;
    }

    Ok(if count == 0 { 0.0 } else { sum / count as f32 })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros(vec![1, 2, 4]);
        let loss = cross_entropy(&logits, &[vec![0, 3]]).unwrap();
        assert!((loss - 4.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_all_ignored_is_zero() {
        let logits = Tensor::new((0..12).map(|i| i as f32).collect(), vec![2, 2, 3]);
        let targets = vec![vec![IGNORE_INDEX; 2]; 2];
        assert_eq!(cross_entropy(&logits, &targets).unwrap(), 0.0);

        let grad = sequence_nll_backward(
            &Tensor::new(logits.data[..6].to_vec(), vec![2, 3]),
            &targets[0],
            0,
        );
        assert!(grad.data.iter().all(|&g| g == 0.0));
    }

    #[test]
    fn test_unsupervised_sequence_is_excluded_from_mean() {
        let mut logits = Tensor::zeros(vec![2, 1, 2]);
        logits.data[0] = 2.0; // sequence 0 predicts token 0 confidently
        let only_first = cross_entropy(&logits, &[vec![0], vec![IGNORE_INDEX]]).unwrap();
        let single = cross_entropy(&Tensor::new(vec![2.0, 0.0], vec![1, 1, 2]), &[vec![0]]).unwrap();
        assert!((only_first - single).abs() < 1e-6);
    }

    #[test]
    fn test_ignored_positions_do_not_contribute() {
        let logits = Tensor::new(vec![5.0, -5.0, 0.0, 0.0], vec![1, 2, 2]);
        let loss = cross_entropy(&logits, &[vec![IGNORE_INDEX, 1]]).unwrap();
        assert!((loss - 2.0f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let logits = Tensor::new(vec![0.3, -1.2, 0.8, 0.1, 0.0, 2.0], vec![2, 3]);
        let targets = [2, 0];
        let grad = sequence_nll_backward(&logits, &targets, 2);

        let eps = 1e-2;
        for i in 0..logits.len() {
            let mut plus = logits.clone();
            plus.data[i] += eps;
            let mut minus = logits.clone();
            minus.data[i] -= eps;
            let numeric =
                (sequence_nll(&plus, &targets).0 - sequence_nll(&minus, &targets).0) / (2.0 * eps) / 2.0;
            assert!((numeric - grad.data[i]).abs() < 1e-3);
        }
    }

    #[test]
    fn test_out_of_range_target_is_rejected() {
        let logits = Tensor::zeros(vec![1, 1, 3]);
        assert!(matches!(
            cross_entropy(&logits, &[vec![3]]),
            Err(Error::TokenOutOfRange { token: 3, vocab_size: 3 })
        ));
    }
}
