//! Datasets: fixed-digit addition and character-level text.
//!
//! ## Addition
//!
//! Every pair `(a, b)` of `ndigit`-digit numbers becomes one sample. With
//! `ndigit = 2` and `85 + 50 = 135`:
//!
//! ```text
//! digits   8 5 5 0 5 3 1        a, b, then c reversed and padded to 3 digits
//! input    8 5 5 0 5 3          all but the last digit
//! target   - - - 5 3 1          next digit; '-' = IGNORE_INDEX
//! ```
//!
//! The sum is written least significant digit first so that the model can
//! produce it the way long addition does, carrying left to right.
//!
//! The `10^(2·ndigit)` pairs are split by a seeded permutation: the first
//! `min(20%, 1000)` indices are the test split, the rest the training split.
//!
//! ## Characters
//!
//! [`CharDataset`] builds its vocabulary from the sorted unique characters of
//! a text and serves every window of `block_size + 1` characters, input and
//! target offset by one, with no masked positions.

use crate::error::{Error, Result};
use crate::model::Parameters;
use crate::sample::{sample, SampleOptions};
use crate::train::{Dataset, Sample, IGNORE_INDEX};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};

/// Largest supported operand width; 10^(2·3) pairs are enumerated eagerly
pub const MAX_NDIGIT: usize = 3;

/// Which side of the train/test split a dataset serves
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

/// All `ndigit`-digit additions, one split of a seeded permutation
#[derive(Clone, Debug)]
pub struct AdditionDataset {
    ndigit: usize,
    split: Split,
    /// Pair indices `a * 10^ndigit + b` of this split
    pairs: Vec<u32>,
}

impl AdditionDataset {
    pub fn new(ndigit: usize, split: Split, seed: u64) -> Result<Self> {
        if !(1..=MAX_NDIGIT).contains(&ndigit) {
            return Err(Error::Config(format!(
                "ndigit must be between 1 and {}, got {}",
                MAX_NDIGIT, ndigit
            )));
        }
        let num = 10u32.pow(2 * ndigit as u32);
        let mut perm: Vec<u32> = (0..num).collect();
        perm.shuffle(&mut StdRng::seed_from_u64(seed));

        let num_test = ((num as usize) / 5).min(1000);
        let pairs = match split {
            Split::Test => perm[..num_test].to_vec(),
            Split::Train => perm[num_test..].to_vec(),
        };
        Ok(Self {
            ndigit,
            split,
            pairs,
        })
    }

    /// Train and test splits from the same permutation
    pub fn splits(ndigit: usize, seed: u64) -> Result<(Self, Self)> {
        Ok((
            Self::new(ndigit, Split::Train, seed)?,
            Self::new(ndigit, Split::Test, seed)?,
        ))
    }

    pub fn ndigit(&self) -> usize {
        self.ndigit
    }

    pub fn split(&self) -> Split {
        self.split
    }

    /// Supervised target positions per sample: the `ndigit + 1` sum digits
    pub fn supervised_per_sample(&self) -> usize {
        self.ndigit + 1
    }

    /// Operands of sample `index`
    pub fn operands(&self, index: usize) -> (u32, u32) {
        let base = 10u32.pow(self.ndigit as u32);
        let pair = self.pairs[index];
        (pair / base, pair % base)
    }

    /// Digits of `a`, `b` and the reversed sum
    pub fn encode(&self, a: u32, b: u32) -> Vec<usize> {
        let n = self.ndigit;
        let mut digits = Vec::with_capacity(3 * n + 1);
        digits.extend(to_digits(a, n));
        digits.extend(to_digits(b, n));
        let mut sum = to_digits(a + b, n + 1);
        sum.reverse();
        digits.extend(sum);
        digits
    }
}

/// `value` as exactly `width` decimal digits, most significant first
fn to_digits(value: u32, width: usize) -> Vec<usize> {
    let mut digits = vec![0; width];
    let mut v = value;
    for d in digits.iter_mut().rev() {
        *d = (v % 10) as usize;
        v /= 10;
    }
    digits
}

impl Dataset for AdditionDataset {
    fn len(&self) -> usize {
        self.pairs.len()
    }

    fn get(&self, index: usize) -> Sample {
        let (a, b) = self.operands(index);
        let digits = self.encode(a, b);
        let input = digits[..digits.len() - 1].to_vec();
        let mut target = digits[1..].to_vec();
        for t in target.iter_mut().take(2 * self.ndigit - 1) {
            *t = IGNORE_INDEX;
        }
        Sample { input, target }
    }

    fn vocab_size(&self) -> usize {
        10
    }

    fn block_size(&self) -> usize {
        3 * self.ndigit
    }
}

/// Outcome of [`exam`]
#[derive(Clone, Debug, Default)]
pub struct ExamReport {
    pub correct: usize,
    pub total: usize,
    /// `(a, b, predicted)` for wrong answers, in dataset order
    pub mistakes: Vec<(u32, u32, u64)>,
}

impl ExamReport {
    pub fn accuracy(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            self.correct as f32 / self.total as f32
        }
    }
}

/// Greedily answer the first `max_samples` problems of `dataset`
///
/// The model sees the `2·ndigit` operand digits and generates `ndigit + 1`
/// digits, which are reversed back into the predicted sum.
pub fn exam(
    params: &Parameters,
    dataset: &AdditionDataset,
    max_samples: Option<usize>,
) -> Result<ExamReport> {
    let n = dataset.ndigit;
    let total = max_samples.map_or(dataset.len(), |m| m.min(dataset.len()));

    let answers: Vec<(u32, u32, u64)> = (0..total)
        .into_par_iter()
        .map(|i| {
            let (a, b) = dataset.operands(i);
            let digits = dataset.encode(a, b);
            // greedy decoding never draws from the stream
            let mut rng = StdRng::seed_from_u64(0);
            let out = sample(params, &digits[..2 * n], n + 1, &SampleOptions::greedy(), &mut rng)?;
            let predicted = out[2 * n..]
                .iter()
                .rev()
                .fold(0u64, |acc, &d| acc * 10 + d as u64);
            Ok((a, b, predicted))
        })
        .collect::<Result<_>>()?;

    let mut report = ExamReport {
        total,
        ..ExamReport::default()
    };
    for (a, b, predicted) in answers {
        if predicted == (a + b) as u64 {
            report.correct += 1;
        } else {
            report.mistakes.push((a, b, predicted));
        }
    }
    log::info!(
        "exam on {:?} split: {}/{} correct ({:.2}%)",
        dataset.split,
        report.correct,
        report.total,
        100.0 * report.accuracy()
    );
    for (a, b, predicted) in report.mistakes.iter().take(5) {
        log::debug!("mistake: {} + {} = {} (predicted {})", a, b, a + b, predicted);
    }
    Ok(report)
}

/// Character-level language-modelling dataset
#[derive(Clone, Debug)]
pub struct CharDataset {
    block_size: usize,
    stoi: HashMap<char, usize>,
    itos: Vec<char>,
    data: Vec<usize>,
}

impl CharDataset {
    pub fn new(text: &str, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::Config("block_size must be positive".into()));
        }
        let itos: Vec<char> = text.chars().collect::<BTreeSet<_>>().into_iter().collect();
        let stoi: HashMap<char, usize> = itos.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        let data: Vec<usize> = text.chars().map(|c| stoi[&c]).collect();
        if data.len() <= block_size {
            return Err(Error::Config(format!(
                "text of {} characters is too short for block_size {}",
                data.len(),
                block_size
            )));
        }
        log::info!(
            "data has {} characters, {} unique",
            data.len(),
            itos.len()
        );
        Ok(Self {
            block_size,
            stoi,
            itos,
            data,
        })
    }

    pub fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .map(|c| {
                self.stoi
                    .get(&c)
                    .copied()
                    .ok_or_else(|| Error::Config(format!("character {:?} is not in the vocabulary", c)))
            })
            .collect()
    }

    /// Ids outside the vocabulary decode to U+FFFD
    pub fn decode(&self, tokens: &[usize]) -> String {
        tokens
            .iter()
            .map(|&t| self.itos.get(t).copied().unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect()
    }
}

impl Dataset for CharDataset {
    fn len(&self) -> usize {
        self.data.len() - self.block_size
    }

    fn get(&self, index: usize) -> Sample {
        let chunk = &self.data[index..index + self.block_size + 1];
        Sample {
            input: chunk[..self.block_size].to_vec(),
            target: chunk[1..].to_vec(),
        }
    }

    fn vocab_size(&self) -> usize {
        self.itos.len()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{init_params, ModelConfig};

    #[test]
    fn test_addition_encoding() {
        let ds = AdditionDataset::new(2, Split::Train, 0).unwrap();
        assert_eq!(ds.encode(85, 50), vec![8, 5, 5, 0, 5, 3, 1]);
        assert_eq!(ds.encode(47, 17), vec![4, 7, 1, 7, 4, 6, 0]);
    }

    #[test]
    fn test_addition_sample_masks_operands() {
        let ds = AdditionDataset::new(2, Split::Train, 0).unwrap();
        let sample = ds.get(0);
        let (a, b) = ds.operands(0);
        let digits = ds.encode(a, b);
        assert_eq!(sample.input, digits[..6].to_vec());
        assert_eq!(&sample.target[..3], &[IGNORE_INDEX; 3]);
        assert_eq!(&sample.target[3..], &digits[4..]);
        assert_eq!(ds.block_size(), 6);
    }

    #[test]
    fn test_splits_partition_all_pairs() {
        let (train, test) = AdditionDataset::splits(2, 3).unwrap();
        assert_eq!(test.len(), 1000);
        assert_eq!(train.len(), 9000);
        let mut all: Vec<u32> = train.pairs.iter().chain(&test.pairs).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10_000).collect::<Vec<_>>());

        let small = AdditionDataset::new(1, Split::Test, 3).unwrap();
        assert_eq!(small.len(), 20);
    }

    #[test]
    fn test_split_depends_on_seed_only() {
        let a = AdditionDataset::new(2, Split::Test, 7).unwrap();
        let b = AdditionDataset::new(2, Split::Test, 7).unwrap();
        let c = AdditionDataset::new(2, Split::Test, 8).unwrap();
        assert_eq!(a.pairs, b.pairs);
        assert_ne!(a.pairs, c.pairs);
    }

    #[test]
    fn test_ndigit_bounds() {
        assert!(AdditionDataset::new(0, Split::Train, 0).is_err());
        assert!(AdditionDataset::new(4, Split::Train, 0).is_err());
    }

    #[test]
    fn test_exam_counts_every_problem() {
        let ds = AdditionDataset::new(1, Split::Test, 0).unwrap();
        let params = init_params(&ModelConfig::tiny(10, 3), 0).unwrap();
        let report = exam(&params, &ds, Some(7)).unwrap();
        assert_eq!(report.total, 7);
        assert_eq!(report.correct + report.mistakes.len(), 7);
    }

    #[test]
    fn test_char_dataset_windows() {
        let ds = CharDataset::new("hello", 2).unwrap();
        assert_eq!(ds.vocab_size(), 4); // e h l o
        assert_eq!(ds.len(), 3);
        let s = ds.get(1);
        assert_eq!(ds.decode(&s.input), "el");
        assert_eq!(ds.decode(&s.target), "ll");
        assert_eq!(ds.encode("hole").unwrap(), vec![1, 3, 2, 0]);
        assert!(ds.encode("x").is_err());
    }

    #[test]
    fn test_char_dataset_too_short() {
        assert!(CharDataset::new("ab", 2).is_err());
    }
}
