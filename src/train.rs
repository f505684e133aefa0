//! Training Loop
//!
//! [`Trainer`] drives epochs over a [`Dataset`]:
//!
//! ```text
//! validate every sample
//! for epoch in 0..max_epochs:
//!     shuffle sample order (seeded)
//!     for batch in order.chunks(batch_size):
//!         loss, grads = forward + backward
//!         clip grads to grad_norm_clip
//!         lr = schedule(tokens)
//!         AdamW step
//!         tokens += supervised positions in batch
//!     held-out loss (no updates), checkpoint if it improved
//! ```
//!
//! ## Batches
//!
//! A [`Sample`] is one `(input, target)` pair; targets equal to
//! [`IGNORE_INDEX`] are context positions that carry no loss. A batch is
//! processed in fixed-size chunks of sequences run in parallel with Rayon.
//! Each chunk sums its sequences' gradients in order and the chunk results
//! are summed in chunk order, so a step gives the same result on any number
//! of threads.
//!
//! ## Randomness
//!
//! One `StdRng` seeded from [`TrainConfig::seed`] drives the epoch shuffles
//! and hands every sequence of every step its own dropout seed before the
//! parallel section starts. The same seed reproduces the same run.

use crate::checkpoint;
use crate::error::{Error, Result};
use crate::gradients::{clip_gradients, Gradients};
use crate::loss::{
    check_targets, cross_entropy, sequence_nll, sequence_nll_backward, supervised_count,
};
use crate::model::{backward, forward, forward_sequence, Parameters};
use crate::optimizer::{adamw_update, OptimizerState};
use crate::schedule::learning_rate;
use crate::training_logger::{LogRecord, TrainingLogger};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::loss::IGNORE_INDEX;

/// Sequences per parallel work unit within a batch
const GRAD_CHUNK: usize = 4;

/// One training example
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sample {
    pub input: Vec<usize>,
    /// Same length as `input`; [`IGNORE_INDEX`] marks unsupervised positions
    pub target: Vec<usize>,
}

/// An indexed collection of fixed-length samples
pub trait Dataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample `index`, `0 <= index < len()`
    fn get(&self, index: usize) -> Sample;

    fn vocab_size(&self) -> usize;

    /// Maximum input length the samples need
    fn block_size(&self) -> usize;
}

/// Inputs and targets of several samples
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub inputs: Vec<Vec<usize>>,
    pub targets: Vec<Vec<usize>>,
}

impl Batch {
    pub fn from_samples(samples: impl IntoIterator<Item = Sample>) -> Self {
        let mut batch = Batch::default();
        for sample in samples {
            batch.inputs.push(sample.input);
            batch.targets.push(sample.target);
        }
        batch
    }

    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Number of supervised target positions
    pub fn supervised_tokens(&self) -> u64 {
        self.targets.iter().map(|t| supervised_count(t) as u64).sum()
    }
}

/// Training hyperparameters
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub max_epochs: usize,
    pub batch_size: usize,
    pub learning_rate: f32,
    pub betas: (f32, f32),
    /// Global gradient norm ceiling
    pub grad_norm_clip: f32,
    /// Decoupled decay on linear weight matrices
    pub weight_decay: f32,
    /// Warmup plus cosine decay when set, constant rate otherwise
    pub lr_decay: bool,
    pub warmup_tokens: u64,
    pub final_tokens: u64,
    pub seed: u64,
    /// Where to save parameters when the held-out loss improves
    pub ckpt_path: Option<PathBuf>,
    /// Log every this many steps; 0 logs only epoch summaries
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_epochs: 10,
            batch_size: 64,
            learning_rate: 3e-4,
            betas: (0.9, 0.95),
            grad_norm_clip: 1.0,
            weight_decay: 0.1,
            lr_decay: false,
            warmup_tokens: 375_000_000,
            final_tokens: 260_000_000_000,
            seed: 42,
            ckpt_path: None,
            log_every: 100,
        }
    }
}

impl TrainConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TrainConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".into()));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.grad_norm_clip > 0.0) {
            return Err(Error::Config(format!(
                "grad_norm_clip must be positive, got {}",
                self.grad_norm_clip
            )));
        }
        let (b1, b2) = self.betas;
        if !(0.0..1.0).contains(&b1) || !(0.0..1.0).contains(&b2) {
            return Err(Error::Config(format!("betas must lie in [0, 1), got {:?}", self.betas)));
        }
        if !(self.weight_decay >= 0.0) {
            return Err(Error::Config(format!(
                "weight_decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        Ok(())
    }
}

/// What one optimizer step did
#[derive(Clone, Copy, Debug)]
pub struct StepStats {
    pub loss: f32,
    pub grad_norm: f32,
    pub learning_rate: f32,
    pub tokens: u64,
}

/// Result of [`Trainer::train`]
pub struct TrainOutcome {
    pub params: Parameters,
    pub optimizer: OptimizerState,
    /// Training loss of the final batch
    pub last_loss: f32,
    /// Held-out loss after each epoch, empty without a held-out set
    pub test_losses: Vec<f32>,
}

/// Mean masked cross-entropy of a batch and its gradients
///
/// `rng` enables dropout; each sequence draws its own seed from it before
/// the parallel section.
pub fn loss_and_gradients(
    params: &Parameters,
    batch: &Batch,
    rng: Option<&mut StdRng>,
) -> Result<(f32, Gradients)> {
    if batch.inputs.len() != batch.targets.len() {
        return Err(Error::Shape("batch has unequal input and target counts".into()));
    }
    for (input, target) in batch.inputs.iter().zip(&batch.targets) {
        if input.len() != target.len() {
            return Err(Error::Shape(format!(
                "input length {} but target length {}",
                input.len(),
                target.len()
            )));
        }
        check_targets(target, params.config.vocab_size)?;
    }
    let normalizer = batch.supervised_tokens() as usize;
    let seeds: Vec<Option<u64>> = match rng {
        Some(rng) => (0..batch.len()).map(|_| Some(rng.random())).collect(),
        None => vec![None; batch.len()],
    };

    let items: Vec<(&Vec<usize>, &Vec<usize>, Option<u64>)> = batch
        .inputs
        .iter()
        .zip(&batch.targets)
        .zip(seeds)
        .map(|((input, target), seed)| (input, target, seed))
        .collect();

    let chunk_results: Vec<Result<(f32, Gradients)>> = items
        .par_chunks(GRAD_CHUNK)
        .map(|chunk| {
            let mut grads = Gradients::zeros_like(params);
            let mut nll = 0.0;
            for &(input, target, seed) in chunk {
                let mut seq_rng = seed.map(StdRng::seed_from_u64);
                let (logits, cache) = forward_sequence(params, input, seq_rng.as_mut())?;
                nll += sequence_nll(&logits, target).0;
                let grad_logits = sequence_nll_backward(&logits, target, normalizer);
                grads.accumulate(&backward(params, &cache, &grad_logits));
            }
            Ok((nll, grads))
        })
        .collect();

    let mut total = Gradients::zeros_like(params);
    let mut nll = 0.0;
    for result in chunk_results {
        let (chunk_nll, chunk_grads) = result?;
        nll += chunk_nll;
        total.accumulate(&chunk_grads);
    }

    let loss = if normalizer == 0 {
        0.0
    } else {
        nll / normalizer as f32
    };
    Ok((loss, total))
}

/// One forward/backward/update step
///
/// Clips, queries the schedule at the current token count, applies AdamW and
/// then advances the token counter by the batch's supervised positions.
pub fn train_step(
    params: &mut Parameters,
    state: &mut OptimizerState,
    batch: &Batch,
    config: &TrainConfig,
    rng: &mut StdRng,
) -> Result<StepStats> {
    let (loss, mut grads) = loss_and_gradients(params, batch, Some(rng))?;
    let grad_norm = clip_gradients(&mut grads, config.grad_norm_clip);
    let lr = learning_rate(state.tokens, config);
    adamw_update(params, &grads, state, lr, config.weight_decay);
    state.tokens += batch.supervised_tokens();

    Ok(StepStats {
        loss,
        grad_norm,
        learning_rate: lr,
        tokens: state.tokens,
    })
}

/// Mean of per-batch losses over `dataset` in index order, no dropout
pub fn evaluate(params: &Parameters, dataset: &dyn Dataset, batch_size: usize) -> Result<f32> {
    if dataset.is_empty() {
        return Err(Error::Config("cannot evaluate on an empty dataset".into()));
    }
    let indices: Vec<usize> = (0..dataset.len()).collect();
    let mut losses = Vec::new();
    for chunk in indices.chunks(batch_size.max(1)) {
        let batch = Batch::from_samples(chunk.iter().map(|&i| dataset.get(i)));
        let logits = forward(params, &batch.inputs)?;
        losses.push(cross_entropy(&logits, &batch.targets)?);
    }
    Ok(losses.iter().sum::<f32>() / losses.len() as f32)
}

/// Check every sample against the model before any computation
pub fn validate_dataset(params: &Parameters, dataset: &dyn Dataset) -> Result<()> {
    if dataset.is_empty() {
        return Err(Error::Config("dataset is empty".into()));
    }
    let config = &params.config;
    if dataset.vocab_size() > config.vocab_size {
        return Err(Error::Config(format!(
            "dataset vocabulary ({}) exceeds model vocabulary ({})",
            dataset.vocab_size(),
            config.vocab_size
        )));
    }
    for i in 0..dataset.len() {
        let sample = dataset.get(i);
        config.check_sequence(&sample.input)?;
        if sample.target.len() != sample.input.len() {
            return Err(Error::Shape(format!(
                "sample {}: input length {} but target length {}",
                i,
                sample.input.len(),
                sample.target.len()
            )));
        }
        check_targets(&sample.target, config.vocab_size)?;
    }
    Ok(())
}

/// Epoch-based trainer over a training and an optional held-out dataset
pub struct Trainer<'a> {
    pub config: TrainConfig,
    train_dataset: &'a dyn Dataset,
    test_dataset: Option<&'a dyn Dataset>,
    logger: Option<TrainingLogger>,
}

impl<'a> Trainer<'a> {
    pub fn new(config: TrainConfig, train_dataset: &'a dyn Dataset) -> Self {
        Self {
            config,
            train_dataset,
            test_dataset: None,
            logger: None,
        }
    }

    pub fn with_test_dataset(mut self, test_dataset: &'a dyn Dataset) -> Self {
        self.test_dataset = Some(test_dataset);
        self
    }

    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Train from fresh optimizer state
    pub fn train(&mut self, params: Parameters) -> Result<TrainOutcome> {
        let state = OptimizerState::new(&params, self.config.betas);
        self.train_from(params, state)
    }

    /// Train continuing from existing optimizer state (token counter included)
    pub fn train_from(
        &mut self,
        mut params: Parameters,
        mut state: OptimizerState,
    ) -> Result<TrainOutcome> {
        self.config.validate()?;
        validate_dataset(&params, self.train_dataset)?;
        if let Some(test) = self.test_dataset {
            validate_dataset(&params, test)?;
        }
        log::info!(
            "training {} parameters on {} samples for {} epochs",
            params.num_parameters(),
            self.train_dataset.len(),
            self.config.max_epochs
        );
        log::debug!("train config: {:?}", self.config);

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut order: Vec<usize> = (0..self.train_dataset.len()).collect();
        let mut last = StepStats {
            loss: 0.0,
            grad_norm: 0.0,
            learning_rate: 0.0,
            tokens: state.tokens,
        };
        let mut best_test_loss = f32::INFINITY;
        let mut test_losses = Vec::new();

        for epoch in 0..self.config.max_epochs {
            order.shuffle(&mut rng);

            for (it, chunk) in order.chunks(self.config.batch_size).enumerate() {
                let batch = Batch::from_samples(chunk.iter().map(|&i| self.train_dataset.get(i)));
                last = train_step(&mut params, &mut state, &batch, &self.config, &mut rng)?;

                if self.config.log_every > 0 && it % self.config.log_every == 0 {
                    log::info!(
                        "epoch {} iter {}: train loss {:.5}, lr {:e}",
                        epoch + 1,
                        it,
                        last.loss,
                        last.learning_rate
                    );
                    self.record(epoch, &state, &last, None)?;
                }
            }

            let test_loss = match self.test_dataset {
                Some(test) => {
                    let loss = evaluate(&params, test, self.config.batch_size)?;
                    log::info!("epoch {}: test loss {:.5}", epoch + 1, loss);
                    test_losses.push(loss);
                    Some(loss)
                }
                None => None,
            };
            self.record(epoch, &state, &last, test_loss)?;

            // without a held-out set every epoch counts as an improvement
            let improved = test_loss.map_or(true, |loss| loss < best_test_loss);
            if let Some(loss) = test_loss {
                best_test_loss = best_test_loss.min(loss);
            }
            if improved {
                if let Some(path) = &self.config.ckpt_path {
                    log::info!("saving checkpoint to {}", path.display());
                    checkpoint::save(path, &params, Some(&state))?;
                }
            }
        }

        Ok(TrainOutcome {
            params,
            optimizer: state,
            last_loss: last.loss,
            test_losses,
        })
    }

    fn record(
        &mut self,
        epoch: usize,
        state: &OptimizerState,
        stats: &StepStats,
        test_loss: Option<f32>,
    ) -> Result<()> {
        if let Some(logger) = &mut self.logger {
            logger.log(&LogRecord {
                epoch,
                step: state.step,
                tokens: state.tokens,
                learning_rate: stats.learning_rate,
                train_loss: stats.loss,
                test_loss,
                grad_norm: stats.grad_norm,
            })?;
        }
        Ok(())
    }
}
