//! picogpt: a small GPT trained from scratch
//!
//! A decoder-only transformer with hand-written backpropagation, an AdamW
//! optimizer with a token-driven learning-rate schedule, and an
//! autoregressive sampler. Small enough to learn multi-digit addition or a
//! character-level text model on a CPU.
//!
//! # Modules
//!
//! - [`tensor`] - flat `f32` tensors with the handful of operations the model needs
//! - [`layers`] - linear, embedding, layer norm, attention, MLP, transformer block
//! - [`model`] - configuration, parameter initialization, forward and backward pass
//! - [`loss`] - masked next-token cross-entropy
//! - [`gradients`], [`optimizer`], [`schedule`] - gradient clipping, AdamW, learning rate
//! - [`train`] - batches, datasets and the epoch trainer
//! - [`sample`] - temperature / top-k / greedy decoding
//! - [`dataset`] - addition and character datasets
//! - [`checkpoint`], [`training_logger`] - persistence and CSV metrics
//!
//! # Example
//!
//! ```rust,no_run
//! use picogpt::dataset::{exam, AdditionDataset};
//! use picogpt::{init_params, ModelConfig, TrainConfig, Trainer};
//!
//! let (train, test) = AdditionDataset::splits(2, 3407)?;
//! let params = init_params(&ModelConfig::addition(2), 3407)?;
//! let mut trainer = Trainer::new(TrainConfig::default(), &train).with_test_dataset(&test);
//! let outcome = trainer.train(params)?;
//! let report = exam(&outcome.params, &test, None)?;
//! println!("{:.1}% correct", 100.0 * report.accuracy());
//! # Ok::<(), picogpt::Error>(())
//! ```

pub mod checkpoint;
pub mod dataset;
pub mod error;
pub mod gradients;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod sample;
pub mod schedule;
pub mod tensor;
pub mod train;
pub mod training_logger;

pub use error::{Error, Result};
pub use loss::{cross_entropy, IGNORE_INDEX};
pub use model::{backward, forward, init_params, ModelConfig, Parameters};
pub use sample::{sample, SampleOptions};
pub use tensor::Tensor;
pub use train::{Batch, Dataset, Sample, TrainConfig, TrainOutcome, Trainer};
