//! picogpt command line
//!
//! ```bash
//! # learn 2-digit addition and grade the result
//! cargo run --release -- train-addition --ndigit 2 --epochs 50 --ckpt add.bin
//!
//! # character-level model over a text file
//! cargo run --release -- train-chars --data input.txt --block-size 128 --ckpt chars.bin
//!
//! # sample from a checkpoint (characters when --data is given, else token ids)
//! cargo run --release -- sample --ckpt chars.bin --data input.txt --prompt "O God" --steps 200 --do-sample --top-k 10
//! cargo run --release -- sample --ckpt add.bin --prompt "4 7 1 7" --steps 3
//! ```
//!
//! Set `RUST_LOG=debug` for per-checkpoint and configuration detail.

use clap::{Args, Parser, Subcommand};
use picogpt::checkpoint;
use picogpt::dataset::{exam, AdditionDataset, CharDataset};
use picogpt::schedule::final_tokens;
use picogpt::training_logger::TrainingLogger;
use picogpt::{init_params, Dataset, Error, ModelConfig, Result, SampleOptions, TrainConfig, Trainer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "picogpt", about = "Train and sample a small GPT from scratch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train on fixed-width addition problems, then grade both splits
    TrainAddition {
        /// Digits per operand
        #[arg(long, default_value = "2")]
        ndigit: usize,

        #[command(flatten)]
        train: TrainArgs,
    },

    /// Train a character-level model on a text file
    TrainChars {
        /// Training text
        #[arg(long)]
        data: PathBuf,

        /// Context length
        #[arg(long, default_value = "128")]
        block_size: usize,

        /// Number of transformer layers
        #[arg(long, default_value = "8")]
        layers: usize,

        /// Number of attention heads
        #[arg(long, default_value = "8")]
        heads: usize,

        /// Embedding dimension
        #[arg(long, default_value = "512")]
        embd: usize,

        #[command(flatten)]
        train: TrainArgs,
    },

    /// Extend a prompt with a trained checkpoint
    Sample {
        /// Checkpoint to load
        #[arg(long)]
        ckpt: PathBuf,

        /// Text whose characters form the vocabulary; without it the prompt is token ids
        #[arg(long)]
        data: Option<PathBuf>,

        /// Prompt text, or whitespace-separated token ids
        #[arg(long)]
        prompt: String,

        /// Tokens to generate
        #[arg(long, default_value = "100")]
        steps: usize,

        #[arg(long, default_value = "1.0")]
        temperature: f32,

        #[arg(long)]
        top_k: Option<usize>,

        /// Draw from the distribution instead of decoding greedily
        #[arg(long)]
        do_sample: bool,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

/// Flags shared by the training subcommands; set flags override `--config`
#[derive(Args)]
struct TrainArgs {
    /// JSON file with TrainConfig fields
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    epochs: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    /// Peak learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Enable warmup plus cosine decay
    #[arg(long)]
    lr_decay: bool,

    #[arg(long)]
    seed: Option<u64>,

    /// Save parameters here when the held-out loss improves
    #[arg(long)]
    ckpt: Option<PathBuf>,

    /// CSV file for training metrics
    #[arg(long)]
    log_csv: Option<PathBuf>,
}

/// A resolved training config plus which schedule fields the JSON set itself
struct ResolvedTrainConfig {
    config: TrainConfig,
    explicit_warmup: bool,
    explicit_final: bool,
}

impl ResolvedTrainConfig {
    /// Fill warmup and decay horizon for `--lr-decay` runs, leaving values
    /// from `--config` untouched
    fn schedule_defaults(mut self, warmup_tokens: u64, final_tokens: u64) -> TrainConfig {
        if self.config.lr_decay {
            if !self.explicit_warmup {
                self.config.warmup_tokens = warmup_tokens;
            }
            if !self.explicit_final {
                self.config.final_tokens = final_tokens;
            }
        }
        self.config
    }
}

impl TrainArgs {
    fn build(&self) -> Result<ResolvedTrainConfig> {
        let (mut config, explicit_warmup, explicit_final) = match &self.config {
            Some(path) => {
                let value: serde_json::Value =
                    serde_json::from_str(&std::fs::read_to_string(path)?)?;
                let explicit_warmup = value.get("warmup_tokens").is_some();
                let explicit_final = value.get("final_tokens").is_some();
                (serde_json::from_value(value)?, explicit_warmup, explicit_final)
            }
            None => (TrainConfig::default(), false, false),
        };
        if let Some(epochs) = self.epochs {
            config.max_epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(lr) = self.lr {
            config.learning_rate = lr;
        }
        if self.lr_decay {
            config.lr_decay = true;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.ckpt.is_some() {
            config.ckpt_path = self.ckpt.clone();
        }
        config.validate()?;
        Ok(ResolvedTrainConfig {
            config,
            explicit_warmup,
            explicit_final,
        })
    }

    fn logger(&self) -> Result<Option<TrainingLogger>> {
        Ok(match &self.log_csv {
            Some(path) => Some(TrainingLogger::new(path)?),
            None => None,
        })
    }
}

fn train_addition(ndigit: usize, args: &TrainArgs) -> Result<()> {
    let resolved = args.build()?;
    let (train, test) = AdditionDataset::splits(ndigit, resolved.config.seed)?;
    let horizon = final_tokens(
        resolved.config.max_epochs,
        train.len(),
        train.supervised_per_sample(),
    );
    let config = resolved.schedule_defaults(1024, horizon);

    let model_config = ModelConfig::addition(ndigit);
    let params = init_params(&model_config, config.seed)?;
    log::info!(
        "addition with {} digits: {} train / {} test problems, {} parameters",
        ndigit,
        train.len(),
        test.len(),
        params.num_parameters()
    );

    let mut trainer = Trainer::new(config, &train).with_test_dataset(&test);
    if let Some(logger) = args.logger()? {
        trainer = trainer.with_logger(logger);
    }
    let outcome = trainer.train(params)?;

    let train_report = exam(&outcome.params, &train, Some(5000))?;
    let test_report = exam(&outcome.params, &test, None)?;
    println!(
        "final train accuracy {:.2}% ({} / {})",
        100.0 * train_report.accuracy(),
        train_report.correct,
        train_report.total
    );
    println!(
        "final test accuracy {:.2}% ({} / {})",
        100.0 * test_report.accuracy(),
        test_report.correct,
        test_report.total
    );
    for (a, b, predicted) in test_report.mistakes.iter().take(5) {
        println!("  {} + {} = {}, predicted {}", a, b, a + b, predicted);
    }
    Ok(())
}

fn train_chars(
    data: &Path,
    model_config: ModelConfig,
    args: &TrainArgs,
) -> Result<()> {
    let resolved = args.build()?;
    let text = std::fs::read_to_string(data)?;
    let dataset = CharDataset::new(&text, model_config.block_size)?;
    let model_config = ModelConfig {
        vocab_size: dataset.vocab_size(),
        ..model_config
    };
    let horizon = final_tokens(
        resolved.config.max_epochs,
        dataset.len(),
        model_config.block_size,
    );
    let config = resolved.schedule_defaults(512 * 20, horizon);

    let params = init_params(&model_config, config.seed)?;
    let mut trainer = Trainer::new(config, &dataset);
    if let Some(logger) = args.logger()? {
        trainer = trainer.with_logger(logger);
    }
    let outcome = trainer.train(params)?;
    println!("final train loss {:.5}", outcome.last_loss);
    Ok(())
}

fn sample(
    ckpt: &Path,
    data: Option<&Path>,
    prompt: &str,
    steps: usize,
    options: SampleOptions,
    seed: u64,
) -> Result<()> {
    let params = checkpoint::load(ckpt)?.params;
    let vocab = match data {
        Some(path) => Some(CharDataset::new(
            &std::fs::read_to_string(path)?,
            params.config.block_size,
        )?),
        None => None,
    };

    let tokens = match &vocab {
        Some(chars) => chars.encode(prompt)?,
        None => prompt
            .split_whitespace()
            .map(|t| {
                t.parse::<usize>()
                    .map_err(|_| Error::Config(format!("invalid token id {:?}", t)))
            })
            .collect::<Result<Vec<_>>>()?,
    };

    let mut rng = StdRng::seed_from_u64(seed);
    let out = picogpt::sample(&params, &tokens, steps, &options, &mut rng)?;
    match &vocab {
        Some(chars) => println!("{}", chars.decode(&out)),
        None => {
            let ids: Vec<String> = out.iter().map(|t| t.to_string()).collect();
            println!("{}", ids.join(" "));
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match &cli.command {
        Command::TrainAddition { ndigit, train } => train_addition(*ndigit, train),
        Command::TrainChars {
            data,
            block_size,
            layers,
            heads,
            embd,
            train,
        } => {
            let model_config = ModelConfig {
                block_size: *block_size,
                n_layers: *layers,
                n_heads: *heads,
                n_embd: *embd,
                ..ModelConfig::default()
            };
            train_chars(data, model_config, train)
        }
        Command::Sample {
            ckpt,
            data,
            prompt,
            steps,
            temperature,
            top_k,
            do_sample,
            seed,
        } => {
            let options = SampleOptions {
                temperature: *temperature,
                top_k: *top_k,
                do_sample: *do_sample,
            };
            sample(ckpt, data.as_deref(), prompt, *steps, options, *seed)
        }
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(config: Option<PathBuf>) -> TrainArgs {
        TrainArgs {
            config,
            epochs: None,
            batch_size: None,
            lr: None,
            lr_decay: true,
            seed: None,
            ckpt: None,
            log_csv: None,
        }
    }

    #[test]
    fn test_schedule_defaults_fill_unset_fields() {
        let config = args(None).build().unwrap().schedule_defaults(1024, 9_000);
        assert!(config.lr_decay);
        assert_eq!((config.warmup_tokens, config.final_tokens), (1024, 9_000));
    }

    #[test]
    fn test_schedule_values_from_json_are_kept() {
        let path = std::env::temp_dir().join(format!("picogpt_cli_{}.json", std::process::id()));
        std::fs::write(&path, r#"{"warmup_tokens": 77, "batch_size": 16}"#).unwrap();
        let resolved = args(Some(path.clone())).build();
        std::fs::remove_file(&path).unwrap();

        let config = resolved.unwrap().schedule_defaults(1024, 9_000);
        assert_eq!(config.warmup_tokens, 77);
        assert_eq!(config.final_tokens, 9_000);
        assert_eq!(config.batch_size, 16);
    }

    #[test]
    fn test_schedule_untouched_without_decay() {
        let mut plain = args(None);
        plain.lr_decay = false;
        let config = plain.build().unwrap().schedule_defaults(1024, 9_000);
        assert_eq!(config, TrainConfig::default());
    }
}
