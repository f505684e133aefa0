//! Training scenarios on the addition task.
//!
//! The 1-digit runs check learning and held-out accuracy in the default
//! suite. The full 2-digit run can take an hour on a single core and is
//! ignored by default:
//!
//! ```bash
//! cargo test --release --test end_to_end -- --ignored
//! ```

use picogpt::checkpoint;
use picogpt::dataset::{exam, AdditionDataset};
use picogpt::schedule::final_tokens;
use picogpt::train::evaluate;
use picogpt::{init_params, sample, Dataset, ModelConfig, SampleOptions, TrainConfig, Trainer};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn one_digit_model() -> ModelConfig {
    ModelConfig {
        vocab_size: 10,
        block_size: 3,
        n_layers: 2,
        n_heads: 2,
        n_embd: 32,
        embd_pdrop: 0.0,
        attn_pdrop: 0.0,
        resid_pdrop: 0.0,
    }
}

fn one_digit_config() -> TrainConfig {
    TrainConfig {
        max_epochs: 80,
        batch_size: 8,
        learning_rate: 5e-3,
        seed: 7,
        log_every: 0,
        ..TrainConfig::default()
    }
}

/// Answer `a + b` greedily with an `ndigit` model
fn add(params: &picogpt::Parameters, ndigit: usize, a: u32, b: u32) -> u64 {
    let ds = AdditionDataset::new(ndigit, picogpt::dataset::Split::Test, 0).unwrap();
    let prompt = &ds.encode(a, b)[..2 * ndigit];
    let out = sample(
        params,
        prompt,
        ndigit + 1,
        &SampleOptions::greedy(),
        &mut StdRng::seed_from_u64(0),
    )
    .unwrap();
    out[2 * ndigit..]
        .iter()
        .rev()
        .fold(0, |acc, &d| acc * 10 + d as u64)
}

#[test]
fn test_one_digit_addition_learns() {
    let (train, test) = AdditionDataset::splits(1, 7).unwrap();
    assert_eq!((train.len(), test.len()), (80, 20));

    let params = init_params(&one_digit_model(), 7).unwrap();
    let initial = evaluate(&params, &train, 64).unwrap();
    assert!((initial - 10f32.ln()).abs() < 0.3, "initial loss {}", initial);

    let outcome = Trainer::new(one_digit_config(), &train)
        .with_test_dataset(&test)
        .train(params)
        .unwrap();

    let final_loss = evaluate(&outcome.params, &train, 64).unwrap();
    assert!(final_loss < 1.0, "train loss {}", final_loss);
    assert_eq!(outcome.test_losses.len(), 80);
    // 80 samples × 2 sum digits × 80 epochs
    assert_eq!(outcome.optimizer.tokens, 12_800);

    let report = exam(&outcome.params, &train, None).unwrap();
    assert_eq!(report.total, 80);
    assert!(report.accuracy() >= 0.3, "train accuracy {}", report.accuracy());
}

#[test]
fn test_one_digit_addition_generalizes_to_held_out_pairs() {
    let (train, test) = AdditionDataset::splits(1, 11).unwrap();
    let epochs = 300;
    let config = TrainConfig {
        max_epochs: epochs,
        batch_size: 16,
        learning_rate: 3e-3,
        lr_decay: true,
        warmup_tokens: 200,
        final_tokens: final_tokens(epochs, train.len(), train.supervised_per_sample()),
        seed: 11,
        log_every: 0,
        ..TrainConfig::default()
    };
    let params = init_params(&one_digit_model(), 11).unwrap();
    let outcome = Trainer::new(config, &train)
        .with_test_dataset(&test)
        .train(params)
        .unwrap();

    let seen = exam(&outcome.params, &train, None).unwrap();
    assert!(seen.accuracy() >= 0.95, "train accuracy {}", seen.accuracy());

    let held_out = exam(&outcome.params, &test, None).unwrap();
    assert_eq!(held_out.total, 20);
    assert!(
        held_out.accuracy() >= 0.9,
        "held-out accuracy {}, mistakes {:?}",
        held_out.accuracy(),
        held_out.mistakes
    );

    // decoding the generated digits agrees with the exam verdict pair by pair
    for i in 0..test.len() {
        let (a, b) = test.operands(i);
        let predicted = add(&outcome.params, 1, a, b);
        let missed = held_out.mistakes.iter().any(|&(x, y, _)| (x, y) == (a, b));
        assert_eq!(predicted == (a + b) as u64, !missed, "{} + {}", a, b);
    }
}

#[test]
fn test_trained_checkpoint_roundtrip() {
    let (train, _) = AdditionDataset::splits(1, 1).unwrap();
    let params = init_params(&one_digit_model(), 1).unwrap();
    let config = TrainConfig {
        max_epochs: 3,
        ..one_digit_config()
    };
    let outcome = Trainer::new(config, &train).train(params).unwrap();

    let path = std::env::temp_dir().join(format!("picogpt_e2e_{}.bin", std::process::id()));
    checkpoint::save(&path, &outcome.params, Some(&outcome.optimizer)).unwrap();
    let restored = checkpoint::load(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(restored.params.version, outcome.params.version);
    assert_eq!(restored.params.tensors(), outcome.params.tensors());
    let state = restored.optimizer.unwrap();
    assert_eq!(state.tokens, outcome.optimizer.tokens);
    assert_eq!(state.step, outcome.optimizer.step);

    let before = exam(&outcome.params, &train, None).unwrap();
    let after = exam(&restored.params, &train, None).unwrap();
    assert_eq!(before.correct, after.correct);
    assert_eq!(before.mistakes, after.mistakes);
}

#[test]
fn test_resumed_training_continues_token_count() {
    let (train, _) = AdditionDataset::splits(1, 2).unwrap();
    let params = init_params(&one_digit_model(), 2).unwrap();
    let config = TrainConfig {
        max_epochs: 2,
        ..one_digit_config()
    };
    let first = Trainer::new(config.clone(), &train).train(params).unwrap();
    assert_eq!(first.optimizer.tokens, 320);

    let second = Trainer::new(config, &train)
        .train_from(first.params, first.optimizer)
        .unwrap();
    assert_eq!(second.optimizer.tokens, 640);
    assert_eq!(second.params.version, 40);
}

#[test]
#[ignore]
fn test_two_digit_addition_reaches_full_accuracy() {
    let ndigit = 2;
    let (train, test) = AdditionDataset::splits(ndigit, 3407).unwrap();
    let config = TrainConfig {
        max_epochs: 50,
        batch_size: 512,
        learning_rate: 6e-4,
        lr_decay: true,
        warmup_tokens: 1024,
        final_tokens: final_tokens(50, train.len(), train.supervised_per_sample()),
        seed: 3407,
        log_every: 0,
        ..TrainConfig::default()
    };
    let params = init_params(&ModelConfig::addition(ndigit), 3407).unwrap();

    let outcome = Trainer::new(config, &train)
        .with_test_dataset(&test)
        .train(params)
        .unwrap();

    assert!(outcome.last_loss < 0.2, "final train loss {}", outcome.last_loss);
    let report = exam(&outcome.params, &test, None).unwrap();
    assert!(report.accuracy() >= 0.99, "test accuracy {}", report.accuracy());
    assert_eq!(add(&outcome.params, ndigit, 47, 17), 64);
    assert_eq!(test.block_size(), 6);
}
