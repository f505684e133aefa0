//! Training Logger
//!
//! Writes one CSV row per logged training step and per epoch summary, and
//! echoes each row through the `log` facade.
//!
//! ## CSV Format
//!
//! - `epoch`: epoch index (0-based)
//! - `step`: optimizer steps taken so far
//! - `tokens`: supervised tokens processed so far
//! - `elapsed_seconds`: time since the logger was created
//! - `learning_rate`: rate used for the most recent step
//! - `train_loss`: training loss of the most recent batch
//! - `test_loss`: held-out loss, empty on per-step rows
//! - `grad_norm`: global gradient norm before clipping
//! - `train_perplexity`: exp(train_loss)
//!
//! ## Example
//!
//! ```rust,no_run
//! use picogpt::training_logger::{LogRecord, TrainingLogger};
//!
//! let mut logger = TrainingLogger::new("training_log.csv")?;
//! logger.log(&LogRecord {
//!     epoch: 0,
//!     step: 100,
//!     tokens: 30_000,
//!     learning_rate: 3e-4,
//!     train_loss: 1.2,
//!     test_loss: None,
//!     grad_norm: 0.8,
//! })?;
//! # Ok::<(), std::io::Error>(())
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

/// One row of training metrics
#[derive(Clone, Debug, PartialEq)]
pub struct LogRecord {
    pub epoch: usize,
    pub step: u64,
    pub tokens: u64,
    pub learning_rate: f32,
    pub train_loss: f32,
    pub test_loss: Option<f32>,
    pub grad_norm: f32,
}

/// CSV logger for training metrics
pub struct TrainingLogger {
    log_file: BufWriter<File>,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create the CSV file and write its header
    pub fn new<P: AsRef<Path>>(log_path: P) -> std::io::Result<Self> {
        let mut log_file = BufWriter::new(File::create(log_path)?);
        writeln!(
            log_file,
            "epoch,step,tokens,elapsed_seconds,learning_rate,train_loss,test_loss,grad_norm,train_perplexity"
        )?;
        log_file.flush()?;

        let now = Instant::now();
        Ok(Self {
            log_file,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Append a row and flush it to disk
    pub fn log(&mut self, record: &LogRecord) -> std::io::Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let test_loss = record
            .test_loss
            .map(|l| format!("{:.5}", l))
            .unwrap_or_default();

        writeln!(
            self.log_file,
            "{},{},{},{:.2},{:.6e},{:.5},{},{:.4},{:.3}",
            record.epoch,
            record.step,
            record.tokens,
            elapsed,
            record.learning_rate,
            record.train_loss,
            test_loss,
            record.grad_norm,
            record.train_loss.exp()
        )?;
        // flushed per row so a crashed run keeps its history
        self.log_file.flush()?;

        let since_last = self.last_log_time.elapsed().as_secs_f32();
        log::debug!(
            "logged step {} at {:.1}s (+{:.1}s)",
            record.step,
            elapsed,
            since_last
        );
        self.last_log_time = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let path = std::env::temp_dir().join(format!("picogpt_log_{}.csv", std::process::id()));
        {
            let mut logger = TrainingLogger::new(&path).unwrap();
            let mut record = LogRecord {
                epoch: 1,
                step: 7,
                tokens: 42,
                learning_rate: 1e-3,
                train_loss: 0.5,
                test_loss: None,
                grad_norm: 0.25,
            };
            logger.log(&record).unwrap();
            record.test_loss = Some(0.75);
            logger.log(&record).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("epoch,step,tokens"));
        let row: Vec<&str> = lines[1].split(',').collect();
        assert_eq!(&row[..3], &["1", "7", "42"]);
        assert_eq!(row[6], "");
        assert_eq!(lines[2].split(',').nth(6), Some("0.75000"));
        std::fs::remove_file(&path).unwrap();
    }
}
