//! Training Data Loading and the Synchronous Training Loop
//!
//! ## How Batches Are Drawn
//!
//! Every row of a batch is a window starting at a uniformly random position
//! in the token stream. The target is the same window shifted one position
//! right, teaching the model to predict the next token:
//!
//! ```text
//! Tokens:  [B, l, e, _, c, h, a, t, E, ...]
//! pos = 1, seq_len = 6
//!   Input:  [l, e, _, c, h, a]
//!   Target: [e, _, c, h, a, t]
//! ```
//!
//! Random windows give even coverage on small corpora, where a sequential
//! sweep would see the same few windows in the same order every epoch.
//! An "epoch" is therefore `num_batches` draws sized so that, on average,
//! each token is seen once.
//!
//! A corpus shorter than `seq_len + 1` tokens cannot fill a window; every row
//! then holds the whole corpus, zero-padded on the right.
//!
//! ## Training Loop
//!
//! ```text
//! for epoch in 0..epochs:
//!     for batch in 0..num_batches:
//!         lr = scheduler.step()
//!         forward → backward → clip → optimizer.step(lr) → zero_grad
//!     loss_history.push(mean batch loss)
//! ```

use crate::backprop::{train_step, Backprop};
use crate::config::Config;
use crate::model::TransformerModel;
use crate::optimizer::Optimizer;
use crate::progress::{ProgressEvent, ProgressSink};
use crate::scheduler::LrScheduler;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Random-window batch sampler over a tokenized corpus
pub struct DataLoader {
    tokens: Vec<usize>,
    seq_len: usize,
    batch_size: usize,
    rng: StdRng,
}

impl DataLoader {
    pub fn new(tokens: Vec<usize>, seq_len: usize, batch_size: usize, seed: u64) -> Self {
        Self {
            tokens,
            seq_len,
            batch_size,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draw `(inputs, targets)`, both `[batch_size, seq_len]`
    pub fn next_batch(&mut self) -> (Tensor, Tensor) {
        let (b, t) = (self.batch_size, self.seq_len);
        let n = self.tokens.len();

        if n < t + 1 {
            let usable = n.saturating_sub(1);
            let mut x = vec![0; t];
            let mut y = vec![0; t];
            x[..usable].copy_from_slice(&self.tokens[..usable]);
            if usable > 0 {
                y[..usable].copy_from_slice(&self.tokens[1..n]);
            }
            let xs = vec![x; b];
            let ys = vec![y; b];
            return (Tensor::from_ids(&xs), Tensor::from_ids(&ys));
        }

        let mut xs = Vec::with_capacity(b);
        let mut ys = Vec::with_capacity(b);
        for _ in 0..b {
            let pos = self.rng.random_range(0..n - t);
            xs.push(self.tokens[pos..pos + t].to_vec());
            ys.push(self.tokens[pos + 1..pos + t + 1].to_vec());
        }
        (Tensor::from_ids(&xs), Tensor::from_ids(&ys))
    }

    /// Start-of-epoch hook; random sampling keeps no position to rewind
    pub fn reset(&mut self) {}

    /// Batches per epoch: one pass over the corpus on average, at least 1
    pub fn num_batches(&self) -> usize {
        let total = self.tokens.len().saturating_sub(1);
        (total / (self.batch_size * self.seq_len)).max(1)
    }

    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }
}

/// Synchronous epoch loop for scripts and tests
///
/// The background [`TrainingController`](crate::controller::TrainingController)
/// runs the same step with pause/stop handling and progress events on top.
pub struct Trainer {
    pub model: TransformerModel,
    pub optimizer: Box<dyn Optimizer>,
    pub data_loader: DataLoader,
    pub config: Config,
    pub loss_history: Vec<f64>,
    backprop: Backprop,
    sinks: Vec<Arc<dyn ProgressSink>>,
}

impl Trainer {
    pub fn new(
        model: TransformerModel,
        optimizer: Box<dyn Optimizer>,
        data_loader: DataLoader,
        config: Config,
    ) -> Self {
        Self {
            model,
            optimizer,
            data_loader,
            config,
            loss_history: Vec::new(),
            backprop: Backprop::new(),
            sinks: Vec::new(),
        }
    }

    /// Report every finished epoch to `sink`, synchronously
    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Train for `num_epochs` (default `config.max_epochs`)
    ///
    /// Returns the full loss history, one mean loss per epoch.
    pub fn train(&mut self, num_epochs: Option<usize>) -> Vec<f64> {
        let num_epochs = num_epochs.unwrap_or(self.config.max_epochs);
        let steps_per_epoch = self.data_loader.num_batches();
        let mut scheduler = LrScheduler::new(
            self.config.lr_schedule,
            self.config.learning_rate,
            num_epochs * steps_per_epoch,
        );

        info!(
            epochs = num_epochs,
            steps_per_epoch,
            parameters = self.model.count_parameters(),
            "training started"
        );
        let start = Instant::now();
        let log_every = self.config.log_every.max(1);

        for epoch in 0..num_epochs {
            self.data_loader.reset();
            let mut epoch_loss = 0.0;

            for batch in 0..steps_per_epoch {
                let (x, y) = self.data_loader.next_batch();
                let lr = scheduler.step();
                let loss = train_step(
                    &mut self.backprop,
                    &mut self.model,
                    self.optimizer.as_mut(),
                    &x,
                    &y,
                    lr,
                    self.config.grad_clip,
                );
                if batch % log_every == 0 {
                    debug!(epoch = epoch + 1, batch, loss, lr, "batch");
                }
                epoch_loss += loss;
            }

            let avg_loss = epoch_loss / steps_per_epoch as f64;
            self.loss_history.push(avg_loss);

            for sink in &self.sinks {
                sink.send(ProgressEvent::EpochComplete {
                    model_id: "trainer".to_string(),
                    epoch: epoch + 1,
                    total_epochs: num_epochs,
                    loss: avg_loss,
                    loss_history: self.loss_history.clone(),
                    elapsed_seconds: start.elapsed().as_secs_f64(),
                    weight_snapshot: None,
                });
            }

            if (epoch + 1) % log_every == 0 || epoch == 0 {
                info!(
                    "Epoch {:4}/{} | Loss: {:.4} | {:.1}s",
                    epoch + 1,
                    num_epochs,
                    avg_loss,
                    start.elapsed().as_secs_f64()
                );
            }
        }

        self.loss_history.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::Adam;
    use crate::tokenizer::{CharTokenizer, Tokenizer};

    #[test]
    fn test_targets_are_inputs_shifted() {
        let tokens: Vec<usize> = (0..100).collect();
        let mut loader = DataLoader::new(tokens, 8, 4, 1);
        let (x, y) = loader.next_batch();
        assert_eq!(x.shape, vec![4, 8]);
        for (a, b) in x.data.iter().zip(&y.data) {
            assert_eq!(*a + 1.0, *b);
        }
    }

    #[test]
    fn test_windows_stay_in_bounds() {
        let tokens: Vec<usize> = (0..20).collect();
        let mut loader = DataLoader::new(tokens, 8, 3, 2);
        for _ in 0..50 {
            let (_, y) = loader.next_batch();
            assert!(y.data.iter().all(|&v| v < 20.0));
        }
    }

    #[test]
    fn test_short_corpus_is_padded() {
        let mut loader = DataLoader::new(vec![3, 4, 5], 6, 2, 0);
        let (x, y) = loader.next_batch();
        assert_eq!(x.data[..6], [3.0, 4.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(y.data[..6], [4.0, 5.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(x.data[..6], x.data[6..]);
        assert_eq!(loader.num_batches(), 1);
    }

    #[test]
    fn test_num_batches() {
        let loader = DataLoader::new(vec![0; 161], 8, 2, 0);
        assert_eq!(loader.num_batches(), 10);
        let loader = DataLoader::new(vec![0; 5], 8, 2, 0);
        assert_eq!(loader.num_batches(), 1);
    }

    #[test]
    fn test_end_to_end_loss_decreases() {
        let corpus = "abcabcabcabc".repeat(20);
        let tokenizer = CharTokenizer::new(&corpus);
        let mut tokens = vec![tokenizer.bos_id()];
        tokens.extend(tokenizer.encode(&corpus).expect("in-vocabulary corpus"));
        tokens.push(tokenizer.eos_id());

        let config = Config {
            vocab_size: tokenizer.vocab_size(),
            d_model: 16,
            n_heads: 2,
            n_layers: 1,
            seq_len: 8,
            batch_size: 2,
            ..Config::default()
        };
        let model = TransformerModel::new(&config);
        let optimizer = Box::new(Adam::from_config(&model, &config));
        let loader = DataLoader::new(tokens, config.seq_len, config.batch_size, config.seed);

        let mut trainer = Trainer::new(model, optimizer, loader, config);
        let history = trainer.train(Some(20));

        assert_eq!(history.len(), 20);
        assert!(history.iter().all(|l| l.is_finite() && *l > 0.0));

        // Falls over the first epochs, allowing sampling noise
        for pair in history[..6].windows(2) {
            assert!(pair[1] <= pair[0] + 0.05, "not decreasing: {:?}", history);
        }
        // Then settles well below the starting loss
        let tail = &history[15..];
        let tail_mean = tail.iter().sum::<f64>() / tail.len() as f64;
        assert!(tail_mean < 0.5 * history[0], "{:?}", history);
        for pair in tail.windows(2) {
            assert!((pair[1] - pair[0]).abs() < 0.15, "not settled: {:?}", history);
        }
    }

    #[test]
    fn test_trainer_reports_epochs_to_sink() {
        use crate::progress::ChannelSink;
        use std::sync::mpsc;

        let tokenizer = CharTokenizer::new("abab");
        let config = Config {
            vocab_size: tokenizer.vocab_size(),
            ..Config::tiny()
        };
        let model = TransformerModel::new(&config);
        let optimizer = Box::new(Adam::from_config(&model, &config));
        let loader = DataLoader::new(vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1], 4, 2, 0);
        let (tx, rx) = mpsc::channel();

        let mut trainer = Trainer::new(model, optimizer, loader, config)
            .with_sink(Arc::new(ChannelSink::new(tx)));
        trainer.train(Some(3));
        drop(trainer);

        let epochs: Vec<usize> = rx
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::EpochComplete { epoch, .. } => Some(epoch),
                _ => None,
            })
            .collect();
        assert_eq!(epochs, vec![1, 2, 3]);
    }
}
