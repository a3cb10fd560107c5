//! Cross-Entropy Loss fused with Softmax
//!
//! ## Forward
//!
//! ```text
//! log_softmax(z)_i = z_i - max(z) - ln Σ_j exp(z_j - max(z))
//! loss = -mean over (batch, seq) of log_softmax(z)[target]
//! ```
//!
//! Subtracting the row max before exponentiating keeps every `exp` ≤ 1, so
//! large logits cannot overflow.
//!
//! ## Backward
//!
//! Differentiating softmax and the log together collapses to
//!
//! ```text
//! dL/dz = (softmax(z) - one_hot(target)) / (batch * seq)
//! ```
//!
//! Each row of that gradient sums to zero over the vocabulary axis.

use crate::layers::missing_cache;
use crate::tensor::{softmax_row, Tensor};

#[derive(Default)]
pub struct CrossEntropyLoss {
    cache: Option<LossCache>,
}

struct LossCache {
    probs: Tensor,
    targets: Vec<usize>,
}

impl CrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mean negative log-likelihood of `targets` under `logits`
    ///
    /// `logits` is `[..., vocab]`; `targets` holds one id per leading position
    /// (as produced by [`Tensor::from_ids`]).
    pub fn forward(&mut self, logits: &Tensor, targets: &Tensor) -> f64 {
        let vocab = logits.last_dim();
        let n = logits.len() / vocab;
        assert_eq!(
            targets.len(),
            n,
            "Expected {} targets for logits of shape {:?}",
            n,
            logits.shape
        );

        let targets: Vec<usize> = targets.data.iter().map(|&t| t as usize).collect();
        let mut probs = vec![0.0; logits.len()];
        let mut total = 0.0;

        for (row, &target) in targets.iter().enumerate() {
            let z = &logits.data[row * vocab..(row + 1) * vocab];
            let max = z.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let log_sum = z.iter().map(|&v| (v - max).exp()).sum::<f64>().ln();
            total -= z[target] - max - log_sum;

            softmax_row(z, &mut probs[row * vocab..(row + 1) * vocab]);
        }

        self.cache = Some(LossCache {
            probs: Tensor::new(probs, logits.shape.clone()),
            targets,
        });
        total / n as f64
    }

    /// `dL/dlogits` for the most recent forward call
    pub fn backward(&self) -> Tensor {
        let Some(cache) = self.cache.as_ref() else {
            missing_cache("CrossEntropyLoss")
        };
        let vocab = cache.probs.last_dim();
        let n = cache.targets.len() as f64;

        let mut grad = cache.probs.clone();
        for (row, &target) in cache.targets.iter().enumerate() {
            grad.data[row * vocab + target] -= 1.0;
        }
        grad.div_scalar(n)
    }
}
