//! Token Embedding
//!
//! Maps integer token ids to learned vectors by row lookup.
//!
//! ## Forward Pass
//!
//! ```text
//! ids:    [batch, seq]            (token ids stored as f64)
//! W:      [vocab_size, d_model]
//! output: out[b, t, :] = W[ids[b, t], :]
//! ```
//!
//! ## Backward Pass
//!
//! The same id can appear many times in one batch, so the weight gradient is
//! a scatter-add: every occurrence contributes its upstream row to the same
//! row of `dW`.
//!
//! ```text
//! dW = 0
//! for each (b, t): dW[ids[b, t], :] += dY[b, t, :]
//! ```
//!
//! Nothing precedes the embedding, so the returned input gradient is zero.

use super::{missing_cache, Module, Param};
use crate::tensor::Tensor;
use rand::Rng;

/// Standard deviation of the initial embedding table
const INIT_STD: f64 = 0.02;

/// Learned token embedding table
pub struct Embedding {
    pub weight: Tensor,
    pub grad_weight: Tensor,
    cache: Option<EmbeddingCache>,
}

struct EmbeddingCache {
    ids: Vec<usize>,
    ids_shape: Vec<usize>,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, d_model: usize, rng: &mut R) -> Self {
        Self {
            weight: Tensor::randn(vec![vocab_size, d_model], INIT_STD, rng),
            grad_weight: Tensor::zeros(vec![vocab_size, d_model]),
            cache: None,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn d_model(&self) -> usize {
        self.weight.shape[1]
    }
}

impl Module for Embedding {
    fn forward(&mut self, ids: &Tensor) -> Tensor {
        let d = self.d_model();
        let vocab = self.vocab_size();
        let ids_vec: Vec<usize> = ids.data.iter().map(|&v| v as usize).collect();

        let mut out = Vec::with_capacity(ids_vec.len() * d);
        for &id in &ids_vec {
            assert!(id < vocab, "Token id {} out of range for vocab {}", id, vocab);
            out.extend_from_slice(&self.weight.data[id * d..(id + 1) * d]);
        }

        let mut shape = ids.shape.clone();
        shape.push(d);
        self.cache = Some(EmbeddingCache {
            ids: ids_vec,
            ids_shape: ids.shape.clone(),
        });
        Tensor::new(out, shape)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let Some(cache) = self.cache.as_ref() else {
            missing_cache("Embedding")
        };
        let d = self.d_model();

        // Scatter-add: repeated ids accumulate into the same row
        self.grad_weight.fill(0.0);
        for (pos, &id) in cache.ids.iter().enumerate() {
            let src = &grad_output.data[pos * d..(pos + 1) * d];
            let dst = &mut self.grad_weight.data[id * d..(id + 1) * d];
            for (g, &s) in dst.iter_mut().zip(src) {
                *g += s;
            }
        }

        Tensor::zeros(cache.ids_shape.clone())
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        vec![("W".to_string(), &self.weight)]
    }

    fn gradients(&self) -> Vec<(String, &Tensor)> {
        vec![("W".to_string(), &self.grad_weight)]
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        vec![Param {
            name: "W".to_string(),
            value: &mut self.weight,
            grad: &mut self.grad_weight,
        }]
    }
}
