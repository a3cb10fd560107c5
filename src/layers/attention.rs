//! Multi-Head Causal Self-Attention
//!
//! Attention lets every position gather information from itself and the
//! positions before it.
//!
//! ## Forward Pass
//!
//! ```text
//! Q, K, V = x·W_q, x·W_k, x·W_v                     [B, T, D]
//! split heads                                        [B, H, T, d_k]
//! scores  = mask(Q·Kᵀ / √d_k)                       [B, H, T, T]
//! attn    = softmax(scores)
//! out     = attn·V                                   [B, H, T, d_k]
//! concat heads, project:  y = out·W_o                [B, T, D]
//! ```
//!
//! ## Causal Masking
//!
//! A 0/1 table marks every *j > i*, precomputed once for `max_seq_len` and
//! cut to the active length on every call. Marked scores are filled with
//! `-∞`, so after the softmax position *i* puts exactly zero weight on every
//! *j > i*.
//!
//! ## Backward Pass
//!
//! The eight forward steps are replayed in reverse:
//!
//! ```text
//! 1. d_concat = W_o backward
//! 2. un-concat heads                       dOut [B, H, T, d_k]
//! 3. dAttn = dOut·Vᵀ,  dV = attnᵀ·dOut
//! 4. dScores = attn * (dAttn - Σ_row(dAttn * attn))     (softmax)
//! 5. dScores /= √d_k
//! 6. dQ = dScores·K,  dK = dScoresᵀ·Q
//! 7. merge heads back to [B, T, D]
//! 8. dx = W_q.backward(dQ) + W_k.backward(dK) + W_v.backward(dV)
//! ```
//!
//! Q, K and V are all projections of the same input, so their three input
//! gradients are summed.

use super::linear::Linear;
use super::{missing_cache, prefixed, prefixed_mut, Module, Param};
use crate::tensor::Tensor;
use rand::Rng;

/// Multi-head self-attention with a causal mask
pub struct MultiHeadAttention {
    pub w_q: Linear,
    pub w_k: Linear,
    pub w_v: Linear,
    pub w_o: Linear,
    pub n_heads: usize,
    pub d_k: usize,
    causal_mask: Tensor,
    cache: Option<AttentionCache>,
}

/// Cache for attention backward pass
struct AttentionCache {
    q: Tensor,
    k: Tensor,
    v: Tensor,
    attn_weights: Tensor,
}

impl MultiHeadAttention {
    /// Create a new attention layer
    ///
    /// # Arguments
    ///
    /// * `d_model` - Model width, must be divisible by `n_heads`
    /// * `n_heads` - Number of attention heads
    /// * `max_seq_len` - Longest sequence the causal mask must cover
    /// * `rng` - Seeded generator for the projection weights
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        n_heads: usize,
        max_seq_len: usize,
        rng: &mut R,
    ) -> Self {
        assert!(
            n_heads > 0 && d_model % n_heads == 0,
            "d_model ({}) must be divisible by n_heads ({})",
            d_model,
            n_heads
        );

        let mut mask = vec![0.0; max_seq_len * max_seq_len];
        for i in 0..max_seq_len {
            for j in i + 1..max_seq_len {
                mask[i * max_seq_len + j] = 1.0;
            }
        }

        Self {
            w_q: Linear::new(d_model, d_model, false, rng),
            w_k: Linear::new(d_model, d_model, false, rng),
            w_v: Linear::new(d_model, d_model, false, rng),
            w_o: Linear::new(d_model, d_model, false, rng),
            n_heads,
            d_k: d_model / n_heads,
            causal_mask: Tensor::new(mask, vec![max_seq_len, max_seq_len]),
            cache: None,
        }
    }

    /// Attention weights from the most recent forward pass
    ///
    /// Shape `[batch, n_heads, seq, seq]`, or `None` before the first call.
    pub fn attention_weights(&self) -> Option<&Tensor> {
        self.cache.as_ref().map(|c| &c.attn_weights)
    }

    /// Top-left `seq_len × seq_len` block of the precomputed mask
    fn mask_for(&self, seq_len: usize) -> Tensor {
        let max = self.causal_mask.shape[0];
        assert!(
            seq_len <= max,
            "Sequence length {} exceeds attention mask size {}",
            seq_len,
            max
        );
        let data = (0..seq_len)
            .flat_map(|i| self.causal_mask.data[i * max..i * max + seq_len].iter().copied())
            .collect();
        Tensor::new(data, vec![seq_len, seq_len])
    }

    /// `[B, T, D] -> [B, H, T, d_k]`
    fn split_heads(&self, x: &Tensor) -> Tensor {
        let (b, t) = (x.shape[0], x.shape[1]);
        x.reshape(&[b, t, self.n_heads, self.d_k]).transpose(1, 2)
    }

    /// `[B, H, T, d_k] -> [B, T, D]`
    fn merge_heads(&self, x: &Tensor) -> Tensor {
        let (b, t) = (x.shape[0], x.shape[2]);
        x.transpose(1, 2).reshape(&[b, t, self.n_heads * self.d_k])
    }
}

impl Module for MultiHeadAttention {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        assert_eq!(x.ndim(), 3, "Attention expects [batch, seq, dim]");
        let seq_len = x.shape[1];
        let scale = (self.d_k as f64).sqrt();

        let q_proj = self.w_q.forward(x);
        let k_proj = self.w_k.forward(x);
        let v_proj = self.w_v.forward(x);
        let q = self.split_heads(&q_proj);
        let k = self.split_heads(&k_proj);
        let v = self.split_heads(&v_proj);

        let scores = q
            .matmul(&k.transpose(-2, -1))
            .div_scalar(scale)
            .masked_fill(&self.mask_for(seq_len), f64::NEG_INFINITY);
        let attn_weights = scores.softmax();

        let concat = self.merge_heads(&attn_weights.matmul(&v));
        let y = self.w_o.forward(&concat);

        self.cache = Some(AttentionCache {
            q,
            k,
            v,
            attn_weights,
        });
        y
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let Some(cache) = self.cache.as_ref() else {
            missing_cache("MultiHeadAttention")
        };
        let scale = (self.d_k as f64).sqrt();
        let t = cache.attn_weights.last_dim();

        // 1-2. Output projection, then back to per-head layout
        let d_concat = self.w_o.backward(grad_output);
        let (b, seq) = (d_concat.shape[0], d_concat.shape[1]);
        let d_out = d_concat
            .reshape(&[b, seq, self.n_heads, self.d_k])
            .transpose(1, 2);

        // 3. out = attn @ V
        let d_attn = d_out.matmul(&cache.v.transpose(-2, -1));
        let d_v = cache.attn_weights.transpose(-2, -1).matmul(&d_out);

        // 4. Softmax backward, one row at a time
        let mut d_scores = vec![0.0; d_attn.len()];
        for (row, out) in d_scores.chunks_mut(t).enumerate() {
            let a = &cache.attn_weights.data[row * t..(row + 1) * t];
            let g = &d_attn.data[row * t..(row + 1) * t];
            let dot: f64 = a.iter().zip(g).map(|(x, y)| x * y).sum();
            for j in 0..t {
                out[j] = a[j] * (g[j] - dot);
            }
        }

        // 5. Scale
        let d_scores = Tensor::new(d_scores, d_attn.shape.clone()).div_scalar(scale);

        // 6. scores = Q @ K^T
        let d_q = d_scores.matmul(&cache.k);
        let d_k = d_scores.transpose(-2, -1).matmul(&cache.q);

        // 7-8. Merge heads and sum the three paths into the shared input
        let d_q = self.merge_heads(&d_q);
        let d_k = self.merge_heads(&d_k);
        let d_v = self.merge_heads(&d_v);

        let dx_q = self.w_q.backward(&d_q);
        let dx_k = self.w_k.backward(&d_k);
        let dx_v = self.w_v.backward(&d_v);
        dx_q.add(&dx_k).add(&dx_v)
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        prefixed("W_q", self.w_q.parameters())
            .chain(prefixed("W_k", self.w_k.parameters()))
            .chain(prefixed("W_v", self.w_v.parameters()))
            .chain(prefixed("W_o", self.w_o.parameters()))
            .collect()
    }

    fn gradients(&self) -> Vec<(String, &Tensor)> {
        prefixed("W_q", self.w_q.gradients())
            .chain(prefixed("W_k", self.w_k.gradients()))
            .chain(prefixed("W_v", self.w_v.gradients()))
            .chain(prefixed("W_o", self.w_o.gradients()))
            .collect()
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        prefixed_mut("W_q", self.w_q.params_mut())
            .chain(prefixed_mut("W_k", self.w_k.params_mut()))
            .chain(prefixed_mut("W_v", self.w_v.params_mut()))
            .chain(prefixed_mut("W_o", self.w_o.params_mut()))
            .collect()
    }
}
