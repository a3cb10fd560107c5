//! Transformer Block
//!
//! Attention and feedforward sublayers, each wrapped in pre-normalization and
//! a residual connection.
//!
//! ## Architecture
//!
//! ```text
//! x → LayerNorm → Attention → (+) → LayerNorm → FeedForward → (+) → output
//! │                            ↑   │                           ↑
//! └────────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! At each residual junction `d(x + f(x))/dx = 1 + f'(x)`: the gradient
//! flowing straight through the identity branch is added to the gradient
//! coming back through the sublayer. The feedforward junction is unwound
//! first, then the attention junction.

use super::attention::MultiHeadAttention;
use super::feedforward::FeedForward;
use super::layer_norm::LayerNorm;
use super::{prefixed, prefixed_mut, Module, Param};
use crate::tensor::Tensor;
use rand::Rng;

/// Pre-norm transformer block
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attention: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub ffn: FeedForward,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        n_heads: usize,
        d_ff: usize,
        max_seq_len: usize,
        rng: &mut R,
    ) -> Self {
        Self {
            ln1: LayerNorm::new(d_model),
            attention: MultiHeadAttention::new(d_model, n_heads, max_seq_len, rng),
            ln2: LayerNorm::new(d_model),
            ffn: FeedForward::new(d_model, d_ff, rng),
        }
    }

    /// Sub-modules in flat order: `[ln1, attention, ln2, ffn]`
    pub fn sub_modules(&self) -> Vec<&dyn Module> {
        vec![&self.ln1, &self.attention, &self.ln2, &self.ffn]
    }

    pub fn sub_modules_mut(&mut self) -> Vec<&mut dyn Module> {
        vec![
            &mut self.ln1,
            &mut self.attention,
            &mut self.ln2,
            &mut self.ffn,
        ]
    }
}

impl Module for TransformerBlock {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        let attn_out = self.attention.forward(&self.ln1.forward(x));
        let x = x.add(&attn_out);

        let ffn_out = self.ffn.forward(&self.ln2.forward(&x));
        x.add(&ffn_out)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        // Second residual: identity branch + feedforward branch
        let grad_ffn = self.ln2.backward(&self.ffn.backward(grad_output));
        let grad_mid = grad_output.add(&grad_ffn);

        // First residual: identity branch + attention branch
        let grad_attn = self.ln1.backward(&self.attention.backward(&grad_mid));
        grad_mid.add(&grad_attn)
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        prefixed("ln1", self.ln1.parameters())
            .chain(prefixed("attention", self.attention.parameters()))
            .chain(prefixed("ln2", self.ln2.parameters()))
            .chain(prefixed("ffn", self.ffn.parameters()))
            .collect()
    }

    fn gradients(&self) -> Vec<(String, &Tensor)> {
        prefixed("ln1", self.ln1.gradients())
            .chain(prefixed("attention", self.attention.gradients()))
            .chain(prefixed("ln2", self.ln2.gradients()))
            .chain(prefixed("ffn", self.ffn.gradients()))
            .collect()
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        prefixed_mut("ln1", self.ln1.params_mut())
            .chain(prefixed_mut("attention", self.attention.params_mut()))
            .chain(prefixed_mut("ln2", self.ln2.params_mut()))
            .chain(prefixed_mut("ffn", self.ffn.params_mut()))
            .collect()
    }
}
