//! Transformer Language Model
//!
//! A decoder-only transformer: token ids in, next-token logits out.
//!
//! ## Architecture
//!
//! ```text
//! Token ids [batch, seq]
//!     ↓
//! Embedding            → [batch, seq, d_model]
//!     ↓
//! + PositionalEncoding (sinusoidal, constant)
//!     ↓
//! TransformerBlock × n_layers
//!     ↓
//! Final LayerNorm
//!     ↓
//! Output head (Linear, no bias) → [batch, seq, vocab_size]
//! ```
//!
//! ## Flat module list
//!
//! The optimizer, the checkpoint format and the introspection helpers all
//! address parameters by position in one flat list:
//!
//! ```text
//! 0            embedding
//! 1 + 4i       block i  ln1
//! 2 + 4i       block i  attention
//! 3 + 4i       block i  ln2
//! 4 + 4i       block i  ffn
//! 1 + 4N       final_ln
//! 2 + 4N       output_head
//! ```
//!
//! The positional encoding has no parameters and is not part of the list.

use crate::config::Config;
use crate::layers::{
    Embedding, LayerNorm, Linear, Module, PositionalEncoding, TransformerBlock,
};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

pub struct TransformerModel {
    pub embedding: Embedding,
    pub pos_encoding: PositionalEncoding,
    pub blocks: Vec<TransformerBlock>,
    pub final_ln: LayerNorm,
    pub output_head: Linear,
    pub config: Config,
}

impl TransformerModel {
    /// Build a freshly initialized model
    ///
    /// All weights are drawn from one generator seeded with `config.seed`, so
    /// two models built from the same config are identical.
    ///
    /// # Panics
    ///
    /// Panics if `vocab_size` is still 0 or `d_model % n_heads != 0`. Callers
    /// validate the config and build the tokenizer first.
    pub fn new(config: &Config) -> Self {
        assert!(config.vocab_size > 0, "vocab_size must be set before building the model");
        let mut rng = StdRng::seed_from_u64(config.seed);

        let embedding = Embedding::new(config.vocab_size, config.d_model, &mut rng);
        let pos_encoding = PositionalEncoding::new(config.seq_len, config.d_model);
        let blocks = (0..config.n_layers)
            .map(|_| {
                TransformerBlock::new(
                    config.d_model,
                    config.n_heads,
                    config.d_ff,
                    config.seq_len,
                    &mut rng,
                )
            })
            .collect();
        let final_ln = LayerNorm::new(config.d_model);
        let output_head = Linear::new(config.d_model, config.vocab_size, false, &mut rng);

        Self {
            embedding,
            pos_encoding,
            blocks,
            final_ln,
            output_head,
            config: config.clone(),
        }
    }

    /// Logits `[batch, seq, vocab]` for token ids `[batch, seq]`
    pub fn forward(&mut self, ids: &Tensor) -> Tensor {
        let x = self.embedding.forward(ids);
        let mut x = self.pos_encoding.forward(&x);
        for block in self.blocks.iter_mut() {
            x = block.forward(&x);
        }
        let x = self.final_ln.forward(&x);
        self.output_head.forward(&x)
    }

    /// Propagate `dL/dlogits` through every module, filling all gradients
    pub fn backward(&mut self, grad_logits: &Tensor) {
        let grad = self.output_head.backward(grad_logits);
        let mut grad = self.final_ln.backward(&grad);
        for block in self.blocks.iter_mut().rev() {
            grad = block.backward(&grad);
        }
        let grad = self.pos_encoding.backward(&grad);
        // Nothing precedes the embedding
        self.embedding.backward(&grad);
    }

    /// Every parameterized module in flat order
    pub fn modules(&self) -> Vec<&dyn Module> {
        let mut modules: Vec<&dyn Module> = vec![&self.embedding];
        for block in &self.blocks {
            modules.extend(block.sub_modules());
        }
        modules.push(&self.final_ln);
        modules.push(&self.output_head);
        modules
    }

    /// Mutable flat module list, same order as [`modules`](Self::modules)
    pub fn modules_mut(&mut self) -> Vec<&mut dyn Module> {
        let mut modules: Vec<&mut dyn Module> = vec![&mut self.embedding];
        for block in self.blocks.iter_mut() {
            modules.extend(block.sub_modules_mut());
        }
        modules.push(&mut self.final_ln);
        modules.push(&mut self.output_head);
        modules
    }

    /// Display names matching [`modules`](Self::modules)
    pub fn module_names(&self) -> Vec<String> {
        let mut names = vec!["embedding".to_string()];
        for i in 0..self.blocks.len() {
            for part in ["ln1", "attention", "ln2", "ffn"] {
                names.push(format!("block{}.{}", i, part));
            }
        }
        names.push("final_ln".to_string());
        names.push("output_head".to_string());
        names
    }

    pub fn count_parameters(&self) -> usize {
        self.modules().iter().map(|m| m.num_parameters()).sum()
    }

    pub fn zero_grad(&mut self) {
        for module in self.modules_mut() {
            module.zero_grad();
        }
    }

    /// Cached attention weights `[batch, heads, seq, seq]` of every layer
    pub fn attention_weights(&self) -> Vec<Option<&Tensor>> {
        self.blocks
            .iter()
            .map(|b| b.attention.attention_weights())
            .collect()
    }
}
