//! Sinusoidal Positional Encoding
//!
//! Adds a fixed position signal so the model can tell token order apart.
//!
//! ```text
//! PE(pos, 2i)   = sin(pos / 10000^(2i/d_model))
//! PE(pos, 2i+1) = cos(pos / 10000^(2i/d_model))
//! ```
//!
//! The table is computed once for `max_seq_len` positions and sliced to the
//! active sequence length on every call. It has no parameters, so the
//! backward pass is the identity.

use super::Module;
use crate::tensor::Tensor;

/// Constant sinusoidal position table
pub struct PositionalEncoding {
    pub table: Tensor,
}

impl PositionalEncoding {
    pub fn new(max_seq_len: usize, d_model: usize) -> Self {
        let mut table = vec![0.0; max_seq_len * d_model];
        let log_base = 10000.0_f64.ln() / d_model as f64;

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                let angle = pos as f64 * (-(i as f64) * log_base).exp();
                table[pos * d_model + i] = angle.sin();
                if i + 1 < d_model {
                    table[pos * d_model + i + 1] = angle.cos();
                }
            }
        }

        Self {
            table: Tensor::new(table, vec![max_seq_len, d_model]),
        }
    }

    pub fn max_seq_len(&self) -> usize {
        self.table.shape[0]
    }
}

impl Module for PositionalEncoding {
    /// `x + PE[:seq_len]` for input `[batch, seq_len, d_model]`
    fn forward(&mut self, x: &Tensor) -> Tensor {
        assert_eq!(x.ndim(), 3, "PositionalEncoding expects [batch, seq, dim]");
        let seq_len = x.shape[1];
        assert!(
            seq_len <= self.max_seq_len(),
            "Sequence length {} exceeds positional table size {}",
            seq_len,
            self.max_seq_len()
        );
        x.add(&self.table.narrow_rows(seq_len))
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        grad_output.clone()
    }
}
