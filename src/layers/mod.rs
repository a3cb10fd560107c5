//! Neural Network Layers
//!
//! Every building block of the transformer lives here. Each layer owns its
//! parameters, its gradients and the cache its backward pass needs.
//!
//! ## Layers
//!
//! - **linear**: Fully connected layer (`Y = X·W + b`)
//! - **embedding**: Token id → vector lookup with scatter-add backward
//! - **positional_encoding**: Constant sinusoidal table, no parameters
//! - **layer_norm**: Layer normalization
//! - **attention**: Multi-head causal self-attention
//! - **feedforward**: Two linear layers around a ReLU
//! - **block**: Pre-norm transformer block with residual connections
//!
//! ## Design Pattern
//!
//! All layers implement [`Module`]:
//!
//! ```rust,ignore
//! impl Module for Layer {
//!     fn forward(&mut self, x: &Tensor) -> Tensor { /* caches what backward needs */ }
//!     fn backward(&mut self, grad: &Tensor) -> Tensor { /* fills grads, returns dL/dx */ }
//!     fn parameters(&self) -> Vec<(String, &Tensor)> { }
//!     fn gradients(&self) -> Vec<(String, &Tensor)> { }
//!     fn params_mut(&mut self) -> Vec<Param<'_>> { }
//! }
//! ```
//!
//! Gradients are overwritten by each backward call, never accumulated across
//! calls. Composite layers expose their children's parameters under dotted
//! names (`W_q.W`, `linear1.b`), which keeps the optimizer and the checkpoint
//! format agnostic to nesting.

pub mod attention;
pub mod block;
pub mod embedding;
pub mod feedforward;
pub mod layer_norm;
pub mod linear;
pub mod positional_encoding;

use crate::tensor::Tensor;

pub use attention::MultiHeadAttention;
pub use block::TransformerBlock;
pub use embedding::Embedding;
pub use feedforward::FeedForward;
pub use layer_norm::LayerNorm;
pub use linear::Linear;
pub use positional_encoding::PositionalEncoding;

/// Mutable view of one parameter and its gradient
///
/// Handed to optimizers and checkpoint loading so they can update weights
/// in place without knowing the concrete layer type.
pub struct Param<'a> {
    pub name: String,
    pub value: &'a mut Tensor,
    pub grad: &'a mut Tensor,
}

/// Common contract for every trainable building block
pub trait Module: Send {
    /// Forward pass. Caches whatever the backward pass needs.
    fn forward(&mut self, x: &Tensor) -> Tensor;

    /// Backward pass. Stores parameter gradients and returns the gradient
    /// with respect to the forward input.
    ///
    /// # Panics
    ///
    /// Panics when called before `forward`.
    fn backward(&mut self, grad_output: &Tensor) -> Tensor;

    /// Named parameters, in a stable order
    fn parameters(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    /// Named gradients, same names and order as `parameters`
    fn gradients(&self) -> Vec<(String, &Tensor)> {
        Vec::new()
    }

    /// Parameters paired with their gradients for in-place updates
    fn params_mut(&mut self) -> Vec<Param<'_>> {
        Vec::new()
    }

    /// Reset every gradient buffer to zero
    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.grad.fill(0.0);
        }
    }

    /// Total number of trainable scalars
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|(_, p)| p.len()).sum()
    }
}

/// Prefix child parameter names with `prefix.`
pub(crate) fn prefixed<'a>(
    prefix: &str,
    items: Vec<(String, &'a Tensor)>,
) -> impl Iterator<Item = (String, &'a Tensor)> + 'a {
    let prefix = prefix.to_string();
    items
        .into_iter()
        .map(move |(name, t)| (format!("{}.{}", prefix, name), t))
}

/// Prefix child parameter views with `prefix.`
pub(crate) fn prefixed_mut<'a>(
    prefix: &str,
    items: Vec<Param<'a>>,
) -> impl Iterator<Item = Param<'a>> + 'a {
    let prefix = prefix.to_string();
    items.into_iter().map(move |mut p| {
        p.name = format!("{}.{}", prefix, p.name);
        p
    })
}

/// Abort with a uniform message when backward runs without a cached forward
pub(crate) fn missing_cache(layer: &str) -> ! {
    panic!("{}::backward called before forward", layer)
}
