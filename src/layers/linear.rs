//! Linear Layer (Fully Connected)
//!
//! Performs an affine transformation over the last axis: `Y = X·W + b`.
//!
//! ## Forward Pass
//!
//! ```text
//! Input:  X [..., d_in]
//! Weight: W [d_in, d_out]
//! Bias:   b [d_out]          (optional)
//! Output: Y = X·W + b [..., d_out]
//! ```
//!
//! ## Backward Pass
//!
//! All leading (batch) dimensions are flattened into rows first:
//!
//! ```text
//! X2 = X.reshape(-1, d_in)      dY2 = dY.reshape(-1, d_out)
//! dW = X2ᵀ · dY2
//! db = Σ_rows dY2
//! dX = (dY2 · Wᵀ).reshape(X.shape)
//! ```
//!
//! ## Initialization
//!
//! Weights are drawn from `N(0, 1)` scaled by `√(2 / (d_in + d_out))`.
//! The bias starts at zero.

use super::{missing_cache, Module, Param};
use crate::tensor::Tensor;
use rand::Rng;

/// Fully connected layer
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub grad_weight: Tensor,
    pub grad_bias: Option<Tensor>,
    cache: Option<LinearCache>,
}

/// Cache for linear layer backward pass
struct LinearCache {
    x: Tensor,
}

impl Linear {
    /// Create a new linear layer
    ///
    /// # Arguments
    ///
    /// * `d_in` - Input dimension
    /// * `d_out` - Output dimension
    /// * `bias` - Whether to learn an additive bias
    /// * `rng` - Seeded generator used for the weight draw
    pub fn new<R: Rng + ?Sized>(d_in: usize, d_out: usize, bias: bool, rng: &mut R) -> Self {
        let scale = (2.0 / (d_in + d_out) as f64).sqrt();
        let weight = Tensor::randn(vec![d_in, d_out], scale, rng);
        Self {
            grad_weight: Tensor::zeros(vec![d_in, d_out]),
            weight,
            bias: bias.then(|| Tensor::zeros(vec![d_out])),
            grad_bias: bias.then(|| Tensor::zeros(vec![d_out])),
            cache: None,
        }
    }

    pub fn d_in(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn d_out(&self) -> usize {
        self.weight.shape[1]
    }
}

impl Module for Linear {
    /// Computes `X·W (+ b)` over the last axis and caches `X`
    fn forward(&mut self, x: &Tensor) -> Tensor {
        assert_eq!(
            x.last_dim(),
            self.d_in(),
            "Linear expects last dim {}, got shape {:?}",
            self.d_in(),
            x.shape
        );
        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.d_out();
        }

        let mut y = x.flatten_2d().matmul(&self.weight);
        if let Some(b) = &self.bias {
            y = y.add(b);
        }

        self.cache = Some(LinearCache { x: x.clone() });
        y.reshape(&out_shape)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let Some(cache) = self.cache.as_ref() else {
            missing_cache("Linear")
        };

        let x2 = cache.x.flatten_2d();
        let dy2 = grad_output.flatten_2d();

        // dW = X^T @ dY
        self.grad_weight = x2.transpose(0, 1).matmul(&dy2);

        // db = sum(dY) over every row
        if let Some(grad_bias) = self.grad_bias.as_mut() {
            *grad_bias = dy2.sum_leading();
        }

        // dX = dY @ W^T
        dy2.matmul(&self.weight.transpose(0, 1))
            .reshape(&cache.x.shape)
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        let mut params = vec![("W".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("b".to_string(), b));
        }
        params
    }

    fn gradients(&self) -> Vec<(String, &Tensor)> {
        let mut grads = vec![("W".to_string(), &self.grad_weight)];
        if let Some(b) = &self.grad_bias {
            grads.push(("b".to_string(), b));
        }
        grads
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        let mut params = vec![Param {
            name: "W".to_string(),
            value: &mut self.weight,
            grad: &mut self.grad_weight,
        }];
        if let (Some(b), Some(gb)) = (self.bias.as_mut(), self.grad_bias.as_mut()) {
            params.push(Param {
                name: "b".to_string(),
                value: b,
                grad: gb,
            });
        }
        params
    }
}
