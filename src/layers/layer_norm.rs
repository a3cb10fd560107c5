//! Layer Normalization
//!
//! Normalizes each position's feature vector to zero mean and unit variance,
//! then applies a learnable scale (gamma) and shift (beta).
//!
//! ## Forward Pass
//!
//! ```text
//! 1. μ = mean(x)                     (last axis)
//! 2. σ² = mean((x - μ)²)             (population variance)
//! 3. x̂ = (x - μ) / √(σ² + ε)
//! 4. y = γ * x̂ + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! dγ = Σ(dy * x̂)      dβ = Σ(dy)      (summed over every leading dim)
//! dx̂ = dy * γ
//! dx = (1/D) * std⁻¹ * (D*dx̂ - Σdx̂ - x̂ * Σ(dx̂ * x̂))
//! ```
//!
//! The two sums account for every element's influence on the mean and on the
//! variance of its own row.

use super::{missing_cache, Module, Param};
use crate::tensor::Tensor;

/// Layer normalization over the last axis
pub struct LayerNorm {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub grad_gamma: Tensor,
    pub grad_beta: Tensor,
    pub eps: f64,
    cache: Option<LayerNormCache>,
}

/// Cache for layer norm backward pass
struct LayerNormCache {
    x_hat: Tensor,
    std_inv: Vec<f64>,
}

impl LayerNorm {
    /// Create a layer norm with γ = 1, β = 0 and ε = 1e-5
    pub fn new(d_model: usize) -> Self {
        Self::with_eps(d_model, 1e-5)
    }

    pub fn with_eps(d_model: usize, eps: f64) -> Self {
        Self {
            gamma: Tensor::full(vec![d_model], 1.0),
            beta: Tensor::zeros(vec![d_model]),
            grad_gamma: Tensor::zeros(vec![d_model]),
            grad_beta: Tensor::zeros(vec![d_model]),
            eps,
            cache: None,
        }
    }
}

impl Module for LayerNorm {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        let mean = x.mean(true);
        let variance = x.var(true);
        let std = variance.add_scalar(self.eps).sqrt();

        let x_hat = x.sub(&mean).div(&std);
        let y = x_hat.mul(&self.gamma).add(&self.beta);

        self.cache = Some(LayerNormCache {
            x_hat,
            std_inv: std.data.iter().map(|s| 1.0 / s).collect(),
        });
        y
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let Some(cache) = self.cache.as_ref() else {
            missing_cache("LayerNorm")
        };
        let d = self.gamma.len();

        self.grad_gamma = grad_output.mul(&cache.x_hat).sum_leading();
        self.grad_beta = grad_output.sum_leading();

        let dx_hat = grad_output.mul(&self.gamma);
        let mut dx = vec![0.0; dx_hat.len()];

        for (row, out) in dx.chunks_mut(d).enumerate() {
            let g = &dx_hat.data[row * d..(row + 1) * d];
            let xh = &cache.x_hat.data[row * d..(row + 1) * d];
            let sum_g: f64 = g.iter().sum();
            let sum_gx: f64 = g.iter().zip(xh).map(|(a, b)| a * b).sum();
            let scale = cache.std_inv[row] / d as f64;

            for j in 0..d {
                out[j] = scale * (d as f64 * g[j] - sum_g - xh[j] * sum_gx);
            }
        }

        Tensor::new(dx, grad_output.shape.clone())
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        vec![
            ("gamma".to_string(), &self.gamma),
            ("beta".to_string(), &self.beta),
        ]
    }

    fn gradients(&self) -> Vec<(String, &Tensor)> {
        vec![
            ("gamma".to_string(), &self.grad_gamma),
            ("beta".to_string(), &self.grad_beta),
        ]
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        vec![
            Param {
                name: "gamma".to_string(),
                value: &mut self.gamma,
                grad: &mut self.grad_gamma,
            },
            Param {
                name: "beta".to_string(),
                value: &mut self.beta,
                grad: &mut self.grad_beta,
            },
        ]
    }
}
