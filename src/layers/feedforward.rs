//! Position-wise FeedForward Network
//!
//! ## Architecture
//!
//! ```text
//! x → Linear1 (d_model → d_ff) → ReLU → Linear2 (d_ff → d_model) → y
//! ```
//!
//! ## Backward Pass
//!
//! The ReLU passes gradient only where its input was positive, so the cached
//! activation mask gates the upstream gradient before it reaches `Linear1`.

use super::linear::Linear;
use super::{missing_cache, prefixed, prefixed_mut, Module, Param};
use crate::tensor::Tensor;
use rand::Rng;

/// Two-layer MLP with a ReLU in between
pub struct FeedForward {
    pub linear1: Linear,
    pub linear2: Linear,
    relu_mask: Option<Vec<bool>>,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(d_model: usize, d_ff: usize, rng: &mut R) -> Self {
        Self {
            linear1: Linear::new(d_model, d_ff, true, rng),
            linear2: Linear::new(d_ff, d_model, true, rng),
            relu_mask: None,
        }
    }
}

impl Module for FeedForward {
    fn forward(&mut self, x: &Tensor) -> Tensor {
        let mut h = self.linear1.forward(x);
        let mask: Vec<bool> = h.data.iter().map(|&v| v > 0.0).collect();
        for (v, &keep) in h.data.iter_mut().zip(&mask) {
            if !keep {
                *v = 0.0;
            }
        }
        self.relu_mask = Some(mask);
        self.linear2.forward(&h)
    }

    fn backward(&mut self, grad_output: &Tensor) -> Tensor {
        let mut grad = self.linear2.backward(grad_output);
        let Some(mask) = self.relu_mask.as_ref() else {
            missing_cache("FeedForward")
        };
        for (g, &keep) in grad.data.iter_mut().zip(mask) {
            if !keep {
                *g = 0.0;
            }
        }
        self.linear1.backward(&grad)
    }

    fn parameters(&self) -> Vec<(String, &Tensor)> {
        prefixed("linear1", self.linear1.parameters())
            .chain(prefixed("linear2", self.linear2.parameters()))
            .collect()
    }

    fn gradients(&self) -> Vec<(String, &Tensor)> {
        prefixed("linear1", self.linear1.gradients())
            .chain(prefixed("linear2", self.linear2.gradients()))
            .collect()
    }

    fn params_mut(&mut self) -> Vec<Param<'_>> {
        prefixed_mut("linear1", self.linear1.params_mut())
            .chain(prefixed_mut("linear2", self.linear2.params_mut()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gradcheck::{check_input_gradient, check_param_gradient};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ffn() -> FeedForward {
        let mut rng = StdRng::seed_from_u64(42);
        FeedForward::new(6, 12, &mut rng)
    }

    fn input(seed: u64) -> Tensor {
        let mut rng = StdRng::seed_from_u64(seed);
        Tensor::randn(vec![2, 4, 6], 1.0, &mut rng)
    }

    #[test]
    fn test_output_shape() {
        let mut f = ffn();
        assert_eq!(f.forward(&input(1)).shape, vec![2, 4, 6]);
    }

    #[test]
    fn test_relu_no_negative_intermediate() {
        let mut f = ffn();
        let x = input(2);
        f.forward(&x);
        let pre = f.linear1.forward(&x);
        let mask = f.relu_mask.as_ref().expect("mask after forward");
        for (&m, &v) in mask.iter().zip(&pre.data) {
            assert_eq!(m, v > 0.0);
        }
        assert!(mask.iter().any(|&m| m) && mask.iter().any(|&m| !m));
    }

    #[test]
    fn test_parameter_count() {
        assert_eq!(ffn().num_parameters(), 6 * 12 + 12 + 12 * 6 + 6);
    }

    #[test]
    fn test_backward_shape() {
        let mut f = ffn();
        let x = input(3);
        let y = f.forward(&x);
        assert_eq!(f.backward(&Tensor::full(y.shape, 1.0)).shape, x.shape);
    }

    #[test]
    fn test_numerical_gradient_linear1_weight() {
        let err = check_param_gradient(&mut ffn(), &input(4), "linear1.W", 41);
        assert!(err < 1e-5, "relative error {}", err);
    }

    #[test]
    fn test_numerical_gradient_linear1_bias() {
        let err = check_param_gradient(&mut ffn(), &input(5), "linear1.b", 42);
        assert!(err < 1e-5, "relative error {}", err);
    }

    #[test]
    fn test_numerical_gradient_linear2_weight() {
        let err = check_param_gradient(&mut ffn(), &input(6), "linear2.W", 43);
        assert!(err < 1e-5, "relative error {}", err);
    }

    #[test]
    fn test_numerical_gradient_linear2_bias() {
        let err = check_param_gradient(&mut ffn(), &input(8), "linear2.b", 45);
        assert!(err < 1e-5, "relative error {}", err);
    }

    #[test]
    fn test_numerical_gradient_input() {
        let err = check_input_gradient(&mut ffn(), &input(7), 44);
        assert!(err < 1e-5, "relative error {}", err);
    }
}
