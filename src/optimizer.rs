//! Optimizers
//!
//! Parameter update rules applied after each backward pass. Both optimizers
//! walk the model's flat module list, so they work for any depth without
//! knowing the concrete layers.
//!
//! ## Adam with decoupled weight decay
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! t = t + 1                         # incremented first: no 1/(1-β⁰) on step 1
//! θ = θ - α * λ * θ                 # decoupled weight decay (when λ > 0)
//! m = β₁ * m + (1 - β₁) * g         # first moment (momentum)
//! v = β₂ * v + (1 - β₂) * g²        # second moment (variance)
//! m_hat = m / (1 - β₁^t)            # bias correction
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! The decay shrinks the weights directly rather than being folded into g,
//! so it does not interact with the adaptive per-parameter step size. It is
//! applied to every parameter.
//!
//! ## SGD
//!
//! `θ = θ - α * g`. Kept as a baseline to compare Adam against.
//!
//! ## Moment state
//!
//! Adam's `m` and `v` are created once, zeroed, from the model's current
//! parameter shapes, and addressed by (module index, parameter index). A model
//! whose shape changes needs a new optimizer.

use crate::config::Config;
use crate::model::TransformerModel;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Tensors with more elements than this are updated in parallel
const PARALLEL_THRESHOLD: usize = 1000;

/// Common contract for parameter update rules
pub trait Optimizer: Send {
    /// Apply one update from the gradients currently stored in the model
    fn step(&mut self, model: &mut TransformerModel);

    fn learning_rate(&self) -> f64;

    /// Used by schedulers before every step
    fn set_learning_rate(&mut self, lr: f64);

    /// Reset every gradient buffer in the model
    fn zero_grad(&self, model: &mut TransformerModel) {
        model.zero_grad();
    }
}

/// Per-parameter Adam state
struct Moments {
    m: Tensor,
    v: Tensor,
}

pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,
    /// Global step counter used for bias correction
    pub t: u64,
    state: Vec<Vec<Moments>>,
}

impl Adam {
    pub fn new(
        model: &TransformerModel,
        lr: f64,
        beta1: f64,
        beta2: f64,
        epsilon: f64,
        weight_decay: f64,
    ) -> Self {
        let state = model
            .modules()
            .iter()
            .map(|module| {
                module
                    .parameters()
                    .iter()
                    .map(|(_, p)| Moments {
                        m: Tensor::zeros(p.shape.clone()),
                        v: Tensor::zeros(p.shape.clone()),
                    })
                    .collect()
            })
            .collect();

        Self {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
            t: 0,
            state,
        }
    }

    /// Hyperparameters taken from a run configuration
    pub fn from_config(model: &TransformerModel, config: &Config) -> Self {
        Self::new(
            model,
            config.learning_rate,
            config.beta1,
            config.beta2,
            config.epsilon,
            config.weight_decay,
        )
    }
}

/// Update one parameter tensor in place
///
/// `bc1`/`bc2` are the bias-correction denominators `1 - β^t`.
#[allow(clippy::too_many_arguments)]
fn adam_update(
    param: &mut [f64],
    grad: &[f64],
    m: &mut [f64],
    v: &mut [f64],
    lr: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    weight_decay: f64,
    bc1: f64,
    bc2: f64,
) {
    let update = |(((p, &g), m), v): (((&mut f64, &f64), &mut f64), &mut f64)| {
        if weight_decay > 0.0 {
            *p -= lr * weight_decay * *p;
        }
        *m = beta1 * *m + (1.0 - beta1) * g;
        *v = beta2 * *v + (1.0 - beta2) * g * g;
        let m_hat = *m / bc1;
        let v_hat = *v / bc2;
        *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
    };

    if param.len() > PARALLEL_THRESHOLD {
        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(m.par_iter_mut())
            .zip(v.par_iter_mut())
            .for_each(update);
    } else {
        param
            .iter_mut()
            .zip(grad.iter())
            .zip(m.iter_mut())
            .zip(v.iter_mut())
            .for_each(update);
    }
}

impl Optimizer for Adam {
    fn step(&mut self, model: &mut TransformerModel) {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for (module, moments) in model.modules_mut().into_iter().zip(self.state.iter_mut()) {
            for (p, state) in module.params_mut().into_iter().zip(moments.iter_mut()) {
                assert_eq!(
                    p.value.shape, state.m.shape,
                    "Optimizer state for {} does not match the model",
                    p.name
                );
                adam_update(
                    &mut p.value.data,
                    &p.grad.data,
                    &mut state.m.data,
                    &mut state.v.data,
                    self.lr,
                    self.beta1,
                    self.beta2,
                    self.epsilon,
                    self.weight_decay,
                    bc1,
                    bc2,
                );
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

/// Plain gradient descent
pub struct Sgd {
    pub lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Self { lr }
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, model: &mut TransformerModel) {
        let lr = self.lr;
        for module in model.modules_mut() {
            for p in module.params_mut() {
                for (w, &g) in p.value.data.iter_mut().zip(&p.grad.data) {
                    *w -= lr * g;
                }
            }
        }
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Module;
    use crate::loss::CrossEntropyLoss;

    fn model() -> TransformerModel {
        TransformerModel::new(&Config {
            vocab_size: 6,
            ..Config::tiny()
        })
    }

    fn batch() -> (Tensor, Tensor) {
        (
            Tensor::from_ids(&[vec![0, 1, 2, 3, 4, 5], vec![5, 4, 3, 2, 1, 0]]),
            Tensor::from_ids(&[vec![1, 2, 3, 4, 5, 0], vec![4, 3, 2, 1, 0, 5]]),
        )
    }

    /// Loss after each of `steps` updates on the same batch
    fn train_steps(opt: &mut dyn Optimizer, model: &mut TransformerModel, steps: usize) -> Vec<f64> {
        let (x, y) = batch();
        let mut loss_fn = CrossEntropyLoss::new();
        let mut history = Vec::new();
        for _ in 0..steps {
            let logits = model.forward(&x);
            history.push(loss_fn.forward(&logits, &y));
            model.backward(&loss_fn.backward());
            opt.step(model);
            opt.zero_grad(model);
        }
        history
    }

    #[test]
    fn test_adam_decreases_loss_on_fixed_batch() {
        let mut model = model();
        let mut adam = Adam::new(&model, 1e-2, 0.9, 0.999, 1e-8, 0.0);
        let history = train_steps(&mut adam, &mut model, 20);
        assert!(history[19] < history[0]);
        assert_eq!(adam.t, 20);
    }

    #[test]
    fn test_adam_beats_sgd_early() {
        let mut model_a = model();
        let mut model_s = model();
        let mut adam = Adam::new(&model_a, 1e-2, 0.9, 0.999, 1e-8, 0.0);
        let mut sgd = Sgd::new(1e-2);
        let adam_loss = train_steps(&mut adam, &mut model_a, 10);
        let sgd_loss = train_steps(&mut sgd, &mut model_s, 10);
        assert_eq!(adam_loss[0], sgd_loss[0]);
        assert!(adam_loss[9] < sgd_loss[9]);
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        // With bias correction, step 1 moves each weight by ~lr * sign(g)
        let mut model = model();
        let before = model.final_ln.beta.clone();
        for p in model.final_ln.params_mut() {
            p.grad.fill(0.3);
        }
        let mut adam = Adam::new(&model, 0.01, 0.9, 0.999, 1e-8, 0.0);
        adam.step(&mut model);
        for (a, b) in model.final_ln.beta.data.iter().zip(&before.data) {
            assert!((b - a - 0.01).abs() < 1e-6);
        }
    }

    #[test]
    fn test_weight_decay_shrinks_without_gradient() {
        let mut model = model();
        let before = model.output_head.weight.clone();
        let mut adam = Adam::new(&model, 0.1, 0.9, 0.999, 1e-8, 0.5);
        adam.step(&mut model);
        // Zero gradient: only the decay term acts, θ *= (1 - lr*λ)
        for (a, b) in model.output_head.weight.data.iter().zip(&before.data) {
            assert!((a - b * 0.95).abs() < 1e-12);
        }
    }

    #[test]
    fn test_sgd_update_rule() {
        let mut model = model();
        let before = model.final_ln.gamma.clone();
        model.final_ln.grad_gamma.fill(2.0);
        let mut sgd = Sgd::new(0.1);
        sgd.step(&mut model);
        for (a, b) in model.final_ln.gamma.data.iter().zip(&before.data) {
            assert!((a - (b - 0.2)).abs() < 1e-12);
        }
    }

    #[test]
    fn test_set_learning_rate() {
        let model = model();
        let mut adam = Adam::from_config(&model, &Config::default());
        assert_eq!(adam.learning_rate(), 1e-3);
        adam.set_learning_rate(5e-4);
        assert_eq!(adam.learning_rate(), 5e-4);
    }
}
