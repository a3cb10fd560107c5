//! Backward Pass Coordinator
//!
//! Wires the model and the loss together so one training step reads as
//! forward, backward, update:
//!
//! ```text
//! ids ──► model.forward ──► logits ──► loss.forward ──► L
//!                                                       │
//! grads ◄── model.backward ◄── dL/dlogits ◄── loss.backward
//! ```
//!
//! [`train_step`] adds clipping and the optimizer update on top; both the
//! synchronous [`Trainer`](crate::train::Trainer) and the background
//! [`TrainingController`](crate::controller::TrainingController) use it.

use crate::gradients::clip_gradients;
use crate::loss::CrossEntropyLoss;
use crate::model::TransformerModel;
use crate::optimizer::Optimizer;
use crate::tensor::Tensor;

#[derive(Default)]
pub struct Backprop {
    loss_fn: CrossEntropyLoss,
}

impl Backprop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Model forward plus loss; returns `(loss, logits)`
    pub fn forward(
        &mut self,
        model: &mut TransformerModel,
        inputs: &Tensor,
        targets: &Tensor,
    ) -> (f64, Tensor) {
        let logits = model.forward(inputs);
        let loss = self.loss_fn.forward(&logits, targets);
        (loss, logits)
    }

    /// Loss gradient back through every module of the model
    pub fn backward(&mut self, model: &mut TransformerModel) {
        let grad = self.loss_fn.backward();
        model.backward(&grad);
    }

    pub fn zero_grad(&self, model: &mut TransformerModel) {
        model.zero_grad();
    }
}

/// One complete optimization step on a batch
///
/// forward → backward → clip (when `grad_clip > 0`) → set lr → step → zero
/// grad. Returns the batch loss.
pub fn train_step(
    backprop: &mut Backprop,
    model: &mut TransformerModel,
    optimizer: &mut dyn Optimizer,
    inputs: &Tensor,
    targets: &Tensor,
    lr: f64,
    grad_clip: f64,
) -> f64 {
    let (loss, _) = backprop.forward(model, inputs, targets);
    backprop.backward(model);

    if grad_clip > 0.0 {
        clip_gradients(model, grad_clip);
    }

    optimizer.set_learning_rate(lr);
    optimizer.step(model);
    optimizer.zero_grad(model);
    loss
}
