//! Gradient Utilities
//!
//! Global gradient norm and norm-based clipping over every parameter of a
//! [`TransformerModel`].
//!
//! ## Why Gradient Clipping?
//!
//! An occasional batch produces a gradient far larger than its neighbours.
//! Applied unchanged it can throw the weights somewhere the loss never
//! recovers from:
//!
//! ```text
//! Step 1000: Loss = 3.2
//! Step 1001: Loss = 287.5  (gradient explosion)
//! Step 1002: Loss = NaN
//! ```
//!
//! ## Algorithm
//!
//! ```text
//! norm = √(Σ g²)                       over all gradients of all modules
//! if norm > max_norm:
//!     g *= max_norm / (norm + 1e-8)    for every gradient
//! ```
//!
//! Every gradient is scaled by the same factor, so the update direction is
//! preserved and only its length shrinks.

use crate::model::TransformerModel;
use rayon::prelude::*;
use tracing::warn;

/// Norms this many times above the ceiling are logged as they are clipped
const EXTREME_NORM_RATIO: f64 = 100.0;

/// L2 norm of all gradients in the model
pub fn compute_grad_norm(model: &TransformerModel) -> f64 {
    let sum_sq_parallel = |data: &[f64]| -> f64 { data.par_iter().map(|&v| v * v).sum() };

    model
        .modules()
        .iter()
        .flat_map(|m| m.gradients())
        .map(|(_, g)| sum_sq_parallel(&g.data))
        .sum::<f64>()
        .sqrt()
}

/// Rescale all gradients so their global norm is at most `max_norm`
///
/// A non-positive `max_norm` disables clipping. Returns the norm measured
/// before clipping.
pub fn clip_gradients(model: &mut TransformerModel, max_norm: f64) -> f64 {
    let norm = compute_grad_norm(model);
    if max_norm <= 0.0 || norm <= max_norm {
        return norm;
    }

    if norm > max_norm * EXTREME_NORM_RATIO || !norm.is_finite() {
        warn!(norm, max_norm, "clipping extreme gradient norm");
    }

    let scale = max_norm / (norm + 1e-8);
    for module in model.modules_mut() {
        for p in module.params_mut() {
            p.grad.data.par_iter_mut().for_each(|g| *g *= scale);
        }
    }
    norm
}
