//! Central-difference gradient checking for unit tests.
//!
//! The scalar objective is `L = Σ forward(x) ⊙ U` for a fixed random upstream
//! gradient `U`, so `backward(U)` must reproduce `∂L/∂θ`. Errors are reported
//! as `‖a − n‖ / (‖a‖ + ‖n‖)` over the whole tensor.

use crate::layers::Module;
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::SeedableRng;

const STEP: f64 = 1e-5;

fn objective<M: Module>(module: &mut M, x: &Tensor, upstream: &Tensor) -> f64 {
    let out = module.forward(x);
    out.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum()
}

fn relative_error(analytic: &[f64], numeric: &[f64]) -> f64 {
    let diff: f64 = analytic
        .iter()
        .zip(numeric)
        .map(|(a, n)| (a - n) * (a - n))
        .sum::<f64>()
        .sqrt();
    let scale = analytic.iter().map(|a| a * a).sum::<f64>().sqrt()
        + numeric.iter().map(|n| n * n).sum::<f64>().sqrt();
    if scale < 1e-12 {
        diff
    } else {
        diff / scale
    }
}

fn upstream_for<M: Module>(module: &mut M, x: &Tensor, seed: u64) -> Tensor {
    let shape = module.forward(x).shape;
    let mut rng = StdRng::seed_from_u64(seed);
    Tensor::randn(shape, 1.0, &mut rng)
}

fn nudge<M: Module>(module: &mut M, name: &str, index: usize, delta: f64) {
    let mut found = false;
    for p in module.params_mut() {
        if p.name == name {
            p.value.data[index] += delta;
            found = true;
        }
    }
    assert!(found, "no parameter named {}", name);
}

/// Relative error between the analytic and numerical gradient of `param`
pub(crate) fn check_param_gradient<M: Module>(
    module: &mut M,
    x: &Tensor,
    param: &str,
    seed: u64,
) -> f64 {
    let upstream = upstream_for(module, x, seed);
    module.forward(x);
    module.backward(&upstream);

    let analytic = module
        .gradients()
        .into_iter()
        .find(|(name, _)| name == param)
        .map(|(_, g)| g.data.clone())
        .unwrap_or_else(|| panic!("no gradient named {}", param));

    let mut numeric = vec![0.0; analytic.len()];
    for (i, slot) in numeric.iter_mut().enumerate() {
        nudge(module, param, i, STEP);
        let plus = objective(module, x, &upstream);
        nudge(module, param, i, -2.0 * STEP);
        let minus = objective(module, x, &upstream);
        nudge(module, param, i, STEP);
        *slot = (plus - minus) / (2.0 * STEP);
    }

    relative_error(&analytic, &numeric)
}

/// Relative error between the analytic and numerical gradient of the input
pub(crate) fn check_input_gradient<M: Module>(module: &mut M, x: &Tensor, seed: u64) -> f64 {
    let upstream = upstream_for(module, x, seed);
    module.forward(x);
    let analytic = module.backward(&upstream).data;

    let mut probe = x.clone();
    let mut numeric = vec![0.0; x.len()];
    for (i, slot) in numeric.iter_mut().enumerate() {
        probe.data[i] = x.data[i] + STEP;
        let plus = objective(module, &probe, &upstream);
        probe.data[i] = x.data[i] - STEP;
        let minus = objective(module, &probe, &upstream);
        probe.data[i] = x.data[i];
        *slot = (plus - minus) / (2.0 * STEP);
    }

    relative_error(&analytic, &numeric)
}
