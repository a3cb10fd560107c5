//! Sampling Strategies
//!
//! Turn the logits of the last position into the next token id.
//!
//! | Strategy      | Rule                                                        |
//! |---------------|-------------------------------------------------------------|
//! | `greedy`      | `argmax(logits)`, deterministic                             |
//! | `temperature` | draw from `softmax(logits / T)`                             |
//! | `top_k`       | keep the k highest logits, then temperature sampling        |
//! | `top_p`       | keep the smallest prefix of sorted probabilities whose sum  |
//! |               | reaches p, renormalize, draw                                |
//!
//! Temperature below 1 sharpens the distribution (more conservative text);
//! above 1 flattens it (more varied text). T is floored at 1e-8.

use crate::config::{Config, SamplingStrategy};
use crate::error::Result;
use crate::tensor::softmax_vec;
use rand::Rng;
use rand_distr::weighted::WeightedIndex;
use rand_distr::Distribution;

const MIN_TEMPERATURE: f64 = 1e-8;

/// Strategy plus the knobs it reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub strategy: SamplingStrategy,
    pub temperature: f64,
    pub top_k: usize,
    pub top_p: f64,
}

impl SamplingParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            strategy: config.sampling_strategy,
            temperature: config.temperature,
            top_k: config.top_k,
            top_p: config.top_p,
        }
    }
}

pub fn greedy(logits: &[f64]) -> usize {
    logits
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        })
        .0
}

/// Categorical draw over `ids` with weights `probs`
///
/// Falls back to the most probable id when the weights are unusable.
fn draw<R: Rng + ?Sized>(ids: &[usize], probs: &[f64], rng: &mut R) -> usize {
    match WeightedIndex::new(probs) {
        Ok(dist) => ids[dist.sample(rng)],
        Err(_) => ids[greedy(probs)],
    }
}

fn scaled(logits: &[f64], temperature: f64) -> Vec<f64> {
    let t = temperature.max(MIN_TEMPERATURE);
    logits.iter().map(|&v| v / t).collect()
}

pub fn temperature_sample<R: Rng + ?Sized>(logits: &[f64], temperature: f64, rng: &mut R) -> usize {
    let probs = softmax_vec(&scaled(logits, temperature));
    let ids: Vec<usize> = (0..probs.len()).collect();
    draw(&ids, &probs, rng)
}

pub fn top_k_sample<R: Rng + ?Sized>(
    logits: &[f64],
    k: usize,
    temperature: f64,
    rng: &mut R,
) -> usize {
    let k = k.clamp(1, logits.len());
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]));
    order.truncate(k);

    let top: Vec<f64> = order.iter().map(|&i| logits[i]).collect();
    let probs = softmax_vec(&scaled(&top, temperature));
    draw(&order, &probs, rng)
}

pub fn top_p_sample<R: Rng + ?Sized>(logits: &[f64], p: f64, temperature: f64, rng: &mut R) -> usize {
    let probs = softmax_vec(&scaled(logits, temperature));
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));

    // First index where the running sum reaches p, inclusive
    let mut cumulative = 0.0;
    let mut cutoff = order.len();
    for (rank, &i) in order.iter().enumerate() {
        cumulative += probs[i];
        if cumulative >= p {
            cutoff = rank + 1;
            break;
        }
    }
    order.truncate(cutoff);

    let kept: Vec<f64> = order.iter().map(|&i| probs[i]).collect();
    let total: f64 = kept.iter().sum();
    let kept: Vec<f64> = kept.iter().map(|&q| q / total).collect();
    draw(&order, &kept, rng)
}

/// Dispatch on the strategy in `params`
pub fn sample_token<R: Rng + ?Sized>(logits: &[f64], params: &SamplingParams, rng: &mut R) -> usize {
    match params.strategy {
        SamplingStrategy::Greedy => greedy(logits),
        SamplingStrategy::Temperature => temperature_sample(logits, params.temperature, rng),
        SamplingStrategy::TopK => top_k_sample(logits, params.top_k, params.temperature, rng),
        SamplingStrategy::TopP => top_p_sample(logits, params.top_p, params.temperature, rng),
    }
}

/// Dispatch on a strategy name; an unknown name is an error
pub fn sample_token_by_name<R: Rng + ?Sized>(
    logits: &[f64],
    strategy: &str,
    temperature: f64,
    top_k: usize,
    top_p: f64,
    rng: &mut R,
) -> Result<usize> {
    let params = SamplingParams {
        strategy: strategy.parse()?,
        temperature,
        top_k,
        top_p,
    };
    Ok(sample_token(logits, &params, rng))
}
