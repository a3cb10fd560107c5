//! Model Introspection
//!
//! Read-only views of a model for visualization: attention maps, a 2-D
//! projection of the embedding table, down-sampled weight tiles, per-module
//! parameter statistics and a token-by-token generation trace.
//!
//! ## Down-sampling
//!
//! Large matrices are reduced to at most `max_dim × max_dim` by taking every
//! `step`-th row and column, then cropping:
//!
//! ```text
//! rows = 256, max_dim = 64  →  row_step = 4  →  rows 0, 4, 8, ... 252
//! rows = 40,  max_dim = 64  →  row_step = 1  →  all 40 rows
//! ```
//!
//! Tensors with more than two dimensions are flattened to
//! `[len / last_dim, last_dim]` first.
//!
//! ## Embedding Projection
//!
//! PCA on the embedding rows. The two leading eigenvectors of the
//! `d_model × d_model` covariance are found by power iteration with
//! deflation, then every centered row is projected onto them.

use crate::error::Result;
use crate::generation::{context_window, next_token_logits, GenerationRequest};
use crate::loss::CrossEntropyLoss;
use crate::model::TransformerModel;
use crate::sampling::sample_token;
use crate::tensor::{softmax_vec, Tensor};
use crate::tokenizer::{Tokenizer, EOS_TOKEN};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Tile bound for on-demand weight matrices
pub const MATRIX_MAX_DIM: usize = 64;

/// Tile bound for the snapshots attached to progress events
pub const SNAPSHOT_MAX_DIM: usize = 32;

const TOP_ALTERNATIVES: usize = 5;
const POWER_ITERATIONS: usize = 1000;

#[derive(Debug, Clone, Serialize)]
pub struct HeadAttention {
    pub layer: usize,
    pub head: usize,
    /// `weights[i][j]`: how much query position i attends to key position j
    pub weights: Vec<Vec<f64>>,
    pub tokens: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingPoint {
    pub token: String,
    pub token_id: usize,
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WeightMatrix {
    pub module: String,
    pub param: String,
    /// Shape of the full parameter, before down-sampling
    pub shape: Vec<usize>,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<Vec<f64>>,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std: f64,
}

/// Compact tile carried by epoch progress events
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeightTile {
    pub module: String,
    pub param: String,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<Vec<f64>>,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ParameterStats {
    pub module_name: String,
    pub param_count: usize,
    pub weight_norm: f64,
    /// `None` when every gradient entry is zero
    pub gradient_norm: Option<f64>,
    pub mean: f64,
    pub std: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenProbability {
    pub token: String,
    pub prob: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedToken {
    pub token: String,
    pub token_id: usize,
    pub probability: f64,
    pub top_probs: Vec<TokenProbability>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_eos: bool,
}

/// Head-averaged attention from the newest position to its context
#[derive(Debug, Clone, Serialize)]
pub struct LayerFocus {
    pub layer: usize,
    pub attention_to_context: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationTrace {
    pub prompt: String,
    pub prompt_tokens: Vec<String>,
    pub generated_tokens: Vec<GeneratedToken>,
    /// One entry per generated token, aligned with `generated_tokens`
    pub attention_snapshots: Vec<Vec<LayerFocus>>,
    pub full_text: String,
}

/// Row-major view of a tensor as `[rows, cols]`
fn as_matrix(t: &Tensor) -> (usize, usize) {
    let cols = t.last_dim().max(1);
    (t.len() / cols, cols)
}

/// Every `step`-th row and column, cropped to `max_dim`
fn sample_grid(t: &Tensor, max_dim: usize) -> Vec<Vec<f64>> {
    let (rows, cols) = as_matrix(t);
    let row_step = (rows / max_dim).max(1);
    let col_step = (cols / max_dim).max(1);
    (0..rows)
        .step_by(row_step)
        .take(max_dim)
        .map(|r| {
            (0..cols)
                .step_by(col_step)
                .take(max_dim)
                .map(|c| t.data[r * cols + c])
                .collect()
        })
        .collect()
}

fn mean_std(values: impl Iterator<Item = f64> + Clone) -> (f64, f64) {
    let n = values.clone().count().max(1) as f64;
    let mean = values.clone().sum::<f64>() / n;
    let var = values.map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

fn min_max(grid: &[Vec<f64>]) -> (f64, f64) {
    grid.iter()
        .flatten()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

/// Per-layer, per-head attention over `text`
///
/// The text is encoded without BOS and truncated to `seq_len` tokens.
pub fn attention_maps(
    model: &mut TransformerModel,
    tokenizer: &dyn Tokenizer,
    text: &str,
) -> Result<Vec<HeadAttention>> {
    let mut tokens = tokenizer.encode(text)?;
    tokens.truncate(model.config.seq_len);
    if tokens.is_empty() {
        return Ok(Vec::new());
    }

    model.forward(&Tensor::from_ids(&[tokens.clone()]));
    let labels: Vec<String> = tokens.iter().map(|&t| tokenizer.decode(&[t])).collect();
    let t = tokens.len();

    let mut maps = Vec::new();
    for (layer, weights) in model.attention_weights().into_iter().enumerate() {
        let Some(w) = weights else { continue };
        for head in 0..w.shape[1] {
            let base = head * t * t;
            let rows = (0..t)
                .map(|i| w.data[base + i * t..base + (i + 1) * t].to_vec())
                .collect();
            maps.push(HeadAttention {
                layer,
                head,
                weights: rows,
                tokens: labels.clone(),
            });
        }
    }
    Ok(maps)
}

/// Mean next-token loss over `text`; 0.0 when it has fewer than 2 tokens
pub fn loss_on_text(
    model: &mut TransformerModel,
    tokenizer: &dyn Tokenizer,
    text: &str,
) -> Result<f64> {
    let tokens = tokenizer.encode(text)?;
    let seq = tokens.len().saturating_sub(1).min(model.config.seq_len);
    if seq < 1 {
        return Ok(0.0);
    }
    let inputs = Tensor::from_ids(&[tokens[..seq].to_vec()]);
    let targets = Tensor::from_ids(&[tokens[1..=seq].to_vec()]);
    let logits = model.forward(&inputs);
    Ok(CrossEntropyLoss::new().forward(&logits, &targets))
}

/// Symmetric `d × d` covariance of the rows of an `n × d` centered matrix
fn covariance(centered: &[f64], n: usize, d: usize) -> Vec<f64> {
    let denom = (n.saturating_sub(1)).max(1) as f64;
    let mut cov = vec![0.0; d * d];
    for row in centered.chunks(d) {
        for i in 0..d {
            for j in i..d {
                cov[i * d + j] += row[i] * row[j];
            }
        }
    }
    for i in 0..d {
        for j in i..d {
            let v = cov[i * d + j] / denom;
            cov[i * d + j] = v;
            cov[j * d + i] = v;
        }
    }
    cov
}

/// Dominant eigenpair of a symmetric positive semi-definite matrix
fn power_iteration<R: Rng>(matrix: &[f64], d: usize, rng: &mut R) -> (f64, Vec<f64>) {
    let mut v: Vec<f64> = (0..d).map(|_| rng.random::<f64>() - 0.5).collect();
    normalize(&mut v);

    for _ in 0..POWER_ITERATIONS {
        let mut w = mat_vec(matrix, &v, d);
        if normalize(&mut w) < 1e-300 {
            return (0.0, v);
        }
        let delta: f64 = w.iter().zip(&v).map(|(a, b)| (a - b).abs()).sum();
        v = w;
        if delta < 1e-12 {
            break;
        }
    }
    let mv = mat_vec(matrix, &v, d);
    let lambda = mv.iter().zip(&v).map(|(a, b)| a * b).sum();
    (lambda, v)
}

fn mat_vec(matrix: &[f64], v: &[f64], d: usize) -> Vec<f64> {
    matrix
        .chunks(d)
        .map(|row| row.iter().zip(v).map(|(a, b)| a * b).sum())
        .collect()
}

/// Scale to unit length; returns the original norm
fn normalize(v: &mut [f64]) -> f64 {
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm > 0.0 {
        v.iter_mut().for_each(|x| *x /= norm);
    }
    norm
}

/// Two leading principal axes of the rows of `centered`
fn principal_axes(centered: &[f64], n: usize, d: usize) -> [Vec<f64>; 2] {
    let mut cov = covariance(centered, n, d);
    let mut rng = StdRng::seed_from_u64(0);

    let (lambda, first) = power_iteration(&cov, d, &mut rng);
    for i in 0..d {
        for j in 0..d {
            cov[i * d + j] -= lambda * first[i] * first[j];
        }
    }
    let (_, second) = power_iteration(&cov, d, &mut rng);
    [first, second]
}

/// PCA projection of every embedding row to 2-D
pub fn embedding_projection(
    model: &TransformerModel,
    tokenizer: &dyn Tokenizer,
) -> Vec<EmbeddingPoint> {
    let table = &model.embedding.weight;
    let (n, d) = as_matrix(table);

    let mut means = vec![0.0; d];
    for row in table.data.chunks(d) {
        for (m, v) in means.iter_mut().zip(row) {
            *m += v / n as f64;
        }
    }
    let centered: Vec<f64> = table
        .data
        .chunks(d)
        .flat_map(|row| row.iter().zip(&means).map(|(v, m)| v - m).collect::<Vec<_>>())
        .collect();

    let [pc1, pc2] = principal_axes(&centered, n, d);
    let dot = |row: &[f64], axis: &[f64]| row.iter().zip(axis).map(|(a, b)| a * b).sum::<f64>();

    centered
        .chunks(d)
        .take(tokenizer.vocab_size())
        .enumerate()
        .map(|(id, row)| EmbeddingPoint {
            token: tokenizer.label(id),
            token_id: id,
            x: dot(row, &pc1),
            y: dot(row, &pc2),
        })
        .collect()
}

/// Every parameter with at least two dimensions, down-sampled
pub fn weight_matrices(model: &TransformerModel, max_dim: usize) -> Vec<WeightMatrix> {
    let mut matrices = Vec::new();
    for (module_name, module) in model.module_names().into_iter().zip(model.modules()) {
        for (param, value) in module.parameters() {
            if value.ndim() < 2 {
                continue;
            }
            let values = sample_grid(value, max_dim);
            let (min, max) = min_max(&values);
            let (mean, std) = mean_std(values.iter().flatten().copied());
            matrices.push(WeightMatrix {
                module: module_name.clone(),
                param,
                shape: value.shape.clone(),
                rows: values.len(),
                cols: values.first().map_or(0, Vec::len),
                values,
                min,
                max,
                mean,
                std,
            });
        }
    }
    matrices
}

/// Small tiles of the embedding, attention, feed-forward and output weights
pub fn weight_snapshot(model: &TransformerModel) -> Vec<WeightTile> {
    weight_matrices(model, SNAPSHOT_MAX_DIM)
        .into_iter()
        .filter(|m| {
            m.module == "embedding"
                || m.module == "output_head"
                || m.module.ends_with(".attention")
                || m.module.ends_with(".ffn")
        })
        .map(|m| WeightTile {
            module: m.module,
            param: m.param,
            rows: m.rows,
            cols: m.cols,
            values: m.values,
            min: m.min,
            max: m.max,
        })
        .collect()
}

/// Norms and moments of each named module's parameters
pub fn parameter_stats(model: &TransformerModel) -> Vec<ParameterStats> {
    let mut stats = Vec::new();
    for (module_name, module) in model.module_names().into_iter().zip(model.modules()) {
        let params = module.parameters();
        let param_count: usize = params.iter().map(|(_, p)| p.len()).sum();
        if param_count == 0 {
            continue;
        }

        let values = params.iter().flat_map(|(_, p)| p.data.iter().copied());
        let weight_norm = values.clone().map(|v| v * v).sum::<f64>().sqrt();
        let (mean, std) = mean_std(values);

        let grads = module.gradients();
        let has_grad = grads.iter().any(|(_, g)| g.data.iter().any(|&v| v != 0.0));
        let gradient_norm = has_grad
            .then(|| grads.iter().map(|(_, g)| g.sum_squares()).sum::<f64>().sqrt());

        stats.push(ParameterStats {
            module_name,
            param_count,
            weight_norm,
            gradient_norm,
            mean,
            std,
        });
    }
    stats
}

fn top_alternatives(probs: &[f64], tokenizer: &dyn Tokenizer) -> Vec<TokenProbability> {
    let mut order: Vec<usize> = (0..probs.len()).collect();
    order.sort_by(|&a, &b| probs[b].total_cmp(&probs[a]));
    order
        .into_iter()
        .take(TOP_ALTERNATIVES)
        .map(|id| TokenProbability {
            token: tokenizer.label(id),
            prob: probs[id],
        })
        .collect()
}

/// Head-averaged attention of the last query position, per layer
fn last_position_focus(model: &TransformerModel, context_len: usize) -> Vec<LayerFocus> {
    let mut focus = Vec::new();
    for (layer, weights) in model.attention_weights().into_iter().enumerate() {
        let Some(w) = weights else { continue };
        let (heads, t) = (w.shape[1], w.shape[2]);
        let mut row = vec![0.0; context_len.min(t)];
        for h in 0..heads {
            let start = (h * t + (t - 1)) * t;
            for (acc, v) in row.iter_mut().zip(&w.data[start..start + t]) {
                *acc += v / heads as f64;
            }
        }
        focus.push(LayerFocus {
            layer,
            attention_to_context: row,
        });
    }
    focus
}

/// Generate while recording probabilities and attention at every step
///
/// Sampling follows `request`; reported probabilities are
/// `softmax(logits / temperature)`. An EOS draw is recorded with
/// `is_eos` and ends the trace.
pub fn generation_trace(
    model: &mut TransformerModel,
    tokenizer: &dyn Tokenizer,
    request: &GenerationRequest,
    rng: &mut StdRng,
) -> Result<GenerationTrace> {
    let settings = request.resolve(&model.config);
    let prompt_ids = tokenizer.encode(&request.prompt)?;
    let mut tokens = vec![tokenizer.bos_id()];
    tokens.extend(&prompt_ids);

    let prompt_tokens = tokens.iter().map(|&t| tokenizer.label(t)).collect();
    let temperature = settings.sampling.temperature.max(1e-8);
    let mut generated_tokens = Vec::new();
    let mut attention_snapshots = Vec::new();

    for _ in 0..settings.max_tokens {
        let context_len = context_window(&tokens, model.config.seq_len).len();
        let logits = next_token_logits(model, &tokens);
        let focus = last_position_focus(model, context_len);

        let scaled: Vec<f64> = logits.iter().map(|v| v / temperature).collect();
        let probs = softmax_vec(&scaled);
        let next = sample_token(&logits, &settings.sampling, rng);
        let is_eos = next == tokenizer.eos_id();

        generated_tokens.push(GeneratedToken {
            token: if is_eos {
                EOS_TOKEN.to_string()
            } else {
                tokenizer.decode(&[next])
            },
            token_id: next,
            probability: probs[next],
            top_probs: top_alternatives(&probs, tokenizer),
            is_eos,
        });
        attention_snapshots.push(focus);

        if is_eos {
            break;
        }
        tokens.push(next);
    }

    Ok(GenerationTrace {
        prompt: request.prompt.clone(),
        prompt_tokens,
        generated_tokens,
        attention_snapshots,
        full_text: tokenizer.decode(&tokens),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, SamplingStrategy};
    use crate::tokenizer::CharTokenizer;

    fn setup() -> (TransformerModel, CharTokenizer) {
        let tokenizer = CharTokenizer::new("hello world");
        let model = TransformerModel::new(&Config {
            vocab_size: tokenizer.vocab_size(),
            ..Config::tiny()
        });
        (model, tokenizer)
    }

    #[test]
    fn test_attention_maps_per_head() {
        let (mut model, tok) = setup();
        let maps = attention_maps(&mut model, &tok, "hello").expect("maps");
        assert_eq!(maps.len(), 2); // 1 layer × 2 heads
        for map in &maps {
            assert_eq!(map.tokens, vec!["h", "e", "l", "l", "o"]);
            assert_eq!(map.weights.len(), 5);
            for (i, row) in map.weights.iter().enumerate() {
                assert!((row.iter().sum::<f64>() - 1.0).abs() < 1e-9);
                assert!(row[i + 1..].iter().all(|&w| w == 0.0));
            }
        }
    }

    #[test]
    fn test_attention_maps_truncate_to_seq_len() {
        let (mut model, tok) = setup();
        let maps = attention_maps(&mut model, &tok, "hello world hello").expect("maps");
        assert_eq!(maps[0].tokens.len(), 8);
        assert!(attention_maps(&mut model, &tok, "").expect("empty").is_empty());
    }

    #[test]
    fn test_loss_on_text() {
        let (mut model, tok) = setup();
        assert_eq!(loss_on_text(&mut model, &tok, "h").expect("loss"), 0.0);
        let loss = loss_on_text(&mut model, &tok, "hello world").expect("loss");
        assert!(loss.is_finite() && loss > 0.0);
    }

    #[test]
    fn test_pca_recovers_dominant_axes() {
        let (mut model, tok) = setup();
        let v = model.config.vocab_size;
        let d = model.config.d_model;
        model.embedding.weight.fill(0.0);
        // Variance along axis 0 dominates axis 1; all other axes constant
        let a = [3.0, -3.0, 1.0, -1.0];
        let b = [0.5, -0.5];
        for i in 0..v {
            let row = &mut model.embedding.weight.data[i * d..(i + 1) * d];
            row[0] = *a.get(i).unwrap_or(&0.0);
            row[1] = if i >= 4 { *b.get(i - 4).unwrap_or(&0.0) } else { 0.0 };
        }

        let points = embedding_projection(&model, &tok);
        assert_eq!(points.len(), v);
        for (i, p) in points.iter().enumerate() {
            let expected_x = *a.get(i).unwrap_or(&0.0);
            let expected_y = if i >= 4 { *b.get(i - 4).unwrap_or(&0.0) } else { 0.0 };
            assert!((p.x.abs() - expected_x.abs()).abs() < 1e-6, "x of {}", i);
            assert!((p.y.abs() - expected_y.abs()).abs() < 1e-6, "y of {}", i);
        }
        assert_eq!(points[v - 2].token, "<BOS>");
        assert_eq!(points[v - 1].token, "<EOS>");
    }

    #[test]
    fn test_sample_grid_strides_and_crops() {
        let t = Tensor::new((0..200 * 3).map(|v| v as f64).collect(), vec![200, 3]);
        let grid = sample_grid(&t, 64);
        // row_step = 3, 67 candidate rows cropped to 64
        assert_eq!(grid.len(), 64);
        assert_eq!(grid[1][0], 9.0);
        assert_eq!(grid[0].len(), 3);
    }

    #[test]
    fn test_weight_matrices_cover_2d_params() {
        let (model, _) = setup();
        let matrices = weight_matrices(&model, MATRIX_MAX_DIM);
        // embedding W, 4 attention projections, 2 feed-forward W, output head W
        assert_eq!(matrices.len(), 8);
        assert!(matrices.iter().all(|m| m.shape.len() == 2));
        let emb = &matrices[0];
        assert_eq!(emb.module, "embedding");
        assert_eq!((emb.rows, emb.cols), (model.config.vocab_size, 16));
        assert!(emb.min <= emb.mean && emb.mean <= emb.max);
    }

    #[test]
    fn test_weight_snapshot_filters_and_bounds() {
        let tok = CharTokenizer::new("abcdefghijklmnopqrstuvwxyz0123456789ABCDEFGH");
        let model = TransformerModel::new(&Config {
            vocab_size: tok.vocab_size(),
            d_model: 64,
            n_heads: 4,
            d_ff: 128,
            ..Config::tiny()
        });
        let tiles = weight_snapshot(&model);
        assert_eq!(tiles.len(), 8);
        assert!(tiles.iter().all(|t| t.rows <= 32 && t.cols <= 32));
        assert!(tiles.iter().all(|t| !t.module.contains("ln")));
    }

    #[test]
    fn test_parameter_stats_gradient_norm() {
        let (mut model, _) = setup();
        let stats = parameter_stats(&model);
        assert_eq!(stats.len(), 7);
        assert!(stats.iter().all(|s| s.gradient_norm.is_none()));
        assert_eq!(stats.iter().map(|s| s.param_count).sum::<usize>(), model.count_parameters());

        model.output_head.grad_weight.fill(0.5);
        let stats = parameter_stats(&model);
        let head = stats.iter().find(|s| s.module_name == "output_head").expect("head");
        let expected = (0.25 * model.output_head.grad_weight.len() as f64).sqrt();
        assert!((head.gradient_norm.expect("norm") - expected).abs() < 1e-9);
    }

    #[test]
    fn test_generation_trace_records_every_step() {
        let (mut model, tok) = setup();
        let mut rng = StdRng::seed_from_u64(0);
        let request = GenerationRequest {
            max_tokens: Some(5),
            strategy: Some(SamplingStrategy::Greedy),
            ..GenerationRequest::new("he")
        };
        let trace = generation_trace(&mut model, &tok, &request, &mut rng).expect("trace");

        assert_eq!(trace.prompt_tokens, vec!["<BOS>", "h", "e"]);
        assert!(!trace.generated_tokens.is_empty() && trace.generated_tokens.len() <= 5);
        assert_eq!(trace.generated_tokens.len(), trace.attention_snapshots.len());
        assert!(trace.full_text.starts_with("he"));

        let first = &trace.generated_tokens[0];
        assert_eq!(first.top_probs.len(), 5);
        assert!(first.top_probs[0].prob >= first.top_probs[4].prob);
        // Context of the first step is BOS + 2 prompt tokens
        let focus = &trace.attention_snapshots[0][0];
        assert_eq!(focus.attention_to_context.len(), 3);
        assert!((focus.attention_to_context.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }
}
