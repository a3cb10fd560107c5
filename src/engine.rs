//! Engine Service
//!
//! One model together with everything needed to train it and query it:
//! tokenizer, optimizer state, batch sampler and a generation RNG.
//!
//! ```text
//!             initialize(config, corpus)        load_weights(path, vocab, config)
//!                        │                                   │
//!                        ▼                                   ▼
//!   ┌───────────────────────────── ready ─────────────────────────────┐
//!   │ generate_text · generate_streaming · attention_weights          │
//!   │ compute_loss_on_text · compute_perplexity · generation_weights  │
//!   │        (rejected with Conflict while training runs unpaused)    │
//!   │                                                                 │
//!   │ embedding_vectors_2d · weight_matrices · parameter_stats        │
//!   │        (always allowed, values may be one batch stale)          │
//!   └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The service itself is not synchronized. The
//! [`TrainingController`](crate::controller::TrainingController) keeps it
//! behind a mutex and holds the lock for one batch at a time, so callers
//! going through the same mutex never observe a half-applied update.

use crate::backprop::{train_step, Backprop};
use crate::checkpoint::{Checkpoint, LoadReport};
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::generation::{GenerationRequest, Generator, TokenStream};
use crate::introspection::{
    self, EmbeddingPoint, GenerationTrace, HeadAttention, ParameterStats, WeightMatrix,
    WeightTile, MATRIX_MAX_DIM,
};
use crate::model::TransformerModel;
use crate::optimizer::Adam;
use crate::tokenizer::{self, Tokenizer, VocabSnapshot};
use crate::train::DataLoader;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use tracing::info;

/// Token stream of a newline-separated corpus
///
/// Every non-blank line is stripped, encoded on its own and wrapped as
/// `[BOS] + tokens + [EOS]`; lines that encode to nothing are dropped.
pub fn encode_corpus(tokenizer: &dyn Tokenizer, corpus: &str) -> Result<Vec<usize>> {
    let mut stream = Vec::new();
    for line in corpus.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let ids = tokenizer.encode(line)?;
        if ids.is_empty() {
            continue;
        }
        stream.push(tokenizer.bos_id());
        stream.extend(ids);
        stream.push(tokenizer.eos_id());
    }
    Ok(stream)
}

pub struct EngineService {
    config: Config,
    tokenizer: Option<Box<dyn Tokenizer>>,
    model: Option<TransformerModel>,
    optimizer: Option<Adam>,
    data_loader: Option<DataLoader>,
    backprop: Backprop,
    rng: StdRng,
    training: bool,
    paused: bool,
}

impl Default for EngineService {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineService {
    pub fn new() -> Self {
        let config = Config::default();
        Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            tokenizer: None,
            model: None,
            optimizer: None,
            data_loader: None,
            backprop: Backprop::new(),
            training: false,
            paused: false,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.model.is_some() && self.tokenizer.is_some()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn model(&self) -> Option<&TransformerModel> {
        self.model.as_ref()
    }

    pub fn tokenizer(&self) -> Option<&dyn Tokenizer> {
        self.tokenizer.as_deref()
    }

    pub fn count_parameters(&self) -> usize {
        self.model.as_ref().map_or(0, TransformerModel::count_parameters)
    }

    fn ensure_not_training(&self) -> Result<()> {
        if self.training {
            return Err(EngineError::Conflict("training is running".to_string()));
        }
        Ok(())
    }

    /// Inference is allowed when idle or paused
    fn ensure_inference_allowed(&self) -> Result<()> {
        if self.training && !self.paused {
            return Err(EngineError::Conflict(
                "model is training; pause it before running inference".to_string(),
            ));
        }
        Ok(())
    }

    fn parts(&self) -> Result<(&TransformerModel, &dyn Tokenizer)> {
        match (self.model.as_ref(), self.tokenizer.as_deref()) {
            (Some(m), Some(t)) => Ok((m, t)),
            _ => Err(EngineError::NotReady),
        }
    }

    /// Build tokenizer, model, optimizer and batch sampler from scratch
    pub fn initialize(&mut self, mut config: Config, corpus: &str) -> Result<()> {
        self.ensure_not_training()?;
        config.ensure_valid()?;

        let tokenizer = tokenizer::create_tokenizer(config.tokenizer_type, corpus)?;
        config.vocab_size = tokenizer.vocab_size();
        let tokens = encode_corpus(tokenizer.as_ref(), corpus)?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyCorpus);
        }

        let model = TransformerModel::new(&config);
        info!(
            tokenizer = %tokenizer.name(),
            vocab_size = config.vocab_size,
            corpus_tokens = tokens.len(),
            parameters = model.count_parameters(),
            "engine initialized"
        );

        self.optimizer = Some(Adam::from_config(&model, &config));
        self.data_loader = Some(DataLoader::new(
            tokens,
            config.seq_len,
            config.batch_size,
            config.seed,
        ));
        self.rng = StdRng::seed_from_u64(config.seed);
        self.model = Some(model);
        self.tokenizer = Some(tokenizer);
        self.config = config;
        Ok(())
    }

    /// Swap the training corpus, keeping weights and vocabulary
    pub fn update_corpus(&mut self, corpus: &str, max_epochs: Option<usize>) -> Result<()> {
        self.ensure_not_training()?;
        let (_, tokenizer) = self.parts()?;
        let tokens = encode_corpus(tokenizer, corpus)?;
        if tokens.is_empty() {
            return Err(EngineError::EmptyCorpus);
        }
        if let Some(epochs) = max_epochs {
            self.config.max_epochs = epochs;
        }
        info!(corpus_tokens = tokens.len(), "corpus updated");
        self.data_loader = Some(DataLoader::new(
            tokens,
            self.config.seq_len,
            self.config.batch_size,
            self.config.seed,
        ));
        Ok(())
    }

    /// Write the weights to `path`; returns the vocabulary to keep with them
    pub fn save_weights<P: AsRef<Path>>(&self, path: P) -> Result<VocabSnapshot> {
        let (model, tokenizer) = self.parts()?;
        Checkpoint::from_model(model).save(path)?;
        Ok(tokenizer.snapshot())
    }

    /// Rebuild tokenizer and model from a saved vocabulary and weights
    ///
    /// The optimizer restarts from zero moments. No corpus is loaded; call
    /// [`update_corpus`](Self::update_corpus) before training again.
    pub fn load_weights<P: AsRef<Path>>(
        &mut self,
        path: P,
        snapshot: &VocabSnapshot,
        mut config: Config,
    ) -> Result<LoadReport> {
        self.ensure_not_training()?;
        let tokenizer = tokenizer::from_snapshot(snapshot)?;
        config.vocab_size = tokenizer.vocab_size();

        let checkpoint = Checkpoint::load(path)?;
        let mut model = TransformerModel::new(&config);
        let report = checkpoint.restore_into(&mut model);

        self.optimizer = Some(Adam::from_config(&model, &config));
        self.data_loader = None;
        self.rng = StdRng::seed_from_u64(config.seed);
        self.model = Some(model);
        self.tokenizer = Some(tokenizer);
        self.config = config;
        Ok(report)
    }

    fn generator(&mut self) -> Result<Generator<'_>> {
        self.ensure_inference_allowed()?;
        match (self.model.as_mut(), self.tokenizer.as_deref()) {
            (Some(model), Some(tokenizer)) => Ok(Generator::new(model, tokenizer, &mut self.rng)),
            _ => Err(EngineError::NotReady),
        }
    }

    pub fn generate_text(&mut self, request: &GenerationRequest) -> Result<String> {
        self.generator()?.generate(request)
    }

    pub fn generate_streaming(&mut self, request: &GenerationRequest) -> Result<TokenStream<'_>> {
        self.generator()?.stream(request)
    }

    /// Attention of every layer and head over `text`
    pub fn attention_weights(&mut self, text: &str) -> Result<Vec<HeadAttention>> {
        self.ensure_inference_allowed()?;
        match (self.model.as_mut(), self.tokenizer.as_deref()) {
            (Some(model), Some(tokenizer)) => introspection::attention_maps(model, tokenizer, text),
            _ => Err(EngineError::NotReady),
        }
    }

    pub fn compute_loss_on_text(&mut self, text: &str) -> Result<f64> {
        self.ensure_inference_allowed()?;
        match (self.model.as_mut(), self.tokenizer.as_deref()) {
            (Some(model), Some(tokenizer)) => introspection::loss_on_text(model, tokenizer, text),
            _ => Err(EngineError::NotReady),
        }
    }

    pub fn compute_perplexity(&mut self, text: &str) -> Result<f64> {
        Ok(self.compute_loss_on_text(text)?.exp())
    }

    pub fn generation_weights(&mut self, request: &GenerationRequest) -> Result<GenerationTrace> {
        self.ensure_inference_allowed()?;
        match (self.model.as_mut(), self.tokenizer.as_deref()) {
            (Some(model), Some(tokenizer)) => {
                introspection::generation_trace(model, tokenizer, request, &mut self.rng)
            }
            _ => Err(EngineError::NotReady),
        }
    }

    pub fn embedding_vectors_2d(&self) -> Result<Vec<EmbeddingPoint>> {
        let (model, tokenizer) = self.parts()?;
        Ok(introspection::embedding_projection(model, tokenizer))
    }

    pub fn weight_matrices(&self) -> Result<Vec<WeightMatrix>> {
        let (model, _) = self.parts()?;
        Ok(introspection::weight_matrices(model, MATRIX_MAX_DIM))
    }

    pub fn parameter_stats(&self) -> Result<Vec<ParameterStats>> {
        let (model, _) = self.parts()?;
        Ok(introspection::parameter_stats(model))
    }

    pub(crate) fn weight_snapshot(&self) -> Vec<WeightTile> {
        self.model
            .as_ref()
            .map(introspection::weight_snapshot)
            .unwrap_or_default()
    }

    pub(crate) fn set_training(&mut self, training: bool) {
        self.training = training;
        if !training {
            self.paused = false;
        }
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    /// Drop the batch sampler so the next `train_batch` fails
    #[cfg(test)]
    pub(crate) fn clear_corpus(&mut self) {
        self.data_loader = None;
    }

    /// Batches per epoch of the loaded corpus
    pub(crate) fn num_batches(&self) -> Result<usize> {
        self.data_loader
            .as_ref()
            .map(DataLoader::num_batches)
            .ok_or(EngineError::EmptyCorpus)
    }

    /// Draw one batch and apply one optimization step at `lr`
    pub(crate) fn train_batch(&mut self, lr: f64) -> Result<f64> {
        let (Some(model), Some(optimizer), Some(loader)) = (
            self.model.as_mut(),
            self.optimizer.as_mut(),
            self.data_loader.as_mut(),
        ) else {
            return Err(EngineError::NotReady);
        };
        let (x, y) = loader.next_batch();
        Ok(train_step(
            &mut self.backprop,
            model,
            optimizer,
            &x,
            &y,
            lr,
            self.config.grad_clip,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SamplingStrategy, TokenizerKind};

    const CORPUS: &str = "hello world\n\n  the cat sat  \nhello cat\n";

    fn ready_engine() -> EngineService {
        let mut engine = EngineService::new();
        engine.initialize(Config::tiny(), CORPUS).expect("initialize");
        engine
    }

    fn greedy(prompt: &str, max_tokens: usize) -> GenerationRequest {
        GenerationRequest {
            max_tokens: Some(max_tokens),
            strategy: Some(SamplingStrategy::Greedy),
            ..GenerationRequest::new(prompt)
        }
    }

    #[test]
    fn test_encode_corpus_wraps_lines() {
        let tok = tokenizer::create_tokenizer(TokenizerKind::Character, "ab").expect("tok");
        let stream = encode_corpus(tok.as_ref(), "ab\n\n   \n b ").expect("stream");
        let (bos, eos) = (tok.bos_id(), tok.eos_id());
        assert_eq!(stream, vec![bos, 0, 1, eos, bos, 1, eos]);
    }

    #[test]
    fn test_not_ready_before_initialize() {
        let mut engine = EngineService::new();
        assert!(!engine.is_ready());
        assert!(matches!(
            engine.generate_text(&GenerationRequest::new("hi")),
            Err(EngineError::NotReady)
        ));
        assert!(matches!(engine.parameter_stats(), Err(EngineError::NotReady)));
    }

    #[test]
    fn test_initialize_sets_vocab_size() {
        let engine = ready_engine();
        assert!(engine.is_ready());
        let vocab = engine.tokenizer().expect("tokenizer").vocab_size();
        assert_eq!(engine.config().vocab_size, vocab);
        assert_eq!(engine.model().expect("model").config.vocab_size, vocab);
    }

    #[test]
    fn test_initialize_rejects_invalid_config() {
        let mut engine = EngineService::new();
        let config = Config {
            d_model: 15,
            ..Config::tiny()
        };
        assert!(matches!(
            engine.initialize(config, CORPUS),
            Err(EngineError::InvalidConfig(_))
        ));
        assert!(matches!(
            engine.initialize(Config::tiny(), "  \n \n"),
            Err(EngineError::EmptyCorpus)
        ));
    }

    #[test]
    fn test_generate_and_stream() {
        let mut engine = ready_engine();
        let text = engine.generate_text(&greedy("hel", 6)).expect("generate");
        assert!(text.starts_with("hel"));

        let pieces: Vec<String> = engine
            .generate_streaming(&greedy("hel", 6))
            .expect("stream")
            .collect();
        assert!(pieces.len() <= 6);
    }

    #[test]
    fn test_inference_conflicts_while_training() {
        let mut engine = ready_engine();
        engine.set_training(true);
        assert!(matches!(
            engine.generate_text(&greedy("hel", 3)),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(engine.compute_loss_on_text("hello"), Err(EngineError::Conflict(_))));
        assert!(matches!(engine.initialize(Config::tiny(), CORPUS), Err(EngineError::Conflict(_))));
        // Best-effort readers still answer
        assert!(engine.parameter_stats().is_ok());

        engine.set_paused(true);
        assert!(engine.generate_text(&greedy("hel", 3)).is_ok());

        engine.set_training(false);
        assert!(!engine.is_paused());
    }

    #[test]
    fn test_perplexity_is_exp_loss() {
        let mut engine = ready_engine();
        let loss = engine.compute_loss_on_text("hello cat").expect("loss");
        let ppl = engine.compute_perplexity("hello cat").expect("ppl");
        assert!((ppl - loss.exp()).abs() < 1e-9);
        assert_eq!(engine.compute_loss_on_text("h").expect("short"), 0.0);
    }

    #[test]
    fn test_training_steps_reduce_loss() {
        let mut engine = ready_engine();
        let before = engine.compute_loss_on_text("hello world").expect("loss");
        for _ in 0..60 {
            engine.train_batch(1e-2).expect("step");
        }
        let after = engine.compute_loss_on_text("hello world").expect("loss");
        assert!(after < before, "{} !< {}", after, before);
    }

    #[test]
    fn test_update_corpus_keeps_weights() {
        let mut engine = ready_engine();
        let before = engine.model().expect("model").embedding.weight.clone();
        engine.update_corpus("the world", Some(7)).expect("update");
        assert_eq!(engine.config().max_epochs, 7);
        assert_eq!(engine.model().expect("model").embedding.weight, before);
        assert!(matches!(
            engine.update_corpus("zebra", None),
            Err(EngineError::UnknownCharacter('z'))
        ));
    }

    #[test]
    fn test_save_and_load_weights() {
        let mut engine = ready_engine();
        for _ in 0..3 {
            engine.train_batch(1e-2).expect("step");
        }
        let path = std::env::temp_dir().join(format!("minillm_engine_{}.bin", std::process::id()));
        let snapshot = engine.save_weights(&path).expect("save");

        let mut restored = EngineService::new();
        let report = restored
            .load_weights(&path, &snapshot, Config::tiny())
            .expect("load");
        std::fs::remove_file(&path).ok();

        assert!(report.skipped.is_empty());
        assert_eq!(restored.config().vocab_size, engine.config().vocab_size);
        assert_eq!(
            restored.model().expect("model").output_head.weight,
            engine.model().expect("model").output_head.weight
        );
        // No corpus after a load
        assert!(matches!(restored.num_batches(), Err(EngineError::EmptyCorpus)));

        let a = engine.generate_text(&greedy("the", 5)).expect("a");
        let b = restored.generate_text(&greedy("the", 5)).expect("b");
        assert_eq!(a, b);
    }

    #[test]
    fn test_introspection_views() {
        let mut engine = ready_engine();
        assert_eq!(
            engine.embedding_vectors_2d().expect("pca").len(),
            engine.config().vocab_size
        );
        assert!(!engine.weight_matrices().expect("matrices").is_empty());
        assert!(!engine.attention_weights("hello").expect("attention").is_empty());
        let trace = engine.generation_weights(&greedy("cat", 4)).expect("trace");
        assert_eq!(trace.prompt, "cat");
        assert!(!engine.weight_snapshot().is_empty());
    }
}
