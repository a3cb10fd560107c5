//! Autoregressive Text Generation
//!
//! ## Decoding Loop
//!
//! ```text
//! tokens = [BOS] + encode(prompt)
//! repeat up to max_tokens times:
//!     context = last seq_len tokens
//!     logits  = model.forward(context)[-1]
//!     if fewer than min_new_tokens generated: logits[EOS] = -1e9
//!     next = sample(logits)
//!     if next == EOS: stop
//!     tokens.push(next)
//! ```
//!
//! The context window slides, so generation can run past `seq_len` tokens
//! while the model only ever sees the most recent `seq_len`.
//!
//! A prompt that encodes to nothing (empty, or every subword unknown) would
//! leave only BOS as context; one random regular token is appended instead
//! so the first step has something to condition on.
//!
//! ## One-shot and Streaming
//!
//! [`Generator::generate`] returns the decoded prompt plus continuation.
//! [`Generator::stream`] yields each new token's text as it is sampled. Both
//! follow the same stopping rules.

use crate::config::{Config, SamplingStrategy};
use crate::error::Result;
use crate::model::TransformerModel;
use crate::sampling::{sample_token, SamplingParams};
use crate::tensor::Tensor;
use crate::tokenizer::Tokenizer;
use rand::rngs::StdRng;
use rand::Rng;

/// Logit assigned to EOS while it is suppressed
const EOS_MASK: f64 = -1e9;

/// The trailing `seq_len` tokens the model conditions on
pub fn context_window(tokens: &[usize], seq_len: usize) -> &[usize] {
    &tokens[tokens.len().saturating_sub(seq_len)..]
}

/// Forward the context window of `tokens`; logits of its last position
pub fn next_token_logits(model: &mut TransformerModel, tokens: &[usize]) -> Vec<f64> {
    let context = context_window(tokens, model.config.seq_len);
    let logits = model.forward(&Tensor::from_ids(&[context.to_vec()]));
    let vocab = logits.last_dim();
    logits.data[logits.len() - vocab..].to_vec()
}

/// What to generate; unset fields fall back to the run configuration
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub strategy: Option<SamplingStrategy>,
    pub temperature: Option<f64>,
    pub top_k: Option<usize>,
    pub top_p: Option<f64>,
    /// EOS is masked until this many tokens have been generated
    pub min_new_tokens: usize,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn resolve(&self, config: &Config) -> GenerationSettings {
        GenerationSettings {
            max_tokens: self.max_tokens.unwrap_or(config.max_gen_len),
            min_new_tokens: self.min_new_tokens,
            sampling: SamplingParams {
                strategy: self.strategy.unwrap_or(config.sampling_strategy),
                temperature: self.temperature.unwrap_or(config.temperature),
                top_k: self.top_k.unwrap_or(config.top_k),
                top_p: self.top_p.unwrap_or(config.top_p),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GenerationSettings {
    pub max_tokens: usize,
    pub min_new_tokens: usize,
    pub sampling: SamplingParams,
}

/// Progress of one decoding run
struct DecodeState {
    tokens: Vec<usize>,
    generated: usize,
    finished: bool,
    settings: GenerationSettings,
}

pub struct Generator<'a> {
    model: &'a mut TransformerModel,
    tokenizer: &'a dyn Tokenizer,
    rng: &'a mut StdRng,
}

impl<'a> Generator<'a> {
    pub fn new(
        model: &'a mut TransformerModel,
        tokenizer: &'a dyn Tokenizer,
        rng: &'a mut StdRng,
    ) -> Self {
        Self {
            model,
            tokenizer,
            rng,
        }
    }

    /// `[BOS] + encode(prompt)`, padded with one random token if the prompt
    /// contributed nothing
    pub fn prompt_tokens(&mut self, prompt: &str) -> Result<Vec<usize>> {
        let bos = self.tokenizer.bos_id();
        let mut tokens = vec![bos];
        tokens.extend(self.tokenizer.encode(prompt)?);
        if tokens.len() == 1 && bos > 0 {
            tokens.push(self.rng.random_range(0..bos));
        }
        Ok(tokens)
    }

    /// Logits of the position after `tokens`
    pub fn next_logits(&mut self, tokens: &[usize]) -> Vec<f64> {
        next_token_logits(self.model, tokens)
    }

    fn start(&mut self, request: &GenerationRequest) -> Result<DecodeState> {
        Ok(DecodeState {
            tokens: self.prompt_tokens(&request.prompt)?,
            generated: 0,
            finished: false,
            settings: request.resolve(&self.model.config),
        })
    }

    /// Sample one token; `None` once EOS is drawn or the budget is spent
    fn step(&mut self, state: &mut DecodeState) -> Option<usize> {
        if state.finished || state.generated >= state.settings.max_tokens {
            state.finished = true;
            return None;
        }

        let eos = self.tokenizer.eos_id();
        let mut logits = self.next_logits(&state.tokens);
        if state.generated < state.settings.min_new_tokens {
            logits[eos] = EOS_MASK;
        }

        let next = sample_token(&logits, &state.settings.sampling, &mut *self.rng);
        if next == eos {
            state.finished = true;
            return None;
        }
        state.tokens.push(next);
        state.generated += 1;
        Some(next)
    }

    /// Decoded prompt followed by the generated continuation
    pub fn generate(&mut self, request: &GenerationRequest) -> Result<String> {
        let mut state = self.start(request)?;
        while self.step(&mut state).is_some() {}
        Ok(self.tokenizer.decode(&state.tokens))
    }

    /// Iterator over the text of each newly generated token
    pub fn stream(mut self, request: &GenerationRequest) -> Result<TokenStream<'a>> {
        let state = self.start(request)?;
        Ok(TokenStream {
            generator: self,
            state,
        })
    }
}

/// Lazily generated tokens, one decoded string per item
pub struct TokenStream<'a> {
    generator: Generator<'a>,
    state: DecodeState,
}

impl Iterator for TokenStream<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let id = self.generator.step(&mut self.state)?;
        Some(self.generator.tokenizer.decode(&[id]))
    }
}
