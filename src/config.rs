//! Run Configuration
//!
//! One [`Config`] value describes a whole run: model shape, optimization
//! hyperparameters, tokenizer family and generation defaults. It is plain
//! data, serializable with serde, and immutable for the duration of a run.
//!
//! ## String-named choices
//!
//! The tokenizer family, sampling strategy and learning-rate schedule are
//! closed enums that serialize as snake_case strings:
//!
//! | Field               | Values                                      |
//! |---------------------|---------------------------------------------|
//! | `tokenizer_type`    | `character`, `gpt4`, `claude`               |
//! | `sampling_strategy` | `greedy`, `temperature`, `top_k`, `top_p`   |
//! | `lr_schedule`       | `constant`, `cosine`, `cosine_restarts`     |
//!
//! Unknown tokenizer or sampling names are rejected. An unknown schedule name
//! silently falls back to `constant`; [`validate_lr_schedule_name`] exists so
//! callers can surface that case before it happens.
//!
//! ## vocab_size
//!
//! `vocab_size` is 0 until a tokenizer has been built from the corpus, which
//! writes the real size (regular tokens plus BOS/EOS) back into the config.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Tokenizer family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TokenizerKind {
    Character,
    /// Subword segmentation with the `cl100k_base` table
    Gpt4,
    /// Subword segmentation with the `o200k_base` table
    Claude,
}

impl TokenizerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenizerKind::Character => "character",
            TokenizerKind::Gpt4 => "gpt4",
            TokenizerKind::Claude => "claude",
        }
    }

    /// BPE table backing a subword tokenizer, `None` for character level
    pub fn encoding_name(&self) -> Option<&'static str> {
        match self {
            TokenizerKind::Character => None,
            TokenizerKind::Gpt4 => Some("cl100k_base"),
            TokenizerKind::Claude => Some("o200k_base"),
        }
    }
}

impl FromStr for TokenizerKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "character" => Ok(TokenizerKind::Character),
            "gpt4" => Ok(TokenizerKind::Gpt4),
            "claude" => Ok(TokenizerKind::Claude),
            other => Err(EngineError::UnknownTokenizer(other.to_string())),
        }
    }
}

/// Next-token selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SamplingStrategy {
    Greedy,
    Temperature,
    TopK,
    TopP,
}

impl SamplingStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SamplingStrategy::Greedy => "greedy",
            SamplingStrategy::Temperature => "temperature",
            SamplingStrategy::TopK => "top_k",
            SamplingStrategy::TopP => "top_p",
        }
    }
}

impl FromStr for SamplingStrategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "greedy" => Ok(SamplingStrategy::Greedy),
            "temperature" => Ok(SamplingStrategy::Temperature),
            "top_k" => Ok(SamplingStrategy::TopK),
            "top_p" => Ok(SamplingStrategy::TopP),
            other => Err(EngineError::UnknownSamplingStrategy(other.to_string())),
        }
    }
}

/// Learning-rate schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LrSchedule {
    #[default]
    Constant,
    Cosine,
    CosineRestarts,
}

impl LrSchedule {
    pub const NAMES: [&'static str; 3] = ["constant", "cosine", "cosine_restarts"];

    pub fn as_str(&self) -> &'static str {
        match self {
            LrSchedule::Constant => "constant",
            LrSchedule::Cosine => "cosine",
            LrSchedule::CosineRestarts => "cosine_restarts",
        }
    }

    /// Parse a schedule name; anything unrecognized is `Constant`
    pub fn parse(s: &str) -> Self {
        match s {
            "cosine" => LrSchedule::Cosine,
            "cosine_restarts" => LrSchedule::CosineRestarts,
            _ => LrSchedule::Constant,
        }
    }
}

macro_rules! string_conversions {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> String {
                value.as_str().to_string()
            }
        }
    };
}

string_conversions!(TokenizerKind);
string_conversions!(SamplingStrategy);
string_conversions!(LrSchedule);

impl TryFrom<String> for TokenizerKind {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl TryFrom<String> for SamplingStrategy {
    type Error = EngineError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<String> for LrSchedule {
    fn from(s: String) -> Self {
        LrSchedule::parse(&s)
    }
}

/// Report an unknown schedule name, which `LrSchedule::parse` would
/// otherwise quietly map to `constant`
pub fn validate_lr_schedule_name(name: &str) -> Option<String> {
    if LrSchedule::NAMES.contains(&name) {
        None
    } else {
        Some(format!(
            "lr_schedule must be one of {}, got '{}'",
            LrSchedule::NAMES.join(", "),
            name
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    // Model shape
    pub d_model: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub d_ff: usize,
    pub seq_len: usize,
    pub vocab_size: usize,

    // Training
    pub batch_size: usize,
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub grad_clip: f64,
    pub lr_schedule: LrSchedule,

    // Adam
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    pub weight_decay: f64,

    pub tokenizer_type: TokenizerKind,

    // Generation
    pub max_gen_len: usize,
    pub temperature: f64,
    pub sampling_strategy: SamplingStrategy,
    pub top_k: usize,
    pub top_p: f64,

    pub seed: u64,
    pub log_every: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            d_model: 64,
            n_heads: 4,
            n_layers: 2,
            d_ff: 256, // 4 * d_model
            seq_len: 64,
            vocab_size: 0, // filled in by the tokenizer

            batch_size: 16,
            learning_rate: 1e-3,
            max_epochs: 100,
            grad_clip: 1.0,
            lr_schedule: LrSchedule::Constant,

            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,

            tokenizer_type: TokenizerKind::Character,

            max_gen_len: 200,
            temperature: 0.8,
            sampling_strategy: SamplingStrategy::Temperature,
            top_k: 10,
            top_p: 0.9,

            seed: 42,
            log_every: 10,
        }
    }
}

impl Config {
    /// Small shape used by tests and quick experiments
    pub fn tiny() -> Self {
        Self {
            d_model: 16,
            n_heads: 2,
            n_layers: 1,
            d_ff: 32,
            seq_len: 8,
            batch_size: 2,
            ..Self::default()
        }
    }

    /// Every violated rule as a human-readable message; empty when valid
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.d_model == 0 {
            errors.push("d_model must be > 0".to_string());
        }
        if self.n_heads == 0 {
            errors.push("n_heads must be > 0".to_string());
        }
        if self.d_model > 0 && self.n_heads > 0 && self.d_model % self.n_heads != 0 {
            errors.push(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            ));
        }
        if self.n_layers < 1 {
            errors.push("n_layers must be >= 1".to_string());
        }
        if self.d_ff == 0 {
            errors.push("d_ff must be > 0".to_string());
        }
        if self.seq_len < 1 {
            errors.push("seq_len must be >= 1".to_string());
        }
        if self.batch_size < 1 {
            errors.push("batch_size must be >= 1".to_string());
        }
        if !(self.learning_rate > 0.0) {
            errors.push("learning_rate must be > 0".to_string());
        }
        if !(self.beta1 > 0.0 && self.beta1 < 1.0) {
            errors.push("beta1 must be in (0, 1)".to_string());
        }
        if !(self.beta2 > 0.0 && self.beta2 < 1.0) {
            errors.push("beta2 must be in (0, 1)".to_string());
        }
        if !(self.temperature > 0.0) {
            errors.push("temperature must be > 0".to_string());
        }
        if !(self.weight_decay >= 0.0) {
            errors.push("weight_decay must be >= 0".to_string());
        }

        errors
    }

    /// `validate` as a `Result`
    pub fn ensure_valid(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(errors))
        }
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
