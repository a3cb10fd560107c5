//! minillm: A Decoder-Only Transformer Engine
//!
//! A small transformer language model built from scratch in Rust, with
//! explicit forward and backward passes for every layer, trained and served
//! from the same process.
//!
//! # Modules
//!
//! - [`tensor`] - Row-major f64 tensors with broadcasting and batched matmul
//! - [`layers`] - Linear, embedding, positional encoding, layer norm,
//!   causal multi-head attention, feed-forward, transformer block
//! - [`model`] - The full model and its flat module list
//! - [`loss`], [`backprop`], [`gradients`] - Fused softmax cross-entropy,
//!   the forward/backward cycle and global-norm clipping
//! - [`optimizer`], [`scheduler`] - Adam with decoupled weight decay, SGD,
//!   constant/cosine/restart learning-rate schedules
//! - [`tokenizer`] - Character and subword tokenizers with vocabulary snapshots
//! - [`sampling`], [`generation`] - Four sampling strategies and the
//!   autoregressive decoding loop
//! - [`train`] - Random-window batching and a synchronous training loop
//! - [`checkpoint`] - Shape-tolerant weight archives
//! - [`engine`], [`controller`], [`registry`] - One model's service, its
//!   background training thread and a capped set of loaded models
//! - [`introspection`], [`progress`] - Visualization views and training events
//!
//! # Example
//!
//! ```rust,no_run
//! use minillm::{Config, EngineService, GenerationRequest};
//!
//! let corpus = std::fs::read_to_string("corpus.txt")?;
//! let mut engine = EngineService::new();
//! engine.initialize(Config::default(), &corpus)?;
//!
//! let text = engine.generate_text(&GenerationRequest::new("Once upon"))?;
//! println!("{}", text);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod backprop;
pub mod checkpoint;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod generation;
pub mod gradients;
pub mod introspection;
pub mod layers;
pub mod loss;
pub mod model;
pub mod optimizer;
pub mod progress;
pub mod registry;
pub mod sampling;
pub mod scheduler;
pub mod tensor;
pub mod tokenizer;
pub mod train;

#[cfg(test)]
mod gradcheck;

// Re-export main types for convenience
pub use checkpoint::{load_model_weights, save_model_weights, Checkpoint, LoadReport};
pub use config::{Config, LrSchedule, SamplingStrategy, TokenizerKind};
pub use controller::TrainingController;
pub use engine::EngineService;
pub use error::{EngineError, Result};
pub use generation::{GenerationRequest, Generator};
pub use layers::Module;
pub use model::TransformerModel;
pub use optimizer::{Adam, Optimizer, Sgd};
pub use progress::{CsvLossSink, ProgressEvent, ProgressSink, TrainingStatus};
pub use registry::ModelRegistry;
pub use scheduler::LrScheduler;
pub use tensor::Tensor;
pub use tokenizer::{create_tokenizer, Tokenizer, VocabSnapshot};
pub use train::{DataLoader, Trainer};
