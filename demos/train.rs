//! Train a Small Transformer on a Text File
//!
//! Builds a tokenizer from the corpus, trains for a number of epochs with
//! the synchronous trainer, writes the loss curve to CSV and prints a sample.
//!
//! ## Usage
//!
//! ```bash
//! # Character-level model on any text file
//! cargo run --release --example train -- --data corpus.txt --epochs 50
//!
//! # Subword tokenizer, cosine schedule, nucleus sampling
//! cargo run --release --example train -- --data corpus.txt \
//!     --tokenizer gpt4 --lr-schedule cosine --sampling top_p
//!
//! # Keep the weights and vocabulary
//! cargo run --release --example train -- --data corpus.txt --save runs/tiny
//! ```
//!
//! Logging follows `RUST_LOG`; per-batch losses appear at `minillm=debug`.

use anyhow::{bail, Context, Result};
use clap::Parser;
use minillm::engine::encode_corpus;
use minillm::{
    create_tokenizer, save_model_weights, Adam, Config, CsvLossSink, DataLoader,
    GenerationRequest, Generator, LrSchedule, SamplingStrategy, TokenizerKind, Trainer,
    TransformerModel,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "train", about = "Train a decoder-only transformer on a text file")]
struct Args {
    /// Path to training text file (one example per line)
    #[arg(long)]
    data: PathBuf,

    /// Number of training epochs
    #[arg(long, default_value = "20")]
    epochs: usize,

    /// Base learning rate
    #[arg(long, default_value = "0.001")]
    lr: f64,

    /// Embedding dimension
    #[arg(long, default_value = "64")]
    d_model: usize,

    /// Number of transformer blocks
    #[arg(long, default_value = "2")]
    n_layers: usize,

    /// Number of attention heads
    #[arg(long, default_value = "4")]
    n_heads: usize,

    /// Context window length
    #[arg(long, default_value = "64")]
    seq_len: usize,

    /// Prompt for the sample printed after training
    #[arg(long, default_value = "")]
    prompt: String,

    /// Sampling temperature
    #[arg(long, default_value = "0.8")]
    temperature: f64,

    /// Maximum number of generated tokens
    #[arg(long, default_value = "200")]
    max_gen: usize,

    /// Tokenizer: character, gpt4 or claude
    #[arg(long, default_value = "character")]
    tokenizer: String,

    /// Sampling strategy: greedy, temperature, top_k or top_p
    #[arg(long, default_value = "temperature")]
    sampling: String,

    /// Learning-rate schedule: constant, cosine or cosine_restarts
    #[arg(long, default_value = "constant")]
    lr_schedule: String,

    /// Directory for weights, vocabulary and loss curve
    #[arg(long)]
    save: Option<PathBuf>,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("minillm=info".parse()?),
        )
        .init();

    let args = Args::parse();

    if let Some(msg) = minillm::config::validate_lr_schedule_name(&args.lr_schedule) {
        bail!(msg);
    }
    let tokenizer_type: TokenizerKind = args.tokenizer.parse()?;
    let sampling_strategy: SamplingStrategy = args.sampling.parse()?;

    let mut config = Config {
        d_model: args.d_model,
        n_heads: args.n_heads,
        n_layers: args.n_layers,
        d_ff: 4 * args.d_model,
        seq_len: args.seq_len,
        learning_rate: args.lr,
        max_epochs: args.epochs,
        lr_schedule: LrSchedule::parse(&args.lr_schedule),
        tokenizer_type,
        sampling_strategy,
        temperature: args.temperature,
        max_gen_len: args.max_gen,
        seed: args.seed,
        ..Config::default()
    };
    config.ensure_valid()?;

    // ========================================================================
    // 1. Corpus and tokenizer
    // ========================================================================
    let text = fs::read_to_string(&args.data)
        .with_context(|| format!("failed to read {}", args.data.display()))?;
    let tokenizer = create_tokenizer(config.tokenizer_type, &text)?;
    config.vocab_size = tokenizer.vocab_size();
    let tokens = encode_corpus(tokenizer.as_ref(), &text)?;
    if tokens.is_empty() {
        bail!("{} has no non-blank lines", args.data.display());
    }
    info!(
        path = %args.data.display(),
        tokenizer = %tokenizer.name(),
        vocab_size = config.vocab_size,
        tokens = tokens.len(),
        "corpus loaded"
    );

    // ========================================================================
    // 2. Model and training
    // ========================================================================
    let model = TransformerModel::new(&config);
    info!(parameters = model.count_parameters(), "model built");

    let optimizer = Box::new(Adam::from_config(&model, &config));
    let loader = DataLoader::new(tokens, config.seq_len, config.batch_size, config.seed);
    let mut trainer = Trainer::new(model, optimizer, loader, config.clone());

    if let Some(dir) = &args.save {
        fs::create_dir_all(dir)?;
        let sink = CsvLossSink::create(dir.join("loss.csv"))?;
        trainer = trainer.with_sink(Arc::new(sink));
    }

    let history = trainer.train(Some(args.epochs));
    if let (Some(first), Some(last)) = (history.first(), history.last()) {
        info!(first, last, perplexity = last.exp(), "training finished");
    }

    // ========================================================================
    // 3. Save
    // ========================================================================
    if let Some(dir) = &args.save {
        save_model_weights(&trainer.model, dir.join("model.ckpt"))?;
        tokenizer.snapshot().save(dir.join("vocab.json"))?;
        fs::write(dir.join("config.json"), trainer.config.to_json()?)?;
        info!(dir = %dir.display(), "run saved");
    }

    // ========================================================================
    // 4. Sample
    // ========================================================================
    let request = GenerationRequest::new(args.prompt.clone());
    let mut rng = StdRng::seed_from_u64(config.seed);
    let sample = Generator::new(&mut trainer.model, tokenizer.as_ref(), &mut rng)
        .generate(&request)?;

    println!("\n{}", "=".repeat(70));
    println!("{}", sample);
    println!("{}", "=".repeat(70));
    Ok(())
}
