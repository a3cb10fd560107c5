//! Subword tokenizer over an external BPE table
//!
//! Segmentation comes from tiktoken's `cl100k_base` or `o200k_base` tables,
//! but their ~100k-200k global ids are thrown away. Instead the training
//! corpus is segmented once, its distinct subword strings are sorted, and
//! they get local ids `0..k`. The model's vocabulary therefore scales with
//! the corpus, not with the BPE table.
//!
//! ```text
//! corpus ──BPE──► ["Hello", ",", " world", ...] ──sort+dedup──► local vocab
//! text   ──BPE──► subwords ──lookup──► local ids   (misses are skipped)
//! ```
//!
//! A subword missing from the local vocabulary is dropped at encode time
//! rather than reported.

use super::{SnapshotKind, Tokenizer, VocabSnapshot};
use crate::error::{EngineError, Result};
use std::collections::{BTreeSet, HashMap};
use tiktoken_rs::CoreBPE;

pub const SUPPORTED_ENCODINGS: [&str; 2] = ["cl100k_base", "o200k_base"];

/// Encoding assumed for snapshots that do not name one
pub const DEFAULT_ENCODING: &str = "cl100k_base";

pub struct SubwordTokenizer {
    encoding_name: String,
    bpe: CoreBPE,
    tokens: Vec<String>,
    subword_to_id: HashMap<String, usize>,
}

fn load_encoding(name: &str) -> Result<CoreBPE> {
    let bpe = match name {
        "cl100k_base" => tiktoken_rs::cl100k_base(),
        "o200k_base" => tiktoken_rs::o200k_base(),
        other => return Err(EngineError::UnsupportedEncoding(other.to_string())),
    };
    bpe.map_err(|e| EngineError::Tokenizer(e.to_string()))
}

/// BPE pieces of `text` as strings
///
/// A piece that is not valid UTF-8 on its own (part of a multi-byte
/// character) decodes to U+FFFD.
fn segment(bpe: &CoreBPE, text: &str) -> Vec<String> {
    bpe.encode_ordinary(text)
        .into_iter()
        .map(|id| {
            bpe.decode(vec![id])
                .unwrap_or_else(|_| char::REPLACEMENT_CHARACTER.to_string())
        })
        .collect()
}

impl SubwordTokenizer {
    pub fn new(encoding_name: &str, corpus: &str) -> Result<Self> {
        let bpe = load_encoding(encoding_name)?;
        let subwords: BTreeSet<String> = segment(&bpe, corpus).into_iter().collect();
        Ok(Self::with_tokens(
            encoding_name,
            bpe,
            subwords.into_iter().collect(),
        ))
    }

    pub fn from_snapshot(snapshot: &VocabSnapshot) -> Result<Self> {
        let encoding_name = snapshot
            .encoding_name
            .as_deref()
            .unwrap_or(DEFAULT_ENCODING);
        let bpe = load_encoding(encoding_name)?;
        Ok(Self::with_tokens(encoding_name, bpe, snapshot.tokens_by_id()))
    }

    fn with_tokens(encoding_name: &str, bpe: CoreBPE, tokens: Vec<String>) -> Self {
        let subword_to_id = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i))
            .collect();
        Self {
            encoding_name: encoding_name.to_string(),
            bpe,
            tokens,
            subword_to_id,
        }
    }

    pub fn encoding_name(&self) -> &str {
        &self.encoding_name
    }
}

impl Tokenizer for SubwordTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<usize>> {
        Ok(segment(&self.bpe, text)
            .iter()
            .filter_map(|sw| self.subword_to_id.get(sw).copied())
            .collect())
    }

    fn decode(&self, ids: &[usize]) -> String {
        ids.iter()
            .filter(|&&id| !self.is_special(id))
            .filter_map(|&id| self.tokens.get(id).map(String::as_str))
            .collect()
    }

    fn vocab_size(&self) -> usize {
        self.tokens.len() + 2
    }

    fn token(&self, id: usize) -> Option<&str> {
        self.tokens.get(id).map(String::as_str)
    }

    fn snapshot(&self) -> VocabSnapshot {
        VocabSnapshot {
            kind: SnapshotKind::Tiktoken,
            vocab: self
                .tokens
                .iter()
                .enumerate()
                .map(|(i, t)| (t.clone(), i))
                .collect(),
            encoding_name: Some(self.encoding_name.clone()),
            has_special_tokens: true,
        }
    }

    fn name(&self) -> String {
        format!("SubwordTokenizer({})", self.encoding_name)
    }
}
