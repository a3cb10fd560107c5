//! Tokenizers
//!
//! Text ↔ integer id conversion, independent of the model. Two families share
//! the [`Tokenizer`] contract:
//!
//! - **character**: one token per distinct character of the corpus
//! - **subword**: byte-pair segmentation from an external BPE table
//!   (`cl100k_base` or `o200k_base`) with a vocabulary rebuilt locally from
//!   the corpus
//!
//! ## Vocabulary Layout
//!
//! ```text
//! id:     0 .. k-1          k        k+1
//!         regular tokens    <BOS>    <EOS>
//! vocab_size = k + 2
//! ```
//!
//! BOS and EOS always occupy the last two ids, so they can be derived from
//! `vocab_size` alone. `decode` silently drops them.
//!
//! ## Unknown Input
//!
//! The two families deliberately disagree on text they have never seen:
//!
//! | Family    | Unseen piece at encode time        |
//! |-----------|------------------------------------|
//! | character | error ([`EngineError::UnknownCharacter`]) |
//! | subword   | skipped, output is shorter          |
//!
//! ## Snapshots
//!
//! A built vocabulary is saved as a [`VocabSnapshot`] next to the model
//! weights so the exact same ids can be rebuilt later without the corpus.

pub mod character;
pub mod subword;

use crate::config::TokenizerKind;
use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

pub use character::CharTokenizer;
pub use subword::SubwordTokenizer;

pub const BOS_TOKEN: &str = "<BOS>";
pub const EOS_TOKEN: &str = "<EOS>";

/// Common contract for every tokenizer family
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<usize>>;

    /// Text for `ids`, skipping BOS/EOS and ids outside the vocabulary
    fn decode(&self, ids: &[usize]) -> String;

    /// Regular tokens plus the two reserved ids
    fn vocab_size(&self) -> usize;

    /// Surface string of a regular token
    fn token(&self, id: usize) -> Option<&str>;

    /// Serializable form of the vocabulary
    fn snapshot(&self) -> VocabSnapshot;

    fn name(&self) -> String;

    fn bos_id(&self) -> usize {
        self.vocab_size() - 2
    }

    fn eos_id(&self) -> usize {
        self.vocab_size() - 1
    }

    fn is_special(&self, id: usize) -> bool {
        id == self.bos_id() || id == self.eos_id()
    }

    /// Display label for any id, including `<BOS>`/`<EOS>`
    fn label(&self, id: usize) -> String {
        if id == self.bos_id() {
            BOS_TOKEN.to_string()
        } else if id == self.eos_id() {
            EOS_TOKEN.to_string()
        } else {
            self.token(id).unwrap_or("").to_string()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    #[default]
    Character,
    Tiktoken,
}

fn default_true() -> bool {
    true
}

/// Persisted vocabulary
///
/// `vocab` maps each regular token to its id; the reserved ids are not
/// stored and are re-derived from its size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabSnapshot {
    #[serde(rename = "type", default)]
    pub kind: SnapshotKind,
    pub vocab: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_name: Option<String>,
    #[serde(default = "default_true")]
    pub has_special_tokens: bool,
}

impl VocabSnapshot {
    /// Regular tokens ordered by id
    pub(crate) fn tokens_by_id(&self) -> Vec<String> {
        let mut pairs: Vec<(&String, &usize)> = self.vocab.iter().collect();
        pairs.sort_by_key(|(_, &id)| id);
        pairs.into_iter().map(|(t, _)| t.clone()).collect()
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Build a tokenizer of the given family from a training corpus
pub fn create_tokenizer(kind: TokenizerKind, corpus: &str) -> Result<Box<dyn Tokenizer>> {
    if corpus.is_empty() {
        return Err(EngineError::EmptyCorpus);
    }
    match kind.encoding_name() {
        None => Ok(Box::new(CharTokenizer::new(corpus))),
        Some(encoding) => Ok(Box::new(SubwordTokenizer::new(encoding, corpus)?)),
    }
}

/// [`create_tokenizer`] by family name
pub fn create_tokenizer_by_name(name: &str, corpus: &str) -> Result<Box<dyn Tokenizer>> {
    let kind: TokenizerKind = name.parse()?;
    create_tokenizer(kind, corpus)
}

/// Rebuild a tokenizer with the exact ids recorded in a snapshot
pub fn from_snapshot(snapshot: &VocabSnapshot) -> Result<Box<dyn Tokenizer>> {
    match snapshot.kind {
        SnapshotKind::Character => Ok(Box::new(CharTokenizer::from_snapshot(snapshot))),
        SnapshotKind::Tiktoken => Ok(Box::new(SubwordTokenizer::from_snapshot(snapshot)?)),
    }
}
