//! Character-level tokenizer
//!
//! Vocabulary is the sorted set of distinct characters in the corpus, so the
//! same corpus always yields the same ids. Encoding is strict: a character
//! that was not in the corpus is an error.

use super::{SnapshotKind, Tokenizer, VocabSnapshot};
use crate::error::{EngineError, Result};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct CharTokenizer {
    tokens: Vec<String>,
    char_to_id: HashMap<char, usize>,
}

impl CharTokenizer {
    pub fn new(corpus: &str) -> Self {
        let chars: BTreeSet<char> = corpus.chars().collect();
        Self::from_chars(chars.into_iter().collect())
    }

    fn from_chars(chars: Vec<char>) -> Self {
        let char_to_id = chars.iter().enumerate().map(|(i, &c)| (c, i)).collect();
        Self {
            tokens: chars.iter().map(|c| c.to_string()).collect(),
            char_to_id,
        }
    }

    pub fn from_snapshot(snapshot: &VocabSnapshot) -> Self {
        let chars = snapshot
            .tokens_by_id()
            .iter()
            .filter_map(|t| t.chars().next())
            .collect();
        Self::from_chars(chars)
    }
}

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<usize>> {
        text.chars()
            .map(|c| {
                self.char_to_id
                    .get(&c)
                    .copied()
                    .ok_or(EngineError::UnknownCharacter(c))
            })
            .collect()
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
            kind: SnapshotKind::Character,
            vocab: self
                .tokens
                .iter()
                .enumerate()
                .map(|(i, t)| (t.clone(), i))
                .collect(),
            encoding_name: None,
            has_special_tokens: true,
        }
    }

    fn name(&self) -> String {
        "CharTokenizer".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vocab_sorted_unique() {
        let tok = CharTokenizer::new("hello world");
        let tokens: Vec<&str> = (0..tok.vocab_size() - 2)
            .filter_map(|i| tok.token(i))
            .collect();
        assert_eq!(tokens, vec![" ", "d", "e", "h", "l", "o", "r", "w"]);
        assert_eq!(tok.vocab_size(), 10);
    }

    #[test]
    fn test_round_trip() {
        let tok = CharTokenizer::new("the quick brown fox");
        let text = "quick fox the brown";
        assert_eq!(tok.decode(&tok.encode(text).expect("encode")), text);
    }

    #[test]
    fn test_unknown_character_is_error() {
        let tok = CharTokenizer::new("abc");
        assert!(matches!(tok.encode("abz"), Err(EngineError::UnknownCharacter('z'))));
    }

    #[test]
    fn test_decode_drops_special_ids() {
        let tok = CharTokenizer::new("ab");
        let ids = vec![tok.bos_id(), 0, 1, tok.eos_id()];
        assert_eq!(tok.decode(&ids), "ab");
    }

    #[test]
    fn test_multibyte_characters() {
        let tok = CharTokenizer::new("héllo 世界");
        let text = "世界 héllo";
        assert_eq!(tok.decode(&tok.encode(text).expect("encode")), text);
    }

    #[test]
    fn test_snapshot_restores_same_ids() {
        let tok = CharTokenizer::new("snapshot");
        let restored = CharTokenizer::from_snapshot(&tok.snapshot());
        assert_eq!(restored.vocab_size(), tok.vocab_size());
        assert_eq!(
            restored.encode("optsan").expect("encode"),
            tok.encode("optsan").expect("encode")
        );
    }
}
