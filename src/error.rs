//! Error type shared by every fallible engine operation.

use std::fmt;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    /// Every violated configuration rule, one message each
    InvalidConfig(Vec<String>),
    UnknownTokenizer(String),
    UnknownSamplingStrategy(String),
    UnsupportedEncoding(String),
    EmptyCorpus,
    /// Strict character-level lookup failure
    UnknownCharacter(char),
    /// Training already running, or inference while training is active
    Conflict(String),
    NotReady,
    CapacityExceeded { max: usize },
    Io(std::io::Error),
    Serialization(serde_json::Error),
    /// The external BPE table could not be loaded or used
    Tokenizer(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidConfig(errors) => {
                write!(f, "invalid configuration: {}", errors.join("; "))
            }
            EngineError::UnknownTokenizer(name) => write!(f, "unknown tokenizer type: {}", name),
            EngineError::UnknownSamplingStrategy(name) => {
                write!(f, "unknown sampling strategy: {}", name)
            }
            EngineError::UnsupportedEncoding(name) => write!(f, "unsupported encoding: {}", name),
            EngineError::EmptyCorpus => write!(f, "corpus contains no text"),
            EngineError::UnknownCharacter(c) => write!(f, "character {:?} not in vocabulary", c),
            EngineError::Conflict(msg) => write!(f, "conflict: {}", msg),
            EngineError::NotReady => write!(f, "model not initialized"),
            EngineError::CapacityExceeded { max } => {
                write!(f, "maximum of {} models already loaded", max)
            }
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
            EngineError::Serialization(e) => write!(f, "serialization error: {}", e),
            EngineError::Tokenizer(msg) => write!(f, "tokenizer error: {}", msg),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            EngineError::Serialization(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Io(e)
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Serialization(e)
    }
}
