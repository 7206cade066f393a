//! Vocabulary interface
//!
//! Tokenization lives outside the runtime. The model only needs to know
//! how many token ids exist, so embedding lookups can map out-of-range ids
//! to [`TOKEN_UNKNOWN`] and logits can be cut to the vocabulary size.

use std::path::Path;

use crate::error::{HyperionError, Result};

/// Token id
pub type TokenId = u32;

/// Unknown token
pub const TOKEN_UNKNOWN: TokenId = 0;
/// Beginning of sequence
pub const TOKEN_BOS: TokenId = 1;
/// End of sequence
pub const TOKEN_EOS: TokenId = 2;
/// Padding
pub const TOKEN_PAD: TokenId = 3;

/// A vocabulary owned outside the model
///
/// Models hold a shared handle and never destroy the vocabulary itself.
pub trait Vocabulary: Send + Sync {
    /// Number of token ids
    fn token_count(&self) -> usize;

    /// Text of a token, if known
    fn token_text(&self, _id: TokenId) -> Option<&str> {
        None
    }
}

/// Vocabulary that only knows its size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedVocabulary(pub usize);

impl Vocabulary for FixedVocabulary {
    fn token_count(&self) -> usize {
        self.0
    }
}

/// Token strings indexed by id
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TokenTable {
    tokens: Vec<String>,
}

impl TokenTable {
    /// Build from token strings; index is the token id
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Load a vocabulary file with one token per line
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or holds no tokens.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| HyperionError::IoError {
            message: format!("Failed to read vocabulary '{}': {e}", path.display()),
        })?;
        let tokens: Vec<String> = text
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .collect();
        if tokens.is_empty() {
            return Err(HyperionError::FormatError {
                reason: format!("Vocabulary '{}' is empty", path.display()),
            });
        }
        Ok(Self { tokens })
    }

    /// Token id of `text`, if present
    pub fn id_of(&self, text: &str) -> Option<TokenId> {
        self.tokens
            .iter()
            .position(|t| t == text)
            .and_then(|i| TokenId::try_from(i).ok())
    }
}

impl Vocabulary for TokenTable {
    fn token_count(&self) -> usize {
        self.tokens.len()
    }

    fn token_text(&self, id: TokenId) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }
}
