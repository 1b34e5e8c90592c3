//! Error types for ID parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing or validating IDs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The ID string is empty.
    #[error("ID cannot be empty")]
    Empty,

    /// The ID has the wrong length.
    #[error("invalid ID length: expected {expected} characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The ID contains a character outside `[0-9a-f]`.
    #[error("invalid ID character '{ch}' at position {position}")]
    InvalidCharacter { ch: char, position: usize },
}

impl IdError {
    /// Returns true if this error indicates the input was empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
