//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors that can occur when parsing a node key.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    /// The key string is empty.
    #[error("node key cannot be empty")]
    Empty,

    /// The key is not exactly eight characters long.
    #[error("invalid node key length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    /// The key contains a character outside `[0-9A-F]`.
    ///
    /// Lowercase hex lands here: pxelinux always asks for uppercase, so a
    /// lowercase name is a different file rather than an alias.
    #[error("invalid character {character:?} at position {position} in node key")]
    InvalidCharacter { character: char, position: usize },
}
