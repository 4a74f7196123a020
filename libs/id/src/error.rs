//! Error types for identifier parsing and validation.

use thiserror::Error;

/// Errors produced when parsing generated ids or validating endpoint names.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("ID cannot be empty")]
    Empty,

    #[error("invalid ID prefix: expected '{expected}', got '{actual}'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("ID missing underscore separator")]
    MissingSeparator,

    #[error("invalid ULID: {0}")]
    InvalidUlid(String),

    /// Endpoint name longer than [`crate::EndpointId::MAX_LEN`].
    #[error("endpoint id too long: {len} > {max}")]
    TooLong { len: usize, max: usize },

    /// Endpoint name contains a character outside `[A-Za-z0-9._-]`.
    #[error("endpoint id contains invalid character {ch:?} at {position}")]
    InvalidCharacter { ch: char, position: usize },
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }

    /// True for errors that only apply to endpoint names.
    pub fn is_name_error(&self) -> bool {
        matches!(self, IdError::TooLong { .. } | IdError::InvalidCharacter { .. })
    }
}
