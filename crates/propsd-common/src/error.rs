//! Error types for Propsd.

use thiserror::Error;

/// Result type alias for Propsd operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Propsd.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload or document parse errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// A `{{ path }}` reference that does not resolve against its scope
    #[error("Unresolved template reference: {0}")]
    UnresolvedTemplate(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}
