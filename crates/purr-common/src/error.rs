//! Error types shared across purr crates

use thiserror::Error;

/// Result type alias for common operations
pub type Result<T> = std::result::Result<T, PurrError>;

/// Main error type for shared purr utilities
#[derive(Error, Debug)]
pub enum PurrError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
