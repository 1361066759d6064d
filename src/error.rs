//! Error types for the signal engine and simulator.

use thiserror::Error;

/// Main error type for caller-facing failures.
///
/// Numerical non-convergence, missing auxiliary data and degenerate
/// cross-sections are not errors; they surface as [`crate::types::Skip`].
#[derive(Error, Debug)]
pub enum BubbleError {
    #[error("Data error: {0}")]
    DataError(String),

    #[error("CSV parsing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParseError(#[from] chrono::ParseError),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("No data loaded")]
    NoData,

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Logging setup failed: {0}")]
    LoggingError(String),
}

/// Result type alias for fallible operations.
pub type Result<T> = std::result::Result<T, BubbleError>;
