//! Error types for reward comparison

use thiserror::Error;

/// Core error type for canonicalization, distance and fitting operations
#[derive(Error, Debug)]
pub enum RewardError {
    /// Observation or action spaces of two reward sources differ
    #[error("Space mismatch in {what}: expected {expected}, got {actual}")]
    SpaceMismatch {
        /// Which space disagreed (e.g. "observation space")
        what: String,
        /// Expected space description
        expected: String,
        /// Actual space description
        actual: String,
    },

    /// Dimension mismatch
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Malformed configuration value
    #[error("Invalid configuration field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    /// Unrecognized kind string (distance, canonicalization, family, ...)
    #[error("Unknown {field} '{value}'")]
    UnknownKind { field: String, value: String },

    /// A reward source produced NaN or infinite output
    #[error("Non-finite reward output: {context}")]
    NonFinite { context: String },

    /// Distribution with negative or zero total weight
    #[error("Invalid distribution: {0}")]
    InvalidDistribution(String),

    /// Computation error
    #[error("Computation error: {0}")]
    Computation(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// CSV output error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other errors, including failures raised by batch sources
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl RewardError {
    /// Shorthand for an [`RewardError::InvalidConfig`] naming `field`
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for an [`RewardError::UnknownKind`]
    pub fn unknown_kind(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::UnknownKind {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Result type alias for reward comparison operations
pub type Result<T> = std::result::Result<T, RewardError>;
