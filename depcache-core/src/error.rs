//! Error types for depcache operations

use thiserror::Error;

/// Backend (storage primitive) errors.
///
/// These are propagated unchanged to the caller of `put`/`get`/`invalidate`.
/// The engine never retries on its own.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("Backend unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Transaction failed: {reason}")]
    Transaction { reason: String },

    #[error("Serialization failed for key {key}: {reason}")]
    Serialization { key: String, reason: String },

    #[error("Deserialization failed for key {key}: {reason}")]
    Deserialization { key: String, reason: String },

    #[error("Corrupt index record {record}: {reason}")]
    Corrupt { record: String, reason: String },

    #[error("Backend lock poisoned")]
    LockPoisoned,
}

/// Configuration errors.
///
/// Raised for scope misuse in development mode, and for invalid
/// [`CacheConfig`](crate::CacheConfig) values in every mode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Scope {scope} does not describe field {field}")]
    UnknownField { scope: String, field: String },

    #[error("Scope {scope}: condition must name at least one described field")]
    EmptyCondition { scope: String },

    #[error("Scope {scope} already declared with fields {declared:?}, got {requested:?}")]
    ConflictingDeclaration {
        scope: String,
        declared: Vec<String>,
        requested: Vec<String>,
    },

    #[error("Scope {scope} must describe at least one field")]
    EmptyFieldSet { scope: String },

    #[error("Scope {scope} describes field {field} more than once")]
    DuplicateField { scope: String, field: String },

    #[error("Scope {scope} describes {count} fields, at most {max} are supported")]
    TooManyFields {
        scope: String,
        count: usize,
        max: usize,
    },

    #[error("Extractor for scope {scope} did not return field {field}")]
    MissingExtractedField { scope: String, field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Master error type for all depcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Not in cache: {key}")]
    NotInCache { key: String },

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

impl CacheError {
    /// True for the recoverable "key absent or expired" signal.
    pub fn is_not_in_cache(&self) -> bool {
        matches!(self, Self::NotInCache { .. })
    }
}

/// Result type alias for depcache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Result type alias for backend primitives.
pub type BackendResult<T> = Result<T, BackendError>;

// =============================================================================
// TESTS
// =============================================================================
