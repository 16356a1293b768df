use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A `MustNotExist` / `MustExist` precondition failed. Callers map this
    /// to "already exists" or "already gone".
    #[error("Conditional write rejected on {table} for key {key}")]
    Conflict { table: String, key: String },

    /// Network, throughput or validation failure reported by the backend.
    #[error("Backend error: {0}")]
    Backend(String),

    /// A batch chunk kept returning unprocessed keys.
    #[error("Backend left {remaining} item(s) unprocessed on {table}")]
    Unprocessed { table: String, remaining: usize },

    /// A point lookup that must find a row found none.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// A stored item could not be decoded into a domain value.
    #[error("Malformed item: {0}")]
    Codec(String),

    /// The caller passed an argument the store cannot act on.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identifier parsing error.
    #[error("Identifier error: {0}")]
    Types(#[from] courier_shared::TypesError),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic I/O error (e.g. reading the config file).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub(crate) fn codec(msg: impl Into<String>) -> Self {
        StoreError::Codec(msg.into())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
