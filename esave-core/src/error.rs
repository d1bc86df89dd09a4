/*!
Error types for the ESave core library.
*/

use thiserror::Error;

/// Result type used throughout ESave.
pub type Result<T> = std::result::Result<T, SaveError>;

/// Errors that can occur while reading, writing or querying save files.
#[derive(Error, Debug)]
pub enum SaveError {
    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encryption/decryption errors, including a wrong key or IV
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// The save file content could not be interpreted
    #[error("Invalid save file format: {0}")]
    InvalidFormat(String),

    /// Storage adapter errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// No record is stored under the key
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// A record exists but holds a different type than requested
    #[error("Type mismatch for key '{key}': expected {expected}, found {found}")]
    TypeMismatch {
        key: String,
        expected: String,
        found: String,
    },

    /// The operation observed a cancellation request
    #[error("Operation canceled")]
    Canceled,
}

impl SaveError {
    /// Create a new encryption error
    pub fn encryption<S: Into<String>>(msg: S) -> Self {
        Self::Encryption(msg.into())
    }

    /// Create a new storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a new invalid format error
    pub fn invalid_format<S: Into<String>>(msg: S) -> Self {
        Self::InvalidFormat(msg.into())
    }

    /// Create a new type mismatch error
    pub fn type_mismatch(
        key: impl Into<String>,
        expected: impl Into<String>,
        found: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            key: key.into(),
            expected: expected.into(),
            found: found.into(),
        }
    }
}
