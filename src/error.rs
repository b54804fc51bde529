//! Error types for the Loginguard service.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Loginguard operations.
///
/// Policy outcomes (a blocked or rejected login) are never errors; they are
/// returned as [`crate::auth::LoginDecision`] values.
#[derive(Error, Debug)]
pub enum LoginGuardError {
    /// Configuration-related errors, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter store errors surfaced by administrative operations
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Identity lookup failed
    #[error("Identity directory error: {0}")]
    Directory(String),

    /// Token issuance failed
    #[error("Token issuance error: {0}")]
    Token(String),

    /// Credential hashing failed
    #[error("Credential hashing error: {0}")]
    Hashing(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Loginguard operations.
pub type Result<T> = std::result::Result<T, LoginGuardError>;
