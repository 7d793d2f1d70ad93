//! Error types for vault operations

use thiserror::Error;

/// Errors that can occur during vault operations
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Master password has not been set - run 'rdpvault init' first")]
    NotInitialized,

    #[error("Too many failed attempts ({0}) - exiting")]
    LockedOut(u32),

    #[error("Master password file corrupted or tampered")]
    VaultCorrupted,

    #[error("Server not found: {0}")]
    ServerNotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Audit log error: {0}")]
    AuditError(String),
}

/// Errors raised while handing credentials to external processes
#[derive(Error, Debug)]
pub enum ExposureError {
    /// A credential field could not be decrypted, so nothing was exposed
    #[error("Stored credentials for '{0}' cannot be decrypted")]
    Undecryptable(String),

    #[error("External process failed: {0}")]
    Process(String),
}

pub type VaultResult<T> = Result<T, VaultError>;
pub type ExposureResult<T> = Result<T, ExposureError>;
