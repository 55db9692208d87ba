//! Error types for failwarden.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown jail: {0}")]
    UnknownJail(String),

    #[error("Jail already exists: {0}")]
    DuplicateJail(String),

    #[error("Invalid regular expression: {0}")]
    Regex(String),

    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Backend not available: {0}")]
    Backend(String),

    #[error("File system error: {0}")]
    FileSystem(String),

    #[error("{0} is not banned")]
    NotBanned(String),
}

pub type WardenResult<T> = std::result::Result<T, WardenError>;
