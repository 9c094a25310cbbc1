//! Error types for Orca

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Declined: {0}")]
    Declined(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("Item of {size} bytes exceeds {tier} capacity of {capacity} bytes")]
    TooLarge {
        tier: &'static str,
        size: usize,
        capacity: usize,
    },

    #[error("Remote error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u8, actual: u32 },

    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Key error: {0}")]
    Key(String),
}

impl Error {
    /// HTTP status code a server should answer with for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::Validation(_) | Error::InvalidAddress(_) => 400,
            Error::Declined(_) => 401,
            Error::TooLarge { .. } => 413,
            Error::Remote { status, .. } => *status,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
