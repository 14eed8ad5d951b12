use thiserror::Error;

/// Errors produced by model constructors and validation routines.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("invalid work unit status: {0}")]
    InvalidStatus(String),

    #[error("invalid lumi range: first {first} > last {last}")]
    InvalidLumiRange { first: u64, last: u64 },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ModelError>;
