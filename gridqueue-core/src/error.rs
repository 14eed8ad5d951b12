use thiserror::Error;

use gridqueue_model::ModelError;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("request {0} has no input dataset")]
    MissingInputDataset(String),

    #[error("request {name}: spec reference {reference:?} is neither a URL nor a local path")]
    MalformedSpecReference { name: String, reference: String },

    #[error("request {0} produced no eligible blocks")]
    NoEligibleBlocks(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("data-location service error: {0}")]
    Location(String),

    #[error("unit store error: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// How a failure while processing one request should be treated by the
/// synchronization loop.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureClass {
    /// Report the request as failed to the tracker; never retried.
    Permanent,
    /// Leave the request alone; the next cycle retries implicitly.
    Transient,
    /// Log with full context and treat as transient.
    Unknown,
}

impl QueueError {
    pub fn classify(&self) -> FailureClass {
        match self {
            QueueError::Model(_)
            | QueueError::MissingInputDataset(_)
            | QueueError::MalformedSpecReference { .. }
            | QueueError::NoEligibleBlocks(_)
            | QueueError::Serialization(_) => FailureClass::Permanent,
            QueueError::Io(_)
            | QueueError::Http(_)
            | QueueError::Location(_)
            | QueueError::Store(_) => FailureClass::Transient,
            QueueError::Internal(_) => FailureClass::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_failures_are_permanent() {
        assert_eq!(
            QueueError::MissingInputDataset("req".into()).classify(),
            FailureClass::Permanent
        );
        assert_eq!(
            QueueError::NoEligibleBlocks("req".into()).classify(),
            FailureClass::Permanent
        );
    }

    #[test]
    fn backend_failures_are_transient() {
        assert_eq!(
            QueueError::Store("connection reset".into()).classify(),
            FailureClass::Transient
        );
        assert_eq!(
            QueueError::Location("timeout".into()).classify(),
            FailureClass::Transient
        );
    }

    #[test]
    fn unexpected_failures_are_unknown() {
        assert_eq!(
            QueueError::Internal("what".into()).classify(),
            FailureClass::Unknown
        );
    }
}
