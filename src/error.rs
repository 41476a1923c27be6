//! Classified errors that callers branch on. Everything else travels as `anyhow::Error`.

use thiserror::Error;

/// Failure reported by an upstream HTTP source.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn status(&self) -> Option<u16> {
        match self {
            SourceError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Client errors other than rate limiting will not succeed on retry.
    pub fn is_retryable(&self) -> bool {
        match self.status() {
            Some(status) => !((400..500).contains(&status) && status != 429),
            None => true,
        }
    }
}

impl From<reqwest::Error> for SourceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            SourceError::Decode(e.to_string())
        } else {
            SourceError::Transport(e.to_string())
        }
    }
}

/// Fatal outcome of fetching one page of leader history.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("non-retryable response on page {page}: {source}")]
    NonRetryable {
        page: u32,
        #[source]
        source: SourceError,
    },

    #[error("page {page} failed after {attempts} attempts: {last}")]
    RetriesExhausted { page: u32, attempts: u32, last: SourceError },
}

/// Order book lookup failure.
#[derive(Debug, Error)]
pub enum BookError {
    #[error("no orderbook exists for token {0}")]
    NotFound(String),

    #[error(transparent)]
    Source(#[from] SourceError),
}

/// Rejected task operation.
#[derive(Debug, Error, PartialEq)]
pub enum TaskError {
    #[error("invalid task parameters: {0}")]
    Validation(String),

    #[error("task {id} is {status}, cannot {action}")]
    InvalidState {
        id: String,
        status: String,
        action: &'static str,
    },

    #[error("task {0} not found")]
    NotFound(String),
}
