use reqwest::StatusCode;
use thiserror::Error;

/// Errors that occur while talking to the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to decode store response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid store url: {0}")]
    InvalidUrl(String),
}

impl StoreError {
    pub fn status(status: StatusCode, body: String) -> Self {
        StoreError::Status { status, body }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http(_) | StoreError::Unavailable(_) => true,
            StoreError::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            StoreError::Decode(_) | StoreError::InvalidUrl(_) => false,
        }
    }
}
