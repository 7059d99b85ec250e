//! NSX client errors

use thiserror::Error;

/// Errors that can occur when interacting with the NSX Policy API
#[derive(Debug, Error)]
pub enum NsxError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// NSX API returned a non-success status
    #[error("NSX API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Authentication failed (bad credentials, expired session, etc.)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid request (e.g., malformed path)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl NsxError {
    /// True for errors worth retrying unchanged: transport failures,
    /// 5xx responses and throttling.
    pub fn is_transient(&self) -> bool {
        match self {
            NsxError::Http(_) => true,
            NsxError::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}
