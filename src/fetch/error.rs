//! Retrieval errors. Network, HttpStatus and ProxyResponse are transient and normally only
//! reach callers wrapped in Exhausted.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    HttpStatus { url: String, status: u16 },

    #[error("Rendering proxy returned no document for {url}: {reason}")]
    ProxyResponse { url: String, reason: String },

    #[error("Giving up on {url} after exhausting all fetch strategies")]
    Exhausted {
        url: String,
        #[source]
        last: Box<FetchError>,
    },

    #[error("{url} requires the rendering proxy, but secondary fetch is disabled")]
    SecondaryDisabled { url: String },

    #[error("Failed to build HTTP client: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// Transient errors are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchError::Network { .. } | FetchError::HttpStatus { .. } | FetchError::ProxyResponse { .. }
        )
    }
}
