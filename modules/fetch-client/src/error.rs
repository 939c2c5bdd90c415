use thiserror::Error;

pub type Result<T> = std::result::Result<T, FetchError>;

/// Failure surface of the fetch client.
///
/// `Status` covers both a non-retryable error status and 429 retry
/// exhaustion; `BrowserUnavailable` is distinct from network failures so a
/// missing Chromium install is never mistaken for a flaky site.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {0:.1}s")]
    Timeout(f64),

    #[error("HTTP error (status {status}): {body}")]
    Status {
        status: u16,
        body: String,
        /// Server-provided wait hint in seconds, when the response carried
        /// a parsable Retry-After header.
        retry_after: Option<f64>,
    },

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Browser engine unavailable: {0}")]
    BrowserUnavailable(String),

    #[error("Browser transport error: {0}")]
    Browser(String),
}

impl FetchError {
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_secs: f64) -> Self {
        if err.is_timeout() {
            FetchError::Timeout(timeout_secs)
        } else {
            FetchError::Network(err.to_string())
        }
    }

    /// Whether this failure is the retryable "too many requests" case.
    pub fn is_too_many_requests(&self) -> bool {
        matches!(self, FetchError::Status { status: 429, .. })
    }
}
