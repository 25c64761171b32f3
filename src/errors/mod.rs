use thiserror::Error;

/// A report page could not be retrieved.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("transport error for {url}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout { url: url.to_string() }
        } else if let Some(status) = err.status() {
            FetchError::Status { url: url.to_string(), status: status.as_u16() }
        } else {
            FetchError::Transport { url: url.to_string(), source: err }
        }
    }

    /// Timeouts, transport failures, throttling and server errors are worth
    /// another attempt. Other client errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Timeout { .. } | FetchError::Transport { .. } => true,
            FetchError::Status { status, .. } => *status == 429 || *status >= 500,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::Status { .. } => "status",
            FetchError::Transport { .. } => "transport",
        }
    }
}

/// A fetched page did not have the expected report structure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid selector {selector:?}: {reason}")]
    InvalidSelector { selector: String, reason: String },

    #[error("report table not found (selector {0:?})")]
    TableNotFound(String),

    #[error("report table has no metadata row")]
    MissingMetadata,

    #[error("malformed metadata row {0:?}")]
    MalformedMetadata(String),

    #[error("{0} table rows but none has a security name")]
    UnnamedRows(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(code: u16) -> FetchError {
        FetchError::Status { url: "http://x".into(), status: code }
    }

    #[test]
    fn test_retryable_classification() {
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(FetchError::Timeout { url: "http://x".into() }.is_retryable());
    }

    #[test]
    fn test_display_names_url() {
        assert_eq!(status(502).to_string(), "HTTP 502 from http://x");
        assert_eq!(status(502).kind(), "status");
    }
}
