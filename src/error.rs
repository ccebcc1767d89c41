//! Error types for catalogue requests.
//!
//! Every per-item fetch settles with a [`FetchError`] on failure. The error
//! is cloneable so it can live inside published task snapshots.

use thiserror::Error;

const BODY_PREVIEW_LIMIT: usize = 256;

/// Failure of a single catalogue or download API request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The session was rejected (HTTP 401/403). Never retried.
    #[error("unauthorized status={status} url={url}")]
    Unauthorized { status: u16, url: String },

    /// Any other non-success HTTP status.
    #[error("api error status={status} url={url}: {body}")]
    Status {
        status: u16,
        url: String,
        body: String,
    },

    /// Connection, timeout or other transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The response body could not be decoded.
    #[error("failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
}

impl FetchError {
    /// Builds the error for a non-success HTTP status.
    pub fn from_status(status: u16, url: impl Into<String>, body: &str) -> Self {
        let url = url.into();
        if status == 401 || status == 403 {
            FetchError::Unauthorized { status, url }
        } else {
            FetchError::Status {
                status,
                url,
                body: preview_body(body),
            }
        }
    }

    /// Classifies a reqwest error.
    pub fn from_reqwest(err: reqwest::Error, url: &str) -> Self {
        if err.is_decode() {
            FetchError::Decode {
                url: url.to_string(),
                message: err.to_string(),
            }
        } else if err.is_timeout() {
            FetchError::Transport(format!("request to {} timed out", url))
        } else if err.is_connect() {
            FetchError::Transport(format!("cannot connect to {}", url))
        } else {
            FetchError::Transport(err.to_string())
        }
    }

    /// True for authorization failures, which invalidate the session.
    pub fn is_auth(&self) -> bool {
        matches!(self, FetchError::Unauthorized { .. })
    }

    /// Whether the retry policy may try this request again.
    pub fn is_retryable(&self) -> bool {
        !self.is_auth()
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Unauthorized { status, .. } | FetchError::Status { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

/// Errors from talking to a running aggregator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    #[error("aggregator has stopped")]
    Closed,
}

fn preview_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }
    if trimmed.len() <= BODY_PREVIEW_LIMIT {
        return trimmed.to_string();
    }
    let mut end = BODY_PREVIEW_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &trimmed[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_statuses_are_not_retryable() {
        for status in [401, 403] {
            let err = FetchError::from_status(status, "http://api/investigations", "");
            assert!(err.is_auth());
            assert!(!err.is_retryable());
            assert_eq!(err.status(), Some(status));
        }
    }

    #[test]
    fn test_other_statuses_are_retryable() {
        let err = FetchError::from_status(502, "http://api/investigations", "bad gateway");
        assert!(!err.is_auth());
        assert!(err.is_retryable());
        assert!(err.to_string().contains("status=502"));
        assert!(err.to_string().contains("bad gateway"));

        assert!(FetchError::Transport("reset".to_string()).is_retryable());
    }

    #[test]
    fn test_preview_body() {
        assert_eq!(preview_body("   "), "<empty body>");
        let long = "x".repeat(BODY_PREVIEW_LIMIT + 20);
        let preview = preview_body(&long);
        assert!(preview.ends_with("..."));
        assert_eq!(preview.len(), BODY_PREVIEW_LIMIT + 3);
    }
}
