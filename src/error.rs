use std::time::Duration;

use thiserror::Error;

/// A single page fetch failed (network, server or session trouble).
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("server answered {status} for {url}")]
    Status { status: u16, url: String },
    #[error("page fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed page: {0}")]
    Malformed(String),
    #[error("session rejected: {0}")]
    Session(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether another attempt on the same page can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Http(_) | TransportError::Timeout(_) | TransportError::Malformed(_) => true,
            TransportError::Status { status, .. } => *status == 429 || *status >= 500,
            TransportError::Session(_) | TransportError::Io(_) => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => TransportError::Status {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => TransportError::Http(e.to_string()),
        }
    }
}

/// Failures that halt an extraction run.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("page {page} failed after {attempts} attempt(s): {source}")]
    TransportExhausted {
        page: u64,
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("checkpoint rejected: {0}")]
    ResumeStateCorrupt(String),
    #[error("cancelled before page {page}")]
    Cancelled { page: u64 },
    #[error("session unavailable: {0}")]
    Session(#[source] TransportError),
    #[error("output sink failed: {0}")]
    Sink(String),
    #[error("checkpoint store failed: {0}")]
    Store(String),
    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),
    #[error("controller is {0}, not idle")]
    NotIdle(&'static str),
}

impl ExtractError {
    /// True when the persisted checkpoint is still a valid place to resume from.
    pub fn is_resumable(&self) -> bool {
        !matches!(
            self,
            ExtractError::ResumeStateCorrupt(_) | ExtractError::UnknownDataset(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        let rate = TransportError::Status { status: 429, url: String::new() };
        let gone = TransportError::Status { status: 404, url: String::new() };
        let down = TransportError::Status { status: 503, url: String::new() };
        assert!(rate.is_retryable());
        assert!(down.is_retryable());
        assert!(!gone.is_retryable());
    }

    #[test]
    fn timeouts_retry_sessions_do_not() {
        assert!(TransportError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!TransportError::Session("login page".into()).is_retryable());
    }

    #[test]
    fn corrupt_checkpoint_is_not_resumable() {
        assert!(!ExtractError::ResumeStateCorrupt("bad".into()).is_resumable());
        assert!(ExtractError::Cancelled { page: 3 }.is_resumable());
    }
}
