// ABOUTME: Error types for batch invocation and reindex job control
// ABOUTME: Classifies transport failures so retry policies never inspect message text

use std::fmt;
use std::time::Duration;

/// Failure of a single call to a remote batch processor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvokeError {
    /// The bearer token was refused (401/403 or an expired JWT).
    Auth(String),
    /// The call did not finish within its timeout and was aborted.
    Timeout(Duration),
    /// The endpoint could not be reached at all.
    Network(String),
    /// The processor failed with a 5xx status.
    Server { status: u16, message: String },
    /// The processor refused the request for a non-auth reason.
    Rejected { status: u16, message: String },
    /// The response body was not a batch result.
    InvalidResponse(String),
}

impl InvokeError {
    /// Classify an error message reported inside a response body.
    ///
    /// Edge functions sometimes answer 200 with `{"error": "..."}`; the status
    /// code is useless there, so the message is all we have.
    pub fn from_message(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        if lower.contains("401")
            || lower.contains("403")
            || lower.contains("unauthorized")
            || lower.contains("jwt")
        {
            InvokeError::Auth(message)
        } else if lower.contains("failed to fetch")
            || lower.contains("networkerror")
            || lower.contains("timed out")
        {
            InvokeError::Network(message)
        } else if status >= 500 {
            InvokeError::Server { status, message }
        } else {
            InvokeError::Rejected { status, message }
        }
    }

    /// Map an HTTP error status to its error class.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => InvokeError::Auth(message),
            500..=599 => InvokeError::Server { status, message },
            _ => InvokeError::from_message(status, message),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, InvokeError::Auth(_))
    }

    /// Errors worth retrying on the same connection attempt budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            InvokeError::Timeout(_) | InvokeError::Network(_) | InvokeError::Server { .. }
        )
    }

    /// Errors that earn the larger loop-level retry budget.
    pub fn is_network(&self) -> bool {
        matches!(self, InvokeError::Timeout(_) | InvokeError::Network(_))
    }
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InvokeError::Auth(msg) => write!(f, "Authorization error: {}", msg),
            InvokeError::Timeout(after) => {
                write!(f, "Request timed out after {}s", after.as_secs())
            }
            InvokeError::Network(msg) => write!(f, "Network error: {}", msg),
            InvokeError::Server { status, message } => {
                write!(f, "Server error ({}): {}", status, message)
            }
            InvokeError::Rejected { status, message } => {
                write!(f, "Request rejected ({}): {}", status, message)
            }
            InvokeError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl std::error::Error for InvokeError {}

/// Failure to start or control the full reindex job.
#[derive(Debug)]
pub enum ReindexError {
    /// A reindex job is already pending or running on the server.
    AlreadyInProgress { job_id: String },
    /// No usable session to authorize the request.
    SessionExpired,
    /// Nothing is being tracked, so there is nothing to act on.
    NoActiveJob,
    Remote(anyhow::Error),
}

impl fmt::Display for ReindexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ReindexError::AlreadyInProgress { job_id } => write!(
                f,
                "A full reindex is already in progress (job {}). Wait for it to finish or cancel it first",
                job_id
            ),
            ReindexError::SessionExpired => {
                write!(f, "Session expired. Please sign in again")
            }
            ReindexError::NoActiveJob => write!(f, "No reindex job is being tracked"),
            ReindexError::Remote(err) => write!(f, "Reindex request failed: {:#}", err),
        }
    }
}

impl std::error::Error for ReindexError {}

impl From<anyhow::Error> for ReindexError {
    fn from(err: anyhow::Error) -> Self {
        ReindexError::Remote(err)
    }
}
