// Error types for document job orchestration
//
// Every failure surfaced by the client, the polling engine, the registry and
// the dispatcher is one `DocflowError`. Callers that need to branch on the
// category match on `DocflowError::kind()`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::model::JobStatus;

/// Result type alias for docflow operations
pub type Result<T> = std::result::Result<T, DocflowError>;

/// Boxed cause carried by webhook handler failures
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Flat error category, used for matching without destructuring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    FileValidation,
    Authentication,
    NotFound,
    NotReady,
    Network,
    Server,
    Rejected,
    RemoteJobFailed,
    Timeout,
    MalformedPayload,
    WebhookProcessing,
    Cancelled,
    ShutDown,
    Internal,
}

/// Errors that can occur while submitting, polling or awaiting document jobs
#[derive(Debug, Error)]
pub enum DocflowError {
    /// Source file is missing, unreadable or over the upload size ceiling
    #[error("file validation failed for {}: {reason}", .path.display())]
    FileValidation { path: PathBuf, reason: String },

    /// API credential rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Job id unknown to the remote service
    #[error("job not found: {0}")]
    NotFound(String),

    /// Result requested before the job reached a terminal state
    #[error("result for job {job_id} is not ready yet")]
    NotReady { job_id: String },

    /// Transport-level failure talking to the remote service
    #[error("network error: {0}")]
    Network(String),

    /// 5xx-class response from the remote service
    #[error("server error ({status_code}): {message}")]
    Server { status_code: u16, message: String },

    /// Other 4xx response: the request itself was refused
    #[error("request rejected ({status_code}): {message}")]
    Rejected { status_code: u16, message: String },

    /// Remote service reported FAILED for the job
    #[error("remote processing failed for job {job_id} (observed at attempt {attempt})")]
    RemoteJobFailed { job_id: String, attempt: u32 },

    /// Poll budget exhausted without reaching a terminal state
    #[error(
        "timed out polling job {job_id} after {attempts} attempt(s), last status: {}",
        describe_status(.last_status)
    )]
    Timeout {
        job_id: String,
        attempts: u32,
        last_status: Option<JobStatus>,
    },

    /// A registry wait elapsed before any resolver finalized the waiter
    #[error("timed out after {waited:?} waiting for result of {key}")]
    WaitTimeout { key: String, waited: Duration },

    /// Webhook body (or result payload) is not well-formed structured data
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A registered webhook handler failed
    #[error("failed to process webhook {event_type}: {source}")]
    WebhookProcessing {
        event_type: String,
        #[source]
        source: BoxError,
    },

    /// Wait or job was cancelled before completion
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Batch coordinator used after shutdown
    #[error("batch coordinator has been shut down")]
    ShutDown,

    /// Internal error (e.g. a worker task panicked)
    #[error("internal error: {0}")]
    Internal(String),
}

fn describe_status(status: &Option<JobStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "never observed".to_string(),
    }
}

impl DocflowError {
    /// Create a file validation error
    pub fn file_validation(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DocflowError::FileValidation {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a network error
    pub fn network(msg: impl Into<String>) -> Self {
        DocflowError::Network(msg.into())
    }

    /// Create a malformed payload error
    pub fn malformed(msg: impl Into<String>) -> Self {
        DocflowError::MalformedPayload(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        DocflowError::Cancelled(msg.into())
    }

    /// The flat category of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            DocflowError::FileValidation { .. } => ErrorKind::FileValidation,
            DocflowError::Authentication(_) => ErrorKind::Authentication,
            DocflowError::NotFound(_) => ErrorKind::NotFound,
            DocflowError::NotReady { .. } => ErrorKind::NotReady,
            DocflowError::Network(_) => ErrorKind::Network,
            DocflowError::Server { .. } => ErrorKind::Server,
            DocflowError::Rejected { .. } => ErrorKind::Rejected,
            DocflowError::RemoteJobFailed { .. } => ErrorKind::RemoteJobFailed,
            DocflowError::Timeout { .. } | DocflowError::WaitTimeout { .. } => ErrorKind::Timeout,
            DocflowError::MalformedPayload(_) => ErrorKind::MalformedPayload,
            DocflowError::WebhookProcessing { .. } => ErrorKind::WebhookProcessing,
            DocflowError::Cancelled(_) => ErrorKind::Cancelled,
            DocflowError::ShutDown => ErrorKind::ShutDown,
            DocflowError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the same call later could succeed
    ///
    /// Authentication, validation and not-found failures are never transient.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
    }

    /// HTTP status code for server and rejected-request errors
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DocflowError::Server { status_code, .. }
            | DocflowError::Rejected { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_carries_context() {
        let err = DocflowError::Timeout {
            job_id: "job-1".into(),
            attempts: 30,
            last_status: Some(JobStatus::InProgress),
        };

        let msg = err.to_string();
        assert!(msg.contains("job-1"));
        assert!(msg.contains("30"));
        assert!(msg.contains("IN_PROGRESS"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_wait_timeout_is_timeout_kind() {
        let err = DocflowError::WaitTimeout {
            key: "job-9".into(),
            waited: Duration::from_secs(5),
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_webhook_error_preserves_source() {
        let cause: BoxError = "handler exploded".into();
        let err = DocflowError::WebhookProcessing {
            event_type: "document.completed".into(),
            source: cause,
        };

        let source = std::error::Error::source(&err).expect("source preserved");
        assert_eq!(source.to_string(), "handler exploded");
        assert!(err.to_string().contains("document.completed"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(DocflowError::network("reset").is_transient());
        assert!(DocflowError::Server {
            status_code: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!DocflowError::Authentication("bad key".into()).is_transient());
        assert!(!DocflowError::NotFound("job".into()).is_transient());
        assert!(!DocflowError::Rejected {
            status_code: 400,
            message: "bad request".into()
        }
        .is_transient());
        assert!(!DocflowError::file_validation("/tmp/x.pdf", "missing").is_transient());
    }

    #[test]
    fn test_status_code() {
        let err = DocflowError::Server {
            status_code: 502,
            message: "bad gateway".into(),
        };
        assert_eq!(err.status_code(), Some(502));
        assert_eq!(DocflowError::ShutDown.status_code(), None);
    }
}
