//! Error types for the request dispatcher.
//!
//! This module defines the central `Error` enum, which captures every failure
//! a request can run into between the client-facing front end and a backend.
//! It implements `From<Error>` for `tonic::Status` so handlers can propagate
//! failures to clients with `?`.
//!
//! ## Error Cases
//! - `Dial`: A backend connection could not be established.
//! - `Call`: A backend answered a call with an error.
//! - `Timeout`: A call or probe did not complete in time.
//! - `HealthCheck`: A backend failed its liveness probe.
//! - `QueueClosed`: The shared request queue no longer accepts work.
//! - `RetriesExhausted`: A request was requeued more often than allowed.
//! - `InvalidRequest`: The client request was malformed.
//! - `ServiceShutdown`: A request arrived while the service was shutting down.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the dispatcher and its backends.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// Establishing the connection to a backend failed.
    #[error("Failed to dial {address}: {reason}")]
    Dial { address: String, reason: String },

    /// The backend returned an error for a call.
    #[error("Call to {address} failed: {reason}")]
    Call { address: String, reason: String },

    /// A call or probe exceeded its deadline.
    #[error("Timed out: {context}")]
    Timeout { context: String },

    /// The backend did not answer its liveness probe.
    #[error("Health check of {address} failed: {reason}")]
    HealthCheck { address: String, reason: String },

    /// The shared request queue is closed.
    #[error("Request queue is closed")]
    QueueClosed,

    /// The request was requeued more often than the configured limit.
    #[error("Request abandoned after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The service is in the process of shutting down.
    #[error("Service is shutting down")]
    ServiceShutdown,
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Dial { .. } | Error::HealthCheck { .. } => Status::unavailable(err.to_string()),
            // Backend failures are retried elsewhere; clients never see the
            // backend's own message.
            Error::Call { .. } => Status::internal("Backend call failed"),
            Error::Timeout { context } => Status::deadline_exceeded(context),
            Error::QueueClosed | Error::ServiceShutdown => {
                Status::unavailable("Service is shutting down")
            }
            Error::RetriesExhausted { attempts } => Status::aborted(format!(
                "Request abandoned after {attempts} attempts"
            )),
            Error::InvalidRequest { reason } => Status::invalid_argument(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn call_errors_hide_backend_message() {
        let status = Status::from(Error::Call {
            address: "127.0.0.1:9000".to_string(),
            reason: "division by zero".to_string(),
        });
        assert_eq!(status.code(), Code::Internal);
        assert!(!status.message().contains("division"));
    }

    #[test]
    fn shutdown_and_closed_queue_are_unavailable() {
        assert_eq!(Status::from(Error::QueueClosed).code(), Code::Unavailable);
        assert_eq!(Status::from(Error::ServiceShutdown).code(), Code::Unavailable);
    }

    #[test]
    fn invalid_request_keeps_reason() {
        let status = Status::from(Error::InvalidRequest {
            reason: "address must not be empty".to_string(),
        });
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "address must not be empty");
    }

    #[test]
    fn retries_exhausted_is_aborted() {
        let status = Status::from(Error::RetriesExhausted { attempts: 3 });
        assert_eq!(status.code(), Code::Aborted);
        assert!(status.message().contains('3'));
    }
}
