//! Error types for the User service.
//!
//! This module defines the central `Error` enum returned by resource
//! operations. It implements `From<Error>` for `tonic::Status` so handlers can
//! propagate with `?` and clients receive the standard gRPC status code. The
//! HTTP gateway maps those codes onward to HTTP statuses.
//!
//! ## Error Cases
//! - `NotFound`: No user exists with the requested identifier.
//! - `InvalidArgument`: The request was malformed (e.g. a bad identifier).
//! - `Internal`: The datastore or another dependency failed.
//! - `Unavailable`: The service is shutting down or its datastore is closed.

use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified request-level error type.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The requested user does not exist.
    #[error("user not found")]
    NotFound,

    /// The client request was invalid.
    #[error("Invalid request: {reason}")]
    InvalidArgument { reason: String },

    /// A dependency failed while serving the request.
    #[error("Internal error: {context}")]
    Internal { context: String },

    /// The service cannot take requests right now.
    #[error("Service unavailable: {reason}")]
    Unavailable { reason: String },
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound => Status::not_found("user not found"),
            Error::InvalidArgument { reason } => Status::invalid_argument(reason),
            Error::Internal { context } => Status::internal(context),
            Error::Unavailable { reason } => Status::unavailable(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn maps_to_grpc_codes() {
        assert_eq!(Status::from(Error::NotFound).code(), Code::NotFound);
        let status = Status::from(Error::InvalidArgument {
            reason: "invalid user ID".to_string(),
        });
        assert_eq!(status.code(), Code::InvalidArgument);
        assert_eq!(status.message(), "invalid user ID");
        assert_eq!(
            Status::from(Error::Internal {
                context: "failed to create user".to_string()
            })
            .code(),
            Code::Internal
        );
        assert_eq!(
            Status::from(Error::Unavailable {
                reason: "closed".to_string()
            })
            .code(),
            Code::Unavailable
        );
    }
}
