//! Error types for the segment server.

use evlog_core::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

type Source = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of server errors, as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed or unacceptable request.
    InvalidRequest,
    /// The block or segment does not exist here.
    ResourceNotFound,
    /// The block already exists.
    ResourceAlreadyExist,
    /// The server is not in a state that allows the operation.
    ServiceState,
    /// The block is archived.
    SegmentFull,
    /// The read reached the end of the block.
    OffsetOnEnd,
    /// This replica cannot accept writes.
    NotLeader,
    /// The request was cancelled before completing.
    Cancelled,
    /// Anything unexpected.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::InvalidRequest => "invalid request",
            Self::ResourceNotFound => "resource not found",
            Self::ResourceAlreadyExist => "resource already exist",
            Self::ServiceState => "service state",
            Self::SegmentFull => "segment full",
            Self::OffsetOnEnd => "offset on end",
            Self::NotLeader => "not leader",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal error",
        };
        f.write_str(name)
    }
}

/// A classified server error.
#[derive(Debug, Error)]
#[error("{kind}: {message}")]
pub struct ServerError {
    kind: ErrorKind,
    message: String,
    #[source]
    source: Option<Source>,
}

impl ServerError {
    /// Creates an error of `kind`.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Invalid request.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, message)
    }

    /// Resource not found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceNotFound, message)
    }

    /// Wrong server state.
    pub fn service_state(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceState, message)
    }

    /// Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Classification.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Human-readable description.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns true if the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::InvalidRequest
                | ErrorKind::ResourceNotFound
                | ErrorKind::ResourceAlreadyExist
                | ErrorKind::OffsetOnEnd
        )
    }

    /// Wire form, which drops the source chain.
    pub fn to_wire(&self) -> WireError {
        WireError {
            kind: self.kind,
            message: self.message.clone(),
        }
    }
}

impl From<CoreError> for ServerError {
    fn from(err: CoreError) -> Self {
        let kind = match &err {
            CoreError::InvalidArgument { .. } => ErrorKind::InvalidRequest,
            CoreError::NotFound { .. } => ErrorKind::ResourceNotFound,
            CoreError::AlreadyExists(_) => ErrorKind::ResourceAlreadyExist,
            CoreError::SegmentFull { .. } => ErrorKind::SegmentFull,
            CoreError::OffsetOnEnd { .. } => ErrorKind::OffsetOnEnd,
            CoreError::NotLeader { .. } | CoreError::NotBootstrapped(_) => ErrorKind::NotLeader,
            CoreError::Closed(_) => ErrorKind::ServiceState,
            _ => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string()).with_source(err)
    }
}

/// Error as carried in RPC responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    /// Classification.
    pub kind: ErrorKind,
    /// Description.
    pub message: String,
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        Self::new(err.kind, err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evlog_core::BlockId;
    use std::error::Error as _;

    #[test]
    fn core_errors_are_classified() {
        let cases = [
            (CoreError::AlreadyExists(BlockId::new(1)), ErrorKind::ResourceAlreadyExist),
            (CoreError::SegmentFull { block: BlockId::new(1) }, ErrorKind::SegmentFull),
            (
                CoreError::OffsetOnEnd {
                    block: BlockId::new(1),
                    seq: 4,
                },
                ErrorKind::OffsetOnEnd,
            ),
            (
                CoreError::NotLeader {
                    block: BlockId::new(1),
                    leader: None,
                },
                ErrorKind::NotLeader,
            ),
            (CoreError::wal_corruption("bad"), ErrorKind::Internal),
            (CoreError::not_found("seek"), ErrorKind::ResourceNotFound),
        ];
        for (core, kind) in cases {
            let err = ServerError::from(core);
            assert_eq!(err.kind(), kind);
            assert!(err.source().is_some());
        }
    }

    #[test]
    fn error_classification() {
        assert!(ServerError::invalid_request("bad").is_client_error());
        assert!(!ServerError::internal("oops").is_client_error());
    }

    #[test]
    fn error_display() {
        let err = ServerError::not_found("block 7");
        assert_eq!(err.to_string(), "resource not found: block 7");
        let back = ServerError::from(err.to_wire());
        assert_eq!(back.kind(), ErrorKind::ResourceNotFound);
        assert_eq!(back.message(), "block 7");
    }
}
