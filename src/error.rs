//! Error types for the rpcflow engine.
//!
//! Every failure the engine reports carries one of a small set of kinds that
//! line up with gRPC status codes, so callers in a management API can forward
//! them without translation tables of their own.

use std::fmt;

use tonic::{Code, Status};

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or ambiguous declarations, incompatible links, unsupported
    /// RPC cardinality.
    InvalidArgument,
    /// Missing orchestration, stage, link, field, service or method.
    NotFound,
    /// Duplicate definitions. Only produced by definition stores.
    AlreadyExists,
    /// Unreachable endpoint, reflection unavailable, port invariant violated.
    FailedPrecondition,
    /// Unclassified transport errors.
    Unknown,
}

impl ErrorKind {
    /// The gRPC status code for this kind.
    pub fn code(self) -> Code {
        match self {
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::FailedPrecondition => Code::FailedPrecondition,
            ErrorKind::Unknown => Code::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::NotFound => "not found",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::FailedPrecondition => "failed precondition",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// An engine error: a kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct EngineError {
    kind: ErrorKind,
    message: String,
}

impl EngineError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::FailedPrecondition, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error message without the kind prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the gRPC status code for this error.
    pub fn code(&self) -> Code {
        self.kind.code()
    }

    /// Prefix the message with context, keeping the kind.
    pub fn context(self, context: impl fmt::Display) -> Self {
        Self {
            kind: self.kind,
            message: format!("{}: {}", context, self.message),
        }
    }

    pub fn is_invalid_argument(&self) -> bool {
        self.kind == ErrorKind::InvalidArgument
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_failed_precondition(&self) -> bool {
        self.kind == ErrorKind::FailedPrecondition
    }
}

impl From<Status> for EngineError {
    fn from(status: Status) -> Self {
        let kind = match status.code() {
            Code::InvalidArgument => ErrorKind::InvalidArgument,
            Code::NotFound => ErrorKind::NotFound,
            Code::AlreadyExists => ErrorKind::AlreadyExists,
            Code::FailedPrecondition | Code::Unavailable | Code::Unimplemented => {
                ErrorKind::FailedPrecondition
            }
            _ => ErrorKind::Unknown,
        };
        Self::new(kind, status.message())
    }
}

impl From<EngineError> for Status {
    fn from(err: EngineError) -> Self {
        Status::new(err.code(), err.message)
    }
}
