//! Error taxonomy for the task-control protocol.
//!
//! Errors are classified by kind, not by origin:
//! - validation kinds ([`ShimError::InvalidArgument`], [`ShimError::NotFound`],
//!   [`ShimError::AlreadyExists`], [`ShimError::FailedPrecondition`],
//!   [`ShimError::NotImplemented`]) are produced by the coordinator itself
//! - passthrough kinds carry the failure of a collaborator (mount, spec,
//!   sandbox runtime, I/O) with its context, without reclassifying it

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;
use tonic::{Code, Status};

/// Result type for shim operations.
pub type ShimResult<T> = Result<T, ShimError>;

/// Errors returned by task-control operations.
#[derive(Debug, Error)]
pub enum ShimError {
    /// Malformed or missing required field.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Referenced process id is unknown.
    #[error("not found: {0}")]
    NotFound(String),

    /// Process id already in use.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Operation requires state that does not exist yet (e.g. no init process).
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Operation is not supported by this shim.
    #[error("not implemented")]
    NotImplemented,

    /// Rootfs mount failed.
    #[error("mount: {0}")]
    Mount(String),

    /// OCI spec could not be read or decoded.
    #[error("spec: {0}")]
    Spec(String),

    /// Sandbox runtime command failed.
    #[error("runtime: {0}")]
    Runtime(String),

    /// Generic IO error.
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Anything else.
    #[error("{0}")]
    Internal(String),
}

/// Machine-readable error kind, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    AlreadyExists,
    FailedPrecondition,
    NotImplemented,
    Unknown,
    Internal,
}

impl ShimError {
    /// Kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShimError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ShimError::NotFound(_) => ErrorKind::NotFound,
            ShimError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ShimError::FailedPrecondition(_) => ErrorKind::FailedPrecondition,
            ShimError::NotImplemented => ErrorKind::NotImplemented,
            ShimError::Mount(_) | ShimError::Spec(_) | ShimError::Runtime(_) => {
                ErrorKind::Unknown
            }
            ShimError::Io(_) | ShimError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// gRPC status code for this error.
    pub fn code(&self) -> Code {
        self.kind().code()
    }

    /// Wrap a passthrough error with more context, keeping its kind.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            ShimError::Mount(msg) => ShimError::Mount(format!("{}: {}", ctx, msg)),
            ShimError::Spec(msg) => ShimError::Spec(format!("{}: {}", ctx, msg)),
            ShimError::Runtime(msg) => ShimError::Runtime(format!("{}: {}", ctx, msg)),
            ShimError::Io(e) => ShimError::Io(io::Error::new(e.kind(), format!("{}: {}", ctx, e))),
            ShimError::Internal(msg) => ShimError::Internal(format!("{}: {}", ctx, msg)),
            other => other,
        }
    }
}

impl ErrorKind {
    /// gRPC status code for this kind.
    pub fn code(self) -> Code {
        match self {
            ErrorKind::InvalidArgument => Code::InvalidArgument,
            ErrorKind::NotFound => Code::NotFound,
            ErrorKind::AlreadyExists => Code::AlreadyExists,
            ErrorKind::FailedPrecondition => Code::FailedPrecondition,
            ErrorKind::NotImplemented => Code::Unimplemented,
            ErrorKind::Unknown => Code::Unknown,
            ErrorKind::Internal => Code::Internal,
        }
    }
}

impl From<ShimError> for Status {
    fn from(err: ShimError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<String> for ShimError {
    fn from(msg: String) -> Self {
        ShimError::Internal(msg)
    }
}

impl From<&str> for ShimError {
    fn from(msg: &str) -> Self {
        ShimError::Internal(msg.to_string())
    }
}

impl From<serde_json::Error> for ShimError {
    fn from(err: serde_json::Error) -> Self {
        ShimError::Internal(format!("json: {}", err))
    }
}
