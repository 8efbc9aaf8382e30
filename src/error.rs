//! Unified error type.
//!
//! Two families of failure flow through weft:
//!
//! | Kind | Examples | Where it ends up |
//! |---|---|---|
//! | Structural / programmer | `NoMatch`, `RecursiveRedirect`, `Precondition` | returned as `Err`, terminates the operation |
//! | Expected / remote | fetch failures, `Status`, `Network` | recorded in the resource cache, read through [`AsyncValue`](crate::AsyncValue) |
//!
//! `Error` is `Clone` so that a single failure can be fanned out to every
//! listener of a [`DataStream`](crate::DataStream) and stored in cache entries.

use std::sync::Arc;

use http::StatusCode;
use thiserror::Error as ThisError;

/// A shareable, type-erased error source.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// `Result` with weft's [`Error`] as the default error type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The error type returned by weft's fallible operations.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// No registered route recognizes the path.
    #[error("could not match {0}")]
    NoMatch(String),

    /// A route pattern was rejected by the matcher.
    #[error("invalid route `{path}`: {reason}")]
    InvalidRoute { path: String, reason: String },

    /// A redirect resolved back to the location that produced it.
    #[error("encountered recursive redirect ({from} => {to})")]
    RecursiveRedirect { from: String, to: String },

    /// The chain produced a render response with no body.
    #[error("no body declared on route {0}")]
    MissingBody(String),

    /// A middleware needed a context value that no earlier middleware added.
    #[error("missing `{0}` in request context")]
    MissingContext(&'static str),

    /// A cache operation was attempted in a state that forbids it.
    #[error("{0}")]
    Precondition(String),

    /// A stream completed before producing the value that was awaited.
    #[error("stream completed without producing a value")]
    EmptyStream,

    /// A remote endpoint answered with a non-success status.
    #[error("request failed with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    /// The transport failed before a response was received.
    #[error("network: {0}")]
    Network(String),

    #[error("decode: {0}")]
    Decode(Arc<serde_json::Error>),

    #[error("authentication required for {0}")]
    Unauthenticated(String),

    #[error("config: {0}")]
    Config(String),

    #[error("io: {0}")]
    Io(Arc<std::io::Error>),

    /// Any other failure raised inside a middleware or effect.
    #[error(transparent)]
    Other(SharedError),

    #[error("{0}")]
    Message(String),
}

impl Error {
    /// Wraps an arbitrary error raised by application code.
    pub fn other(e: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(e))
    }

    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Whether an HTTP operation that failed with this error may be retried.
    ///
    /// Network and I/O failures and 5xx statuses are retryable; everything
    /// else (4xx in particular) is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Io(_) => true,
            Self::Status { status, .. } => status.is_server_error(),
            _ => false,
        }
    }
}

/// Errors compare equal when they render the same message.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(Arc::new(e))
    }
}
