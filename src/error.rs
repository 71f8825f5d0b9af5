use std::{error::Error, fmt, io};

use actix::MailboxError;
use ndarray::ShapeError;

/// The crate's result type.
pub type Result<T> = std::result::Result<T, FedError>;

/// Failures raised while configuring or driving a federated training run.
#[derive(Debug)]
pub enum FedError {
    /// Invalid configuration, caught before any worker is started.
    InvalidConfig(String),
    /// The configuration file could not be read.
    Io(io::Error),
    /// The configuration file is not valid JSON for `FedConfig`.
    Json(serde_json::Error),
    /// A worker actor is gone or its mailbox is closed. Fatal, never retried.
    Mailbox(MailboxError),
    /// A worker was asked to do something before its model, loss or optimizer was set.
    NotBound {
        worker_id: usize,
        what: &'static str,
    },
    /// Two vectors that must share the flattened layout don't.
    LengthMismatch { expected: usize, got: usize },
    /// A tensor handed to the model has an unexpected shape.
    Shape(ShapeError),
    /// A participant's data loader ran out of batches.
    LoaderExhausted { worker_id: usize },
    /// A loss was requested on a worker that holds no forward outputs.
    MissingForward { worker_id: usize },
}

impl fmt::Display for FedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Json(e) => write!(f, "config parse error: {e}"),
            Self::Mailbox(e) => write!(f, "worker unavailable: {e}"),
            Self::NotBound { worker_id, what } => {
                write!(f, "worker {worker_id} has no {what} set")
            }
            Self::LengthMismatch { expected, got } => {
                write!(f, "length mismatch: got {got}, expected {expected}")
            }
            Self::Shape(e) => write!(f, "shape error: {e}"),
            Self::LoaderExhausted { worker_id } => {
                write!(f, "data loader for worker {worker_id} is exhausted")
            }
            Self::MissingForward { worker_id } => {
                write!(f, "worker {worker_id} has no forward outputs to evaluate")
            }
        }
    }
}

impl Error for FedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            Self::Mailbox(e) => Some(e),
            Self::Shape(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for FedError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for FedError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

impl From<MailboxError> for FedError {
    fn from(value: MailboxError) -> Self {
        Self::Mailbox(value)
    }
}

impl From<ShapeError> for FedError {
    fn from(value: ShapeError) -> Self {
        Self::Shape(value)
    }
}
