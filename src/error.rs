//! Crate error taxonomy.
//!
//! A single `thiserror` enum ([`Error`]) and a crate-wide [`Result`] alias.
//! The subsystem error types ([`crate::sync::SyncError`],
//! [`crate::tensor::TensorError`]) and `std::io::Error` fold into it via
//! `From`, so `?` works across the seams.

use crate::tensor::Dtype;
use thiserror::Error;

/// Errors produced by the coordinator and its seams.
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument or registration is invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// An operation was attempted in the wrong lifecycle state.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// A tensor shape did not match the expected one.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// An element type did not match the expected one.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DtypeMismatch { expected: Dtype, got: Dtype },

    /// A requested operation is not supported in the current configuration.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// The shared-memory synchronization fabric failed.
    #[error(transparent)]
    Sync(#[from] crate::sync::SyncError),

    /// The compute engine failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// A tensor operation failed.
    #[error(transparent)]
    Tensor(#[from] crate::tensor::TensorError),

    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
