use thiserror::Error;

use crate::sparse::error::CscError;

/// Fatal errors of the stamping core.
///
/// Non-convergence and truncation-driven step rejection are *not* errors; they are
/// reported through `converged()` and the shrunk time step respectively.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceError {
    #[error(transparent)]
    Matrix(#[from] CscError),

    #[error("node {node} was never registered (registered unknowns: {registered})")]
    UnregisteredNode { node: usize, registered: usize },

    #[error("instance '{instance}' stamped ({row}, {col}) which is not part of its topology")]
    UnboundSlot {
        instance: String,
        row: usize,
        col: usize,
    },

    #[error("instance '{instance}' was stamped before setup")]
    NotSetUp { instance: String },

    #[error("invalid parameter '{parameter}' on '{instance}': {reason}")]
    InvalidParameter {
        instance: String,
        parameter: &'static str,
        reason: String,
    },

    #[error("unknown parameter '{parameter}' for {device} '{instance}'")]
    UnknownParameter {
        device: &'static str,
        instance: String,
        parameter: String,
    },

    #[error("unknown instance '{0}'")]
    UnknownInstance(String),

    #[error("terminal '{terminal}' of '{instance}' shares ground with another terminal; its current cannot be separated")]
    SharedGround { instance: String, terminal: String },

    #[error("no backup snapshot to restore for '{instance}'")]
    NoSnapshot { instance: String },

    #[error("missing sparsity-pattern entry at (row={row}, col={col})")]
    MissingPatternEntry { row: usize, col: usize },
}

pub type DeviceResult<T> = Result<T, DeviceError>;
