use thiserror::Error;

use crate::matrix::SUPPORTED_BLOCK_SIZE;

#[derive(Error, Debug)]
pub enum MatmulError {
    #[error("invalid {what}: {reason}")]
    Validation { what: &'static str, reason: String },
    #[error("unsupported block size {0} (only {supported} is supported)", supported = SUPPORTED_BLOCK_SIZE)]
    UnsupportedBlockSize(usize),
    #[error("transpose metadata supports at most {max} rows, got {rows}")]
    RowBoundExceeded { rows: usize, max: usize },
    #[error("block byte offsets for {nonzeros} blocks overflow i32")]
    OffsetOverflow { nonzeros: usize },
    #[error("incompatible matmul problem: {0}")]
    IncompatibleProblem(String),
    #[error("invalid matrix: {0}")]
    InvalidMatrix(String),
    #[error("backend '{backend}' failed with status {code}: {message}")]
    Backend {
        backend: String,
        code: i32,
        message: String,
    },
    #[error("tensor error: {0}")]
    Tensor(#[from] bsm_tensor::TensorError),
}

impl MatmulError {
    pub(crate) fn validation(what: &'static str, reason: impl Into<String>) -> Self {
        MatmulError::Validation {
            what,
            reason: reason.into(),
        }
    }

    /// True for errors detected before any device work was issued.
    pub fn is_precondition(&self) -> bool {
        !matches!(self, MatmulError::Backend { .. } | MatmulError::Tensor(_))
    }
}

pub type Result<T> = std::result::Result<T, MatmulError>;
