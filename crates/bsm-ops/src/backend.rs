use std::fmt::Debug;

use bsm_tensor::Stream;

use crate::error::{MatmulError, Result};
use crate::matrix::{BlockSize, Problem};

/// Trait for compute backends executing the fused block-sparse kernels.
///
/// The dispatcher has already validated the operands, attached any transpose
/// metadata and bitmasks, and checked `valid_matmul` before either multiply
/// primitive is called. Work is queued onto `stream`.
pub trait MatmulBackend: Send + Sync + Debug {
    /// Returns the name of this backend.
    fn name(&self) -> &str;

    /// Plain multiply: every sparse operand is traversed in its stored
    /// row-grouped order.
    fn matmul(&self, problem: &Problem, stream: &Stream) -> Result<()>;

    /// Extended multiply: sparse operands may carry transpose metadata and
    /// bitmask scratch.
    fn matmul_ex(&self, problem: &Problem, stream: &Stream) -> Result<()>;

    /// Compatibility predicate for an assembled problem.
    fn valid_matmul(&self, problem: &Problem) -> bool {
        problem.incompatibility().is_none()
    }
}

/// Map a block dimension onto a supported block size.
///
/// # Errors
/// Returns `UnsupportedBlockSize` for any dimension the kernels are not
/// built for.
pub fn as_block_size(dim: usize) -> Result<BlockSize> {
    BlockSize::from_dim(dim).ok_or(MatmulError::UnsupportedBlockSize(dim))
}

/// Convert a backend status code into a result. Zero is success.
pub fn check_status(backend: &str, code: i32, message: impl Into<String>) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    Err(MatmulError::Backend {
        backend: backend.to_string(),
        code,
        message: message.into(),
    })
}
