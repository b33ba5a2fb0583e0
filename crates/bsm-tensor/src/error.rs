use thiserror::Error;

use crate::device::Device;
use crate::dtype::DType;

#[derive(Error, Debug)]
pub enum TensorError {
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },
    #[error("index {index} out of bounds for tensor with {len} elements")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("expected a host-resident tensor, got one on {0}")]
    NotOnHost(Device),
    #[error("expected a {expected}-dimensional tensor, got {got} dimensions")]
    RankMismatch { expected: usize, got: usize },
    #[error("unsupported dtype for {op}: {dtype}")]
    UnsupportedDType { op: &'static str, dtype: DType },
    #[error("storage lock poisoned")]
    Poisoned,
    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;
