//! `bsm-ops` - Host-side orchestration of block-sparse matrix multiplication.
//!
//! This crate provides:
//! - Validation of caller-supplied dense and BCSR buffers
//! - Zero-copy adaptation of those buffers into matrix views
//! - Transpose metadata synthesis from row-grouped indices alone
//! - Bitmask scratch allocation for sparse x sparse products
//! - A `Dispatcher` exposing the dsd, dds, sdd, ssd and dss entry points
//! - A `MatmulBackend` trait for the compute kernels behind them

pub mod backend;
pub mod bitmask;
pub mod convert;
pub mod dispatch;
pub mod error;
pub mod matrix;
pub mod sparse;
pub mod transpose;
pub mod validate;

// Re-export primary types at the crate root for convenience.
pub use backend::{as_block_size, check_status, MatmulBackend};
pub use dispatch::{Dispatcher, MetaRule, Operand, SparseArgs, Variant, VariantSpec};
pub use error::{MatmulError, Result};
pub use matrix::{
    BlockMatrix, BlockSize, Matrix, MatrixView, Problem, TransposeMeta, SUPPORTED_BLOCK_SIZE,
};
pub use sparse::SparseMatrix;
pub use transpose::MAX_TRANSPOSE_ROWS;
