//! Scratch space the kernels use to track block-pair coverage.

use bsm_tensor::{DType, Device, Shape, Tensor};
use log::trace;

use crate::matrix::BlockMatrix;

/// Block columns tracked per 64-bit bitmask word.
pub const BITMASK_ALIGNMENT: usize = 64;

/// Bytes needed for one 64-bit word per 64 block columns per block row.
pub fn size_in_bytes(rows: usize, columns: usize) -> usize {
    let column_entries = columns.div_ceil(BITMASK_ALIGNMENT);
    column_entries * rows * std::mem::size_of::<u64>()
}

/// Allocate block-pair coverage scratch for `m` as it is traversed.
///
/// The contents are owned by the backend; nothing is promised about them.
pub fn allocate_bitmask(m: &BlockMatrix, transpose: bool, device: Device) -> Tensor {
    let (block_rows, block_cols) = if transpose {
        (m.block_cols(), m.block_rows())
    } else {
        (m.block_rows(), m.block_cols())
    };
    let bytes = size_in_bytes(block_rows, block_cols);
    trace!(
        "bitmask: {} bytes for {}x{} blocks on {}",
        bytes,
        block_rows,
        block_cols,
        device
    );
    Tensor::empty(Shape::new(vec![bytes]), DType::I8, device)
}
