//! Column-grouped indexing of a row-grouped block-sparse matrix, derived
//! purely from index arithmetic. Block payloads never move.

use bsm_tensor::{ArrayBackend, DType, Shape, Tensor};
use log::trace;

use crate::error::{MatmulError, Result};
use crate::matrix::{BlockMatrix, TransposeMeta, SUPPORTED_BLOCK_SIZE};

/// Largest row count whose block-row index fits below one column step of
/// the composite sort key.
pub const MAX_TRANSPOSE_ROWS: usize = SUPPORTED_BLOCK_SIZE * SUPPORTED_BLOCK_SIZE;

/// Row offsets must start at zero, never decrease and end at `nonzeros`.
fn check_offsets(offsets: &[i32], block_rows: usize, nonzeros: usize) -> Result<()> {
    if offsets.len() != block_rows + 1 {
        return Err(MatmulError::InvalidMatrix(format!(
            "expected {} offsets for {} block rows, got {}",
            block_rows + 1,
            block_rows,
            offsets.len()
        )));
    }
    if offsets[0] != 0 {
        return Err(MatmulError::InvalidMatrix(format!(
            "offsets must start at 0, got {}",
            offsets[0]
        )));
    }
    if let Some(row) = offsets.windows(2).position(|w| w[1] < w[0]) {
        return Err(MatmulError::InvalidMatrix(format!(
            "offsets decrease at block row {}: {} -> {}",
            row,
            offsets[row],
            offsets[row + 1]
        )));
    }
    let last = offsets[block_rows];
    if last as usize != nonzeros {
        return Err(MatmulError::InvalidMatrix(format!(
            "offsets describe {} blocks but the matrix has {}",
            last, nonzeros
        )));
    }
    Ok(())
}

/// Block-row index of every nonzero block, as i16 on the data device.
///
/// Position `p` belongs to the row `i` with `offsets[i] <= p < offsets[i + 1]`.
pub fn row_indices(m: &BlockMatrix, runtime: &dyn ArrayBackend) -> Result<Tensor> {
    let block_rows = m.block_rows();
    m.offsets
        .with_slice::<i32, _>(|o| check_offsets(o, block_rows, m.nonzeros))??;
    let ends = m.offsets.slice(1, block_rows + 1)?;
    let starts = m.offsets.slice(0, block_rows)?;
    let counts = ends.add(&starts.mul_scalar(-1, runtime)?, runtime)?;
    let rows = counts.repeat_interleave(runtime)?;
    Ok(rows.cast(DType::I16)?)
}

/// Derive the transpose metadata of `m`.
///
/// Blocks are ordered by a composite key `column * block_rows + row`, which
/// is unique per block, so an unstable sort yields the same order a stable
/// two-key sort would. The byte offsets of the blocks in the original buffer
/// are permuted alongside, and the per-column offsets come from a histogram
/// of the column indices.
pub fn transpose(m: &BlockMatrix, runtime: &dyn ArrayBackend) -> Result<TransposeMeta> {
    // TODO: drop the row bound once the runtime exposes a stable sort.
    if m.rows > MAX_TRANSPOSE_ROWS {
        return Err(MatmulError::RowBoundExceeded {
            rows: m.rows,
            max: MAX_TRANSPOSE_ROWS,
        });
    }
    let device = m.data.device();
    let nonzeros = m.nonzeros;
    let block_rows = m.block_rows();
    let block_cols = m.block_cols();
    let bytes_per_block = m.block_size.bytes_per_block(m.data.dtype());
    if nonzeros
        .checked_mul(bytes_per_block)
        .map_or(true, |end| end > i32::MAX as usize)
    {
        return Err(MatmulError::OffsetOverflow { nonzeros });
    }
    let outside = m.indices.with_slice::<i16, _>(|cols| {
        cols.iter()
            .filter(|&&c| c < 0 || c as usize >= block_cols)
            .count()
    })?;
    if outside > 0 {
        return Err(MatmulError::InvalidMatrix(format!(
            "{} of {} column indices fall outside [0, {})",
            outside, nonzeros, block_cols
        )));
    }

    // Sort row indices by column to get the transposed matrix's indices.
    let row_idxs = row_indices(m, runtime)?;
    let sort_keys = m
        .indices
        .cast(DType::I64)?
        .mul_scalar(block_rows as i64, runtime)?
        .add(&row_idxs.cast(DType::I64)?, runtime)?;
    let gather_indices = sort_keys.argsort(runtime)?;
    let indices_t = row_idxs.gather(&gather_indices, runtime)?;

    // Where each block of the transposed traversal lives in the original buffer.
    let last = nonzeros.saturating_sub(1) * bytes_per_block;
    let block_offsets = Tensor::linspace(0, last as i64, nonzeros, DType::I32, device, runtime)?;
    let block_offsets_t = block_offsets.gather(&gather_indices, runtime)?;

    let zero = Tensor::zeros(Shape::new(vec![1]), DType::I32, device);
    let offsets_t = if block_cols == 0 {
        zero
    } else {
        let nnz_per_column = m
            .indices
            .histc(block_cols, 0, block_cols as i64, runtime)?;
        Tensor::cat(&[&zero, &nnz_per_column.cumsum(runtime)?])?
    };

    trace!(
        "transpose metadata: {} blocks over {}x{} block grid",
        nonzeros,
        block_rows,
        block_cols
    );
    Ok(TransposeMeta {
        indices_t,
        offsets_t,
        block_offsets_t,
        bytes_per_block,
    })
}
