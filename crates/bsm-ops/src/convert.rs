//! Conversion of validated buffers into matrix views.

use bsm_tensor::Tensor;

use crate::backend::as_block_size;
use crate::error::{MatmulError, Result};
use crate::matrix::{BlockMatrix, Matrix};
use crate::validate::{is_transposed, validate_dense, validate_sparse, validate_transpose};

/// Convert a dense operand into a view. Zero-copy.
///
/// A transposed buffer reports the extents of the contiguous buffer it is a
/// view of; the orientation travels separately as the transpose flag.
pub fn as_matrix(x: &Tensor) -> Result<Matrix> {
    validate_dense(x)?;
    let (rows, cols) = if is_transposed(x) {
        (x.size(1), x.size(0))
    } else {
        (x.size(0), x.size(1))
    };
    Ok(Matrix::new(rows, cols, x.clone()))
}

/// Read entry `idx` of a host-resident i32 metadata buffer.
pub fn access_metadata(m: &Tensor, idx: usize) -> Result<i32> {
    Ok(m.read::<i32>(idx)?)
}

fn as_extent(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| MatmulError::validation("shape", format!("negative {}: {}", what, value)))
}

/// Read the declared (rows, cols) of a sparse operand.
///
/// The caller must have synchronized the stream that produced `shape`;
/// `Dispatcher` does so once per call before resolving any operand.
pub fn read_extents(shape: &Tensor) -> Result<(usize, usize)> {
    let rows = as_extent(access_metadata(shape, 0)?, "rows")?;
    let cols = as_extent(access_metadata(shape, 1)?, "cols")?;
    Ok((rows, cols))
}

/// Read a validated transpose flag. Any nonzero value means transposed.
pub fn read_transpose_flag(transpose: &Tensor) -> Result<bool> {
    validate_transpose(transpose)?;
    Ok(access_metadata(transpose, 0)? != 0)
}

/// Swap the shape descriptor in place when the operand is consumed
/// transposed.
///
/// Callers describe a sparse operand in the orientation in which it takes
/// part in the product; after the swap the descriptor matches the stored
/// row-grouped extents. Calling this twice on the same buffer swaps back.
pub fn standardize_shape(shape: &Tensor, transpose: bool) -> Result<()> {
    if !transpose {
        return Ok(());
    }
    let rows = access_metadata(shape, 0)?;
    let cols = access_metadata(shape, 1)?;
    shape.write::<i32>(0, cols)?;
    shape.write::<i32>(1, rows)?;
    Ok(())
}

/// Convert a sparse (shape, data, offsets, indices) tuple into a view.
///
/// Besides the buffer-level validation this checks that the declared extents
/// tile into whole blocks and that the metadata lengths agree with them.
pub fn as_block_matrix(
    shape: &Tensor,
    data: &Tensor,
    offsets: &Tensor,
    indices: &Tensor,
) -> Result<BlockMatrix> {
    validate_sparse(shape, data, offsets, indices)?;
    let block_size = as_block_size(data.size(1))?;
    let (rows, cols) = read_extents(shape)?;

    let block = block_size.as_usize();
    if rows % block != 0 || cols % block != 0 {
        return Err(MatmulError::validation(
            "shape",
            format!("[{}x{}] does not tile into {}x{} blocks", rows, cols, block, block),
        ));
    }
    if offsets.numel() != rows / block + 1 {
        return Err(MatmulError::validation(
            "sparse offsets",
            format!(
                "expected {} offsets for {} block rows, got {}",
                rows / block + 1,
                rows / block,
                offsets.numel()
            ),
        ));
    }
    let nonzeros = indices.numel();
    if data.size(0) != nonzeros {
        return Err(MatmulError::validation(
            "sparse indices",
            format!(
                "expected one index per block, got {} indices for {} blocks",
                nonzeros,
                data.size(0)
            ),
        ));
    }

    Ok(BlockMatrix {
        rows,
        cols,
        block_size,
        nonzeros,
        data: data.clone(),
        offsets: offsets.clone(),
        indices: indices.clone(),
        transpose_meta: None,
        bitmask: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsm_tensor::{DType, Device, Shape};

    const GPU: Device = Device::Cuda(0);

    fn shape_tensor(rows: i32, cols: i32) -> Tensor {
        Tensor::from_vec(vec![rows, cols], Shape::new(vec![2]), Device::Cpu).unwrap()
    }

    fn vector<T: bsm_tensor::Element>(data: Vec<T>) -> Tensor {
        let n = data.len();
        Tensor::from_vec(data, Shape::new(vec![n]), GPU).unwrap()
    }

    #[test]
    fn test_as_matrix_row_major() {
        let x = Tensor::zeros(Shape::new(vec![128, 256]), DType::F16, GPU);
        let m = as_matrix(&x).unwrap();
        assert_eq!((m.rows, m.cols), (128, 256));
        assert!(m.data.same_storage(&x));
    }

    #[test]
    fn test_as_matrix_transposed_swaps() {
        let x = Tensor::zeros(Shape::new(vec![128, 256]), DType::F16, GPU);
        let m = as_matrix(&x.t().unwrap()).unwrap();
        assert_eq!((m.rows, m.cols), (128, 256));
    }

    #[test]
    fn test_standardize_shape() {
        let s = shape_tensor(256, 512);
        standardize_shape(&s, false).unwrap();
        assert_eq!(s.to_vec::<i32>().unwrap(), vec![256, 512]);
        standardize_shape(&s, true).unwrap();
        assert_eq!(s.to_vec::<i32>().unwrap(), vec![512, 256]);
    }

    #[test]
    fn test_read_transpose_flag() {
        assert!(read_transpose_flag(&Tensor::scalar(1i32, Device::Cpu)).unwrap());
        assert!(!read_transpose_flag(&Tensor::scalar(0i32, Device::Cpu)).unwrap());
        assert!(read_transpose_flag(&Tensor::scalar(1i32, GPU)).is_err());
    }

    #[test]
    fn test_as_block_matrix() {
        let data = Tensor::zeros(Shape::new(vec![2, 128, 128]), DType::F16, GPU);
        let offsets = vector(vec![0i32, 1, 2]);
        let indices = vector(vec![1i16, 0]);
        let m = as_block_matrix(&shape_tensor(256, 256), &data, &offsets, &indices)
            .unwrap();
        assert_eq!((m.rows, m.cols), (256, 256));
        assert_eq!(m.nonzeros, 2);
        assert_eq!(m.block_rows(), 2);
        assert_eq!(m.block_cols(), 2);
        assert!(m.transpose_meta.is_none());
        assert!(m.bitmask.is_none());
    }

    #[test]
    fn test_as_block_matrix_rejects_untiled_shape() {
        let data = Tensor::zeros(Shape::new(vec![0, 128, 128]), DType::F16, GPU);
        let offsets = vector(vec![0i32, 0]);
        let indices = vector(Vec::<i16>::new());
        let r = as_block_matrix(&shape_tensor(100, 128), &data, &offsets, &indices);
        assert!(r.is_err());
    }

    #[test]
    fn test_as_block_matrix_rejects_offset_count() {
        let data = Tensor::zeros(Shape::new(vec![0, 128, 128]), DType::F16, GPU);
        let offsets = vector(vec![0i32, 0]);
        let indices = vector(Vec::<i16>::new());
        let r = as_block_matrix(&shape_tensor(256, 128), &data, &offsets, &indices);
        assert!(r.unwrap_err().to_string().contains("offsets"));
    }

    #[test]
    fn test_as_block_matrix_rejects_index_count() {
        let data = Tensor::zeros(Shape::new(vec![2, 128, 128]), DType::F16, GPU);
        let offsets = vector(vec![0i32, 1]);
        let indices = vector(vec![0i16]);
        let r = as_block_matrix(&shape_tensor(128, 128), &data, &offsets, &indices);
        assert!(r.is_err());
    }

    #[test]
    fn test_as_block_matrix_rejects_negative_extent() {
        let data = Tensor::zeros(Shape::new(vec![0, 128, 128]), DType::F16, GPU);
        let offsets = vector(vec![0i32]);
        let indices = vector(Vec::<i16>::new());
        let r = as_block_matrix(&shape_tensor(-128, 128), &data, &offsets, &indices);
        assert!(r.unwrap_err().to_string().contains("negative"));
    }
}
