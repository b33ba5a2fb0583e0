//! Preconditions every caller-supplied buffer must satisfy before it is trusted.

use bsm_tensor::{DType, Layout, Tensor};

use crate::backend::as_block_size;
use crate::error::{MatmulError, Result};

fn check_cuda(x: &Tensor, what: &'static str) -> Result<()> {
    if !x.device().is_cuda() {
        return Err(MatmulError::validation(
            what,
            format!("expected device memory, got {}", x.device()),
        ));
    }
    Ok(())
}

fn check_cpu(x: &Tensor, what: &'static str) -> Result<()> {
    if x.device().is_cuda() {
        return Err(MatmulError::validation(
            what,
            format!("expected host memory, got {}", x.device()),
        ));
    }
    Ok(())
}

fn check_dtype(x: &Tensor, dtype: DType, what: &'static str) -> Result<()> {
    if x.dtype() != dtype {
        return Err(MatmulError::validation(
            what,
            format!("expected {} elements, got {}", dtype, x.dtype()),
        ));
    }
    Ok(())
}

fn check_ndim(x: &Tensor, ndim: usize, what: &'static str) -> Result<()> {
    if x.ndim() != ndim {
        return Err(MatmulError::validation(
            what,
            format!("expected {} dimensions, got {}", ndim, x.ndim()),
        ));
    }
    Ok(())
}

fn check_numel(x: &Tensor, numel: usize, what: &'static str) -> Result<()> {
    if x.numel() != numel {
        return Err(MatmulError::validation(
            what,
            format!("expected {} elements, got {}", numel, x.numel()),
        ));
    }
    Ok(())
}

/// A shape descriptor is a host-resident pair of i32 extents.
pub fn validate_shape(shape: &Tensor) -> Result<()> {
    check_cpu(shape, "shape")?;
    check_numel(shape, 2, "shape")?;
    check_dtype(shape, DType::I32, "shape")
}

/// A transpose flag is a host-resident i32 scalar.
pub fn validate_transpose(transpose: &Tensor) -> Result<()> {
    check_cpu(transpose, "transpose flag")?;
    check_numel(transpose, 1, "transpose flag")?;
    check_dtype(transpose, DType::I32, "transpose flag")
}

/// Validate the (shape, data, offsets, indices) tuple of a sparse operand.
pub fn validate_sparse(
    shape: &Tensor,
    data: &Tensor,
    offsets: &Tensor,
    indices: &Tensor,
) -> Result<()> {
    validate_shape(shape)?;
    check_cuda(data, "sparse data")?;
    check_ndim(data, 3, "sparse data")?;
    check_dtype(data, DType::F16, "sparse data")?;
    check_cuda(offsets, "sparse offsets")?;
    check_ndim(offsets, 1, "sparse offsets")?;
    check_dtype(offsets, DType::I32, "sparse offsets")?;
    check_cuda(indices, "sparse indices")?;
    check_ndim(indices, 1, "sparse indices")?;
    check_dtype(indices, DType::I16, "sparse indices")?;

    if data.size(1) != data.size(2) {
        return Err(MatmulError::validation(
            "sparse data",
            format!("blocks must be square, got {}x{}", data.size(1), data.size(2)),
        ));
    }
    as_block_size(data.size(1))?;
    Ok(())
}

/// True if `x` is a pure transpose view of a contiguous buffer.
pub fn is_transposed(x: &Tensor) -> bool {
    x.layout() == Layout::Transposed
}

/// A dense operand is a 2-D f16 device buffer, contiguous or transposed.
pub fn validate_dense(x: &Tensor) -> Result<()> {
    check_cuda(x, "dense operand")?;
    check_ndim(x, 2, "dense operand")?;
    check_dtype(x, DType::F16, "dense operand")?;
    if x.layout() == Layout::Strided {
        return Err(MatmulError::validation(
            "dense operand",
            format!(
                "expected a contiguous or transposed layout, got strides {:?} for dims {:?}",
                x.strides(),
                x.dims()
            ),
        ));
    }
    Ok(())
}
