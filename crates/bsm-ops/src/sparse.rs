//! Block-sparse matrix value type: buffers plus a logical orientation.

use bsm_tensor::{f16, DType, Device, Shape, Tensor};

use crate::error::{MatmulError, Result};

fn invalid<T>(msg: String) -> Result<T> {
    Err(MatmulError::InvalidMatrix(msg))
}

/// Lightweight structural validation. Returns the data buffer viewed as
/// `[blocks, block, block]`.
fn validate_matrix(size: &Shape, data: &Tensor, indices: &Tensor, offsets: &Tensor) -> Result<Tensor> {
    if size.ndim() < 2 {
        return invalid(format!("expected at least 2 dimensions, got {}", size));
    }
    let mut data = data.clone();
    if data.ndim() == 1 {
        data = data.reshape(Shape::new(vec![data.numel(), 1, 1]))?;
    }
    if data.ndim() < 3 {
        return invalid(format!(
            "expected 3D shape for data (nnz, block, block), got {}D",
            data.ndim()
        ));
    }

    let nd = data.ndim();
    let (bh, bw) = (data.size(nd - 2), data.size(nd - 1));
    if bh != bw {
        return invalid(format!("expected square blocking, got block shape [{}, {}]", bh, bw));
    }
    let block = bw;
    if nd > 3 {
        // Flatten leading batch dimensions; the logical shape lives in `size`.
        let blocks = data.numel() / (block * block).max(1);
        data = data.reshape(Shape::new(vec![blocks, block, block]))?;
    }

    let rows = size.dim(size.ndim() - 2);
    let cols = size.dim(size.ndim() - 1);
    if block == 0 || rows % block != 0 || cols % block != 0 {
        return invalid(format!(
            "matrix shape {} must be divisible by blocking [{}, {}]",
            size, block, block
        ));
    }
    if size.numel() < data.numel() {
        return invalid(format!(
            "number of nonzeros exceeds matrix capacity ({} v. {})",
            data.numel(),
            size.numel()
        ));
    }
    if indices.ndim() != 1 {
        return invalid(format!("expected 1D indices, got {}D indices", indices.ndim()));
    }
    if offsets.ndim() != 1 {
        return invalid(format!("expected 1D offsets, got {}D offsets", offsets.ndim()));
    }
    if indices.numel() != data.size(0) {
        return invalid(format!(
            "expected 1 index per nonzero block, got {} indices for {} blocks",
            indices.numel(),
            data.size(0)
        ));
    }
    let block_rows = size.numel().checked_div(cols).unwrap_or(0) / block;
    if offsets.numel() != block_rows + 1 {
        return invalid(format!(
            "expected one offset per block row plus one, got {} offsets with {} block rows",
            offsets.numel(),
            block_rows
        ));
    }
    if data.device() != indices.device() || data.device() != offsets.device() {
        return invalid(format!(
            "expected data & metadata on a common device, got data on {}, indices on {} and offsets on {}",
            data.device(),
            indices.device(),
            offsets.device()
        ));
    }
    if data.dtype() != DType::F16 {
        return invalid(format!("expected f16 data, got {} data", data.dtype()));
    }
    if indices.dtype() != DType::I16 {
        return invalid(format!("expected i16 indices, got {} indices", indices.dtype()));
    }
    if offsets.dtype() != DType::I32 {
        return invalid(format!("expected i32 offsets, got {} offsets", offsets.dtype()));
    }
    Ok(data)
}

/// A matrix stored in block compressed sparse row (BCSR) format.
///
/// `t()` flips the logical orientation without touching the buffers; the
/// dispatcher derives transpose flags and shape descriptors from it.
#[derive(Debug, Clone)]
pub struct SparseMatrix {
    size: Shape,
    data: Tensor,
    indices: Tensor,
    offsets: Tensor,
    transposed: bool,
}

impl SparseMatrix {
    /// Wrap BCSR buffers describing a matrix of `size`.
    pub fn new(size: Shape, data: Tensor, indices: Tensor, offsets: Tensor) -> Result<Self> {
        let data = validate_matrix(&size, &data, &indices, &offsets)?;
        Ok(SparseMatrix {
            size,
            data,
            indices,
            offsets,
            transposed: false,
        })
    }

    /// Build a matrix from block coordinates, each block filled with one value.
    ///
    /// Blocks may be given in any order; they are stored row-grouped with
    /// ascending columns.
    pub fn from_blocks(
        rows: usize,
        cols: usize,
        block: usize,
        blocks: &[((usize, usize), f16)],
        device: Device,
    ) -> Result<Self> {
        if block == 0 || rows % block != 0 || cols % block != 0 {
            return invalid(format!(
                "[{}x{}] does not tile into {}x{} blocks",
                rows, cols, block, block
            ));
        }
        let block_rows = rows / block;
        let block_cols = cols / block;
        let mut sorted = blocks.to_vec();
        sorted.sort_by_key(|&((r, c), _)| (r, c));
        if let Some(((r, c), _)) = sorted
            .iter()
            .find(|((r, c), _)| *r >= block_rows || *c >= block_cols)
        {
            return invalid(format!(
                "block ({}, {}) is outside a {}x{} block grid",
                r, c, block_rows, block_cols
            ));
        }
        if sorted.windows(2).any(|w| w[0].0 == w[1].0) {
            return invalid("duplicate block coordinates".to_string());
        }
        if exceeds_index_range(block_cols) {
            return invalid(format!("{} block columns do not fit i16 indices", block_cols));
        }

        let mut offsets = vec![0i32; block_rows + 1];
        for ((r, _), _) in &sorted {
            offsets[r + 1] += 1;
        }
        for i in 0..block_rows {
            offsets[i + 1] += offsets[i];
        }
        let indices: Vec<i16> = sorted.iter().map(|((_, c), _)| *c as i16).collect();
        let values = block * block;
        let mut data = Vec::with_capacity(sorted.len() * values);
        for (_, v) in &sorted {
            data.extend(std::iter::repeat(*v).take(values));
        }

        let nnz = sorted.len();
        SparseMatrix::new(
            Shape::new(vec![rows, cols]),
            Tensor::from_vec(data, Shape::new(vec![nnz, block, block]), device)?,
            Tensor::from_vec(indices, Shape::new(vec![nnz]), device)?,
            Tensor::from_vec(offsets, Shape::new(vec![block_rows + 1]), device)?,
        )
    }

    /// Re-run the structural validation.
    pub fn validate(&self) -> Result<()> {
        validate_matrix(&self.storage_size(), &self.data, &self.indices, &self.offsets)?;
        Ok(())
    }

    fn storage_size(&self) -> Shape {
        if self.transposed {
            Shape::new(vec![self.size.dim(1), self.size.dim(0)])
        } else {
            self.size.clone()
        }
    }

    /// Transposed view sharing the same buffers.
    pub fn t(&self) -> Result<SparseMatrix> {
        if self.dim() != 2 {
            return invalid(format!(
                "t() expects a matrix with 2 dimensions, but self is {}D",
                self.dim()
            ));
        }
        Ok(SparseMatrix {
            size: Shape::new(vec![self.size.dim(1), self.size.dim(0)]),
            data: self.data.clone(),
            indices: self.indices.clone(),
            offsets: self.offsets.clone(),
            transposed: !self.transposed,
        })
    }

    /// True unless the matrix is a transposed view.
    pub fn is_contiguous(&self) -> bool {
        !self.transposed
    }

    pub fn is_cuda(&self) -> bool {
        self.data.device().is_cuda()
    }

    pub fn device(&self) -> Device {
        self.data.device()
    }

    /// Logical size, in the matrix's current orientation.
    pub fn size(&self) -> &Shape {
        &self.size
    }

    pub fn dim(&self) -> usize {
        self.size.ndim()
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    pub fn offsets(&self) -> &Tensor {
        &self.offsets
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    /// Number of stored values.
    pub fn nnz(&self) -> usize {
        self.data.numel()
    }

    /// Block dimension.
    pub fn blocking(&self) -> usize {
        self.data.size(1)
    }

    /// Same buffers under a new shape. Only the uncompressed (leading)
    /// dimensions may change.
    pub fn view(&self, shape: Shape) -> Result<SparseMatrix> {
        if !self.is_contiguous() {
            return invalid("view() requires a contiguous matrix".to_string());
        }
        let last = self.size.dim(self.dim() - 1);
        if shape.ndim() == 0 || shape.dim(shape.ndim() - 1) != last {
            return invalid(format!(
                "can't change view on compressed dimension: {} v. {}",
                last, shape
            ));
        }
        if shape.numel() != self.size.numel() {
            return invalid(format!(
                "mismatch in numel of matrix and new shape: {} v. {}",
                self.size.numel(),
                shape.numel()
            ));
        }
        SparseMatrix::new(
            shape,
            self.data.clone(),
            self.indices.clone(),
            self.offsets.clone(),
        )
    }

    /// Copy all buffers to `device`.
    pub fn to(&self, device: Device) -> Result<SparseMatrix> {
        Ok(SparseMatrix {
            size: self.size.clone(),
            data: self.data.to(device)?,
            indices: self.indices.to(device)?,
            offsets: self.offsets.to(device)?,
            transposed: self.transposed,
        })
    }

    /// Host i32 shape descriptor in the logical orientation, with leading
    /// batch dimensions folded into the rows.
    pub fn shape_tensor(&self) -> Result<Tensor> {
        let cols = self.size.dim(self.dim() - 1);
        let rows = self.size.numel() / cols.max(1);
        let extent = |v: usize| {
            i32::try_from(v)
                .map_err(|_| MatmulError::InvalidMatrix(format!("extent {} overflows i32", v)))
        };
        Ok(Tensor::from_vec(
            vec![extent(rows)?, extent(cols)?],
            Shape::new(vec![2]),
            Device::Cpu,
        )?)
    }

    /// Host i32 transpose flag for this matrix's orientation.
    pub fn transpose_tensor(&self) -> Tensor {
        Tensor::scalar(self.transposed as i32, Device::Cpu)
    }
}

fn exceeds_index_range(block_cols: usize) -> bool {
    block_cols > i16::MAX as usize + 1
}
