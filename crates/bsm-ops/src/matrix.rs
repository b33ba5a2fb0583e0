//! Non-owning matrix views handed to the compute backend.

use bsm_tensor::{ArrayBackend, DType, Device, Tensor};

use crate::error::Result;

/// The only block dimension the kernels are built for.
pub const SUPPORTED_BLOCK_SIZE: usize = 128;

/// Square block dimension of a block-sparse matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSize {
    /// 128x128 blocks.
    B128,
}

impl BlockSize {
    /// Map a block dimension onto a supported block size.
    pub fn from_dim(dim: usize) -> Option<BlockSize> {
        match dim {
            SUPPORTED_BLOCK_SIZE => Some(BlockSize::B128),
            _ => None,
        }
    }

    /// Block dimension in elements.
    pub fn as_usize(self) -> usize {
        match self {
            BlockSize::B128 => 128,
        }
    }

    /// Number of values in one block.
    pub fn values_per_block(self) -> usize {
        self.as_usize() * self.as_usize()
    }

    /// Size in bytes of one block payload of `dtype`.
    pub fn bytes_per_block(self, dtype: DType) -> usize {
        self.values_per_block() * dtype.size_in_bytes()
    }
}

/// Dense matrix view: extents plus a shared handle to caller memory.
#[derive(Debug, Clone)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Tensor,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Tensor) -> Self {
        Matrix { rows, cols, data }
    }
}

/// Column-grouped indexing of a row-grouped block-sparse matrix.
///
/// Payloads are not moved: `block_offsets_t[i]` is the byte offset, in the
/// original data buffer, of the i-th block in column-grouped order.
#[derive(Debug, Clone)]
pub struct TransposeMeta {
    /// i16 block-row index of each block, ordered by (column, row).
    pub indices_t: Tensor,
    /// i32 per-column block offsets, length block_cols + 1.
    pub offsets_t: Tensor,
    /// i32 byte offset of each block in the original data buffer.
    pub block_offsets_t: Tensor,
    /// Size of one block payload in bytes.
    pub bytes_per_block: usize,
}

impl TransposeMeta {
    /// `offsets_t` scaled to byte offsets into a column-grouped payload.
    pub fn byte_offsets_t(&self, runtime: &dyn ArrayBackend) -> Result<Tensor> {
        Ok(self
            .offsets_t
            .mul_scalar(self.bytes_per_block as i64, runtime)?)
    }
}

/// Block-sparse matrix view in row-grouped (BCSR) form.
#[derive(Debug, Clone)]
pub struct BlockMatrix {
    pub rows: usize,
    pub cols: usize,
    pub block_size: BlockSize,
    pub nonzeros: usize,
    /// f16 payloads, `[nonzeros, block, block]`.
    pub data: Tensor,
    /// i32 block-row offsets, length block_rows + 1.
    pub offsets: Tensor,
    /// i16 block-column index of each block.
    pub indices: Tensor,
    pub transpose_meta: Option<TransposeMeta>,
    /// Backend scratch for block-pair coverage.
    pub bitmask: Option<Tensor>,
}

impl BlockMatrix {
    pub fn block_rows(&self) -> usize {
        self.rows / self.block_size.as_usize()
    }

    pub fn block_cols(&self) -> usize {
        self.cols / self.block_size.as_usize()
    }
}

/// One operand (or the output) of a multiplication.
#[derive(Debug, Clone)]
pub enum MatrixView {
    Dense(Matrix),
    Sparse(BlockMatrix),
}

impl MatrixView {
    pub fn rows(&self) -> usize {
        match self {
            MatrixView::Dense(m) => m.rows,
            MatrixView::Sparse(m) => m.rows,
        }
    }

    pub fn cols(&self) -> usize {
        match self {
            MatrixView::Dense(m) => m.cols,
            MatrixView::Sparse(m) => m.cols,
        }
    }

    /// Extents after applying `transpose`.
    pub fn oriented(&self, transpose: bool) -> (usize, usize) {
        if transpose {
            (self.cols(), self.rows())
        } else {
            (self.rows(), self.cols())
        }
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self, MatrixView::Sparse(_))
    }

    pub fn as_sparse(&self) -> Option<&BlockMatrix> {
        match self {
            MatrixView::Sparse(m) => Some(m),
            MatrixView::Dense(_) => None,
        }
    }

    pub fn device(&self) -> Device {
        match self {
            MatrixView::Dense(m) => m.data.device(),
            MatrixView::Sparse(m) => m.data.device(),
        }
    }
}

/// A fully assembled multiplication: out = op(lhs) x op(rhs).
#[derive(Debug, Clone)]
pub struct Problem {
    pub lhs: MatrixView,
    pub transpose_lhs: bool,
    pub rhs: MatrixView,
    pub transpose_rhs: bool,
    pub out: MatrixView,
}

impl Problem {
    /// Reason the problem cannot be executed, or `None` if it is well formed.
    ///
    /// Checks dimension agreement under the requested orientations and that
    /// every sparse participant uses the same blocking.
    pub fn incompatibility(&self) -> Option<String> {
        let (m, k) = self.lhs.oriented(self.transpose_lhs);
        let (k2, n) = self.rhs.oriented(self.transpose_rhs);
        if k != k2 {
            return Some(format!(
                "inner dimensions disagree: [{}x{}] @ [{}x{}]",
                m, k, k2, n
            ));
        }
        if self.out.rows() != m || self.out.cols() != n {
            return Some(format!(
                "output is [{}x{}] but the product is [{}x{}]",
                self.out.rows(),
                self.out.cols(),
                m,
                n
            ));
        }

        let mut block_sizes = [&self.lhs, &self.rhs, &self.out]
            .into_iter()
            .filter_map(|v| v.as_sparse().map(|s| s.block_size));
        if let Some(first) = block_sizes.next() {
            if let Some(other) = block_sizes.find(|b| *b != first) {
                return Some(format!(
                    "sparse participants disagree on blocking: {} vs {}",
                    first.as_usize(),
                    other.as_usize()
                ));
            }
            // A dense inner dimension must tile into whole blocks.
            if k % first.as_usize() != 0 {
                return Some(format!(
                    "inner dimension {} is not a multiple of the block size {}",
                    k,
                    first.as_usize()
                ));
            }
        }
        None
    }

    /// True if any operand carries synthesized transpose metadata.
    pub fn has_transpose_meta(&self) -> bool {
        [&self.lhs, &self.rhs]
            .into_iter()
            .filter_map(MatrixView::as_sparse)
            .any(|m| m.transpose_meta.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bsm_tensor::Shape;

    fn dense(rows: usize, cols: usize) -> MatrixView {
        let t = Tensor::zeros(Shape::new(vec![rows, cols]), DType::F16, Device::Cuda(0));
        MatrixView::Dense(Matrix::new(rows, cols, t))
    }

    fn sparse(rows: usize, cols: usize) -> MatrixView {
        let dev = Device::Cuda(0);
        MatrixView::Sparse(BlockMatrix {
            rows,
            cols,
            block_size: BlockSize::B128,
            nonzeros: 0,
            data: Tensor::zeros(Shape::new(vec![0, 128, 128]), DType::F16, dev),
            offsets: Tensor::zeros(Shape::new(vec![rows / 128 + 1]), DType::I32, dev),
            indices: Tensor::zeros(Shape::new(vec![0]), DType::I16, dev),
            transpose_meta: None,
            bitmask: None,
        })
    }

    #[test]
    fn test_block_size() {
        assert_eq!(BlockSize::from_dim(128), Some(BlockSize::B128));
        assert_eq!(BlockSize::from_dim(64), None);
        assert_eq!(BlockSize::B128.values_per_block(), 16384);
        assert_eq!(BlockSize::B128.bytes_per_block(DType::F16), 32768);
    }

    #[test]
    fn test_oriented() {
        let v = dense(2, 3);
        assert_eq!(v.oriented(false), (2, 3));
        assert_eq!(v.oriented(true), (3, 2));
    }

    #[test]
    fn test_compatible_problem() {
        let p = Problem {
            lhs: sparse(256, 384),
            transpose_lhs: false,
            rhs: dense(384, 64),
            transpose_rhs: false,
            out: dense(256, 64),
        };
        assert!(p.incompatibility().is_none());
        assert!(!p.has_transpose_meta());
    }

    #[test]
    fn test_transposed_operand_changes_agreement() {
        let p = Problem {
            lhs: sparse(384, 256),
            transpose_lhs: true,
            rhs: dense(384, 64),
            transpose_rhs: false,
            out: dense(256, 64),
        };
        assert!(p.incompatibility().is_none());
    }

    #[test]
    fn test_inner_dimension_mismatch() {
        let p = Problem {
            lhs: sparse(256, 256),
            transpose_lhs: false,
            rhs: dense(128, 64),
            transpose_rhs: false,
            out: dense(256, 64),
        };
        let reason = p.incompatibility().unwrap();
        assert!(reason.contains("inner dimensions"));
    }

    #[test]
    fn test_output_mismatch() {
        let p = Problem {
            lhs: dense(256, 128),
            transpose_lhs: false,
            rhs: dense(128, 256),
            transpose_rhs: false,
            out: sparse(128, 256),
        };
        assert!(p.incompatibility().unwrap().contains("output"));
    }

    #[test]
    fn test_dense_inner_dimension_must_tile() {
        let p = Problem {
            lhs: dense(256, 100),
            transpose_lhs: false,
            rhs: dense(100, 256),
            transpose_rhs: false,
            out: sparse(256, 256),
        };
        assert!(p.incompatibility().unwrap().contains("multiple"));
    }
}
