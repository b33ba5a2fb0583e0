use std::os::raw::{c_char, c_void};
use std::ptr;

use bsm_ops::{BlockMatrix, MatrixView, Problem};
use bsm_tensor::{DType, Device, Stream, Tensor};

/// Status codes returned by all FFI functions.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BsmStatus {
    Ok = 0,
    ErrorInvalidArgument = 1,
    ErrorValidation = 2,
    ErrorIncompatible = 3,
    ErrorBackend = 4,
    ErrorInternal = 5,
}

/// Element type selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BsmDType {
    F16 = 0,
    F32 = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
}

impl From<BsmDType> for DType {
    fn from(dtype: BsmDType) -> DType {
        match dtype {
            BsmDType::F16 => DType::F16,
            BsmDType::F32 => DType::F32,
            BsmDType::I8 => DType::I8,
            BsmDType::I16 => DType::I16,
            BsmDType::I32 => DType::I32,
            BsmDType::I64 => DType::I64,
        }
    }
}

/// Memory space selector.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BsmDeviceKind {
    Cpu = 0,
    Cuda = 1,
}

/// A device: host memory, or an accelerator by ordinal.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BsmDevice {
    pub kind: BsmDeviceKind,
    pub ordinal: u32,
}

impl From<BsmDevice> for Device {
    fn from(device: BsmDevice) -> Device {
        match device.kind {
            BsmDeviceKind::Cpu => Device::Cpu,
            BsmDeviceKind::Cuda => Device::Cuda(device.ordinal),
        }
    }
}

impl From<Device> for BsmDevice {
    fn from(device: Device) -> BsmDevice {
        match device {
            Device::Cpu => BsmDevice {
                kind: BsmDeviceKind::Cpu,
                ordinal: 0,
            },
            Device::Cuda(ordinal) => BsmDevice {
                kind: BsmDeviceKind::Cuda,
                ordinal,
            },
        }
    }
}

/// Storage kind of a matrix descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BsmMatrixKind {
    Dense = 0,
    Sparse = 1,
}

/// A dense operand as seen by the kernels.
///
/// `rows` and `cols` are the extents of the contiguous buffer; the transpose
/// flag of the problem says how it is consumed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BsmDenseDesc {
    pub rows: usize,
    pub cols: usize,
    pub data: *mut c_void,
}

/// A block-sparse operand as seen by the kernels.
///
/// The `*_t` pointers and `bitmask` are null unless the dispatcher attached
/// transpose metadata or bitmask scratch to this operand.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BsmSparseDesc {
    pub rows: usize,
    pub cols: usize,
    pub block_size: usize,
    pub nonzeros: usize,
    pub data: *mut c_void,
    pub offsets: *mut c_void,
    pub indices: *mut c_void,
    pub indices_t: *mut c_void,
    pub offsets_t: *mut c_void,
    pub block_offsets_t: *mut c_void,
    pub bitmask: *mut c_void,
    pub bitmask_bytes: usize,
}

/// One participant of a multiplication. Only the member matching `kind` is
/// meaningful; the other is zeroed.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BsmMatrixDesc {
    pub kind: BsmMatrixKind,
    pub dense: BsmDenseDesc,
    pub sparse: BsmSparseDesc,
}

/// A fully assembled multiplication: out = op(lhs) x op(rhs).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BsmProblem {
    pub lhs: BsmMatrixDesc,
    pub transpose_lhs: bool,
    pub rhs: BsmMatrixDesc,
    pub transpose_rhs: bool,
    pub out: BsmMatrixDesc,
    pub device: BsmDevice,
    pub stream: u64,
}

/// Kernel entry point. Returns zero on success, a backend status code otherwise.
pub type BsmMatmulFn =
    Option<unsafe extern "C" fn(problem: *const BsmProblem, user_data: *mut c_void) -> i32>;

/// Describes a non-zero status code returned by a kernel entry point.
pub type BsmStatusTextFn =
    Option<unsafe extern "C" fn(code: i32, user_data: *mut c_void) -> *const c_char>;

/// The compute backend, supplied by the caller.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BsmKernelTable {
    pub matmul: BsmMatmulFn,
    pub matmul_ex: BsmMatmulFn,
    pub status_text: BsmStatusTextFn,
    pub user_data: *mut c_void,
}

fn pointer(t: &Tensor) -> bsm_ops::Result<*mut c_void> {
    Ok(t.data_ptr()?)
}

fn optional_pointer(t: Option<&Tensor>) -> bsm_ops::Result<*mut c_void> {
    t.map_or(Ok(ptr::null_mut()), pointer)
}

const EMPTY_DENSE: BsmDenseDesc = BsmDenseDesc {
    rows: 0,
    cols: 0,
    data: ptr::null_mut(),
};

const EMPTY_SPARSE: BsmSparseDesc = BsmSparseDesc {
    rows: 0,
    cols: 0,
    block_size: 0,
    nonzeros: 0,
    data: ptr::null_mut(),
    offsets: ptr::null_mut(),
    indices: ptr::null_mut(),
    indices_t: ptr::null_mut(),
    offsets_t: ptr::null_mut(),
    block_offsets_t: ptr::null_mut(),
    bitmask: ptr::null_mut(),
    bitmask_bytes: 0,
};

impl BsmSparseDesc {
    fn describe(m: &BlockMatrix) -> bsm_ops::Result<Self> {
        let meta = m.transpose_meta.as_ref();
        Ok(BsmSparseDesc {
            rows: m.rows,
            cols: m.cols,
            block_size: m.block_size.as_usize(),
            nonzeros: m.nonzeros,
            data: pointer(&m.data)?,
            offsets: pointer(&m.offsets)?,
            indices: pointer(&m.indices)?,
            indices_t: optional_pointer(meta.map(|t| &t.indices_t))?,
            offsets_t: optional_pointer(meta.map(|t| &t.offsets_t))?,
            block_offsets_t: optional_pointer(meta.map(|t| &t.block_offsets_t))?,
            bitmask: optional_pointer(m.bitmask.as_ref())?,
            bitmask_bytes: m.bitmask.as_ref().map_or(0, Tensor::numel),
        })
    }
}

impl BsmMatrixDesc {
    fn describe(view: &MatrixView) -> bsm_ops::Result<Self> {
        Ok(match view {
            MatrixView::Dense(m) => BsmMatrixDesc {
                kind: BsmMatrixKind::Dense,
                dense: BsmDenseDesc {
                    rows: m.rows,
                    cols: m.cols,
                    data: pointer(&m.data)?,
                },
                sparse: EMPTY_SPARSE,
            },
            MatrixView::Sparse(m) => BsmMatrixDesc {
                kind: BsmMatrixKind::Sparse,
                dense: EMPTY_DENSE,
                sparse: BsmSparseDesc::describe(m)?,
            },
        })
    }
}

impl BsmProblem {
    /// Describe `problem` for a kernel running on `stream`.
    ///
    /// The pointers stay valid while `problem` is alive.
    pub fn describe(problem: &Problem, stream: &Stream) -> bsm_ops::Result<Self> {
        Ok(BsmProblem {
            lhs: BsmMatrixDesc::describe(&problem.lhs)?,
            transpose_lhs: problem.transpose_lhs,
            rhs: BsmMatrixDesc::describe(&problem.rhs)?,
            transpose_rhs: problem.transpose_rhs,
            out: BsmMatrixDesc::describe(&problem.out)?,
            device: stream.device.into(),
            stream: stream.id,
        })
    }
}
