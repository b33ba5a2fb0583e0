mod context;
mod error;
mod types;

pub use context::*;
pub use error::*;
pub use types::*;

use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::ptr;

use bsm_tensor::{Shape, Tensor};

/// Execute a closure that returns a `BsmStatus`, catching any panics
/// and converting them into `BsmStatus::ErrorInternal`.
fn catch_panic<F: FnOnce() -> BsmStatus>(f: F) -> BsmStatus {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(status) => status,
        Err(_) => {
            set_last_error("internal panic".to_string());
            BsmStatus::ErrorInternal
        }
    }
}

/// Opaque tensor handle.
pub struct BsmTensor {
    pub inner: Tensor,
}

/// Borrow the tensor behind a handle, recording an error if it is null.
unsafe fn tensor<'a>(handle: *const BsmTensor, name: &str) -> Result<&'a Tensor, BsmStatus> {
    if handle.is_null() {
        set_last_error(format!("{} is null", name));
        return Err(BsmStatus::ErrorInvalidArgument);
    }
    Ok(&(*handle).inner)
}

unsafe fn context<'a>(ctx: *const BsmContext) -> Result<&'a BsmContext, BsmStatus> {
    if ctx.is_null() {
        set_last_error("ctx is null".to_string());
        return Err(BsmStatus::ErrorInvalidArgument);
    }
    Ok(&*ctx)
}

fn emit(t: Tensor, out: *mut *mut BsmTensor) -> BsmStatus {
    unsafe {
        *out = Box::into_raw(Box::new(BsmTensor { inner: t }));
    }
    BsmStatus::Ok
}

/// Unwrap a handle lookup inside an FFI body, returning its status on failure.
macro_rules! try_handle {
    ($e:expr) => {
        match $e {
            Ok(v) => v,
            Err(status) => return status,
        }
    };
}

/// Create a contiguous tensor of shape `dims[..ndim]`.
///
/// `numel * element size` bytes are copied from `data`; a null `data`
/// yields a zero-filled tensor. The caller must later call
/// `bsm_tensor_destroy` on `*tensor_out`.
#[no_mangle]
pub unsafe extern "C" fn bsm_tensor_create(
    data: *const c_void,
    dims: *const usize,
    ndim: usize,
    dtype: BsmDType,
    device: BsmDevice,
    tensor_out: *mut *mut BsmTensor,
) -> BsmStatus {
    catch_panic(|| {
        if tensor_out.is_null() || (dims.is_null() && ndim > 0) {
            set_last_error("null argument".to_string());
            return BsmStatus::ErrorInvalidArgument;
        }
        let dims = if ndim == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(dims, ndim) }.to_vec()
        };
        let t = Tensor::zeros(Shape::new(dims), dtype.into(), device.into());
        if !data.is_null() {
            let bytes = t.numel() * t.dtype().size_in_bytes();
            let dst = match t.data_ptr() {
                Ok(p) => p,
                Err(e) => {
                    set_last_error(e.to_string());
                    return BsmStatus::ErrorInternal;
                }
            };
            unsafe { ptr::copy_nonoverlapping(data as *const u8, dst as *mut u8, bytes) };
        }
        emit(t, tensor_out)
    })
}

/// Create a transposed view of a 2-D tensor. The view shares the buffer.
#[no_mangle]
pub unsafe extern "C" fn bsm_tensor_transpose(
    tensor: *const BsmTensor,
    tensor_out: *mut *mut BsmTensor,
) -> BsmStatus {
    catch_panic(|| {
        let t = try_handle!(unsafe { self::tensor(tensor, "tensor") });
        if tensor_out.is_null() {
            set_last_error("tensor_out is null".to_string());
            return BsmStatus::ErrorInvalidArgument;
        }
        match t.t() {
            Ok(view) => emit(view, tensor_out),
            Err(e) => {
                set_last_error(e.to_string());
                BsmStatus::ErrorInvalidArgument
            }
        }
    })
}

/// Copy a tensor's buffer, in storage order, into `dst`.
///
/// `capacity` is the size of `dst` in bytes and must hold the whole buffer.
#[no_mangle]
pub unsafe extern "C" fn bsm_tensor_copy_out(
    tensor: *const BsmTensor,
    dst: *mut c_void,
    capacity: usize,
) -> BsmStatus {
    catch_panic(|| {
        let t = try_handle!(unsafe { self::tensor(tensor, "tensor") });
        let bytes = t.numel() * t.dtype().size_in_bytes();
        if dst.is_null() || capacity < bytes {
            set_last_error(format!("destination must hold {} bytes", bytes));
            return BsmStatus::ErrorInvalidArgument;
        }
        match t.data_ptr() {
            Ok(src) => {
                unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes) };
                BsmStatus::Ok
            }
            Err(e) => {
                set_last_error(e.to_string());
                BsmStatus::ErrorInternal
            }
        }
    })
}

/// Destroy a tensor handle. Other handles viewing the same buffer stay valid.
///
/// Passing a null pointer is a no-op and returns `BsmStatus::Ok`.
#[no_mangle]
pub unsafe extern "C" fn bsm_tensor_destroy(tensor: *mut BsmTensor) -> BsmStatus {
    if tensor.is_null() {
        return BsmStatus::Ok;
    }
    drop(Box::from_raw(tensor));
    BsmStatus::Ok
}

/// Create a dispatch context around a caller-supplied kernel table.
///
/// On success, writes a heap-allocated `BsmContext` pointer into `*ctx_out`
/// and returns `BsmStatus::Ok`. The caller must later call
/// `bsm_context_destroy` to free the context.
#[no_mangle]
pub unsafe extern "C" fn bsm_context_create(
    table: *const BsmKernelTable,
    ctx_out: *mut *mut BsmContext,
) -> BsmStatus {
    catch_panic(|| {
        if table.is_null() || ctx_out.is_null() {
            set_last_error("null argument".to_string());
            return BsmStatus::ErrorInvalidArgument;
        }
        let table = unsafe { *table };
        if table.matmul.is_none() || table.matmul_ex.is_none() {
            set_last_error("kernel table must provide matmul and matmul_ex".to_string());
            return BsmStatus::ErrorInvalidArgument;
        }
        let ctx = Box::new(BsmContext::new(table));
        unsafe {
            *ctx_out = Box::into_raw(ctx);
        }
        BsmStatus::Ok
    })
}

/// Destroy a context previously created by `bsm_context_create`.
///
/// Passing a null pointer is a no-op and returns `BsmStatus::Ok`.
#[no_mangle]
pub unsafe extern "C" fn bsm_context_destroy(ctx: *mut BsmContext) -> BsmStatus {
    if ctx.is_null() {
        return BsmStatus::Ok;
    }
    drop(Box::from_raw(ctx));
    BsmStatus::Ok
}

/// out = op(a) x op(b) with a sparse `a` and dense `b`, `out`.
///
/// `shape` is a host i32 pair describing `a` as consumed; it is rewritten
/// in place to the stored extents when `transpose_a` is nonzero.
#[no_mangle]
pub unsafe extern "C" fn bsm_dsd(
    ctx: *const BsmContext,
    shape: *const BsmTensor,
    data: *const BsmTensor,
    offsets: *const BsmTensor,
    indices: *const BsmTensor,
    transpose_a: *const BsmTensor,
    b: *const BsmTensor,
    out: *const BsmTensor,
) -> BsmStatus {
    catch_panic(|| unsafe {
        let ctx = try_handle!(context(ctx));
        report(ctx.dispatcher.dsd(
            try_handle!(tensor(shape, "shape")),
            try_handle!(tensor(data, "data")),
            try_handle!(tensor(offsets, "offsets")),
            try_handle!(tensor(indices, "indices")),
            try_handle!(tensor(transpose_a, "transpose_a")),
            try_handle!(tensor(b, "b")),
            try_handle!(tensor(out, "out")),
        ))
    })
}

/// out = op(a) x op(b) with a dense `a`, `out` and sparse `b`.
#[no_mangle]
pub unsafe extern "C" fn bsm_dds(
    ctx: *const BsmContext,
    a: *const BsmTensor,
    shape: *const BsmTensor,
    data: *const BsmTensor,
    offsets: *const BsmTensor,
    indices: *const BsmTensor,
    transpose_b: *const BsmTensor,
    out: *const BsmTensor,
) -> BsmStatus {
    catch_panic(|| unsafe {
        let ctx = try_handle!(context(ctx));
        report(ctx.dispatcher.dds(
            try_handle!(tensor(a, "a")),
            try_handle!(tensor(shape, "shape")),
            try_handle!(tensor(data, "data")),
            try_handle!(tensor(offsets, "offsets")),
            try_handle!(tensor(indices, "indices")),
            try_handle!(tensor(transpose_b, "transpose_b")),
            try_handle!(tensor(out, "out")),
        ))
    })
}

/// Sampled product of dense `a` and `b`, written into the blocks of the
/// sparse output.
#[no_mangle]
pub unsafe extern "C" fn bsm_sdd(
    ctx: *const BsmContext,
    a: *const BsmTensor,
    b: *const BsmTensor,
    shape: *const BsmTensor,
    data: *const BsmTensor,
    offsets: *const BsmTensor,
    indices: *const BsmTensor,
) -> BsmStatus {
    catch_panic(|| unsafe {
        let ctx = try_handle!(context(ctx));
        report(ctx.dispatcher.sdd(
            try_handle!(tensor(a, "a")),
            try_handle!(tensor(b, "b")),
            try_handle!(tensor(shape, "shape")),
            try_handle!(tensor(data, "data")),
            try_handle!(tensor(offsets, "offsets")),
            try_handle!(tensor(indices, "indices")),
        ))
    })
}

/// Product of sparse `a` and dense `b`, written into the blocks of the
/// sparse output.
#[no_mangle]
pub unsafe extern "C" fn bsm_ssd(
    ctx: *const BsmContext,
    a_shape: *const BsmTensor,
    a_data: *const BsmTensor,
    a_offsets: *const BsmTensor,
    a_indices: *const BsmTensor,
    transpose_a: *const BsmTensor,
    b: *const BsmTensor,
    out_shape: *const BsmTensor,
    out_data: *const BsmTensor,
    out_offsets: *const BsmTensor,
    out_indices: *const BsmTensor,
) -> BsmStatus {
    catch_panic(|| unsafe {
        let ctx = try_handle!(context(ctx));
        report(ctx.dispatcher.ssd(
            try_handle!(tensor(a_shape, "a_shape")),
            try_handle!(tensor(a_data, "a_data")),
            try_handle!(tensor(a_offsets, "a_offsets")),
            try_handle!(tensor(a_indices, "a_indices")),
            try_handle!(tensor(transpose_a, "transpose_a")),
            try_handle!(tensor(b, "b")),
            try_handle!(tensor(out_shape, "out_shape")),
            try_handle!(tensor(out_data, "out_data")),
            try_handle!(tensor(out_offsets, "out_offsets")),
            try_handle!(tensor(out_indices, "out_indices")),
        ))
    })
}

/// out = op(a) x op(b) with sparse `a`, `b` and a dense `out`.
#[no_mangle]
pub unsafe extern "C" fn bsm_dss(
    ctx: *const BsmContext,
    a_shape: *const BsmTensor,
    a_data: *const BsmTensor,
    a_offsets: *const BsmTensor,
    a_indices: *const BsmTensor,
    transpose_a: *const BsmTensor,
    b_shape: *const BsmTensor,
    b_data: *const BsmTensor,
    b_offsets: *const BsmTensor,
    b_indices: *const BsmTensor,
    transpose_b: *const BsmTensor,
    out: *const BsmTensor,
) -> BsmStatus {
    catch_panic(|| unsafe {
        let ctx = try_handle!(context(ctx));
        report(ctx.dispatcher.dss(
            try_handle!(tensor(a_shape, "a_shape")),
            try_handle!(tensor(a_data, "a_data")),
            try_handle!(tensor(a_offsets, "a_offsets")),
            try_handle!(tensor(a_indices, "a_indices")),
            try_handle!(tensor(transpose_a, "transpose_a")),
            try_handle!(tensor(b_shape, "b_shape")),
            try_handle!(tensor(b_data, "b_data")),
            try_handle!(tensor(b_offsets, "b_offsets")),
            try_handle!(tensor(b_indices, "b_indices")),
            try_handle!(tensor(transpose_b, "transpose_b")),
            try_handle!(tensor(out, "out")),
        ))
    })
}

/// Retrieve the last error message.
///
/// Returns a pointer to a C string describing the most recent error, or
/// null if no error has occurred. The caller must free the returned string
/// with `bsm_free_string`.
#[no_mangle]
pub extern "C" fn bsm_last_error() -> *const c_char {
    match error::take_last_error() {
        Some(e) => e.into_raw(),
        None => std::ptr::null(),
    }
}

/// Free a string previously returned by `bsm_last_error`.
#[no_mangle]
pub unsafe extern "C" fn bsm_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;
    use std::sync::atomic::{AtomicI32, Ordering};

    const GPU: BsmDevice = BsmDevice {
        kind: BsmDeviceKind::Cuda,
        ordinal: 0,
    };
    const HOST: BsmDevice = BsmDevice {
        kind: BsmDeviceKind::Cpu,
        ordinal: 0,
    };

    /// Counts calls: +1 per plain multiply, +100 per extended multiply.
    /// Fails with status 7 when the dense lhs has 384 buffer rows.
    unsafe extern "C" fn plain(problem: *const BsmProblem, user_data: *mut c_void) -> i32 {
        let calls = &*(user_data as *const AtomicI32);
        calls.fetch_add(1, Ordering::SeqCst);
        let p = &*problem;
        if p.lhs.kind == BsmMatrixKind::Dense && p.lhs.dense.rows == 384 {
            return 7;
        }
        0
    }

    unsafe extern "C" fn extended(problem: *const BsmProblem, user_data: *mut c_void) -> i32 {
        let calls = &*(user_data as *const AtomicI32);
        calls.fetch_add(100, Ordering::SeqCst);
        let p = &*problem;
        if p.lhs.kind == BsmMatrixKind::Sparse && p.lhs.sparse.indices_t.is_null() {
            return 9;
        }
        0
    }

    unsafe extern "C" fn text(_code: i32, _user_data: *mut c_void) -> *const c_char {
        b"kernel exploded\0".as_ptr() as *const c_char
    }

    fn create<T>(data: &[T], dims: &[usize], dtype: BsmDType, device: BsmDevice) -> *mut BsmTensor {
        let mut out = ptr::null_mut();
        let status = unsafe {
            bsm_tensor_create(
                data.as_ptr() as *const c_void,
                dims.as_ptr(),
                dims.len(),
                dtype,
                device,
                &mut out,
            )
        };
        assert_eq!(status, BsmStatus::Ok);
        out
    }

    fn zeros(dims: &[usize], dtype: BsmDType, device: BsmDevice) -> *mut BsmTensor {
        let mut out = ptr::null_mut();
        let status = unsafe {
            bsm_tensor_create(ptr::null(), dims.as_ptr(), dims.len(), dtype, device, &mut out)
        };
        assert_eq!(status, BsmStatus::Ok);
        out
    }

    fn context(calls: &AtomicI32) -> *mut BsmContext {
        let table = BsmKernelTable {
            matmul: Some(plain),
            matmul_ex: Some(extended),
            status_text: Some(text),
            user_data: calls as *const AtomicI32 as *mut c_void,
        };
        let mut ctx = ptr::null_mut();
        assert_eq!(unsafe { bsm_context_create(&table, &mut ctx) }, BsmStatus::Ok);
        ctx
    }

    fn last_error() -> String {
        let msg = bsm_last_error();
        assert!(!msg.is_null());
        let s = unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned();
        unsafe { bsm_free_string(msg as *mut c_char) };
        s
    }

    struct Sparse {
        shape: *mut BsmTensor,
        data: *mut BsmTensor,
        offsets: *mut BsmTensor,
        indices: *mut BsmTensor,
    }

    /// 256x256 with blocks at (0, 1) and (1, 0).
    fn checkerboard() -> Sparse {
        Sparse {
            shape: create(&[256i32, 256], &[2], BsmDType::I32, HOST),
            data: zeros(&[2, 128, 128], BsmDType::F16, GPU),
            offsets: create(&[0i32, 1, 2], &[3], BsmDType::I32, GPU),
            indices: create(&[1i16, 0], &[2], BsmDType::I16, GPU),
        }
    }

    #[test]
    fn test_tensor_round_trip() {
        let t = create(&[1i32, 2, 3, 4, 5, 6], &[2, 3], BsmDType::I32, HOST);
        let mut view = ptr::null_mut();
        assert_eq!(unsafe { bsm_tensor_transpose(t, &mut view) }, BsmStatus::Ok);
        assert_eq!(unsafe { (*view).inner.dims() }, &[3, 2]);
        let mut out = [0i32; 6];
        let status = unsafe { bsm_tensor_copy_out(view, out.as_mut_ptr() as *mut c_void, 24) };
        assert_eq!(status, BsmStatus::Ok);
        assert_eq!(out, [1, 2, 3, 4, 5, 6]);
        let status = unsafe { bsm_tensor_copy_out(t, out.as_mut_ptr() as *mut c_void, 8) };
        assert_eq!(status, BsmStatus::ErrorInvalidArgument);
        unsafe {
            bsm_tensor_destroy(view);
            bsm_tensor_destroy(t);
        }
    }

    #[test]
    fn test_context_requires_both_kernels() {
        let table = BsmKernelTable {
            matmul: Some(plain),
            matmul_ex: None,
            status_text: None,
            user_data: ptr::null_mut(),
        };
        let mut ctx = ptr::null_mut();
        let status = unsafe { bsm_context_create(&table, &mut ctx) };
        assert_eq!(status, BsmStatus::ErrorInvalidArgument);
        assert!(ctx.is_null());
        assert!(last_error().contains("matmul_ex"));
    }

    #[test]
    fn test_dsd_dispatches_to_kernels() {
        let calls = AtomicI32::new(0);
        let ctx = context(&calls);
        let a = checkerboard();
        let b = zeros(&[256, 64], BsmDType::F16, GPU);
        let out = zeros(&[256, 64], BsmDType::F16, GPU);

        let no = create(&[0i32], &[1], BsmDType::I32, HOST);
        let status = unsafe { bsm_dsd(ctx, a.shape, a.data, a.offsets, a.indices, no, b, out) };
        assert_eq!(status, BsmStatus::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let yes = create(&[1i32], &[1], BsmDType::I32, HOST);
        let status = unsafe { bsm_dsd(ctx, a.shape, a.data, a.offsets, a.indices, yes, b, out) };
        assert_eq!(status, BsmStatus::Ok);
        assert_eq!(calls.load(Ordering::SeqCst), 101);

        unsafe { bsm_context_destroy(ctx) };
    }

    #[test]
    fn test_status_mapping() {
        let calls = AtomicI32::new(0);
        let ctx = context(&calls);
        let a = checkerboard();
        let no = create(&[0i32], &[1], BsmDType::I32, HOST);

        // Host-resident dense operand.
        let host_b = zeros(&[256, 64], BsmDType::F16, HOST);
        let out = zeros(&[256, 64], BsmDType::F16, GPU);
        let status = unsafe { bsm_dsd(ctx, a.shape, a.data, a.offsets, a.indices, no, host_b, out) };
        assert_eq!(status, BsmStatus::ErrorValidation);
        assert!(last_error().contains("device memory"));

        // Inner dimensions disagree.
        let tall_b = zeros(&[512, 64], BsmDType::F16, GPU);
        let status = unsafe { bsm_dsd(ctx, a.shape, a.data, a.offsets, a.indices, no, tall_b, out) };
        assert_eq!(status, BsmStatus::ErrorIncompatible);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Kernel failure carries the status text.
        let lhs = zeros(&[384, 256], BsmDType::F16, GPU);
        let rhs = zeros(&[256, 256], BsmDType::F16, GPU);
        let sout = Sparse {
            shape: create(&[384i32, 256], &[2], BsmDType::I32, HOST),
            data: zeros(&[1, 128, 128], BsmDType::F16, GPU),
            offsets: create(&[0i32, 1, 1, 1], &[4], BsmDType::I32, GPU),
            indices: create(&[0i16], &[1], BsmDType::I16, GPU),
        };
        let status = unsafe {
            bsm_sdd(ctx, lhs, rhs, sout.shape, sout.data, sout.offsets, sout.indices)
        };
        assert_eq!(status, BsmStatus::ErrorBackend);
        assert!(last_error().contains("kernel exploded"));

        let status = unsafe { bsm_dsd(ctx, ptr::null(), a.data, a.offsets, a.indices, no, rhs, out) };
        assert_eq!(status, BsmStatus::ErrorInvalidArgument);
        assert!(last_error().contains("shape"));

        unsafe { bsm_context_destroy(ctx) };
    }
}
