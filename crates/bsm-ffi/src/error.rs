use std::cell::RefCell;
use std::ffi::CString;

use bsm_ops::MatmulError;

use crate::types::BsmStatus;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Store an error message for later retrieval via `bsm_last_error`.
pub fn set_last_error(msg: String) {
    LAST_ERROR.with(|e| {
        *e.borrow_mut() = CString::new(msg).ok();
    });
}

/// Take the last error message, leaving `None` in its place.
pub fn take_last_error() -> Option<CString> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

/// Status code for a failed dispatch.
pub fn status_of(err: &MatmulError) -> BsmStatus {
    match err {
        MatmulError::IncompatibleProblem(_) => BsmStatus::ErrorIncompatible,
        MatmulError::Backend { .. } => BsmStatus::ErrorBackend,
        MatmulError::Tensor(_) => BsmStatus::ErrorInternal,
        MatmulError::Validation { .. }
        | MatmulError::UnsupportedBlockSize(_)
        | MatmulError::RowBoundExceeded { .. }
        | MatmulError::OffsetOverflow { .. }
        | MatmulError::InvalidMatrix(_) => BsmStatus::ErrorValidation,
    }
}

/// Record `result`'s error, if any, and convert it into a status code.
pub fn report(result: bsm_ops::Result<()>) -> BsmStatus {
    match result {
        Ok(()) => BsmStatus::Ok,
        Err(e) => {
            let status = status_of(&e);
            set_last_error(e.to_string());
            status
        }
    }
}
