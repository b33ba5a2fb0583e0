use std::ffi::CStr;
use std::sync::Arc;

use bsm_ops::{check_status, Dispatcher, MatmulBackend, MatmulError, Problem};
use bsm_tensor::{HostBackend, Stream};
use log::warn;

use crate::types::{BsmKernelTable, BsmMatmulFn, BsmProblem};

/// `MatmulBackend` forwarding to the caller's kernel table.
#[derive(Debug)]
pub struct CallbackBackend {
    table: BsmKernelTable,
}

// The caller guarantees the table's callbacks and `user_data` may be used
// from any thread for as long as the context lives.
unsafe impl Send for CallbackBackend {}
unsafe impl Sync for CallbackBackend {}

impl CallbackBackend {
    pub fn new(table: BsmKernelTable) -> Self {
        Self { table }
    }

    fn status_text(&self, code: i32) -> String {
        let Some(text) = self.table.status_text else {
            return "no status text available".to_string();
        };
        let msg = unsafe { text(code, self.table.user_data) };
        if msg.is_null() {
            return "no status text available".to_string();
        }
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }

    fn invoke(
        &self,
        entry: BsmMatmulFn,
        which: &str,
        problem: &Problem,
        stream: &Stream,
    ) -> bsm_ops::Result<()> {
        let Some(f) = entry else {
            return Err(MatmulError::Backend {
                backend: self.name().to_string(),
                code: -1,
                message: format!("no {} kernel registered", which),
            });
        };
        let desc = BsmProblem::describe(problem, stream)?;
        let code = unsafe { f(&desc, self.table.user_data) };
        if code == 0 {
            return Ok(());
        }
        warn!("{} kernel returned status {}", which, code);
        check_status(self.name(), code, self.status_text(code))
    }
}

impl MatmulBackend for CallbackBackend {
    fn name(&self) -> &str {
        "callback"
    }

    fn matmul(&self, problem: &Problem, stream: &Stream) -> bsm_ops::Result<()> {
        self.invoke(self.table.matmul, "matmul", problem, stream)
    }

    fn matmul_ex(&self, problem: &Problem, stream: &Stream) -> bsm_ops::Result<()> {
        self.invoke(self.table.matmul_ex, "matmul_ex", problem, stream)
    }
}

/// Opaque context handle that owns the dispatcher and its backends.
pub struct BsmContext {
    pub dispatcher: Dispatcher,
}

impl BsmContext {
    pub fn new(table: BsmKernelTable) -> Self {
        Self {
            dispatcher: Dispatcher::new(
                Arc::new(HostBackend::new()),
                Arc::new(CallbackBackend::new(table)),
            ),
        }
    }
}
