//! The five multiplication entry points, driven by one parametrized pipeline.
//!
//! Every variant runs the same steps: validate and adapt the operands,
//! check the assembled problem, attach bitmasks and transpose metadata where
//! the variant's rules ask for them, then call the plain or the extended
//! backend primitive.

use std::fmt;
use std::sync::Arc;

use bsm_tensor::{ArrayBackend, Device, Tensor};
use log::debug;

use crate::backend::MatmulBackend;
use crate::bitmask::allocate_bitmask;
use crate::convert::{as_block_matrix, as_matrix, read_transpose_flag, standardize_shape};
use crate::error::{MatmulError, Result};
use crate::matrix::{MatrixView, Problem};
use crate::sparse::SparseMatrix;
use crate::transpose::transpose;
use crate::validate::{is_transposed, validate_shape};

/// Multiplication variants, named by the (output, lhs, rhs) storage kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Variant {
    /// dense = op(sparse) x op(dense)
    Dsd,
    /// dense = op(dense) x op(sparse)
    Dds,
    /// sparse = op(dense) x op(dense)
    Sdd,
    /// sparse = op(sparse) x op(dense)
    Ssd,
    /// dense = op(sparse) x op(sparse)
    Dss,
}

/// When a sparse operand needs column-grouped metadata synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaRule {
    Never,
    /// Left operands: the kernel walks columns of the stored matrix when
    /// the operand is consumed transposed.
    WhenTransposed,
    /// Right operands: the kernel walks columns of the stored matrix when
    /// the operand is consumed as stored.
    WhenNotTransposed,
}

impl MetaRule {
    pub fn applies(self, transposed: bool) -> bool {
        match self {
            MetaRule::Never => false,
            MetaRule::WhenTransposed => transposed,
            MetaRule::WhenNotTransposed => !transposed,
        }
    }
}

/// Which operands are sparse and which rules apply to them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantSpec {
    pub lhs_sparse: bool,
    pub rhs_sparse: bool,
    /// The output is sparse; its pattern is supplied by the caller.
    pub out_sparse: bool,
    pub lhs_rule: MetaRule,
    pub rhs_rule: MetaRule,
    /// Allocate block-pair coverage scratch for every sparse operand.
    pub bitmasks: bool,
    /// Always call the extended primitive.
    pub force_ex: bool,
}

impl Variant {
    pub fn spec(self) -> VariantSpec {
        match self {
            Variant::Dsd => VariantSpec {
                lhs_sparse: true,
                rhs_sparse: false,
                out_sparse: false,
                lhs_rule: MetaRule::WhenTransposed,
                rhs_rule: MetaRule::Never,
                bitmasks: false,
                force_ex: false,
            },
            Variant::Dds => VariantSpec {
                lhs_sparse: false,
                rhs_sparse: true,
                out_sparse: false,
                lhs_rule: MetaRule::Never,
                rhs_rule: MetaRule::WhenNotTransposed,
                bitmasks: false,
                force_ex: false,
            },
            Variant::Sdd => VariantSpec {
                lhs_sparse: false,
                rhs_sparse: false,
                out_sparse: true,
                lhs_rule: MetaRule::Never,
                rhs_rule: MetaRule::Never,
                bitmasks: false,
                force_ex: false,
            },
            Variant::Ssd => VariantSpec {
                lhs_sparse: true,
                rhs_sparse: false,
                out_sparse: true,
                lhs_rule: MetaRule::WhenTransposed,
                rhs_rule: MetaRule::Never,
                bitmasks: false,
                force_ex: false,
            },
            Variant::Dss => VariantSpec {
                lhs_sparse: true,
                rhs_sparse: true,
                out_sparse: false,
                lhs_rule: MetaRule::WhenTransposed,
                rhs_rule: MetaRule::WhenNotTransposed,
                bitmasks: true,
                force_ex: true,
            },
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Variant::Dsd => "dsd",
            Variant::Dds => "dds",
            Variant::Sdd => "sdd",
            Variant::Ssd => "ssd",
            Variant::Dss => "dss",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Buffers of a sparse operand as the caller passes them.
#[derive(Debug, Clone, Copy)]
pub struct SparseArgs<'a> {
    pub shape: &'a Tensor,
    pub data: &'a Tensor,
    pub offsets: &'a Tensor,
    pub indices: &'a Tensor,
    /// Host i32 flag; `None` for a sparse output, which is never transposed.
    pub transpose: Option<&'a Tensor>,
}

/// One caller-supplied participant of a multiplication.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'a> {
    Dense(&'a Tensor),
    Sparse(SparseArgs<'a>),
}

impl Operand<'_> {
    fn is_sparse(&self) -> bool {
        matches!(self, Operand::Sparse(_))
    }

    fn sparse_device(&self) -> Option<Device> {
        match self {
            Operand::Sparse(args) => Some(args.data.device()),
            Operand::Dense(_) => None,
        }
    }
}

/// Runs multiplications against an array runtime and a compute backend.
///
/// Holds no per-call state: every call builds its views, metadata and
/// scratch from the buffers it is given and drops them when it returns.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    runtime: Arc<dyn ArrayBackend>,
    kernels: Arc<dyn MatmulBackend>,
}

impl Dispatcher {
    pub fn new(runtime: Arc<dyn ArrayBackend>, kernels: Arc<dyn MatmulBackend>) -> Self {
        Dispatcher { runtime, kernels }
    }

    pub fn runtime(&self) -> &dyn ArrayBackend {
        self.runtime.as_ref()
    }

    pub fn kernels(&self) -> &dyn MatmulBackend {
        self.kernels.as_ref()
    }

    /// Validate and adapt one operand, returning its view and orientation.
    fn resolve(&self, operand: &Operand<'_>) -> Result<(MatrixView, bool)> {
        match operand {
            Operand::Dense(x) => {
                let m = as_matrix(x)?;
                Ok((MatrixView::Dense(m), is_transposed(x)))
            }
            Operand::Sparse(args) => {
                let transposed = match args.transpose {
                    Some(flag) => {
                        let transposed = read_transpose_flag(flag)?;
                        validate_shape(args.shape)?;
                        standardize_shape(args.shape, transposed)?;
                        transposed
                    }
                    None => false,
                };
                let m = as_block_matrix(args.shape, args.data, args.offsets, args.indices)?;
                Ok((MatrixView::Sparse(m), transposed))
            }
        }
    }

    /// Run `variant` on the given participants.
    pub fn run(
        &self,
        variant: Variant,
        lhs: Operand<'_>,
        rhs: Operand<'_>,
        out: Operand<'_>,
    ) -> Result<()> {
        let spec = variant.spec();
        if lhs.is_sparse() != spec.lhs_sparse
            || rhs.is_sparse() != spec.rhs_sparse
            || out.is_sparse() != spec.out_sparse
        {
            return Err(MatmulError::validation(
                "operands",
                format!("storage kinds do not match variant {}", variant),
            ));
        }

        // Sparse extents are read on the host: wait once for the stream that
        // produced them.
        if let Some(device) = [&lhs, &rhs, &out].iter().find_map(|o| o.sparse_device()) {
            let stream = self.runtime.current_stream(device);
            self.runtime.synchronize(&stream)?;
        }

        let (lhs, transpose_lhs) = self.resolve(&lhs)?;
        let (rhs, transpose_rhs) = self.resolve(&rhs)?;
        let (out, _) = self.resolve(&out)?;
        let mut problem = Problem {
            lhs,
            transpose_lhs,
            rhs,
            transpose_rhs,
            out,
        };

        if !self.kernels.valid_matmul(&problem) {
            let reason = problem.incompatibility().unwrap_or_else(|| {
                format!("rejected by backend '{}'", self.kernels.name())
            });
            return Err(MatmulError::IncompatibleProblem(reason));
        }

        if spec.bitmasks {
            for (view, transposed) in [
                (&mut problem.lhs, transpose_lhs),
                (&mut problem.rhs, transpose_rhs),
            ] {
                if let MatrixView::Sparse(m) = view {
                    let bitmask = allocate_bitmask(m, transposed, m.data.device());
                    m.bitmask = Some(bitmask);
                }
            }
        }

        for (view, transposed, rule) in [
            (&mut problem.lhs, transpose_lhs, spec.lhs_rule),
            (&mut problem.rhs, transpose_rhs, spec.rhs_rule),
        ] {
            if let MatrixView::Sparse(m) = view {
                if rule.applies(transposed) {
                    let meta = transpose(m, self.runtime())?;
                    m.transpose_meta = Some(meta);
                }
            }
        }

        let extended = spec.force_ex || problem.has_transpose_meta();
        let stream = self.runtime.current_stream(problem.out.device());
        debug!(
            "{}: [{}x{}]{} @ [{}x{}]{} -> [{}x{}] via {} on {}",
            variant,
            problem.lhs.rows(),
            problem.lhs.cols(),
            if transpose_lhs { "^T" } else { "" },
            problem.rhs.rows(),
            problem.rhs.cols(),
            if transpose_rhs { "^T" } else { "" },
            problem.out.rows(),
            problem.out.cols(),
            if extended { "matmul_ex" } else { "matmul" },
            self.kernels.name()
        );
        if extended {
            self.kernels.matmul_ex(&problem, &stream)
        } else {
            self.kernels.matmul(&problem, &stream)
        }
    }

    /// dense = op(sparse) x op(dense)
    #[allow(clippy::too_many_arguments)]
    pub fn dsd(
        &self,
        shape: &Tensor,
        data: &Tensor,
        offsets: &Tensor,
        indices: &Tensor,
        transpose_a: &Tensor,
        rhs: &Tensor,
        out: &Tensor,
    ) -> Result<()> {
        let lhs = SparseArgs {
            shape,
            data,
            offsets,
            indices,
            transpose: Some(transpose_a),
        };
        self.run(
            Variant::Dsd,
            Operand::Sparse(lhs),
            Operand::Dense(rhs),
            Operand::Dense(out),
        )
    }

    /// dense = op(dense) x op(sparse)
    #[allow(clippy::too_many_arguments)]
    pub fn dds(
        &self,
        lhs: &Tensor,
        shape: &Tensor,
        data: &Tensor,
        offsets: &Tensor,
        indices: &Tensor,
        transpose_b: &Tensor,
        out: &Tensor,
    ) -> Result<()> {
        let rhs = SparseArgs {
            shape,
            data,
            offsets,
            indices,
            transpose: Some(transpose_b),
        };
        self.run(
            Variant::Dds,
            Operand::Dense(lhs),
            Operand::Sparse(rhs),
            Operand::Dense(out),
        )
    }

    /// sparse = op(dense) x op(dense), written into the given pattern.
    pub fn sdd(
        &self,
        lhs: &Tensor,
        rhs: &Tensor,
        shape: &Tensor,
        data: &Tensor,
        offsets: &Tensor,
        indices: &Tensor,
    ) -> Result<()> {
        let out = SparseArgs {
            shape,
            data,
            offsets,
            indices,
            transpose: None,
        };
        self.run(
            Variant::Sdd,
            Operand::Dense(lhs),
            Operand::Dense(rhs),
            Operand::Sparse(out),
        )
    }

    /// sparse = op(sparse) x op(dense), written into the given pattern.
    #[allow(clippy::too_many_arguments)]
    pub fn ssd(
        &self,
        lhs_shape: &Tensor,
        lhs_data: &Tensor,
        lhs_offsets: &Tensor,
        lhs_indices: &Tensor,
        transpose_a: &Tensor,
        rhs: &Tensor,
        out_shape: &Tensor,
        out_data: &Tensor,
        out_offsets: &Tensor,
        out_indices: &Tensor,
    ) -> Result<()> {
        let lhs = SparseArgs {
            shape: lhs_shape,
            data: lhs_data,
            offsets: lhs_offsets,
            indices: lhs_indices,
            transpose: Some(transpose_a),
        };
        let out = SparseArgs {
            shape: out_shape,
            data: out_data,
            offsets: out_offsets,
            indices: out_indices,
            transpose: None,
        };
        self.run(
            Variant::Ssd,
            Operand::Sparse(lhs),
            Operand::Dense(rhs),
            Operand::Sparse(out),
        )
    }

    /// dense = op(sparse) x op(sparse)
    #[allow(clippy::too_many_arguments)]
    pub fn dss(
        &self,
        lhs_shape: &Tensor,
        lhs_data: &Tensor,
        lhs_offsets: &Tensor,
        lhs_indices: &Tensor,
        transpose_a: &Tensor,
        rhs_shape: &Tensor,
        rhs_data: &Tensor,
        rhs_offsets: &Tensor,
        rhs_indices: &Tensor,
        transpose_b: &Tensor,
        out: &Tensor,
    ) -> Result<()> {
        let lhs = SparseArgs {
            shape: lhs_shape,
            data: lhs_data,
            offsets: lhs_offsets,
            indices: lhs_indices,
            transpose: Some(transpose_a),
        };
        let rhs = SparseArgs {
            shape: rhs_shape,
            data: rhs_data,
            offsets: rhs_offsets,
            indices: rhs_indices,
            transpose: Some(transpose_b),
        };
        self.run(
            Variant::Dss,
            Operand::Sparse(lhs),
            Operand::Sparse(rhs),
            Operand::Dense(out),
        )
    }

    /// `dsd` with the flags derived from `a`'s orientation.
    pub fn dsd_matrix(&self, a: &SparseMatrix, b: &Tensor, out: &Tensor) -> Result<()> {
        self.dsd(
            &a.shape_tensor()?,
            a.data(),
            a.offsets(),
            a.indices(),
            &a.transpose_tensor(),
            b,
            out,
        )
    }

    /// `dds` with the flags derived from `b`'s orientation.
    pub fn dds_matrix(&self, a: &Tensor, b: &SparseMatrix, out: &Tensor) -> Result<()> {
        self.dds(
            a,
            &b.shape_tensor()?,
            b.data(),
            b.offsets(),
            b.indices(),
            &b.transpose_tensor(),
            out,
        )
    }

    /// `sdd` into the pattern of `out`.
    pub fn sdd_matrix(&self, a: &Tensor, b: &Tensor, out: &SparseMatrix) -> Result<()> {
        require_contiguous(out)?;
        self.sdd(
            a,
            b,
            &out.shape_tensor()?,
            out.data(),
            out.offsets(),
            out.indices(),
        )
    }

    /// `ssd` into the pattern of `out`.
    pub fn ssd_matrix(&self, a: &SparseMatrix, b: &Tensor, out: &SparseMatrix) -> Result<()> {
        require_contiguous(out)?;
        self.ssd(
            &a.shape_tensor()?,
            a.data(),
            a.offsets(),
            a.indices(),
            &a.transpose_tensor(),
            b,
            &out.shape_tensor()?,
            out.data(),
            out.offsets(),
            out.indices(),
        )
    }

    /// `dss` with both flags derived from the operands' orientations.
    pub fn dss_matrix(&self, a: &SparseMatrix, b: &SparseMatrix, out: &Tensor) -> Result<()> {
        self.dss(
            &a.shape_tensor()?,
            a.data(),
            a.offsets(),
            a.indices(),
            &a.transpose_tensor(),
            &b.shape_tensor()?,
            b.data(),
            b.offsets(),
            b.indices(),
            &b.transpose_tensor(),
            out,
        )
    }
}

fn require_contiguous(out: &SparseMatrix) -> Result<()> {
    if !out.is_contiguous() {
        return Err(MatmulError::InvalidMatrix(
            "a sparse output cannot be a transposed view".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::check_status;
    use bsm_tensor::{f16, DType, Device, HostBackend, Shape, Stream};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const GPU: Device = Device::Cuda(0);

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Plain,
        Extended,
    }

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<(Call, Problem)>>,
        fail_with: Option<i32>,
    }

    impl Recorder {
        fn last(&self) -> (Call, Problem) {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }

        fn count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl MatmulBackend for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn matmul(&self, problem: &Problem, _stream: &Stream) -> Result<()> {
            self.calls.lock().unwrap().push((Call::Plain, problem.clone()));
            check_status(self.name(), self.fail_with.unwrap_or(0), "injected failure")
        }

        fn matmul_ex(&self, problem: &Problem, _stream: &Stream) -> Result<()> {
            self.calls.lock().unwrap().push((Call::Extended, problem.clone()));
            check_status(self.name(), self.fail_with.unwrap_or(0), "injected failure")
        }
    }

    fn setup() -> (Dispatcher, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(Arc::new(HostBackend::new()), recorder.clone());
        (dispatcher, recorder)
    }

    fn dense(rows: usize, cols: usize) -> Tensor {
        Tensor::zeros(Shape::new(vec![rows, cols]), DType::F16, GPU)
    }

    fn checkerboard() -> SparseMatrix {
        SparseMatrix::from_blocks(
            256,
            256,
            128,
            &[((0, 1), f16::ONE), ((1, 0), f16::ONE)],
            GPU,
        )
        .unwrap()
    }

    fn lhs_meta(p: &Problem) -> bool {
        p.lhs.as_sparse().map_or(false, |m| m.transpose_meta.is_some())
    }

    fn rhs_meta(p: &Problem) -> bool {
        p.rhs.as_sparse().map_or(false, |m| m.transpose_meta.is_some())
    }

    #[test]
    fn test_meta_rules() {
        assert!(!MetaRule::Never.applies(true));
        assert!(MetaRule::WhenTransposed.applies(true));
        assert!(!MetaRule::WhenTransposed.applies(false));
        assert!(MetaRule::WhenNotTransposed.applies(false));
    }

    #[test]
    fn test_variant_specs() {
        let dss = Variant::Dss.spec();
        assert!(dss.bitmasks && dss.force_ex);
        assert_eq!(Variant::Dds.spec().rhs_rule, MetaRule::WhenNotTransposed);
        assert_eq!(Variant::Sdd.spec().lhs_rule, MetaRule::Never);
        assert_eq!(Variant::Ssd.to_string(), "ssd");
    }

    #[test]
    fn test_dsd_plain() {
        let (d, rec) = setup();
        let a = checkerboard();
        d.dsd_matrix(&a, &dense(256, 64), &dense(256, 64)).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Plain);
        assert!(!p.transpose_lhs);
        assert!(!lhs_meta(&p));
    }

    #[test]
    fn test_dsd_transposed_builds_lhs_meta() {
        let (d, rec) = setup();
        let a = checkerboard().t().unwrap();
        d.dsd_matrix(&a, &dense(256, 64), &dense(256, 64)).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Extended);
        assert!(p.transpose_lhs);
        assert!(lhs_meta(&p));
        let meta = p.lhs.as_sparse().unwrap().transpose_meta.clone().unwrap();
        assert_eq!(meta.indices_t.to_vec::<i16>().unwrap(), vec![1, 0]);
    }

    #[test]
    fn test_dsd_transposed_dense_rhs() {
        let (d, rec) = setup();
        let b = dense(64, 256).t().unwrap();
        d.dsd_matrix(&checkerboard(), &b, &dense(256, 64)).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Plain);
        assert!(p.transpose_rhs);
        assert_eq!((p.rhs.rows(), p.rhs.cols()), (64, 256));
    }

    #[test]
    fn test_dds_rule_is_complementary() {
        let (d, rec) = setup();
        let b = checkerboard();
        d.dds_matrix(&dense(64, 256), &b, &dense(64, 256)).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Extended);
        assert!(rhs_meta(&p));

        d.dds_matrix(&dense(64, 256), &b.t().unwrap(), &dense(64, 256))
            .unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Plain);
        assert!(p.transpose_rhs);
        assert!(!rhs_meta(&p));
    }

    #[test]
    fn test_sdd_never_builds_meta() {
        let (d, rec) = setup();
        let out = checkerboard();
        d.sdd_matrix(&dense(256, 128), &dense(128, 256), &out).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Plain);
        assert!(p.out.is_sparse());
        assert!(p.out.as_sparse().unwrap().data.same_storage(out.data()));
    }

    #[test]
    fn test_sdd_rejects_transposed_output() {
        let (d, _) = setup();
        let out = checkerboard().t().unwrap();
        assert!(d.sdd_matrix(&dense(256, 128), &dense(128, 256), &out).is_err());
    }

    #[test]
    fn test_ssd_follows_lhs_rule() {
        let (d, rec) = setup();
        let a = checkerboard();
        let out = checkerboard();
        d.ssd_matrix(&a, &dense(256, 256), &out).unwrap();
        assert_eq!(rec.last().0, Call::Plain);
        d.ssd_matrix(&a.t().unwrap(), &dense(256, 256), &out).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Extended);
        assert!(lhs_meta(&p));
    }

    #[test]
    fn test_dss_bitmasks_and_meta() {
        let (d, rec) = setup();
        let a = checkerboard();
        let b = checkerboard();
        d.dss_matrix(&a, &b, &dense(256, 256)).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Extended);
        assert!(!lhs_meta(&p));
        assert!(rhs_meta(&p));
        let lhs = p.lhs.as_sparse().unwrap();
        let rhs = p.rhs.as_sparse().unwrap();
        assert_eq!(lhs.bitmask.as_ref().unwrap().numel(), 16);
        assert_eq!(rhs.bitmask.as_ref().unwrap().numel(), 16);
    }

    #[test]
    fn test_dss_always_extended() {
        let (d, rec) = setup();
        let a = checkerboard();
        let b = checkerboard().t().unwrap();
        d.dss_matrix(&a, &b, &dense(256, 256)).unwrap();
        let (call, p) = rec.last();
        assert_eq!(call, Call::Extended);
        assert!(!lhs_meta(&p));
        assert!(!rhs_meta(&p));
    }

    #[test]
    fn test_incompatible_shapes_fail_before_backend() {
        let (d, rec) = setup();
        let a = checkerboard();
        let err = d.dsd_matrix(&a, &dense(384, 64), &dense(256, 64)).unwrap_err();
        assert!(matches!(err, MatmulError::IncompatibleProblem(_)));
        assert!(err.is_precondition());
        assert_eq!(rec.count(), 0);
    }

    #[test]
    fn test_host_dense_fails_before_backend() {
        let (d, rec) = setup();
        let host = Tensor::zeros(Shape::new(vec![256, 64]), DType::F16, Device::Cpu);
        let err = d.dsd_matrix(&checkerboard(), &host, &dense(256, 64)).unwrap_err();
        assert!(matches!(err, MatmulError::Validation { .. }));
        assert_eq!(rec.count(), 0);
    }

    #[test]
    fn test_mismatched_operand_kinds() {
        let (d, _) = setup();
        let x = dense(256, 256);
        let err = d
            .run(Variant::Dsd, Operand::Dense(&x), Operand::Dense(&x), Operand::Dense(&x))
            .unwrap_err();
        assert!(err.to_string().contains("dsd"));
    }

    #[test]
    fn test_backend_failure_propagates() {
        let recorder = Arc::new(Recorder {
            fail_with: Some(2),
            ..Default::default()
        });
        let d = Dispatcher::new(Arc::new(HostBackend::new()), recorder.clone());
        let err = d
            .dsd_matrix(&checkerboard(), &dense(256, 64), &dense(256, 64))
            .unwrap_err();
        assert!(matches!(err, MatmulError::Backend { code: 2, .. }));
        assert_eq!(recorder.count(), 1);
    }

    /// Host runtime that counts stream synchronizations.
    #[derive(Debug, Default)]
    struct CountingRuntime {
        host: HostBackend,
        syncs: AtomicUsize,
    }

    impl ArrayBackend for CountingRuntime {
        fn name(&self) -> &str {
            "counting"
        }
        fn current_stream(&self, device: Device) -> Stream {
            self.host.current_stream(device)
        }
        fn synchronize(&self, stream: &Stream) -> bsm_tensor::Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            self.host.synchronize(stream)
        }
        fn histc(&self, v: &[i64], bins: usize, min: i64, max: i64) -> bsm_tensor::Result<Vec<i64>> {
            self.host.histc(v, bins, min, max)
        }
        fn cumsum(&self, v: &[i64]) -> bsm_tensor::Result<Vec<i64>> {
            self.host.cumsum(v)
        }
        fn argsort(&self, keys: &[i64]) -> bsm_tensor::Result<Vec<i64>> {
            self.host.argsort(keys)
        }
        fn gather(&self, v: &[i64], index: &[i64]) -> bsm_tensor::Result<Vec<i64>> {
            self.host.gather(v, index)
        }
        fn linspace(&self, start: i64, end: i64, steps: usize) -> bsm_tensor::Result<Vec<i64>> {
            self.host.linspace(start, end, steps)
        }
        fn repeat_interleave(&self, counts: &[i64]) -> bsm_tensor::Result<Vec<i64>> {
            self.host.repeat_interleave(counts)
        }
        fn add(&self, a: &[i64], b: &[i64]) -> bsm_tensor::Result<Vec<i64>> {
            self.host.add(a, b)
        }
        fn mul_scalar(&self, a: &[i64], s: i64) -> bsm_tensor::Result<Vec<i64>> {
            self.host.mul_scalar(a, s)
        }
    }

    #[test]
    fn test_synchronizes_once_per_call() {
        let runtime = Arc::new(CountingRuntime::default());
        let d = Dispatcher::new(runtime.clone(), Arc::new(Recorder::default()));
        let a = checkerboard();

        d.dss_matrix(&a, &a.t().unwrap(), &dense(256, 256)).unwrap();
        assert_eq!(runtime.syncs.load(Ordering::SeqCst), 1);
        d.ssd_matrix(&a, &dense(256, 256), &a).unwrap();
        assert_eq!(runtime.syncs.load(Ordering::SeqCst), 2);
        d.dsd_matrix(&a, &dense(256, 64), &dense(256, 64)).unwrap();
        assert_eq!(runtime.syncs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_raw_entry_point_standardizes_shape() {
        let (d, rec) = setup();
        let a = SparseMatrix::from_blocks(256, 384, 128, &[((1, 2), f16::ONE)], GPU).unwrap();
        // The caller describes the operand as consumed: [384 x 256].
        let shape = a.t().unwrap().shape_tensor().unwrap();
        let flag = Tensor::scalar(1i32, Device::Cpu);
        d.dsd(
            &shape,
            a.data(),
            a.offsets(),
            a.indices(),
            &flag,
            &dense(256, 64),
            &dense(384, 64),
        )
        .unwrap();
        assert_eq!(shape.to_vec::<i32>().unwrap(), vec![256, 384]);
        let (_, p) = rec.last();
        assert_eq!((p.lhs.rows(), p.lhs.cols()), (256, 384));
    }
}
