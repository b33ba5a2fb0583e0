use std::fmt::Debug;

use crate::device::{Device, Stream};
use crate::error::Result;

/// Trait for pluggable array runtimes (host reference, CUDA, etc.).
///
/// Index primitives work on i64 slices: integer tensors are widened on the
/// way in and narrowed back to their dtype by `Tensor`. The runtime queues
/// the work onto the current stream of the tensor's device.
pub trait ArrayBackend: Send + Sync + Debug {
    /// Returns the name of this runtime (e.g., "host").
    fn name(&self) -> &str;

    /// The stream work for `device` is currently issued onto.
    fn current_stream(&self, device: Device) -> Stream;

    /// Block the host until all work queued on `stream` has completed.
    fn synchronize(&self, stream: &Stream) -> Result<()>;

    /// Histogram with `bins` equal-width bins over `[min, max]`.
    ///
    /// A value equal to `max` lands in the last bin; values outside the
    /// range are ignored.
    fn histc(&self, values: &[i64], bins: usize, min: i64, max: i64) -> Result<Vec<i64>>;

    /// Inclusive prefix sum.
    fn cumsum(&self, values: &[i64]) -> Result<Vec<i64>>;

    /// Indices that sort `keys` in ascending order.
    ///
    /// Not guaranteed stable; callers that need a total order must make
    /// their keys unique.
    fn argsort(&self, keys: &[i64]) -> Result<Vec<i64>>;

    /// `result[i] = values[index[i]]`.
    fn gather(&self, values: &[i64], index: &[i64]) -> Result<Vec<i64>>;

    /// `steps` evenly spaced values from `start` to `end` inclusive.
    fn linspace(&self, start: i64, end: i64, steps: usize) -> Result<Vec<i64>>;

    /// Repeat each position `i` `counts[i]` times: `[2, 0, 1]` -> `[0, 0, 2]`.
    fn repeat_interleave(&self, counts: &[i64]) -> Result<Vec<i64>>;

    /// Element-wise addition: result[i] = a[i] + b[i].
    fn add(&self, a: &[i64], b: &[i64]) -> Result<Vec<i64>>;

    /// Scalar multiplication: result[i] = a[i] * s.
    fn mul_scalar(&self, a: &[i64], s: i64) -> Result<Vec<i64>>;
}
