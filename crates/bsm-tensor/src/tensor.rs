use std::ffi::c_void;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::ArrayBackend;
use crate::device::Device;
use crate::dtype::DType;
use crate::element::Element;
use crate::error::{Result, TensorError};
use crate::shape::{Layout, Shape};
use crate::storage::Storage;

/// A strided view over shared, typed storage.
///
/// Cloning a tensor or taking a transpose view shares the underlying buffer,
/// so writes through one handle are visible through every other handle.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Storage>>,
    shape: Shape,
    strides: Vec<usize>,
    dtype: DType,
    device: Device,
}

impl Tensor {
    /// Create a contiguous tensor from owned data.
    ///
    /// # Errors
    /// Returns an error if `data.len() != shape.numel()`.
    pub fn from_vec<T: Element>(data: Vec<T>, shape: Shape, device: Device) -> Result<Self> {
        if data.len() != shape.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Self::from_storage(T::into_storage(data), shape, device))
    }

    /// Create a zero-filled contiguous tensor.
    pub fn zeros(shape: Shape, dtype: DType, device: Device) -> Self {
        let n = shape.numel();
        Self::from_storage(Storage::zeros(dtype, n), shape, device)
    }

    /// Allocate a contiguous tensor whose contents the caller must not rely on.
    ///
    /// The host runtime happens to zero the buffer.
    pub fn empty(shape: Shape, dtype: DType, device: Device) -> Self {
        Self::zeros(shape, dtype, device)
    }

    /// A one-element vector holding `value`.
    pub fn scalar<T: Element>(value: T, device: Device) -> Self {
        Self::from_storage(T::into_storage(vec![value]), Shape::new(vec![1]), device)
    }

    fn from_storage(storage: Storage, shape: Shape, device: Device) -> Self {
        let strides = shape.strides();
        Tensor {
            dtype: storage.dtype(),
            storage: Arc::new(RwLock::new(storage)),
            shape,
            strides,
            device,
        }
    }

    /// Returns a reference to the tensor's shape.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Returns the dimension sizes.
    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    /// Returns the element strides of each dimension.
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn size(&self, i: usize) -> usize {
        self.shape.dim(i)
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    /// Number of logical elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Returns the tensor's data type.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the device the buffer lives on.
    pub fn device(&self) -> Device {
        self.device
    }

    /// True if the strides are the row-major strides of the shape.
    pub fn is_contiguous(&self) -> bool {
        self.shape.is_contiguous(&self.strides)
    }

    /// Layout classification of a 2-D view.
    pub fn layout(&self) -> Layout {
        Layout::of(self.dims(), &self.strides)
    }

    /// Transpose view of a 2-D tensor. No data is moved.
    ///
    /// # Errors
    /// Returns an error if the tensor is not 2-D.
    pub fn t(&self) -> Result<Tensor> {
        if self.ndim() != 2 {
            return Err(TensorError::RankMismatch {
                expected: 2,
                got: self.ndim(),
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            shape: Shape::new(vec![self.size(1), self.size(0)]),
            strides: vec![self.strides[1], self.strides[0]],
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Reinterpret the buffer with a new contiguous shape.
    ///
    /// # Errors
    /// Returns an error if the element count changes or the tensor is not
    /// contiguous.
    pub fn reshape(&self, new_shape: Shape) -> Result<Tensor> {
        if self.numel() != new_shape.numel() || !self.is_contiguous() {
            return Err(TensorError::ShapeMismatch {
                expected: self.dims().to_vec(),
                got: new_shape.dims().to_vec(),
            });
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            strides: new_shape.strides(),
            shape: new_shape,
            dtype: self.dtype,
            device: self.device,
        })
    }

    /// Copy the tensor to `device`, keeping its strides.
    pub fn to(&self, device: Device) -> Result<Tensor> {
        let storage = self.read_storage()?.clone();
        Ok(Tensor {
            storage: Arc::new(RwLock::new(storage)),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            dtype: self.dtype,
            device,
        })
    }

    /// True if both handles view the same buffer.
    pub fn same_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, Storage>> {
        self.storage.read().map_err(|_| TensorError::Poisoned)
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Storage>> {
        self.storage.write().map_err(|_| TensorError::Poisoned)
    }

    fn ensure_host(&self) -> Result<()> {
        if self.device.is_cuda() {
            return Err(TensorError::NotOnHost(self.device));
        }
        Ok(())
    }

    /// Read element `idx` of a host-resident buffer, in storage order.
    ///
    /// # Errors
    /// Returns an error if the tensor is not on the host, the dtype does not
    /// match `T`, or `idx` is out of bounds.
    pub fn read<T: Element>(&self, idx: usize) -> Result<T> {
        self.ensure_host()?;
        let storage = self.read_storage()?;
        let data = storage.as_slice::<T>()?;
        data.get(idx).copied().ok_or(TensorError::IndexOutOfBounds {
            index: idx,
            len: data.len(),
        })
    }

    /// Overwrite element `idx` of a host-resident buffer, in storage order.
    pub fn write<T: Element>(&self, idx: usize, value: T) -> Result<()> {
        self.ensure_host()?;
        let mut storage = self.write_storage()?;
        let data = storage.as_mut_slice::<T>()?;
        let len = data.len();
        match data.get_mut(idx) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TensorError::IndexOutOfBounds { index: idx, len }),
        }
    }

    /// Copy the underlying buffer out, in storage order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.read_storage()?.as_slice::<T>()?.to_vec())
    }

    /// Run `f` with a read-only view of the underlying buffer.
    pub fn with_slice<T: Element, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R> {
        let storage = self.read_storage()?;
        Ok(f(storage.as_slice::<T>()?))
    }

    /// Raw address of the first element, for handing to foreign kernels.
    ///
    /// The address stays valid while any handle to this buffer is alive.
    pub fn data_ptr(&self) -> Result<*mut c_void> {
        Ok(self.write_storage()?.as_mut_ptr() as *mut c_void)
    }

    fn index_values(&self, op: &'static str) -> Result<Vec<i64>> {
        if self.ndim() != 1 {
            return Err(TensorError::RankMismatch {
                expected: 1,
                got: self.ndim(),
            });
        }
        if !self.dtype.is_integer() {
            return Err(TensorError::UnsupportedDType {
                op,
                dtype: self.dtype,
            });
        }
        self.read_storage()?.to_i64_vec()
    }

    fn from_index_values(values: Vec<i64>, dtype: DType, device: Device) -> Result<Tensor> {
        let shape = Shape::new(vec![values.len()]);
        Ok(Self::from_storage(Storage::from_i64(dtype, values)?, shape, device))
    }

    /// Evenly spaced integers from `start` to `end` inclusive.
    pub fn linspace(
        start: i64,
        end: i64,
        steps: usize,
        dtype: DType,
        device: Device,
        backend: &dyn ArrayBackend,
    ) -> Result<Tensor> {
        Self::from_index_values(backend.linspace(start, end, steps)?, dtype, device)
    }

    /// Histogram of a 1-D integer tensor. Counts are i32.
    pub fn histc(
        &self,
        bins: usize,
        min: i64,
        max: i64,
        backend: &dyn ArrayBackend,
    ) -> Result<Tensor> {
        let values = self.index_values("histc")?;
        Self::from_index_values(backend.histc(&values, bins, min, max)?, DType::I32, self.device)
    }

    /// Inclusive prefix sum, keeping the dtype.
    pub fn cumsum(&self, backend: &dyn ArrayBackend) -> Result<Tensor> {
        let values = self.index_values("cumsum")?;
        Self::from_index_values(backend.cumsum(&values)?, self.dtype, self.device)
    }

    /// Ascending sort permutation. Indices are i64.
    pub fn argsort(&self, backend: &dyn ArrayBackend) -> Result<Tensor> {
        let values = self.index_values("argsort")?;
        Self::from_index_values(backend.argsort(&values)?, DType::I64, self.device)
    }

    /// `result[i] = self[index[i]]`, keeping the dtype of `self`.
    pub fn gather(&self, index: &Tensor, backend: &dyn ArrayBackend) -> Result<Tensor> {
        let values = self.index_values("gather")?;
        let index = index.index_values("gather")?;
        Self::from_index_values(backend.gather(&values, &index)?, self.dtype, self.device)
    }

    /// Position `i` repeated `self[i]` times. Positions are i64.
    pub fn repeat_interleave(&self, backend: &dyn ArrayBackend) -> Result<Tensor> {
        let counts = self.index_values("repeat_interleave")?;
        Self::from_index_values(backend.repeat_interleave(&counts)?, DType::I64, self.device)
    }

    /// Element-wise sum, keeping the dtype of `self`.
    pub fn add(&self, other: &Tensor, backend: &dyn ArrayBackend) -> Result<Tensor> {
        let a = self.index_values("add")?;
        let b = other.index_values("add")?;
        Self::from_index_values(backend.add(&a, &b)?, self.dtype, self.device)
    }

    /// Multiply every element by `s`, keeping the dtype.
    pub fn mul_scalar(&self, s: i64, backend: &dyn ArrayBackend) -> Result<Tensor> {
        let values = self.index_values("mul_scalar")?;
        Self::from_index_values(backend.mul_scalar(&values, s)?, self.dtype, self.device)
    }

    /// Copy of elements `start..end` of a 1-D integer tensor.
    pub fn slice(&self, start: usize, end: usize) -> Result<Tensor> {
        let values = self.index_values("slice")?;
        if start > end || end > values.len() {
            return Err(TensorError::IndexOutOfBounds {
                index: end,
                len: values.len(),
            });
        }
        Self::from_index_values(values[start..end].to_vec(), self.dtype, self.device)
    }

    /// Convert a 1-D integer tensor to another integer dtype.
    pub fn cast(&self, dtype: DType) -> Result<Tensor> {
        let values = self.index_values("cast")?;
        Self::from_index_values(values, dtype, self.device)
    }

    /// Concatenate 1-D integer tensors of one dtype.
    pub fn cat(parts: &[&Tensor]) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::Other("cat: no tensors given".to_string()))?;
        let mut values = Vec::new();
        for part in parts {
            if part.dtype != first.dtype {
                return Err(TensorError::DTypeMismatch {
                    expected: first.dtype,
                    got: part.dtype,
                });
            }
            values.extend(part.index_values("cat")?);
        }
        Self::from_index_values(values, first.dtype, first.device)
    }
}
