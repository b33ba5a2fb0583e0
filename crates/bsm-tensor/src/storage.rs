use half::f16;

use crate::dtype::DType;
use crate::element::Element;
use crate::error::{Result, TensorError};

/// Flat, typed element storage for one buffer.
#[derive(Debug, Clone)]
pub enum Storage {
    F16(Vec<f16>),
    F32(Vec<f32>),
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    I64(Vec<i64>),
}

impl Storage {
    /// Number of elements in this storage.
    pub fn len(&self) -> usize {
        match self {
            Storage::F16(v) => v.len(),
            Storage::F32(v) => v.len(),
            Storage::I8(v) => v.len(),
            Storage::I16(v) => v.len(),
            Storage::I32(v) => v.len(),
            Storage::I64(v) => v.len(),
        }
    }

    /// Returns true if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the dtype of this storage.
    pub fn dtype(&self) -> DType {
        match self {
            Storage::F16(_) => DType::F16,
            Storage::F32(_) => DType::F32,
            Storage::I8(_) => DType::I8,
            Storage::I16(_) => DType::I16,
            Storage::I32(_) => DType::I32,
            Storage::I64(_) => DType::I64,
        }
    }

    /// Create zero-filled storage for the given dtype and element count.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::F16 => Storage::F16(vec![f16::ZERO; n]),
            DType::F32 => Storage::F32(vec![0.0; n]),
            DType::I8 => Storage::I8(vec![0; n]),
            DType::I16 => Storage::I16(vec![0; n]),
            DType::I32 => Storage::I32(vec![0; n]),
            DType::I64 => Storage::I64(vec![0; n]),
        }
    }

    /// Borrow the data as a slice of `T`.
    ///
    /// # Errors
    /// Returns an error if `T` does not match the storage dtype.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        let dtype = self.dtype();
        T::slice(self).ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            got: dtype,
        })
    }

    /// Mutably borrow the data as a slice of `T`.
    ///
    /// # Errors
    /// Returns an error if `T` does not match the storage dtype.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        let dtype = self.dtype();
        T::slice_mut(self).ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            got: dtype,
        })
    }

    /// Widen integer storage to i64 for the index primitives.
    ///
    /// # Errors
    /// Returns an error for floating-point storage.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        match self {
            Storage::I8(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            Storage::I16(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            Storage::I32(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            Storage::I64(v) => Ok(v.clone()),
            other => Err(TensorError::UnsupportedDType {
                op: "to_i64_vec",
                dtype: other.dtype(),
            }),
        }
    }

    /// Narrow i64 values into integer storage of `dtype`.
    ///
    /// Values are truncated with `as` casts, matching the runtime's
    /// integer conversion semantics.
    ///
    /// # Errors
    /// Returns an error if `dtype` is not an integer dtype.
    pub fn from_i64(dtype: DType, values: Vec<i64>) -> Result<Self> {
        match dtype {
            DType::I8 => Ok(Storage::I8(values.into_iter().map(|x| x as i8).collect())),
            DType::I16 => Ok(Storage::I16(values.into_iter().map(|x| x as i16).collect())),
            DType::I32 => Ok(Storage::I32(values.into_iter().map(|x| x as i32).collect())),
            DType::I64 => Ok(Storage::I64(values)),
            other => Err(TensorError::UnsupportedDType {
                op: "from_i64",
                dtype: other,
            }),
        }
    }

    /// Raw pointer to the first element.
    ///
    /// The pointer stays valid while the storage is alive, since buffers are
    /// never resized after construction.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        match self {
            Storage::F16(v) => v.as_mut_ptr() as *mut u8,
            Storage::F32(v) => v.as_mut_ptr() as *mut u8,
            Storage::I8(v) => v.as_mut_ptr() as *mut u8,
            Storage::I16(v) => v.as_mut_ptr() as *mut u8,
            Storage::I32(v) => v.as_mut_ptr() as *mut u8,
            Storage::I64(v) => v.as_mut_ptr() as *mut u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros() {
        let s = Storage::zeros(DType::I16, 4);
        assert_eq!(s.len(), 4);
        assert_eq!(s.dtype(), DType::I16);
        assert_eq!(s.as_slice::<i16>().unwrap(), &[0; 4]);
    }

    #[test]
    fn test_as_slice_mismatch() {
        let s = Storage::zeros(DType::F16, 2);
        assert!(s.as_slice::<i32>().is_err());
    }

    #[test]
    fn test_mut_slice() {
        let mut s = Storage::I32(vec![1, 2]);
        s.as_mut_slice::<i32>().unwrap()[0] = 42;
        assert_eq!(s.as_slice::<i32>().unwrap()[0], 42);
    }

    #[test]
    fn test_i64_widen_narrow() {
        let s = Storage::I16(vec![1, -2, 3]);
        let wide = s.to_i64_vec().unwrap();
        assert_eq!(wide, vec![1, -2, 3]);
        let back = Storage::from_i64(DType::I32, wide).unwrap();
        assert_eq!(back.as_slice::<i32>().unwrap(), &[1, -2, 3]);
    }

    #[test]
    fn test_float_not_index() {
        assert!(Storage::zeros(DType::F16, 1).to_i64_vec().is_err());
        assert!(Storage::from_i64(DType::F32, vec![1]).is_err());
    }
}
