use std::fmt;

/// Element types a tensor buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 16-bit floating point (IEEE 754 half-precision, via the `half` crate).
    F16,
    /// 32-bit floating point.
    F32,
    /// 8-bit signed integer. Used for opaque byte scratch buffers.
    I8,
    /// 16-bit signed integer.
    I16,
    /// 32-bit signed integer.
    I32,
    /// 64-bit signed integer.
    I64,
}

impl DType {
    /// Returns the size in bytes of a single element.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::I8 => 1,
            DType::F16 | DType::I16 => 2,
            DType::F32 | DType::I32 => 4,
            DType::I64 => 8,
        }
    }

    /// Returns true for the integer dtypes.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::I8 | DType::I16 | DType::I32 | DType::I64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F16 => write!(f, "f16"),
            DType::F32 => write!(f, "f32"),
            DType::I8 => write!(f, "i8"),
            DType::I16 => write!(f, "i16"),
            DType::I32 => write!(f, "i32"),
            DType::I64 => write!(f, "i64"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_in_bytes() {
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::I8.size_in_bytes(), 1);
        assert_eq!(DType::I16.size_in_bytes(), 2);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_is_integer() {
        assert!(DType::I16.is_integer());
        assert!(!DType::F16.is_integer());
    }

    #[test]
    fn test_display() {
        assert_eq!(DType::F16.to_string(), "f16");
        assert_eq!(DType::I32.to_string(), "i32");
    }
}
