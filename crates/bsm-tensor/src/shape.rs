use std::fmt;

/// A tensor shape, wrapping a vector of dimension sizes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    /// Create a new shape from a vector of dimensions.
    pub fn new(dims: Vec<usize>) -> Self {
        Shape { dims }
    }

    /// Create a shape from a slice of dimensions.
    pub fn from_slice(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }

    /// Number of dimensions (rank).
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements (product of all dimension sizes).
    pub fn numel(&self) -> usize {
        self.dims.iter().product()
    }

    /// Returns the size of dimension `i`.
    ///
    /// # Panics
    /// Panics if `i >= ndim()`.
    pub fn dim(&self, i: usize) -> usize {
        self.dims[i]
    }

    /// Returns a reference to the underlying dimension sizes.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Computes row-major contiguous strides for this shape.
    ///
    /// For a shape [d0, d1, d2], the strides are [d1*d2, d2, 1].
    pub fn strides(&self) -> Vec<usize> {
        if self.dims.is_empty() {
            return vec![];
        }
        let mut strides = vec![0usize; self.dims.len()];
        strides[self.dims.len() - 1] = 1;
        for i in (0..self.dims.len() - 1).rev() {
            strides[i] = strides[i + 1] * self.dims[i + 1];
        }
        strides
    }

    /// Checks if the given strides correspond to a contiguous (row-major) layout
    /// for this shape.
    pub fn is_contiguous(&self, strides: &[usize]) -> bool {
        if strides.len() != self.dims.len() {
            return false;
        }
        let expected = self.strides();
        strides == expected.as_slice()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape::new(dims)
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::from_slice(dims)
    }
}

/// Memory layout of a 2-D buffer, inferred from its strides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Contiguous row-major.
    RowMajor,
    /// A pure transpose view of a contiguous buffer: the minor stride is 1
    /// and the major stride equals the number of rows.
    Transposed,
    /// Anything else.
    Strided,
}

impl Layout {
    /// Classify a 2-D (dims, strides) pair. Non 2-D inputs are `Strided`.
    ///
    /// The transpose signature is checked first, so degenerate 1x1 views
    /// report `Transposed`.
    pub fn of(dims: &[usize], strides: &[usize]) -> Layout {
        if dims.len() != 2 || strides.len() != 2 {
            return Layout::Strided;
        }
        if strides[0] == 1 && strides[1] == dims[0] {
            Layout::Transposed
        } else if Shape::from_slice(dims).is_contiguous(strides) {
            Layout::RowMajor
        } else {
            Layout::Strided
        }
    }
}
