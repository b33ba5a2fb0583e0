//! `bsm-tensor` - Array runtime for block-sparse matmul orchestration.
//!
//! This crate provides:
//! - A `Tensor` type: a strided view over shared, typed storage tagged with a device
//! - An `ArrayBackend` trait for the index primitives metadata derivation needs
//!   (histogram, prefix sum, argsort, gather, linspace)
//! - A reference `HostBackend` implementation
//! - Shape, stride and layout utilities
//! - Data type, element and device definitions

pub mod backend;
pub mod device;
pub mod dtype;
pub mod element;
pub mod error;
pub mod host;
pub mod shape;
pub mod storage;
pub mod tensor;

// Re-export primary types at the crate root for convenience.
pub use backend::ArrayBackend;
pub use device::{Device, Stream};
pub use dtype::DType;
pub use element::Element;
pub use error::{Result, TensorError};
pub use host::HostBackend;
pub use shape::{Layout, Shape};
pub use storage::Storage;
pub use tensor::Tensor;

pub use half::f16;
