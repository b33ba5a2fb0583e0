//! Rust scalar types that can back a tensor buffer.

use half::f16;

use crate::dtype::DType;
use crate::storage::Storage;

/// Maps a Rust scalar type onto its dtype and storage variant.
pub trait Element: Copy + PartialEq + Send + Sync + 'static {
    /// The dtype tag for this element type.
    const DTYPE: DType;

    /// Wrap an owned vector into storage.
    fn into_storage(data: Vec<Self>) -> Storage;

    /// Borrow the storage as a slice of this type, if the variant matches.
    fn slice(storage: &Storage) -> Option<&[Self]>;

    /// Mutably borrow the storage as a slice of this type, if the variant matches.
    fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]>;
}

macro_rules! impl_element {
    ($ty:ty, $variant:ident) => {
        impl Element for $ty {
            const DTYPE: DType = DType::$variant;

            fn into_storage(data: Vec<Self>) -> Storage {
                Storage::$variant(data)
            }

            fn slice(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            fn slice_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(v.as_mut_slice()),
                    _ => None,
                }
            }
        }
    };
}

impl_element!(f16, F16);
impl_element!(f32, F32);
impl_element!(i8, I8);
impl_element!(i16, I16);
impl_element!(i32, I32);
impl_element!(i64, I64);
