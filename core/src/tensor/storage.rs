//! Typed storage buffers.
//!
//! # What is Storage?
//!
//! "Storage" is the container that holds the raw numerical data of a tensor. The tensor holds
//! the shape; the storage holds the bits in one of the three training dtypes.
//!
//! Keeping each dtype in its own `Vec` (rather than a `Vec<u8>` with a tag) means a cast is
//! an explicit, element-wise conversion and a slice of a `bf16` tensor is still a `bf16`
//! tensor, bit for bit.

use super::DType;
use half::{bf16, f16};
use std::ops::Range;

/// A contiguous buffer of tensor elements.
#[derive(Clone, Debug, PartialEq)]
pub enum Storage {
    F32(Vec<f32>),
    F16(Vec<f16>),
    BF16(Vec<bf16>),
}

fn select<T: Copy>(data: &[T], ranges: &[Range<usize>]) -> Vec<T> {
    let total = ranges.iter().map(|r| r.len()).sum();
    let mut out = Vec::with_capacity(total);
    for r in ranges {
        out.extend_from_slice(&data[r.clone()]);
    }
    out
}

impl Storage {
    /// A buffer of `len` elements, each set to `value` rounded to `dtype`.
    pub fn filled(dtype: DType, len: usize, value: f32) -> Self {
        match dtype {
            DType::F32 => Storage::F32(vec![value; len]),
            DType::F16 => Storage::F16(vec![f16::from_f32(value); len]),
            DType::BF16 => Storage::BF16(vec![bf16::from_f32(value); len]),
        }
    }

    /// Narrows `f32` values into `dtype`.
    pub fn from_f32(dtype: DType, values: &[f32]) -> Self {
        match dtype {
            DType::F32 => Storage::F32(values.to_vec()),
            DType::F16 => Storage::F16(values.iter().map(|&v| f16::from_f32(v)).collect()),
            DType::BF16 => Storage::BF16(values.iter().map(|&v| bf16::from_f32(v)).collect()),
        }
    }

    /// Decodes little-endian bytes. The caller guarantees the length is a multiple of the
    /// element size.
    pub fn from_le_bytes(dtype: DType, bytes: &[u8]) -> Self {
        match dtype {
            DType::F32 => Storage::F32(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            DType::F16 => Storage::F16(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            DType::BF16 => Storage::BF16(
                bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Storage::F32(_) => DType::F32,
            Storage::F16(_) => DType::F16,
            Storage::BF16(_) => DType::BF16,
        }
    }

    /// Returns the number of elements in the storage.
    pub fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F16(v) => v.len(),
            Storage::BF16(v) => v.len(),
        }
    }

    /// Returns `true` if the storage contains no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match self {
            Storage::F32(v) => v.clone(),
            Storage::F16(v) => v.iter().map(|x| x.to_f32()).collect(),
            Storage::BF16(v) => v.iter().map(|x| x.to_f32()).collect(),
        }
    }

    /// Element-wise conversion. Same-dtype casts are clones, so they are bit-exact.
    pub fn cast(&self, dtype: DType) -> Storage {
        if self.dtype() == dtype {
            return self.clone();
        }
        match (self, dtype) {
            (Storage::F16(v), DType::BF16) => {
                Storage::BF16(v.iter().map(|x| bf16::from_f32(x.to_f32())).collect())
            }
            (Storage::BF16(v), DType::F16) => {
                Storage::F16(v.iter().map(|x| f16::from_f32(x.to_f32())).collect())
            }
            _ => Storage::from_f32(dtype, &self.to_f32_vec()),
        }
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        match self {
            Storage::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::F16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            Storage::BF16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
        }
    }

    /// Copies the given element ranges, in order, into a new buffer of the same dtype.
    pub fn select(&self, ranges: &[Range<usize>]) -> Storage {
        match self {
            Storage::F32(v) => Storage::F32(select(v, ranges)),
            Storage::F16(v) => Storage::F16(select(v, ranges)),
            Storage::BF16(v) => Storage::BF16(select(v, ranges)),
        }
    }

    /// Appends `other[range]` to `self`. Both buffers must share a dtype; this is checked
    /// by the callers in `ops`.
    pub(crate) fn extend_from(&mut self, other: &Storage, range: Range<usize>) {
        match (self, other) {
            (Storage::F32(a), Storage::F32(b)) => a.extend_from_slice(&b[range]),
            (Storage::F16(a), Storage::F16(b)) => a.extend_from_slice(&b[range]),
            (Storage::BF16(a), Storage::BF16(b)) => a.extend_from_slice(&b[range]),
            _ => unreachable!("dtype checked by caller"),
        }
    }

    /// An empty buffer of `dtype` with room for `capacity` elements.
    pub(crate) fn with_capacity(dtype: DType, capacity: usize) -> Storage {
        match dtype {
            DType::F32 => Storage::F32(Vec::with_capacity(capacity)),
            DType::F16 => Storage::F16(Vec::with_capacity(capacity)),
            DType::BF16 => Storage::BF16(Vec::with_capacity(capacity)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_ranges() {
        let s = Storage::F32(vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        let picked = s.select(&[0..2, 4..5]);
        assert_eq!(picked, Storage::F32(vec![0.0, 1.0, 4.0]));
    }

    #[test]
    fn test_cast_f32_to_bf16_rounds() {
        let s = Storage::F32(vec![1.0, 1.0 + 1.0 / 512.0]);
        let b = s.cast(DType::BF16);
        // bf16 keeps 7 explicit mantissa bits, so 1 + 2^-9 rounds down to 1.0.
        assert_eq!(b.to_f32_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_filled_len() {
        let s = Storage::filled(DType::F16, 3, 2.0);
        assert_eq!(s.len(), 3);
        assert_eq!(s.dtype(), DType::F16);
        assert!(!s.is_empty());
    }
}
