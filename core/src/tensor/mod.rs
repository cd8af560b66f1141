//! Host-side parameter tensors.
//!
//! # What lives here?
//!
//! `meshtune` orchestrates *where* parameter bytes live, not how a forward pass is computed.
//! The tensor type is therefore deliberately small: a flat, row-major buffer in one of the
//! three training dtypes plus a dynamic shape. It supports exactly the operations the
//! orchestration layer needs:
//!
//! - **Slicing** (`narrow`) and **concatenation** (`cat`) for tensor-parallel shards.
//! - **Casting** between `f32`, `f16` and `bf16` for the training dtype.
//! - **Byte encoding** for collectives and checkpoints.
//! - A handful of reductions used by gradient clipping and the optimizer.
//!
//! ## Example
//!
//! ```rust
//! use meshtune::tensor::{DType, Tensor};
//!
//! let w = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
//! let left = w.narrow(1, 0, 2).unwrap();
//! assert_eq!(left.shape(), &[2, 2]);
//! assert_eq!(left.to_f32_vec(), vec![1.0, 2.0, 4.0, 5.0]);
//!
//! let half = w.to_dtype(DType::BF16);
//! assert_eq!(half.dtype(), DType::BF16);
//! ```
//!
//! > [!TIP]
//! > **Layout**: row-major (C-style). The last dimension changes fastest, so a slice along
//! > axis 0 is one contiguous run while a slice along the last axis is `outer` short runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub mod ops;
pub mod storage;

pub use storage::Storage;

/// Error type for Tensor operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TensorError {
    /// The shape of the data does not match the expected shape.
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    /// An axis is out of range for the tensor's rank.
    #[error("Axis {axis} out of range for rank {rank}")]
    AxisOutOfRange { axis: usize, rank: usize },
    /// A slice extends past the end of a dimension.
    #[error("Index out of bounds: index {index:?} for shape {shape:?}")]
    IndexOutOfBounds {
        index: Vec<usize>,
        shape: Vec<usize>,
    },
    /// Two tensors that must share a dtype do not.
    #[error("DType mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },
    /// A byte buffer has the wrong length for the requested dtype and shape.
    #[error("Byte length mismatch: expected {expected} bytes, got {got}")]
    ByteLength { expected: usize, got: usize },
    /// The requested operation is not supported.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, TensorError>;

/// Element type of a tensor's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::BF16 => "bf16",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = TensorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "f32" | "fp32" => Ok(DType::F32),
            "f16" | "fp16" => Ok(DType::F16),
            "bf16" => Ok(DType::BF16),
            other => Err(TensorError::Unsupported(format!("unknown dtype `{other}`"))),
        }
    }
}

/// An N-dimensional, row-major tensor with runtime shape and dtype.
///
/// Unlike a compute tensor, this type never lives on an accelerator: it is the host-side
/// representation of a parameter (or one shard of it) as it moves between the weight
/// source, the collectives and the checkpoint writer.
#[derive(Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<usize>,
    storage: Storage,
}

impl Tensor {
    /// Creates an `f32` tensor from a flat vector and a shape.
    ///
    /// # Errors
    ///
    /// Returns `TensorError::ShapeMismatch` if `data.len()` differs from the product of `shape`.
    pub fn new(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        Self::from_storage(Storage::F32(data), shape)
    }

    /// Wraps an existing storage buffer.
    pub fn from_storage(storage: Storage, shape: &[usize]) -> Result<Self> {
        let size: usize = shape.iter().product();
        if storage.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: vec![size],
                got: vec![storage.len()],
            });
        }
        Ok(Self {
            shape: shape.to_vec(),
            storage,
        })
    }

    /// Creates a tensor filled with zeros.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    /// Creates a tensor filled with ones.
    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    /// Creates a tensor with every element set to `value` (rounded to `dtype`).
    pub fn full(shape: &[usize], value: f32, dtype: DType) -> Self {
        let size: usize = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            storage: Storage::filled(dtype, size, value),
        }
    }

    /// Decodes a little-endian byte buffer.
    pub fn from_le_bytes(bytes: &[u8], shape: &[usize], dtype: DType) -> Result<Self> {
        let size: usize = shape.iter().product();
        let expected = size * dtype.size_in_bytes();
        if bytes.len() != expected {
            return Err(TensorError::ByteLength {
                expected,
                got: bytes.len(),
            });
        }
        Self::from_storage(Storage::from_le_bytes(dtype, bytes), shape)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn dtype(&self) -> DType {
        self.storage.dtype()
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.storage.len()
    }

    /// Bytes held by the storage.
    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut Storage {
        &mut self.storage
    }

    pub fn into_storage(self) -> Storage {
        self.storage
    }

    /// Widens every element to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        self.storage.to_f32_vec()
    }

    /// Returns a copy cast to `dtype`. Casting to the current dtype is a plain clone.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            storage: self.storage.cast(dtype),
        }
    }

    /// Little-endian encoding of the storage (shape and dtype are not included).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.storage.to_le_bytes()
    }

    /// Returns the same data under a new shape with equal element count.
    pub fn reshape(self, shape: &[usize]) -> Result<Tensor> {
        let size: usize = shape.iter().product();
        if size != self.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape,
                got: shape.to_vec(),
            });
        }
        Ok(Tensor {
            shape: shape.to_vec(),
            storage: self.storage,
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", &self.shape)
            .field("dtype", &self.dtype())
            .finish_non_exhaustive()
    }
}
