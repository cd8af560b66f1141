//! Tensor operations used by sharding, collectives and the optimizer.

use super::{DType, Result, Storage, Tensor, TensorError};
use rayon::prelude::*;

/// Splits a shape around `axis` into `(outer, dim, inner)` element counts.
fn split_at_axis(shape: &[usize], axis: usize) -> (usize, usize, usize) {
    let outer = shape[..axis].iter().product();
    let inner = shape[axis + 1..].iter().product();
    (outer, shape[axis], inner)
}

impl Tensor {
    /// Returns the sub-tensor `[start, start + len)` along `axis`.
    ///
    /// # Errors
    ///
    /// - `AxisOutOfRange` if `axis >= rank`.
    /// - `IndexOutOfBounds` if the range extends past the dimension.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Tensor> {
        if axis >= self.rank() {
            return Err(TensorError::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        let (outer, dim, inner) = split_at_axis(self.shape(), axis);
        if start + len > dim {
            return Err(TensorError::IndexOutOfBounds {
                index: vec![start + len],
                shape: self.shape().to_vec(),
            });
        }

        let ranges: Vec<_> = (0..outer)
            .map(|o| {
                let base = o * dim * inner + start * inner;
                base..base + len * inner
            })
            .collect();

        let mut shape = self.shape().to_vec();
        shape[axis] = len;
        Tensor::from_storage(self.storage().select(&ranges), &shape)
    }

    /// Concatenates tensors along `axis`.
    ///
    /// All parts must share dtype and every dimension except `axis`.
    pub fn cat(parts: &[Tensor], axis: usize) -> Result<Tensor> {
        let first = parts
            .first()
            .ok_or_else(|| TensorError::Unsupported("cat of zero tensors".to_string()))?;
        if axis >= first.rank() {
            return Err(TensorError::AxisOutOfRange {
                axis,
                rank: first.rank(),
            });
        }

        let mut total_dim = 0;
        for part in parts {
            if part.dtype() != first.dtype() {
                return Err(TensorError::DTypeMismatch {
                    expected: first.dtype(),
                    got: part.dtype(),
                });
            }
            let same_rest = part.rank() == first.rank()
                && part
                    .shape()
                    .iter()
                    .zip(first.shape())
                    .enumerate()
                    .all(|(i, (a, b))| i == axis || a == b);
            if !same_rest {
                return Err(TensorError::ShapeMismatch {
                    expected: first.shape().to_vec(),
                    got: part.shape().to_vec(),
                });
            }
            total_dim += part.shape()[axis];
        }

        let (outer, _, inner) = split_at_axis(first.shape(), axis);
        let numel = outer * total_dim * inner;
        let mut storage = Storage::with_capacity(first.dtype(), numel);
        for o in 0..outer {
            for part in parts {
                let block = part.shape()[axis] * inner;
                storage.extend_from(part.storage(), o * block..(o + 1) * block);
            }
        }

        let mut shape = first.shape().to_vec();
        shape[axis] = total_dim;
        Tensor::from_storage(storage, &shape)
    }

    /// Sum of squares, accumulated in `f64`.
    pub fn sq_norm(&self) -> f64 {
        self.to_f32_vec()
            .par_iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum()
    }

    /// Element-wise `self += other`, computed in `f32` and rounded back to `self`'s dtype.
    pub fn add_assign(&mut self, other: &Tensor) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape().to_vec(),
                got: other.shape().to_vec(),
            });
        }
        if let (Storage::F32(a), Storage::F32(b)) = (self.storage_mut(), other.storage()) {
            a.par_iter_mut().zip(b.par_iter()).for_each(|(x, y)| *x += *y);
            return Ok(());
        }
        let mut acc = self.to_f32_vec();
        acc.par_iter_mut()
            .zip(other.to_f32_vec().par_iter())
            .for_each(|(x, y)| *x += *y);
        let dtype = self.dtype();
        *self.storage_mut() = Storage::from_f32(dtype, &acc);
        Ok(())
    }

    /// Multiplies every element by `factor` in place.
    pub fn scale(&mut self, factor: f32) {
        if let Storage::F32(v) = self.storage_mut() {
            v.par_iter_mut().for_each(|x| *x *= factor);
            return;
        }
        let scaled: Vec<f32> = self.to_f32_vec().iter().map(|x| x * factor).collect();
        let dtype = self.dtype();
        *self.storage_mut() = Storage::from_f32(dtype, &scaled);
    }

    /// 2-D matrix product `self @ rhs` in `f32`, regardless of input dtypes.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        if self.rank() != 2 || rhs.rank() != 2 || self.shape()[1] != rhs.shape()[0] {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.shape().last().copied().unwrap_or(0)],
                got: rhs.shape().to_vec(),
            });
        }
        let (m, k, n) = (self.shape()[0], self.shape()[1], rhs.shape()[1]);
        let a = self.to_f32_vec();
        let b = rhs.to_f32_vec();
        let mut out = vec![0.0f32; m * n];
        out.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
            for p in 0..k {
                let a_ip = a[i * k + p];
                for (j, o) in row.iter_mut().enumerate() {
                    *o += a_ip * b[p * n + j];
                }
            }
        });
        Tensor::new(out, &[m, n])
    }

    /// Transpose of a 2-D tensor, keeping the dtype.
    pub fn t(&self) -> Result<Tensor> {
        if self.rank() != 2 {
            return Err(TensorError::Unsupported(format!(
                "transpose of rank {} tensor",
                self.rank()
            )));
        }
        let (rows, cols) = (self.shape()[0], self.shape()[1]);
        let data = self.to_f32_vec();
        let mut out = vec![0.0f32; rows * cols];
        for r in 0..rows {
            for c in 0..cols {
                out[c * rows + r] = data[r * cols + c];
            }
        }
        Tensor::from_storage(Storage::from_f32(self.dtype(), &out), &[cols, rows])
    }

    /// Returns `true` if every element is bit-identical to `other`'s.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        self.shape() == other.shape() && self.to_le_bytes() == other.to_le_bytes()
    }

    /// Element-wise equality within `tol`, compared in `f32`.
    pub fn all_close(&self, other: &Tensor, tol: f32) -> bool {
        self.shape() == other.shape()
            && self
                .to_f32_vec()
                .iter()
                .zip(other.to_f32_vec())
                .all(|(a, b)| (a - b).abs() <= tol)
    }
}

/// Convenience for tests and synthetic sources: `0, 1, 2, ...` as `f32` in `dtype`.
pub fn arange(shape: &[usize], dtype: DType) -> Tensor {
    let size: usize = shape.iter().product();
    let values: Vec<f32> = (0..size).map(|i| i as f32).collect();
    Tensor {
        shape: shape.to_vec(),
        storage: Storage::from_f32(dtype, &values),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_leading_axis() {
        let t = arange(&[4, 3], DType::F32);
        let rows = t.narrow(0, 2, 2).unwrap();
        assert_eq!(rows.shape(), &[2, 3]);
        assert_eq!(rows.to_f32_vec(), vec![6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
    }

    #[test]
    fn test_narrow_trailing_axis() {
        let t = arange(&[2, 4], DType::F32);
        let cols = t.narrow(1, 1, 2).unwrap();
        assert_eq!(cols.to_f32_vec(), vec![1.0, 2.0, 5.0, 6.0]);
    }

    #[test]
    fn test_narrow_out_of_bounds() {
        let t = arange(&[2, 4], DType::F32);
        assert!(matches!(
            t.narrow(1, 3, 2),
            Err(TensorError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            t.narrow(2, 0, 1),
            Err(TensorError::AxisOutOfRange { axis: 2, rank: 2 })
        ));
    }

    #[test]
    fn test_cat_trailing_axis() {
        let t = arange(&[3, 4], DType::BF16);
        let parts = vec![t.narrow(1, 0, 2).unwrap(), t.narrow(1, 2, 2).unwrap()];
        let back = Tensor::cat(&parts, 1).unwrap();
        assert!(back.bit_eq(&t));
    }

    #[test]
    fn test_cat_rejects_mixed_dtypes() {
        let a = arange(&[1, 2], DType::F32);
        let b = arange(&[1, 2], DType::F16);
        assert!(matches!(
            Tensor::cat(&[a, b], 0),
            Err(TensorError::DTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_matmul() {
        let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let b = Tensor::new(vec![5.0, 6.0, 7.0, 8.0], &[2, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.to_f32_vec(), vec![19.0, 22.0, 43.0, 50.0]);
    }

    #[test]
    fn test_transpose() {
        let t = arange(&[2, 3], DType::F32);
        assert_eq!(
            t.t().unwrap().to_f32_vec(),
            vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]
        );
    }

    #[test]
    fn test_add_assign_and_scale() {
        let mut a = Tensor::new(vec![1.0, 2.0], &[2]).unwrap();
        let b = Tensor::new(vec![0.5, 0.5], &[2]).unwrap();
        a.add_assign(&b).unwrap();
        a.scale(2.0);
        assert_eq!(a.to_f32_vec(), vec![3.0, 5.0]);
        assert!((a.sq_norm() - 34.0).abs() < 1e-9);
    }
}
