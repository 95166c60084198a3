use crate::config::pad_to;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::sparse::CsrMatrix;

// Layout — Padded memory layout of a dense tensor buffer
//
// The Layout maps a *logical* shape (plus a batch count) onto the flat buffer
// a TensorStorage owns. Logical shape never changes with padding; padding is
// purely a property of the buffer.
//
//   logical  [batch, d0, .., rows, cols]
//   buffer   [batch, d0, .., rows, pad(cols)]
//
// where pad() rounds up to the pool's padding unit (8 f32 elements for the
// default 32-byte alignment). Every row therefore starts on an aligned
// boundary, which is what vectorized host loops and accelerator kernels want.
//
// HOST SLACK
//
//   Host allocations additionally round the row count up to the unit, so the
//   host buffer holds `batch * outer * pad(rows) * pad(cols)` elements. The
//   extra rows sit after the dense region and are never read; device buffers
//   carry only the dense region (`dense_len`), which keeps host↔device
//   transfers a single contiguous copy.

/// Padded layout of one tensor instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    batch_size: usize,
    pad_unit: usize,
}

impl Layout {
    /// Layout for `batch_size` stacked tensors of `shape`.
    pub fn new(shape: Shape, batch_size: usize, pad_unit: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::invalid_argument("batch size must be positive"));
        }
        if pad_unit == 0 {
            return Err(Error::invalid_argument("padding unit must be positive"));
        }
        Ok(Layout {
            shape,
            batch_size,
            pad_unit,
        })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pad_unit(&self) -> usize {
        self.pad_unit
    }

    pub fn rows(&self) -> usize {
        self.shape.rows()
    }

    pub fn cols(&self) -> usize {
        self.shape.cols()
    }

    /// Elements between the starts of consecutive rows.
    pub fn row_stride(&self) -> usize {
        pad_to(self.cols(), self.pad_unit)
    }

    /// Number of `rows x cols` matrices across the batch.
    pub fn matrix_count(&self) -> usize {
        self.batch_size * self.shape.matrix_count()
    }

    /// Elements between the starts of consecutive matrices.
    pub fn matrix_stride(&self) -> usize {
        self.rows() * self.row_stride()
    }

    /// Logical element count across the batch.
    pub fn logical_len(&self) -> usize {
        self.batch_size * self.shape.elem_count()
    }

    /// Length of the dense region (column padding included).
    pub fn dense_len(&self) -> usize {
        self.matrix_count() * self.matrix_stride()
    }

    /// Host buffer capacity (row and column padding included).
    pub fn host_capacity(&self) -> usize {
        self.matrix_count() * pad_to(self.rows(), self.pad_unit) * self.row_stride()
    }

    /// Logical dims with the batch folded in as the leading dimension and the
    /// shape left-padded to `rank` first.
    pub fn batched_dims(&self, rank: usize) -> Vec<usize> {
        let mut dims = Vec::with_capacity(rank + 1);
        dims.push(self.batch_size);
        dims.extend_from_slice(self.shape.expand(rank).dims());
        dims
    }

    /// `batched_dims` with the innermost extent replaced by the row stride.
    pub fn padded_dims(&self, rank: usize) -> Vec<usize> {
        let mut dims = self.batched_dims(rank);
        if let Some(last) = dims.last_mut() {
            *last = self.row_stride();
        }
        dims
    }

    /// Copy the logical values out of a padded buffer.
    pub fn gather(&self, padded: &[f32]) -> Result<Vec<f32>> {
        self.check_len(padded.len())?;
        let (cols, stride) = (self.cols(), self.row_stride());
        let row_count = self.matrix_count() * self.rows();
        let mut out = Vec::with_capacity(self.logical_len());
        for r in 0..row_count {
            out.extend_from_slice(&padded[r * stride..r * stride + cols]);
        }
        Ok(out)
    }

    /// Write logical values into a padded buffer, leaving padding untouched.
    pub fn scatter(&self, logical: &[f32], padded: &mut [f32]) -> Result<()> {
        self.check_len(padded.len())?;
        if logical.len() != self.logical_len() {
            return Err(Error::invalid_argument(format!(
                "expected {} values for {} x {}, got {}",
                self.logical_len(),
                self.batch_size,
                self.shape,
                logical.len()
            )));
        }
        let (cols, stride) = (self.cols(), self.row_stride());
        for (r, row) in logical.chunks_exact(cols).enumerate() {
            padded[r * stride..r * stride + cols].copy_from_slice(row);
        }
        Ok(())
    }

    /// Compress a dense region into one CSR matrix per matrix of the batch.
    pub fn compress_csr(&self, dense: &[f32]) -> Result<Vec<CsrMatrix>> {
        let stride = self.matrix_stride();
        (0..self.matrix_count())
            .map(|m| {
                let block = dense.get(m * stride..(m + 1) * stride).ok_or_else(|| {
                    Error::invalid_argument("dense region shorter than the layout")
                })?;
                CsrMatrix::from_dense(self.rows(), self.cols(), self.row_stride(), block)
            })
            .collect()
    }

    /// Expand CSR matrices into a dense region.
    pub fn expand_csr(&self, matrices: &[CsrMatrix], dense: &mut [f32]) -> Result<()> {
        if matrices.len() != self.matrix_count() {
            return Err(Error::invalid_argument(format!(
                "expected {} CSR matrices, got {}",
                self.matrix_count(),
                matrices.len()
            )));
        }
        let stride = self.matrix_stride();
        for (m, csr) in matrices.iter().enumerate() {
            if csr.rows != self.rows() || csr.cols != self.cols() {
                return Err(Error::invalid_argument(format!(
                    "CSR matrix {m} is {}x{}, layout wants {}x{}",
                    csr.rows,
                    csr.cols,
                    self.rows(),
                    self.cols()
                )));
            }
            let block = dense.get_mut(m * stride..(m + 1) * stride).ok_or_else(|| {
                Error::invalid_argument("dense region shorter than the layout")
            })?;
            csr.to_dense(self.row_stride(), block)?;
        }
        Ok(())
    }

    fn check_len(&self, len: usize) -> Result<()> {
        if len < self.dense_len() {
            return Err(Error::invalid_argument(format!(
                "buffer of {len} elements is smaller than the dense region ({})",
                self.dense_len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(dims: &[usize], batch: usize) -> Layout {
        Layout::new(Shape::new(dims.to_vec()).unwrap(), batch, 8).unwrap()
    }

    #[test]
    fn test_sizes() {
        let l = layout(&[3, 4], 2);
        assert_eq!(l.row_stride(), 8);
        assert_eq!(l.dense_len(), 2 * 3 * 8);
        assert_eq!(l.host_capacity(), 2 * 8 * 8);
        assert_eq!(l.logical_len(), 24);
    }

    #[test]
    fn test_aligned_cols_need_no_padding() {
        let l = layout(&[2, 16], 1);
        assert_eq!(l.row_stride(), 16);
        assert_eq!(l.dense_len(), 32);
    }

    #[test]
    fn test_batched_dims() {
        let l = layout(&[3, 4], 2);
        assert_eq!(l.batched_dims(3), vec![2, 1, 3, 4]);
        assert_eq!(l.padded_dims(2), vec![2, 3, 8]);
    }

    #[test]
    fn test_scatter_gather() {
        let l = layout(&[2, 3], 1);
        let mut buf = vec![0.0; l.dense_len()];
        l.scatter(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &mut buf).unwrap();
        assert_eq!(&buf[..3], &[1.0, 2.0, 3.0]);
        assert_eq!(&buf[8..11], &[4.0, 5.0, 6.0]);
        assert_eq!(buf[3], 0.0);
        assert_eq!(l.gather(&buf).unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_zero_batch_rejected() {
        assert!(Layout::new(Shape::new(vec![2]).unwrap(), 0, 8).is_err());
    }
}
