// Sparse — Compressed-row (CSR) matrices
//
// A sparse TensorStorage holds one CsrMatrix per `rows x cols` matrix of its
// (batch x outer dims) stack. The three arrays are typed views of the
// representation, not reinterpreted raw memory:
//
//   row_offsets  len rows + 1, row r occupies row_offsets[r]..row_offsets[r+1]
//   col_indices  len nnz, column of each stored value
//   values       len nnz
//
// CONVERSION
//
//   Dense → CSR keeps every value that is not exactly 0.0 (so -0.0 is dropped
//   and NaN is kept), scanning row-major; columns within a row ascend.
//   CSR → dense zero-fills the target and scatters the stored values,
//   summing duplicate coordinates.

use crate::error::{Error, Result};

/// One matrix in compressed sparse row form.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix {
    pub rows: usize,
    pub cols: usize,
    pub row_offsets: Vec<u32>,
    pub col_indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl CsrMatrix {
    /// An all-zero matrix.
    pub fn empty(rows: usize, cols: usize) -> Self {
        CsrMatrix {
            rows,
            cols,
            row_offsets: vec![0; rows + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Compress a dense matrix stored with row stride `ld`.
    pub fn from_dense(rows: usize, cols: usize, ld: usize, data: &[f32]) -> Result<Self> {
        if ld < cols || data.len() < rows.saturating_sub(1) * ld + cols {
            return Err(Error::invalid_argument(format!(
                "dense block of {} elements cannot hold {rows}x{cols} with stride {ld}",
                data.len()
            )));
        }
        let mut row_offsets = Vec::with_capacity(rows + 1);
        let mut col_indices = Vec::new();
        let mut values = Vec::new();
        row_offsets.push(0);
        for r in 0..rows {
            let row = &data[r * ld..r * ld + cols];
            for (c, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    col_indices.push(c as u32);
                    values.push(v);
                }
            }
            row_offsets.push(values.len() as u32);
        }
        Ok(CsrMatrix {
            rows,
            cols,
            row_offsets,
            col_indices,
            values,
        })
    }

    /// Number of stored values.
    pub fn nnz(&self) -> usize {
        self.values.len()
    }

    /// Expand into `out`, a dense matrix with row stride `ld`.
    pub fn to_dense(&self, ld: usize, out: &mut [f32]) -> Result<()> {
        self.validate()?;
        if ld < self.cols || out.len() < self.rows.saturating_sub(1) * ld + self.cols {
            return Err(Error::invalid_argument(format!(
                "dense target of {} elements cannot hold {}x{} with stride {ld}",
                out.len(),
                self.rows,
                self.cols
            )));
        }
        for r in 0..self.rows {
            out[r * ld..r * ld + self.cols].fill(0.0);
            let (start, end) = (self.row_offsets[r] as usize, self.row_offsets[r + 1] as usize);
            for i in start..end {
                out[r * ld + self.col_indices[i] as usize] += self.values[i];
            }
        }
        Ok(())
    }

    /// Check the structural invariants of the three arrays.
    pub fn validate(&self) -> Result<()> {
        let nnz = self.values.len();
        let bad = |what: &str| Err(Error::invalid_argument(format!("malformed CSR: {what}")));
        if self.row_offsets.len() != self.rows + 1 {
            return bad("row_offsets length");
        }
        if self.col_indices.len() != nnz {
            return bad("col_indices length");
        }
        if self.row_offsets.first() != Some(&0)
            || self.row_offsets.last().map(|&v| v as usize) != Some(nnz)
            || self.row_offsets.windows(2).any(|w| w[0] > w[1])
        {
            return bad("row_offsets not monotone from 0 to nnz");
        }
        if self.col_indices.iter().any(|&c| c as usize >= self.cols) {
            return bad("column index out of range");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dense_skips_zeros_and_padding() {
        // 2x3 stored with stride 4; the 9.0 is padding and must be ignored.
        let dense = [1.0, 0.0, 2.0, 9.0, 0.0, -0.0, 3.0, 9.0];
        let csr = CsrMatrix::from_dense(2, 3, 4, &dense).unwrap();
        assert_eq!(csr.row_offsets, vec![0, 2, 3]);
        assert_eq!(csr.col_indices, vec![0, 2, 2]);
        assert_eq!(csr.values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_nan_is_kept() {
        let csr = CsrMatrix::from_dense(1, 2, 2, &[f32::NAN, 0.0]).unwrap();
        assert_eq!(csr.nnz(), 1);
        assert!(csr.values[0].is_nan());
    }

    #[test]
    fn test_to_dense_sums_duplicates() {
        let csr = CsrMatrix {
            rows: 1,
            cols: 2,
            row_offsets: vec![0, 3],
            col_indices: vec![1, 1, 0],
            values: vec![1.0, 2.0, 4.0],
        };
        let mut out = [7.0; 2];
        csr.to_dense(2, &mut out).unwrap();
        assert_eq!(out, [4.0, 3.0]);
    }

    #[test]
    fn test_malformed_rejected() {
        let csr = CsrMatrix {
            rows: 1,
            cols: 2,
            row_offsets: vec![0, 1],
            col_indices: vec![5],
            values: vec![1.0],
        };
        let mut out = [0.0; 2];
        assert!(csr.to_dense(2, &mut out).is_err());
    }
}
