// BroadcastDispatch — Run a chunk kernel over broadcasting operands
//
// Given a reference shape and N operands whose extents match the reference
// or are 1 at every dimension, `dispatch` calls a kernel closure once per
// contiguous chunk, handing it one Chunk (offset, len) per operand. No
// expanded copy of a broadcasting operand is ever built: an extent-1
// dimension is replayed by reusing the same offset (modulo indexing).
//
// WALK
//
//   Starting at dimension `dim`, a cursor greedily absorbs dimensions while
//   no operand broadcasts there. The trailing `min_dim` dimensions are the
//   kernel's own window (a matrix kernel wants rows and cols intact) and are
//   never split.
//
//   - Cursor reaches the window: one kernel call covers everything from
//     `dim` inward (the fast path, no recursion).
//   - Otherwise the absorbed dimensions are iterated as one flat count, and
//     for each, the broadcasting dimension at the cursor is iterated with
//     `(i % extent) * stride` per operand before recursing one deeper.
//   - Walking past the last dimension is a single-element leaf.
//
//   For out [4, 1, 8] with a [4, 1, 8] and b [1, 1, 8], dim 0 broadcasts,
//   so the kernel runs four times on 8-element chunks and b's offset is 0
//   every time.
//
// Operands carry logical extents for the broadcast decision and padded
// extents for strides and chunk lengths, so padded buffers dispatch as is.

use tracing::trace;

use crate::error::{Error, Result};
use crate::kernels::Chunk;
use crate::shape::Shape;

/// One buffer taking part in a dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operand {
    dims: Vec<usize>,
    padded: Vec<usize>,
    strides: Vec<usize>,
}

impl Operand {
    /// An operand with logical extents `dims` stored with extents `padded`
    /// (row-major). Both must have the same rank, and each padded extent must
    /// be at least the logical one.
    pub fn new(dims: Vec<usize>, padded: Vec<usize>) -> Result<Self> {
        if dims.len() != padded.len() || dims.iter().zip(&padded).any(|(d, p)| p < d) {
            return Err(Error::invalid_argument(format!(
                "padded extents {padded:?} do not cover {dims:?}"
            )));
        }
        let mut strides = vec![1usize; padded.len()];
        for i in (0..padded.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * padded[i + 1];
        }
        Ok(Operand {
            dims,
            padded,
            strides,
        })
    }

    /// A densely packed operand.
    pub fn contiguous(dims: Vec<usize>) -> Self {
        let padded = dims.clone();
        let mut strides = vec![1usize; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * dims[i + 1];
        }
        Operand {
            dims,
            padded,
            strides,
        }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    fn span_from(&self, dim: usize) -> usize {
        self.padded[dim..].iter().product()
    }

    fn broadcasts_at(&self, reference: &[usize], d: usize) -> bool {
        self.dims[d] == 1 && reference[d] > 1
    }
}

/// Invoke `kernel` over every chunk of the broadcast of `operands` against
/// `reference`. The chunk slice handed to the kernel is parallel to
/// `operands`.
pub fn dispatch<F>(
    reference: &[usize],
    operands: &[Operand],
    min_dim: usize,
    kernel: F,
) -> Result<()>
where
    F: FnMut(&[Chunk]) -> Result<()>,
{
    let rank = reference.len();
    if rank == 0 || operands.is_empty() {
        return Err(Error::invalid_argument("dispatch needs a shape and operands"));
    }
    let window_start = rank.saturating_sub(min_dim);
    for op in operands {
        let compatible = op.dims.len() == rank
            && op.dims[..window_start]
                .iter()
                .zip(reference)
                .all(|(&d, &r)| d == r || d == 1);
        if !compatible {
            return Err(Error::ShapeMismatch {
                expected: Shape::new(reference.to_vec())?,
                got: Shape::new(op.dims.clone())?,
            });
        }
    }

    let mut walker = Walker {
        reference,
        operands,
        window_start,
        kernel,
        chunks: Vec::with_capacity(operands.len()),
    };
    walker.recurse(0, &vec![0; operands.len()])
}

struct Walker<'a, F> {
    reference: &'a [usize],
    operands: &'a [Operand],
    window_start: usize,
    kernel: F,
    chunks: Vec<Chunk>,
}

impl<'a, F> Walker<'a, F>
where
    F: FnMut(&[Chunk]) -> Result<()>,
{
    fn recurse(&mut self, dim: usize, offsets: &[usize]) -> Result<()> {
        let rank = self.reference.len();
        if dim >= rank {
            return self.call(offsets, |_| 1);
        }

        let mut cursor = dim;
        while cursor < self.window_start
            && !self
                .operands
                .iter()
                .any(|op| op.broadcasts_at(self.reference, cursor))
        {
            cursor += 1;
        }

        if cursor >= self.window_start {
            let operands = self.operands;
            return self.call(offsets, |i| operands[i].span_from(dim));
        }

        if cursor == dim {
            return self.split(cursor, offsets);
        }

        let combined: usize = self.reference[dim..cursor].iter().product();
        let mut next = offsets.to_vec();
        for j in 0..combined {
            for (i, op) in self.operands.iter().enumerate() {
                next[i] = offsets[i] + j * op.strides[cursor - 1];
            }
            self.split(cursor, &next)?;
        }
        Ok(())
    }

    /// Iterate the broadcasting dimension `dim` and recurse inward.
    fn split(&mut self, dim: usize, offsets: &[usize]) -> Result<()> {
        let mut next = offsets.to_vec();
        for i in 0..self.reference[dim] {
            for (k, op) in self.operands.iter().enumerate() {
                next[k] = offsets[k] + (i % op.dims[dim]) * op.strides[dim];
            }
            self.recurse(dim + 1, &next)?;
        }
        Ok(())
    }

    fn call(&mut self, offsets: &[usize], len: impl Fn(usize) -> usize) -> Result<()> {
        self.chunks.clear();
        for (i, &offset) in offsets.iter().enumerate() {
            self.chunks.push(Chunk::new(offset, len(i)));
        }
        trace!(chunks = ?self.chunks, "dispatch leaf");
        (self.kernel)(&self.chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(reference: &[usize], operands: &[Operand], min_dim: usize) -> Vec<Vec<Chunk>> {
        let mut calls = Vec::new();
        dispatch(reference, operands, min_dim, |chunks| {
            calls.push(chunks.to_vec());
            Ok(())
        })
        .unwrap();
        calls
    }

    #[test]
    fn test_fast_path_single_call() {
        let ops = vec![
            Operand::contiguous(vec![2, 3, 4]),
            Operand::contiguous(vec![2, 3, 4]),
        ];
        let calls = collect(&[2, 3, 4], &ops, 0);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![Chunk::new(0, 24), Chunk::new(0, 24)]);
    }

    #[test]
    fn test_leading_broadcast_replays_slice() {
        let ops = vec![
            Operand::contiguous(vec![4, 1, 8]),
            Operand::contiguous(vec![4, 1, 8]),
            Operand::contiguous(vec![1, 1, 8]),
        ];
        let calls = collect(&[4, 1, 8], &ops, 0);
        assert_eq!(calls.len(), 4);
        for (i, call) in calls.iter().enumerate() {
            assert_eq!(call[0], Chunk::new(i * 8, 8));
            assert_eq!(call[1], Chunk::new(i * 8, 8));
            assert_eq!(call[2], Chunk::new(0, 8));
        }
    }

    #[test]
    fn test_inner_broadcast_after_absorbed_dims() {
        // out [2, 3, 4], b [2, 1, 4]: dim 0 is absorbed, dim 1 broadcasts.
        let ops = vec![
            Operand::contiguous(vec![2, 3, 4]),
            Operand::contiguous(vec![2, 1, 4]),
        ];
        let calls = collect(&[2, 3, 4], &ops, 0);
        assert_eq!(calls.len(), 6);
        assert_eq!(calls[0], vec![Chunk::new(0, 4), Chunk::new(0, 4)]);
        assert_eq!(calls[2], vec![Chunk::new(8, 4), Chunk::new(0, 4)]);
        assert_eq!(calls[3], vec![Chunk::new(12, 4), Chunk::new(4, 4)]);
        assert_eq!(calls[5], vec![Chunk::new(20, 4), Chunk::new(4, 4)]);
    }

    #[test]
    fn test_column_broadcast_uses_unit_leaves() {
        let ops = vec![
            Operand::contiguous(vec![1, 3]),
            Operand::contiguous(vec![1, 1]),
        ];
        let calls = collect(&[1, 3], &ops, 0);
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| c[1] == Chunk::new(0, 1) && c[0].len == 1));
    }

    #[test]
    fn test_matrix_window_is_kept_whole() {
        // Batched matmul: out [2, 2, 2] from a [2, 2, 3] and b [1, 3, 2].
        // Window dims differ between operands; only the batch broadcasts.
        let ops = vec![
            Operand::contiguous(vec![2, 2, 2]),
            Operand::contiguous(vec![2, 2, 3]),
            Operand::contiguous(vec![1, 3, 2]),
        ];
        let calls = collect(&[2, 2, 2], &ops, 2);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec![Chunk::new(0, 4), Chunk::new(0, 6), Chunk::new(0, 6)]);
        assert_eq!(calls[1], vec![Chunk::new(4, 4), Chunk::new(6, 6), Chunk::new(0, 6)]);
    }

    #[test]
    fn test_matrix_window_fast_path() {
        let ops = vec![
            Operand::contiguous(vec![3, 2, 2]),
            Operand::contiguous(vec![3, 2, 5]),
            Operand::contiguous(vec![3, 5, 2]),
        ];
        let calls = collect(&[3, 2, 2], &ops, 2);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![Chunk::new(0, 12), Chunk::new(0, 30), Chunk::new(0, 30)]);
    }

    #[test]
    fn test_padded_strides() {
        // Two rows of 3 logical columns padded to 8.
        let out = Operand::new(vec![2, 3], vec![2, 8]).unwrap();
        let b = Operand::new(vec![1, 3], vec![1, 8]).unwrap();
        let calls = collect(&[2, 3], &[out, b], 0);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], vec![Chunk::new(8, 8), Chunk::new(0, 8)]);
    }

    #[test]
    fn test_incompatible_operand_rejected() {
        let ops = vec![Operand::contiguous(vec![3, 4]), Operand::contiguous(vec![2, 4])];
        let err = dispatch(&[3, 4], &ops, 0, |_| Ok(()));
        assert!(matches!(err, Err(Error::ShapeMismatch { .. })));
    }
}
