use std::fmt;

use crate::error::{Error, Result};

// Shape — N-dimensional extents of a tensor
//
// A Shape is an ordered list of positive extents, outermost first:
//   - Vector: Shape([5])        1 dimension
//   - Matrix: Shape([3, 4])     3 rows, 4 columns
//   - Stack:  Shape([2, 3, 4])  two 3x4 matrices
//
// The innermost extent is the column count and the one before it the row
// count; a rank-1 shape is a single row. Shapes never carry padding: the
// padded layout of a buffer is derived by TensorStorage, and the logical
// shape is what every comparison uses.
//
// BROADCASTING
//
// Two shapes are compatible at a dimension if the extents are equal or one
// of them is 1. Shapes of different rank are aligned on the right by
// left-padding the shorter one with 1s (`expand`).

/// N-dimensional shape of a tensor. Every extent is positive and the rank is
/// at least one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape, rejecting empty shapes and zero extents.
    pub fn new(dims: Vec<usize>) -> Result<Self> {
        if dims.is_empty() || dims.contains(&0) {
            return Err(Error::InvalidShape(dims));
        }
        Ok(Shape(dims))
    }

    /// The dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements (product of all dimensions).
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Option<usize> {
        self.0.get(d).copied()
    }

    /// Innermost extent.
    pub fn cols(&self) -> usize {
        self.0[self.0.len() - 1]
    }

    /// Second-innermost extent, 1 for vectors.
    pub fn rows(&self) -> usize {
        if self.rank() > 1 {
            self.0[self.0.len() - 2]
        } else {
            1
        }
    }

    /// Number of `rows x cols` matrices stacked in the outer dimensions.
    pub fn matrix_count(&self) -> usize {
        self.elem_count() / (self.rows() * self.cols())
    }

    /// Left-pad with 1s until the shape has `rank` dimensions.
    /// Shapes that already have at least `rank` dimensions are returned as is.
    pub fn expand(&self, rank: usize) -> Shape {
        if self.rank() >= rank {
            return self.clone();
        }
        let mut dims = vec![1; rank - self.rank()];
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }

    /// Prepend one outer dimension (used to fold the batch into the shape).
    pub fn with_leading(&self, extent: usize) -> Result<Shape> {
        let mut dims = Vec::with_capacity(self.rank() + 1);
        dims.push(extent);
        dims.extend_from_slice(&self.0);
        Shape::new(dims)
    }

    /// The shape with its two innermost dimensions swapped.
    pub fn transposed(&self) -> Shape {
        let mut dims = self.expand(2).0;
        let n = dims.len();
        dims.swap(n - 1, n - 2);
        Shape(dims)
    }

    /// Whether `self` and `other` can broadcast at dimension `dim` once both
    /// are expanded to the same rank.
    pub fn is_broadcast_compatible(&self, other: &Shape, dim: usize) -> bool {
        let rank = self.rank().max(other.rank());
        let l = self.expand(rank);
        let r = other.expand(rank);
        match (l.dim(dim), r.dim(dim)) {
            (Some(a), Some(b)) => a == b || a == 1 || b == 1,
            _ => false,
        }
    }

    /// Compute the broadcast output shape from two input shapes.
    ///
    /// NumPy-style rules: align from the right, missing leading dimensions
    /// count as 1, and each pair must be equal or contain a 1.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [3] and [4]          → Error
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let rank = lhs.rank().max(rhs.rank());
        let l = lhs.expand(rank);
        let r = rhs.expand(rank);
        let mut result = Vec::with_capacity(rank);
        for dim in 0..rank {
            if !l.is_broadcast_compatible(&r, dim) {
                return Err(Error::ShapeMismatch {
                    expected: lhs.clone(),
                    got: rhs.clone(),
                });
            }
            // Extents are positive, so the larger one is the broadcast extent.
            result.push(l.0[dim].max(r.0[dim]));
        }
        Ok(Shape(result))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl TryFrom<Vec<usize>> for Shape {
    type Error = Error;

    fn try_from(v: Vec<usize>) -> Result<Self> {
        Shape::new(v)
    }
}

impl TryFrom<&[usize]> for Shape {
    type Error = Error;

    fn try_from(s: &[usize]) -> Result<Self> {
        Shape::new(s.to_vec())
    }
}

impl<const N: usize> TryFrom<[usize; N]> for Shape {
    type Error = Error;

    fn try_from(s: [usize; N]) -> Result<Self> {
        Shape::new(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid() {
        assert!(Shape::new(vec![]).is_err());
        assert!(Shape::new(vec![3, 0]).is_err());
    }

    #[test]
    fn test_matrix_shape() {
        let s = Shape::new(vec![3, 4]).unwrap();
        assert_eq!(s.rank(), 2);
        assert_eq!(s.elem_count(), 12);
        assert_eq!(s.rows(), 3);
        assert_eq!(s.cols(), 4);
    }

    #[test]
    fn test_vector_is_single_row() {
        let s = Shape::new(vec![5]).unwrap();
        assert_eq!(s.rows(), 1);
        assert_eq!(s.cols(), 5);
        assert_eq!(s.matrix_count(), 1);
    }

    #[test]
    fn test_expand_left_pads() {
        let s = Shape::new(vec![3, 4]).unwrap();
        assert_eq!(s.expand(4).dims(), &[1, 1, 3, 4]);
        assert_eq!(s.expand(1).dims(), &[3, 4]);
    }

    #[test]
    fn test_broadcast_shape() {
        let a = Shape::new(vec![5, 3, 1]).unwrap();
        let b = Shape::new(vec![3, 4]).unwrap();
        assert_eq!(Shape::broadcast_shape(&a, &b).unwrap().dims(), &[5, 3, 4]);
        let c = Shape::new(vec![3]).unwrap();
        let d = Shape::new(vec![4]).unwrap();
        assert!(Shape::broadcast_shape(&c, &d).is_err());
    }

    #[test]
    fn test_broadcast_compatibility_per_dim() {
        let a = Shape::new(vec![4, 1, 8]).unwrap();
        let b = Shape::new(vec![2, 8]).unwrap();
        assert!(a.is_broadcast_compatible(&b, 0));
        assert!(a.is_broadcast_compatible(&b, 1));
        assert!(a.is_broadcast_compatible(&b, 2));
        let c = Shape::new(vec![3, 8]).unwrap();
        let d = Shape::new(vec![2, 8]).unwrap();
        assert!(!c.is_broadcast_compatible(&d, 0));
    }

    #[test]
    fn test_transposed() {
        let s = Shape::new(vec![2, 3, 4]).unwrap();
        assert_eq!(s.transposed().dims(), &[2, 4, 3]);
        let v = Shape::new(vec![4]).unwrap();
        assert_eq!(v.transposed().dims(), &[4, 1]);
    }

    #[test]
    fn test_display() {
        let s = Shape::try_from([3, 4]).unwrap();
        assert_eq!(format!("{}", s), "[3, 4]");
    }
}
