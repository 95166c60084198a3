// Kernels — Per-chunk numeric routines
//
// A kernel is described by a `Kernel` value and executed over one output
// chunk and zero or more input chunks. Host execution lives here
// (`run`); accelerators execute the same descriptions on their own memory
// (see `Accelerator::launch`).
//
// LEAF SEMANTICS
//
//   Elementwise kernels walk the output chunk and read each input at
//   `i % input.len()`, so a one-element input chunk is replayed across the
//   whole output. Kernels marked "accumulates" add into the output instead
//   of overwriting it; they are what backward passes use to sum gradient
//   contributions from several consumers.
//
//   ReduceSum walks the *input* and folds it into the output modulo the
//   output length; it is the adjoint of broadcasting.
//
//   Gemm works on a stack of row-major matrices whose rows are padded to
//   `lda`/`ldb`/`ldc` elements. The batch count is derived from the output
//   chunk length.

use std::ops::Range;

use rayon::prelude::*;

use crate::error::{Error, Result};

/// A window into a flat buffer: `len` elements starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub offset: usize,
    pub len: usize,
}

impl Chunk {
    pub fn new(offset: usize, len: usize) -> Self {
        Chunk { offset, len }
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

/// Matrix multiply parameters: `C[m, n] (+)= op(A)[m, k] · op(B)[k, n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GemmParams {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    /// Row stride of the stored A matrix.
    pub lda: usize,
    /// Row stride of the stored B matrix.
    pub ldb: usize,
    /// Row stride of C.
    pub ldc: usize,
    pub trans_a: bool,
    pub trans_b: bool,
    /// Add into C instead of overwriting it.
    pub accumulate: bool,
}

impl GemmParams {
    /// Elements between consecutive A matrices.
    pub fn stride_a(&self) -> usize {
        (if self.trans_a { self.k } else { self.m }) * self.lda
    }

    /// Elements between consecutive B matrices.
    pub fn stride_b(&self) -> usize {
        (if self.trans_b { self.n } else { self.k }) * self.ldb
    }

    /// Elements between consecutive C matrices.
    pub fn stride_c(&self) -> usize {
        self.m * self.ldc
    }
}

/// Matrix transpose parameters for a stack of `rows x cols` matrices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransposeParams {
    pub rows: usize,
    pub cols: usize,
    /// Row stride of the input matrices.
    pub ld_in: usize,
    /// Row stride of the output matrices.
    pub ld_out: usize,
}

/// A kernel description.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// out = a + b
    Add,
    /// out = a - b
    Sub,
    /// out = a * b
    Mul,
    /// out = a / b
    Div,
    /// out = a * factor
    Scale(f32),
    /// out = value
    Fill(f32),
    /// out = max(a, 0)
    Relu,
    /// out += dy * (y > 0), accumulating; inputs are [dy, y]
    ReluGrad,
    /// out += a * factor, accumulating
    AddScaled(f32),
    /// out += a * b, accumulating
    MulAdd,
    /// out[i % out.len] += a[i] * factor, accumulating
    ReduceSum(f32),
    /// Batched matrix multiply, inputs are [a, b]
    Gemm(GemmParams),
    /// Batched matrix transpose, input is [a]
    Transpose(TransposeParams),
}

impl Kernel {
    /// Number of input chunks the kernel reads.
    pub fn arity(&self) -> usize {
        match self {
            Kernel::Fill(_) => 0,
            Kernel::Scale(_)
            | Kernel::Relu
            | Kernel::AddScaled(_)
            | Kernel::ReduceSum(_)
            | Kernel::Transpose(_) => 1,
            Kernel::Add
            | Kernel::Sub
            | Kernel::Mul
            | Kernel::Div
            | Kernel::ReluGrad
            | Kernel::MulAdd
            | Kernel::Gemm(_) => 2,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Kernel::Add => "add",
            Kernel::Sub => "sub",
            Kernel::Mul => "mul",
            Kernel::Div => "div",
            Kernel::Scale(_) => "scale",
            Kernel::Fill(_) => "fill",
            Kernel::Relu => "relu",
            Kernel::ReluGrad => "relu_grad",
            Kernel::AddScaled(_) => "add_scaled",
            Kernel::MulAdd => "mul_add",
            Kernel::ReduceSum(_) => "reduce_sum",
            Kernel::Gemm(_) => "gemm",
            Kernel::Transpose(_) => "transpose",
        }
    }
}

/// Execute `kernel` on host slices. `out` and `inputs` are already narrowed to
/// their chunks.
pub fn run(kernel: &Kernel, out: &mut [f32], inputs: &[&[f32]]) -> Result<()> {
    if inputs.len() != kernel.arity() {
        return Err(Error::invalid_argument(format!(
            "kernel {} expects {} inputs, got {}",
            kernel.name(),
            kernel.arity(),
            inputs.len()
        )));
    }
    if inputs.iter().any(|i| i.is_empty()) {
        return Err(Error::invalid_argument(format!(
            "kernel {} received an empty input chunk",
            kernel.name()
        )));
    }

    match *kernel {
        Kernel::Add => binary(out, inputs[0], inputs[1], |a, b| a + b),
        Kernel::Sub => binary(out, inputs[0], inputs[1], |a, b| a - b),
        Kernel::Mul => binary(out, inputs[0], inputs[1], |a, b| a * b),
        Kernel::Div => binary(out, inputs[0], inputs[1], |a, b| a / b),
        Kernel::Scale(factor) => unary(out, inputs[0], |a| a * factor),
        Kernel::Fill(value) => out.fill(value),
        Kernel::Relu => unary(out, inputs[0], |a| a.max(0.0)),
        Kernel::ReluGrad => {
            let (dy, y) = (inputs[0], inputs[1]);
            for (i, o) in out.iter_mut().enumerate() {
                if y[i % y.len()] > 0.0 {
                    *o += dy[i % dy.len()];
                }
            }
        }
        Kernel::AddScaled(factor) => {
            let a = inputs[0];
            for (i, o) in out.iter_mut().enumerate() {
                *o += a[i % a.len()] * factor;
            }
        }
        Kernel::MulAdd => {
            let (a, b) = (inputs[0], inputs[1]);
            for (i, o) in out.iter_mut().enumerate() {
                *o += a[i % a.len()] * b[i % b.len()];
            }
        }
        Kernel::ReduceSum(factor) => {
            if out.is_empty() {
                return Err(Error::invalid_argument("reduce_sum into an empty chunk"));
            }
            let n = out.len();
            for (i, &v) in inputs[0].iter().enumerate() {
                out[i % n] += v * factor;
            }
        }
        Kernel::Gemm(p) => gemm(&p, out, inputs[0], inputs[1])?,
        Kernel::Transpose(p) => transpose(&p, out, inputs[0])?,
    }
    Ok(())
}

fn binary(out: &mut [f32], a: &[f32], b: &[f32], f: impl Fn(f32, f32) -> f32) {
    if a.len() == out.len() && b.len() == out.len() {
        for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
            *o = f(x, y);
        }
        return;
    }
    for (i, o) in out.iter_mut().enumerate() {
        *o = f(a[i % a.len()], b[i % b.len()]);
    }
}

fn unary(out: &mut [f32], a: &[f32], f: impl Fn(f32) -> f32) {
    for (i, o) in out.iter_mut().enumerate() {
        *o = f(a[i % a.len()]);
    }
}

fn gemm(p: &GemmParams, out: &mut [f32], a: &[f32], b: &[f32]) -> Result<()> {
    let batch = out.len() / p.stride_c();
    if batch == 0
        || out.len() % p.stride_c() != 0
        || a.len() < batch * p.stride_a()
        || b.len() < batch * p.stride_b()
    {
        return Err(Error::invalid_argument(format!(
            "gemm chunk sizes out={} a={} b={} do not fit {:?}",
            out.len(),
            a.len(),
            b.len(),
            p
        )));
    }

    for bi in 0..batch {
        let a = &a[bi * p.stride_a()..(bi + 1) * p.stride_a()];
        let b = &b[bi * p.stride_b()..(bi + 1) * p.stride_b()];
        let c = &mut out[bi * p.stride_c()..(bi + 1) * p.stride_c()];

        // One output row per task.
        c.par_chunks_mut(p.ldc).enumerate().for_each(|(i, row)| {
            for (j, cell) in row.iter_mut().take(p.n).enumerate() {
                let mut sum = 0.0f32;
                for q in 0..p.k {
                    let av = if p.trans_a {
                        a[q * p.lda + i]
                    } else {
                        a[i * p.lda + q]
                    };
                    let bv = if p.trans_b {
                        b[j * p.ldb + q]
                    } else {
                        b[q * p.ldb + j]
                    };
                    sum += av * bv;
                }
                if p.accumulate {
                    *cell += sum;
                } else {
                    *cell = sum;
                }
            }
        });
    }
    Ok(())
}

fn transpose(p: &TransposeParams, out: &mut [f32], input: &[f32]) -> Result<()> {
    let in_stride = p.rows * p.ld_in;
    let out_stride = p.cols * p.ld_out;
    let batch = out.len() / out_stride;
    if batch == 0 || input.len() < batch * in_stride {
        return Err(Error::invalid_argument(format!(
            "transpose chunk sizes out={} in={} do not fit {:?}",
            out.len(),
            input.len(),
            p
        )));
    }
    for bi in 0..batch {
        let src = &input[bi * in_stride..];
        let dst = &mut out[bi * out_stride..];
        for i in 0..p.rows {
            for j in 0..p.cols {
                dst[j * p.ld_out + i] = src[i * p.ld_in + j];
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_replays_short_input() {
        let mut out = vec![0.0; 4];
        run(&Kernel::Add, &mut out, &[&[1.0, 2.0, 3.0, 4.0], &[10.0]]).unwrap();
        assert_eq!(out, vec![11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn test_accumulating_kernels() {
        let mut out = vec![1.0; 2];
        run(&Kernel::AddScaled(2.0), &mut out, &[&[1.0, 2.0]]).unwrap();
        assert_eq!(out, vec![3.0, 5.0]);
        run(&Kernel::MulAdd, &mut out, &[&[1.0, 1.0], &[2.0, 3.0]]).unwrap();
        assert_eq!(out, vec![5.0, 8.0]);
    }

    #[test]
    fn test_reduce_sum_folds_input() {
        let mut out = vec![0.0; 2];
        run(&Kernel::ReduceSum(1.0), &mut out, &[&[1.0, 2.0, 3.0, 4.0]]).unwrap();
        assert_eq!(out, vec![4.0, 6.0]);
        run(&Kernel::ReduceSum(-1.0), &mut out, &[&[1.0, 1.0]]).unwrap();
        assert_eq!(out, vec![3.0, 5.0]);
    }

    #[test]
    fn test_relu_grad_masks_by_output() {
        let mut out = vec![0.0; 3];
        run(&Kernel::ReluGrad, &mut out, &[&[1.0, 1.0, 1.0], &[2.0, 0.0, -1.0]]).unwrap();
        assert_eq!(out, vec![1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_gemm_with_padding() {
        // A = [[1, 2], [3, 4]] stored with row stride 4, B = identity.
        let a = [1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0];
        let b = [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let mut c = vec![0.0; 8];
        let p = GemmParams {
            m: 2,
            n: 2,
            k: 2,
            lda: 4,
            ldb: 4,
            ldc: 4,
            trans_a: false,
            trans_b: false,
            accumulate: false,
        };
        run(&Kernel::Gemm(p), &mut c, &[&a, &b]).unwrap();
        assert_eq!(c, vec![1.0, 2.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0]);
    }

    #[test]
    fn test_gemm_transposed_operand() {
        // A^T · A for A = [[1, 2]] → [[1, 2], [2, 4]]
        let a = [1.0, 2.0];
        let mut c = vec![0.0; 4];
        let p = GemmParams {
            m: 2,
            n: 2,
            k: 1,
            lda: 2,
            ldb: 2,
            ldc: 2,
            trans_a: true,
            trans_b: false,
            accumulate: false,
        };
        run(&Kernel::Gemm(p), &mut c, &[&a, &a]).unwrap();
        assert_eq!(c, vec![1.0, 2.0, 2.0, 4.0]);
    }

    #[test]
    fn test_arity_is_checked() {
        let mut out = vec![0.0; 2];
        assert!(run(&Kernel::Add, &mut out, &[&[1.0]]).is_err());
    }
}
