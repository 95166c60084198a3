// Compute — Numeric entry points on TensorStorage
//
// Every entry point follows the same steps:
//
//   1. Validate: all storages dense (TypeMismatch), on the output's device
//      (DeviceMismatch), with broadcast-compatible shapes and batch sizes
//      (ShapeMismatch). Nothing is written before validation passes.
//   2. Describe each storage as a broadcast Operand: batch folded in as the
//      leading dimension, logical extents for the broadcast decision, padded
//      extents for strides.
//   3. Run BroadcastDispatch and execute the Kernel on each chunk, on host
//      slices or through `Accelerator::launch`.
//
// Outputs are written in place. Any input that is the output storage itself
// is snapshotted before the output is locked for writing.
//
// Forward ops overwrite their output. The `accumulate*`, `mul_add`,
// `relu_grad` and accumulating `gemm` calls add into it, which is what
// gradient propagation needs.

use std::ptr;
use std::sync::RwLockReadGuard;

use crate::accelerator::{DeviceBuffer, DeviceChunk};
use crate::broadcast::{self, Operand};
use crate::error::{Error, Result};
use crate::kernels::{self, GemmParams, Kernel, TransposeParams};
use crate::shape::Shape;
use crate::storage::{StorageData, TensorStorage};

// Validation helpers

fn require_device(out: &TensorStorage, inputs: &[&TensorStorage]) -> Result<()> {
    for input in inputs {
        if input.device() != out.device() {
            return Err(Error::DeviceMismatch {
                expected: out.device(),
                got: input.device(),
            });
        }
    }
    Ok(())
}

fn require_dense(storages: &[&TensorStorage]) -> Result<()> {
    storages.iter().try_for_each(|s| s.require_dense())
}

fn batched_shape(s: &TensorStorage) -> Result<Shape> {
    s.shape().with_leading(s.batch_size())
}

fn shape_mismatch(expected: &TensorStorage, got: &TensorStorage) -> Error {
    match (batched_shape(expected), batched_shape(got)) {
        (Ok(expected), Ok(got)) => Error::ShapeMismatch { expected, got },
        (Err(e), _) | (_, Err(e)) => e,
    }
}

/// `input` replays into `target`: same or lower rank, every extent equal or 1,
/// batch equal or 1.
fn broadcasts_into(input: &TensorStorage, target: &TensorStorage) -> bool {
    let rank = target.shape().rank();
    if input.shape().rank() > rank {
        return false;
    }
    let dims_ok = input
        .shape()
        .expand(rank)
        .dims()
        .iter()
        .zip(target.shape().dims())
        .all(|(&i, &t)| i == t || i == 1);
    let batch_ok = input.batch_size() == target.batch_size() || input.batch_size() == 1;
    dims_ok && batch_ok
}

fn operand(s: &TensorStorage, rank: usize) -> Result<Operand> {
    Operand::new(s.layout().batched_dims(rank), s.layout().padded_dims(rank))
}

// Execution

enum HostInput<'a> {
    Locked(RwLockReadGuard<'a, StorageData>),
    Snapshot(Vec<f32>),
}

impl HostInput<'_> {
    fn slice(&self) -> Result<&[f32]> {
        match self {
            HostInput::Locked(data) => data.host(),
            HostInput::Snapshot(values) => Ok(values.as_slice()),
        }
    }
}

fn narrow<'a>(buf: &'a [f32], chunk: &kernels::Chunk) -> Result<&'a [f32]> {
    buf.get(chunk.range())
        .ok_or_else(|| Error::msg(format!("chunk {chunk:?} outside buffer of {}", buf.len())))
}

/// Dispatch `kernel` over `reference` with `out` as operand 0 and `inputs`
/// after it.
fn execute(
    kernel: Kernel,
    reference: &[usize],
    min_dim: usize,
    rank: usize,
    out: &TensorStorage,
    inputs: &[&TensorStorage],
) -> Result<()> {
    let mut operands = Vec::with_capacity(inputs.len() + 1);
    operands.push(operand(out, rank)?);
    for input in inputs {
        operands.push(operand(input, rank)?);
    }

    if out.device().is_accelerator() {
        return execute_device(kernel, reference, min_dim, &operands, out, inputs);
    }

    // Distinct inputs, each read once; the output itself is snapshotted.
    let mut held: Vec<(&TensorStorage, HostInput<'_>)> = Vec::new();
    let mut slots = Vec::with_capacity(inputs.len());
    for &input in inputs {
        if let Some(i) = held.iter().position(|(s, _)| ptr::eq(*s, input)) {
            slots.push(i);
            continue;
        }
        let data = if ptr::eq(input, out) {
            HostInput::Snapshot(input.read()?.host()?.to_vec())
        } else {
            HostInput::Locked(input.read()?)
        };
        slots.push(held.len());
        held.push((input, data));
    }
    let buffers = held
        .iter()
        .map(|(_, h)| h.slice())
        .collect::<Result<Vec<_>>>()?;

    let mut out_data = out.write()?;
    let out_buf = out_data.host_mut()?;
    broadcast::dispatch(reference, &operands, min_dim, |chunks| {
        let views = slots
            .iter()
            .zip(&chunks[1..])
            .map(|(&slot, chunk)| narrow(buffers[slot], chunk))
            .collect::<Result<Vec<_>>>()?;
        let len = out_buf.len();
        let target = out_buf.get_mut(chunks[0].range()).ok_or_else(|| {
            Error::msg(format!("chunk {:?} outside buffer of {len}", chunks[0]))
        })?;
        kernels::run(&kernel, target, &views)
    })
}

fn execute_device(
    kernel: Kernel,
    reference: &[usize],
    min_dim: usize,
    operands: &[Operand],
    out: &TensorStorage,
    inputs: &[&TensorStorage],
) -> Result<()> {
    let acc = out.accelerator()?;

    // Device memory is written through the accelerator, so read guards on
    // every distinct storage (the output included) are enough.
    let mut held: Vec<(&TensorStorage, RwLockReadGuard<'_, StorageData>)> = Vec::new();
    let mut slots = Vec::with_capacity(inputs.len() + 1);
    for &storage in std::iter::once(&out).chain(inputs.iter()) {
        if let Some(i) = held.iter().position(|(s, _)| ptr::eq(*s, storage)) {
            slots.push(i);
            continue;
        }
        slots.push(held.len());
        held.push((storage, storage.read()?));
    }
    let buffers = held
        .iter()
        .map(|(_, data)| data.device_buffer())
        .collect::<Result<Vec<&DeviceBuffer>>>()?;

    broadcast::dispatch(reference, operands, min_dim, |chunks| {
        let target = DeviceChunk::new(buffers[slots[0]], chunks[0]);
        let sources: Vec<DeviceChunk<'_>> = slots[1..]
            .iter()
            .zip(&chunks[1..])
            .map(|(&slot, &chunk)| DeviceChunk::new(buffers[slot], chunk))
            .collect();
        acc.launch(&kernel, target, &sources)
    })
}

/// Elementwise op whose output has exactly the broadcast shape of `inputs`.
fn elementwise(kernel: Kernel, out: &TensorStorage, inputs: &[&TensorStorage]) -> Result<()> {
    let mut all = vec![out];
    all.extend_from_slice(inputs);
    require_dense(&all)?;
    require_device(out, inputs)?;

    let mut expected = inputs
        .first()
        .map(|s| s.shape().clone())
        .ok_or_else(|| Error::invalid_argument("elementwise op without inputs"))?;
    for input in &inputs[1..] {
        expected = Shape::broadcast_shape(&expected, input.shape())?;
    }
    let batch = inputs.iter().map(|s| s.batch_size()).max().unwrap_or(1);
    if &expected != out.shape() || batch != out.batch_size() {
        let got = expected.with_leading(batch)?;
        return Err(Error::ShapeMismatch {
            expected: batched_shape(out)?,
            got,
        });
    }
    for input in inputs {
        if !broadcasts_into(input, out) {
            return Err(shape_mismatch(out, input));
        }
    }

    let rank = out.shape().rank();
    let reference = out.layout().batched_dims(rank);
    execute(kernel, &reference, 0, rank, out, inputs)
}

// Forward ops

/// out = a + b
pub fn add(out: &TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<()> {
    elementwise(Kernel::Add, out, &[a, b])
}

/// out = a - b
pub fn sub(out: &TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<()> {
    elementwise(Kernel::Sub, out, &[a, b])
}

/// out = a * b (elementwise)
pub fn dot(out: &TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<()> {
    elementwise(Kernel::Mul, out, &[a, b])
}

/// out = a / b (elementwise)
pub fn div(out: &TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<()> {
    elementwise(Kernel::Div, out, &[a, b])
}

/// out = a * factor
pub fn scale(out: &TensorStorage, a: &TensorStorage, factor: f32) -> Result<()> {
    elementwise(Kernel::Scale(factor), out, &[a])
}

/// out = max(a, 0)
pub fn relu(out: &TensorStorage, a: &TensorStorage) -> Result<()> {
    elementwise(Kernel::Relu, out, &[a])
}

/// Set every logical element of `out` to `value`.
pub fn fill(out: &TensorStorage, value: f32) -> Result<()> {
    out.require_dense()?;
    out.fill(value)
}

/// Batched matrix product. Leading dimensions (batch included) broadcast;
/// the two innermost dimensions follow matrix rules.
pub fn matmul(out: &TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<()> {
    let rank = a.shape().rank().max(b.shape().rank()).max(2);
    let (ea, eb) = (a.shape().expand(rank), b.shape().expand(rank));
    let (m, k, n) = (ea.rows(), ea.cols(), eb.cols());
    if eb.rows() != k {
        return Err(Error::ShapeMismatch {
            expected: a.shape().transposed(),
            got: b.shape().clone(),
        });
    }
    let mut dims = Vec::with_capacity(rank);
    for (&da, &db) in ea.dims()[..rank - 2].iter().zip(&eb.dims()[..rank - 2]) {
        if da != db && da != 1 && db != 1 {
            return Err(Error::ShapeMismatch {
                expected: a.shape().clone(),
                got: b.shape().clone(),
            });
        }
        dims.push(da.max(db));
    }
    dims.extend_from_slice(&[m, n]);
    let expected = Shape::new(dims)?;
    let batch = a.batch_size().max(b.batch_size());
    if &expected != out.shape() || batch != out.batch_size() {
        return Err(Error::ShapeMismatch {
            expected: batched_shape(out)?,
            got: expected.with_leading(batch)?,
        });
    }
    gemm(out, a, b, false, false, false)
}

// Gradient helpers

/// Batched `out (+)= op(a) · op(b)` where `op` optionally transposes the two
/// innermost dimensions. Leading dimensions of all three storages broadcast
/// against each other; when `out` is the broadcast side its matrices
/// accumulate every product that maps onto them.
pub fn gemm(
    out: &TensorStorage,
    a: &TensorStorage,
    b: &TensorStorage,
    trans_a: bool,
    trans_b: bool,
    accumulate: bool,
) -> Result<()> {
    require_dense(&[out, a, b])?;
    require_device(out, &[a, b])?;

    let rank = [out, a, b]
        .iter()
        .map(|s| s.shape().rank())
        .max()
        .unwrap_or(2)
        .max(2);
    let (eo, ea, eb) = (
        out.shape().expand(rank),
        a.shape().expand(rank),
        b.shape().expand(rank),
    );
    let (m, ka) = if trans_a {
        (ea.cols(), ea.rows())
    } else {
        (ea.rows(), ea.cols())
    };
    let (kb, n) = if trans_b {
        (eb.cols(), eb.rows())
    } else {
        (eb.rows(), eb.cols())
    };
    if ka != kb {
        return Err(shape_mismatch(a, b));
    }
    if eo.rows() != m || eo.cols() != n {
        return Err(shape_mismatch(out, a));
    }

    let storages = [out, a, b];
    let dims: Vec<Vec<usize>> = storages.iter().map(|s| s.layout().batched_dims(rank)).collect();
    let mut reference = Vec::with_capacity(rank + 1);
    for d in 0..rank - 1 {
        let extent = dims.iter().map(|v| v[d]).max().unwrap_or(1);
        if dims.iter().any(|v| v[d] != extent && v[d] != 1) {
            return Err(shape_mismatch(a, b));
        }
        reference.push(extent);
    }
    reference.extend_from_slice(&[m, n]);

    let params = GemmParams {
        m,
        n,
        k: ka,
        lda: a.layout().row_stride(),
        ldb: b.layout().row_stride(),
        ldc: out.layout().row_stride(),
        trans_a,
        trans_b,
        accumulate,
    };
    execute(Kernel::Gemm(params), &reference, 2, rank, out, &[a, b])
}

/// out = aᵀ over the two innermost dimensions.
pub fn transpose(out: &TensorStorage, a: &TensorStorage) -> Result<()> {
    require_dense(&[out, a])?;
    require_device(out, &[a])?;
    if out.shape() != &a.shape().transposed() || out.batch_size() != a.batch_size() {
        return Err(shape_mismatch(out, a));
    }
    let rank = out.shape().rank();
    let ea = a.shape().expand(rank);
    let params = TransposeParams {
        rows: ea.rows(),
        cols: ea.cols(),
        ld_in: a.layout().row_stride(),
        ld_out: out.layout().row_stride(),
    };
    let reference = out.layout().batched_dims(rank);
    execute(Kernel::Transpose(params), &reference, 2, rank, out, &[a])
}

/// dst += src * factor, with `src` broadcasting into `dst`.
pub fn accumulate(dst: &TensorStorage, src: &TensorStorage, factor: f32) -> Result<()> {
    require_dense(&[dst, src])?;
    require_device(dst, &[src])?;
    if !broadcasts_into(src, dst) {
        return Err(shape_mismatch(dst, src));
    }
    let rank = dst.shape().rank();
    let reference = dst.layout().batched_dims(rank);
    execute(Kernel::AddScaled(factor), &reference, 0, rank, dst, &[src])
}

/// dst += factor * (src summed over every dimension where `dst` has extent 1).
///
/// This is the adjoint of broadcasting: it folds the gradient of a broadcast
/// result back onto the smaller operand.
pub fn accumulate_broadcast(dst: &TensorStorage, src: &TensorStorage, factor: f32) -> Result<()> {
    require_dense(&[dst, src])?;
    require_device(dst, &[src])?;
    if !broadcasts_into(dst, src) {
        return Err(shape_mismatch(src, dst));
    }
    let rank = src.shape().rank();
    let reference = src.layout().batched_dims(rank);
    execute(Kernel::ReduceSum(factor), &reference, 0, rank, dst, &[src])
}

/// out += a * b
pub fn mul_add(out: &TensorStorage, a: &TensorStorage, b: &TensorStorage) -> Result<()> {
    require_dense(&[out, a, b])?;
    require_device(out, &[a, b])?;
    for input in [a, b] {
        if !broadcasts_into(input, out) {
            return Err(shape_mismatch(out, input));
        }
    }
    let rank = out.shape().rank();
    let reference = out.layout().batched_dims(rank);
    execute(Kernel::MulAdd, &reference, 0, rank, out, &[a, b])
}

/// out += dy where y > 0
pub fn relu_grad(out: &TensorStorage, dy: &TensorStorage, y: &TensorStorage) -> Result<()> {
    require_dense(&[out, dy, y])?;
    require_device(out, &[dy, y])?;
    for input in [dy, y] {
        if !broadcasts_into(input, out) {
            return Err(shape_mismatch(out, input));
        }
    }
    let rank = out.shape().rank();
    let reference = out.layout().batched_dims(rank);
    execute(Kernel::ReluGrad, &reference, 0, rank, out, &[dy, y])
}
