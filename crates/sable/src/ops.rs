// Ops — Graph-recording functional operations
//
// Each op reads its operands' forward storages from the registry, computes a
// fresh output storage through `sable_core::compute`, registers it as a new
// node and records the history edges autograd needs:
//
//   output node   Output { BackwardOp, save_output }
//   operand nodes Operand { consumers += output }
//
// The output is trainable iff some operand is. Nothing is registered when the
// computation fails, so a rejected op leaves the registry unchanged.

use sable_core::{compute, Device, Error, Result, Shape, TensorStorage};

use crate::graph::{BackwardOp, GraphRegistry, NodeKey, StorageType};

/// Register a dense node on `device` holding `values`.
pub fn from_values(
    registry: &mut GraphRegistry,
    shape: Shape,
    device: Device,
    values: &[f32],
    trainable: bool,
) -> Result<NodeKey> {
    let forward = TensorStorage::create(shape, device, false, 1, registry.pool())?;
    forward.load(values)?;
    registry.insert_node(forward, trainable)
}

/// Register a zero-initialized dense node.
pub fn zeros(
    registry: &mut GraphRegistry,
    shape: Shape,
    device: Device,
    trainable: bool,
) -> Result<NodeKey> {
    registry.register_node(shape, StorageType::Dense, device, 1, trainable)
}

/// y = a + b (broadcasting)
pub fn add(registry: &mut GraphRegistry, a: NodeKey, b: NodeKey) -> Result<NodeKey> {
    elementwise(registry, a, b, compute::add, BackwardOp::Add { a, b })
}

/// y = a - b (broadcasting)
pub fn sub(registry: &mut GraphRegistry, a: NodeKey, b: NodeKey) -> Result<NodeKey> {
    elementwise(registry, a, b, compute::sub, BackwardOp::Sub { a, b })
}

/// y = a * b elementwise (broadcasting)
pub fn dot(registry: &mut GraphRegistry, a: NodeKey, b: NodeKey) -> Result<NodeKey> {
    elementwise(registry, a, b, compute::dot, BackwardOp::Dot { a, b })
}

/// y = a · b over the two innermost dimensions; leading dimensions broadcast.
pub fn matmul(registry: &mut GraphRegistry, a: NodeKey, b: NodeKey) -> Result<NodeKey> {
    let (na, nb) = (registry.node(a)?, registry.node(b)?);
    let shape = matmul_shape(na.shape(), nb.shape())?;
    let batch = na.batch_size().max(nb.batch_size());
    let out = TensorStorage::create(shape, na.device(), false, batch, registry.pool())?;
    compute::matmul(&out, na.forward(), nb.forward())?;
    let trainable = na.is_trainable() || nb.is_trainable();
    finish(registry, out, trainable, BackwardOp::Matmul { a, b }, false)
}

/// y = a * factor
pub fn scale(registry: &mut GraphRegistry, a: NodeKey, factor: f32) -> Result<NodeKey> {
    let na = registry.node(a)?;
    let out = like(registry, na.forward())?;
    compute::scale(&out, na.forward(), factor)?;
    let trainable = na.is_trainable();
    finish(registry, out, trainable, BackwardOp::Scale { a, factor }, false)
}

/// y = max(a, 0). The output is saved: its gradient rule reads it.
pub fn relu(registry: &mut GraphRegistry, a: NodeKey) -> Result<NodeKey> {
    let na = registry.node(a)?;
    let out = like(registry, na.forward())?;
    compute::relu(&out, na.forward())?;
    let trainable = na.is_trainable();
    finish(registry, out, trainable, BackwardOp::Relu { a }, true)
}

type BinaryFn = fn(&TensorStorage, &TensorStorage, &TensorStorage) -> Result<()>;

fn elementwise(
    registry: &mut GraphRegistry,
    a: NodeKey,
    b: NodeKey,
    f: BinaryFn,
    op: BackwardOp,
) -> Result<NodeKey> {
    let (na, nb) = (registry.node(a)?, registry.node(b)?);
    if na.device() != nb.device() {
        return Err(Error::DeviceMismatch {
            expected: na.device(),
            got: nb.device(),
        });
    }
    let shape = Shape::broadcast_shape(na.shape(), nb.shape())?;
    let batch = na.batch_size().max(nb.batch_size());
    let out = TensorStorage::create(shape, na.device(), false, batch, registry.pool())?;
    f(&out, na.forward(), nb.forward())?;
    let trainable = na.is_trainable() || nb.is_trainable();
    finish(registry, out, trainable, op, false)
}

fn like(registry: &GraphRegistry, s: &TensorStorage) -> Result<TensorStorage> {
    TensorStorage::create(
        s.shape().clone(),
        s.device(),
        false,
        s.batch_size(),
        registry.pool(),
    )
}

fn finish(
    registry: &mut GraphRegistry,
    out: TensorStorage,
    trainable: bool,
    op: BackwardOp,
    save_output: bool,
) -> Result<NodeKey> {
    let key = registry.insert_node(out, trainable)?;
    registry.record(key, op, save_output)?;
    Ok(key)
}

/// Result shape of a broadcasting matrix product.
pub fn matmul_shape(a: &Shape, b: &Shape) -> Result<Shape> {
    let rank = a.rank().max(b.rank()).max(2);
    let (ea, eb) = (a.expand(rank), b.expand(rank));
    if ea.cols() != eb.rows() {
        return Err(Error::ShapeMismatch {
            expected: a.transposed(),
            got: b.clone(),
        });
    }
    let mut dims = Vec::with_capacity(rank);
    for (&da, &db) in ea.dims()[..rank - 2].iter().zip(&eb.dims()[..rank - 2]) {
        if da != db && da != 1 && db != 1 {
            return Err(Error::ShapeMismatch {
                expected: a.clone(),
                got: b.clone(),
            });
        }
        dims.push(da.max(db));
    }
    dims.extend_from_slice(&[ea.rows(), eb.cols()]);
    Shape::new(dims)
}
