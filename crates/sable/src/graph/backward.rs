// BackwardOp — Gradient rules of the recorded operations
//
// Each variant carries the operand keys of the operation that produced a
// node. `invoke` reads the produced node's gradient (and whatever forward
// values the rule needs) and ACCUMULATES into every trainable operand's
// gradient. Non-trainable operands are skipped.
//
// GRADIENT RULES (y is the produced node, dy its gradient):
//
//   Add:     da += reduce(dy),           db += reduce(dy)
//   Sub:     da += reduce(dy),           db += -reduce(dy)
//   Dot:     da += reduce(dy * b),       db += reduce(dy * a)
//   Matmul:  da += dy · bᵀ,              db += aᵀ · dy
//   Scale:   da += dy * factor
//   Relu:    da += dy where y > 0
//
// reduce() sums over every dimension the operand was broadcast along, so an
// operand of shape [1, n] added to [m, n] receives the column sums of dy.

use sable_core::{compute, Result, TensorStorage};
use tracing::trace;

use super::node::NodeKey;
use super::registry::GraphRegistry;

/// Backward rule of one recorded operation.
#[derive(Debug, Clone, PartialEq)]
pub enum BackwardOp {
    Add { a: NodeKey, b: NodeKey },
    Sub { a: NodeKey, b: NodeKey },
    /// Elementwise product.
    Dot { a: NodeKey, b: NodeKey },
    Matmul { a: NodeKey, b: NodeKey },
    Scale { a: NodeKey, factor: f32 },
    Relu { a: NodeKey },
}

impl BackwardOp {
    pub fn name(&self) -> &'static str {
        match self {
            BackwardOp::Add { .. } => "add",
            BackwardOp::Sub { .. } => "sub",
            BackwardOp::Dot { .. } => "dot",
            BackwardOp::Matmul { .. } => "matmul",
            BackwardOp::Scale { .. } => "scale",
            BackwardOp::Relu { .. } => "relu",
        }
    }

    /// Operand keys in argument order. A node used twice appears twice.
    pub fn operands(&self) -> Vec<NodeKey> {
        match *self {
            BackwardOp::Add { a, b }
            | BackwardOp::Sub { a, b }
            | BackwardOp::Dot { a, b }
            | BackwardOp::Matmul { a, b } => vec![a, b],
            BackwardOp::Scale { a, .. } | BackwardOp::Relu { a } => vec![a],
        }
    }

    /// Propagate the gradient of `output` into the operands.
    pub fn invoke(&self, registry: &GraphRegistry, output: NodeKey) -> Result<()> {
        let y = registry.node(output)?;
        let dy = y.gradient()?;
        trace!(op = self.name(), %output, "invoke backward");

        match *self {
            BackwardOp::Add { a, b } => {
                reduce_into(registry, a, dy, 1.0)?;
                reduce_into(registry, b, dy, 1.0)
            }
            BackwardOp::Sub { a, b } => {
                reduce_into(registry, a, dy, 1.0)?;
                reduce_into(registry, b, dy, -1.0)
            }
            BackwardOp::Dot { a, b } => {
                let (fa, fb) = (registry.node(a)?.forward(), registry.node(b)?.forward());
                product_into(registry, a, dy, fb)?;
                product_into(registry, b, dy, fa)
            }
            BackwardOp::Matmul { a, b } => {
                let (na, nb) = (registry.node(a)?, registry.node(b)?);
                if let Some(da) = na.backward() {
                    compute::gemm(da, dy, nb.forward(), false, true, true)?;
                }
                if let Some(db) = nb.backward() {
                    compute::gemm(db, na.forward(), dy, true, false, true)?;
                }
                Ok(())
            }
            BackwardOp::Scale { a, factor } => match registry.node(a)?.backward() {
                Some(da) => compute::accumulate(da, dy, factor),
                None => Ok(()),
            },
            BackwardOp::Relu { a } => match registry.node(a)?.backward() {
                Some(da) => compute::relu_grad(da, dy, y.forward()),
                None => Ok(()),
            },
        }
    }
}

/// grad(key) += factor * reduce(dy)
fn reduce_into(registry: &GraphRegistry, key: NodeKey, dy: &TensorStorage, factor: f32) -> Result<()> {
    match registry.node(key)?.backward() {
        Some(grad) => compute::accumulate_broadcast(grad, dy, factor),
        None => Ok(()),
    }
}

/// grad(key) += reduce(dy * other)
fn product_into(
    registry: &GraphRegistry,
    key: NodeKey,
    dy: &TensorStorage,
    other: &TensorStorage,
) -> Result<()> {
    let Some(grad) = registry.node(key)?.backward() else {
        return Ok(());
    };
    if grad.shape() == dy.shape() && grad.batch_size() == dy.batch_size() {
        return compute::mul_add(grad, dy, other);
    }
    let temp = TensorStorage::create(
        dy.shape().clone(),
        dy.device(),
        false,
        dy.batch_size(),
        registry.pool(),
    )?;
    compute::dot(&temp, dy, other)?;
    compute::accumulate_broadcast(grad, &temp, 1.0)?;
    temp.destroy()
}
