// GraphNode — One vertex of the computation graph
//
// A node owns the forward value of one tensor and, when trainable, a gradient
// accumulator of the same shape. Its history is a stack of entries in the
// order the node was produced and consumed:
//
//   Output   the node was produced by an operation; holds the BackwardOp that
//            pushes this node's gradient into the operation's operands
//   Operand  the node was read by one or more later operations; holds the
//            keys of those consumers whose gradient has not arrived yet
//
// Consecutive reads fold into the same Operand entry. During backprop each
// consumer removes its key once it has accumulated into this node; when the
// Operand entry empties it is popped, exposing the Output entry below it.
//
// READINESS
//
//   A node is ready to backpropagate iff its top entry is an Output entry.
//   Leaves (no Output entry) never become ready, which ends traversal there.

use std::fmt;

use sable_core::{Device, Error, Result, Shape, TensorStorage};

use super::backward::BackwardOp;

/// Registry-assigned key of a GraphNode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub(crate) usize);

impl NodeKey {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// One entry of a node's history.
#[derive(Debug)]
pub enum History {
    Output {
        op: BackwardOp,
        /// The forward value is needed again by `op`.
        save_output: bool,
    },
    Operand {
        /// Consumers still owing a gradient contribution.
        consumers: Vec<NodeKey>,
    },
}

impl History {
    pub fn is_output(&self) -> bool {
        matches!(self, History::Output { .. })
    }
}

/// A computation-graph vertex.
#[derive(Debug)]
pub struct GraphNode {
    key: NodeKey,
    forward: TensorStorage,
    backward: Option<TensorStorage>,
    history: Vec<History>,
}

impl GraphNode {
    pub(crate) fn new(key: NodeKey, forward: TensorStorage, backward: Option<TensorStorage>) -> Self {
        GraphNode {
            key,
            forward,
            backward,
            history: Vec::new(),
        }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn forward(&self) -> &TensorStorage {
        &self.forward
    }

    /// The gradient accumulator, absent for non-trainable nodes.
    pub fn backward(&self) -> Option<&TensorStorage> {
        self.backward.as_ref()
    }

    /// The gradient accumulator, or an error for non-trainable nodes.
    pub fn gradient(&self) -> Result<&TensorStorage> {
        self.backward
            .as_ref()
            .ok_or_else(|| Error::invalid_argument(format!("{} is not trainable", self.key)))
    }

    pub fn is_trainable(&self) -> bool {
        self.backward.is_some()
    }

    pub fn shape(&self) -> &Shape {
        self.forward.shape()
    }

    pub fn device(&self) -> Device {
        self.forward.device()
    }

    pub fn batch_size(&self) -> usize {
        self.forward.batch_size()
    }

    pub fn history(&self) -> &[History] {
        &self.history
    }

    // History

    /// Record that this node was produced by an operation.
    pub fn append_output_history(&mut self, op: BackwardOp, save_output: bool) {
        self.history.push(History::Output { op, save_output });
    }

    /// Record that `consumer` read this node as an input.
    pub fn append_operand_history(&mut self, consumer: NodeKey) {
        match self.history.last_mut() {
            Some(History::Operand { consumers }) => consumers.push(consumer),
            _ => self.history.push(History::Operand {
                consumers: vec![consumer],
            }),
        }
    }

    /// Mark the gradient from `consumer` as delivered. Pops the Operand entry
    /// once no consumer is left.
    pub fn remove_gradient_input_key(&mut self, consumer: NodeKey) -> Result<()> {
        let Some(History::Operand { consumers }) = self.history.last_mut() else {
            return Err(Error::invalid_argument(format!(
                "{} received an unexpected gradient from {consumer}",
                self.key
            )));
        };
        let pos = consumers.iter().position(|&k| k == consumer).ok_or_else(|| {
            Error::invalid_argument(format!(
                "{} does not expect a gradient from {consumer}",
                self.key
            ))
        })?;
        consumers.remove(pos);
        if consumers.is_empty() {
            self.history.pop();
        }
        Ok(())
    }

    pub fn pop_history(&mut self) -> Option<History> {
        self.history.pop()
    }

    /// Pop the top entry only if it is an Operand entry.
    pub fn pop_if_operand_history(&mut self) -> Option<History> {
        match self.history.last() {
            Some(History::Operand { .. }) => self.history.pop(),
            _ => None,
        }
    }

    pub fn is_backprop_ready(&self) -> bool {
        self.history.last().is_some_and(History::is_output)
    }

    /// Move both storages to `device`.
    pub fn send_to(&mut self, device: Device) -> Result<()> {
        self.forward.send_to(device)?;
        if let Some(grad) = self.backward.as_mut() {
            grad.send_to(device)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use sable_core::MemoryPool;

    use super::*;

    fn node(key: usize) -> GraphNode {
        let pool = MemoryPool::host_only();
        let shape = Shape::new(vec![2]).unwrap();
        let fwd = TensorStorage::create(shape.clone(), Device::host(), false, 1, &pool).unwrap();
        let bwd = TensorStorage::create(shape, Device::host(), false, 1, &pool).unwrap();
        GraphNode::new(NodeKey(key), fwd, Some(bwd))
    }

    #[test]
    fn test_operand_entries_fold() {
        let mut n = node(0);
        n.append_output_history(BackwardOp::Relu { a: NodeKey(9) }, true);
        n.append_operand_history(NodeKey(1));
        n.append_operand_history(NodeKey(2));
        assert_eq!(n.history().len(), 2);
        assert!(!n.is_backprop_ready());

        n.remove_gradient_input_key(NodeKey(2)).unwrap();
        assert!(!n.is_backprop_ready());
        n.remove_gradient_input_key(NodeKey(1)).unwrap();
        assert!(n.is_backprop_ready());
    }

    #[test]
    fn test_unexpected_gradient_rejected() {
        let mut n = node(0);
        assert!(n.remove_gradient_input_key(NodeKey(3)).is_err());
        n.append_operand_history(NodeKey(1));
        assert!(n.remove_gradient_input_key(NodeKey(3)).is_err());
    }

    #[test]
    fn test_pop_if_operand() {
        let mut n = node(0);
        n.append_output_history(BackwardOp::Relu { a: NodeKey(9) }, false);
        assert!(n.pop_if_operand_history().is_none());
        n.append_operand_history(NodeKey(1));
        assert!(n.pop_if_operand_history().is_some());
        assert!(n.pop_history().is_some_and(|h| h.is_output()));
        assert!(!n.is_backprop_ready());
    }
}
