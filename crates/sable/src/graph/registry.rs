// GraphRegistry — Owner of every GraphNode and UnitState of one model
//
// Two keyed pools, each with its own monotonically increasing counter:
//
//   nodes  NodeKey → GraphNode   (forward value, gradient, history)
//   units  UnitKey → UnitState   (per-layer named tensors/scalars/strings)
//
// Keys are never reused. Nodes and units live until the registry is dropped.
//
// AUTOGRAD
//
//   auto_grad(start) seeds start's gradient with `seed_gradient` and walks
//   the graph in reverse over a worklist of ready nodes:
//
//     1. pop a ready node, take its top Output entry
//     2. invoke the entry's BackwardOp (accumulates into operand gradients)
//     3. for each trainable operand, remove this node from its pending
//        consumers; if that makes the operand ready, push it
//
//   A node is processed only after every consumer recorded in its history
//   has delivered its gradient, so shared nodes accumulate the full sum
//   before passing it on. Leaves and non-trainable nodes end the walk.
//
// The registry has no internal locking; `&mut self` on registration is the
// single-writer rule.

use std::collections::HashMap;
use std::sync::Arc;

use sable_core::{compute, Device, Error, MemoryPool, Result, Shape, TensorStorage};
use tracing::debug;

use super::backward::BackwardOp;
use super::node::{GraphNode, History, NodeKey};
use super::unit::{UnitKey, UnitState};

/// Registry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Name used by `RegistrySet` and in log output.
    pub name: String,
    /// Value written into the start node's gradient by `auto_grad`.
    pub seed_gradient: f32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            name: "default".to_string(),
            seed_gradient: 1.0,
        }
    }
}

impl RegistryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        RegistryConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_seed_gradient(mut self, seed: f32) -> Self {
        self.seed_gradient = seed;
        self
    }
}

/// Dense or CSR storage for a registered node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Dense,
    Sparse,
}

/// Keyed owner of graph nodes and unit states.
#[derive(Debug)]
pub struct GraphRegistry {
    config: RegistryConfig,
    pool: Arc<MemoryPool>,
    nodes: HashMap<NodeKey, GraphNode>,
    units: HashMap<UnitKey, UnitState>,
    next_node: usize,
    next_unit: usize,
}

impl GraphRegistry {
    pub fn new(config: RegistryConfig, pool: Arc<MemoryPool>) -> Self {
        GraphRegistry {
            config,
            pool,
            nodes: HashMap::new(),
            units: HashMap::new(),
            next_node: 0,
            next_unit: 0,
        }
    }

    /// A host-only registry with its own pool.
    pub fn host(name: impl Into<String>) -> Self {
        Self::new(RegistryConfig::new(name), MemoryPool::host_only())
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    // Registration

    /// Allocate a node's forward storage (and gradient storage when
    /// `trainable`) and return its key.
    pub fn register_node(
        &mut self,
        shape: Shape,
        storage: StorageType,
        device: Device,
        batch_size: usize,
        trainable: bool,
    ) -> Result<NodeKey> {
        let sparse = storage == StorageType::Sparse;
        let forward = TensorStorage::create(shape, device, sparse, batch_size, &self.pool)?;
        self.insert_node(forward, trainable)
    }

    /// Register an already computed forward storage.
    pub fn insert_node(&mut self, forward: TensorStorage, trainable: bool) -> Result<NodeKey> {
        let backward = if trainable {
            Some(TensorStorage::create(
                forward.shape().clone(),
                forward.device(),
                false,
                forward.batch_size(),
                &self.pool,
            )?)
        } else {
            None
        };
        let key = NodeKey(self.next_node);
        self.next_node += 1;
        debug!(
            registry = %self.config.name,
            %key,
            shape = %forward.shape(),
            trainable,
            "node registered"
        );
        self.nodes.insert(key, GraphNode::new(key, forward, backward));
        Ok(key)
    }

    pub fn register_unit(&mut self, unit: UnitState) -> UnitKey {
        let key = UnitKey(self.next_unit);
        self.next_unit += 1;
        debug!(registry = %self.config.name, %key, kind = unit.kind(), "unit registered");
        self.units.insert(key, unit);
        key
    }

    // Lookup

    pub fn node(&self, key: NodeKey) -> Result<&GraphNode> {
        self.nodes.get(&key).ok_or(Error::NotFound {
            kind: "node",
            key: key.0,
        })
    }

    pub fn node_mut(&mut self, key: NodeKey) -> Result<&mut GraphNode> {
        self.nodes.get_mut(&key).ok_or(Error::NotFound {
            kind: "node",
            key: key.0,
        })
    }

    pub fn unit(&self, key: UnitKey) -> Result<&UnitState> {
        self.units.get(&key).ok_or(Error::NotFound {
            kind: "unit",
            key: key.0,
        })
    }

    pub fn unit_mut(&mut self, key: UnitKey) -> Result<&mut UnitState> {
        self.units.get_mut(&key).ok_or(Error::NotFound {
            kind: "unit",
            key: key.0,
        })
    }

    // History

    /// Record that `output` was produced by `op`: an Output entry on the
    /// output node and an Operand entry on every trainable operand.
    pub fn record(&mut self, output: NodeKey, op: BackwardOp, save_output: bool) -> Result<()> {
        let operands = op.operands();
        for &operand in &operands {
            self.node(operand)?;
        }
        if !self.node(output)?.is_trainable() {
            return Ok(());
        }
        for operand in operands {
            let node = self.node_mut(operand)?;
            if node.is_trainable() {
                node.append_operand_history(output);
            }
        }
        self.node_mut(output)?.append_output_history(op, save_output);
        Ok(())
    }

    // Gradients

    /// Reset every trainable node's gradient to zero.
    pub fn zero_grad(&self) -> Result<()> {
        for node in self.nodes.values() {
            if let Some(grad) = node.backward() {
                compute::fill(grad, 0.0)?;
            }
        }
        Ok(())
    }

    /// Backpropagate from `start`. Returns the keys of the nodes whose
    /// backward operation ran, in execution order.
    pub fn auto_grad(&mut self, start: NodeKey) -> Result<Vec<NodeKey>> {
        let seed = self.config.seed_gradient;
        {
            let node = self.node(start)?;
            if !node.is_trainable() {
                return Err(Error::invalid_argument(format!(
                    "auto_grad from non-trainable {start}"
                )));
            }
            if let Some(History::Operand { consumers }) = node.history().last() {
                return Err(Error::invalid_argument(format!(
                    "{start} still waits on gradients from {consumers:?}"
                )));
            }
            compute::fill(node.gradient()?, seed)?;
        }
        debug!(registry = %self.config.name, %start, seed, "auto_grad");

        let mut ready = vec![start];
        let mut order = Vec::new();
        while let Some(key) = ready.pop() {
            let node = self.node_mut(key)?;
            if !node.is_backprop_ready() {
                // A leaf start node: seeding was all there was to do.
                continue;
            }
            let Some(History::Output { op, save_output }) = node.pop_history() else {
                continue;
            };
            debug!(%key, op = op.name(), save_output, "backward");
            op.invoke(self, key)?;
            order.push(key);

            for operand in op.operands() {
                let node = self.node_mut(operand)?;
                if !node.is_trainable() {
                    continue;
                }
                node.remove_gradient_input_key(key)?;
                if node.is_backprop_ready() {
                    ready.push(operand);
                }
            }
        }
        Ok(order)
    }

    // Data helpers

    /// Overwrite a node's forward values.
    pub fn set_data(&self, key: NodeKey, values: &[f32]) -> Result<()> {
        self.node(key)?.forward().load(values)
    }

    /// A node's forward values.
    pub fn data(&self, key: NodeKey) -> Result<Vec<f32>> {
        self.node(key)?.forward().to_vec()
    }

    /// A node's accumulated gradient.
    pub fn gradient(&self, key: NodeKey) -> Result<Vec<f32>> {
        self.node(key)?.gradient()?.to_vec()
    }

    /// Move a node's storages to `device`.
    pub fn send_to(&mut self, key: NodeKey, device: Device) -> Result<()> {
        self.node_mut(key)?.send_to(device)
    }
}
