// Graph — Computation graph nodes, their registry and reverse-mode autograd
//
// - node:     GraphNode, NodeKey and the History stack
// - backward: BackwardOp, the gradient rule of each recorded operation
// - unit:     UnitState, opaque per-layer state, and UnitKey
// - registry: GraphRegistry, owner of nodes and units; zero_grad / auto_grad
// - context:  RegistrySet, named registries with one current selection

mod backward;
mod context;
mod node;
mod registry;
mod unit;

pub use backward::BackwardOp;
pub use context::RegistrySet;
pub use node::{GraphNode, History, NodeKey};
pub use registry::{GraphRegistry, RegistryConfig, StorageType};
pub use unit::{UnitKey, UnitState};
