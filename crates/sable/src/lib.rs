//! # Sable
//!
//! Computation-graph registry and reverse-mode autograd over device-aware
//! tensor storage.
//!
//! ## Usage
//!
//! ```rust
//! use sable::prelude::*;
//!
//! # fn main() -> sable::Result<()> {
//! let mut reg = GraphRegistry::host("model");
//! let a = ops::from_values(&mut reg, Shape::new(vec![2])?, Device::host(), &[1.0, 2.0], true)?;
//! let b = ops::from_values(&mut reg, Shape::new(vec![2])?, Device::host(), &[3.0, 4.0], true)?;
//! let y = ops::dot(&mut reg, a, b)?;
//! reg.zero_grad()?;
//! reg.auto_grad(y)?;
//! assert_eq!(reg.gradient(a)?, vec![3.0, 4.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `sable-core` | TensorStorage, MemoryPool, Accelerator, BroadcastDispatch, compute |
//! | `sable` | GraphNode, GraphRegistry, autograd, functional ops, Linear |

pub mod graph;
pub mod layers;
pub mod ops;

pub use sable_core::{
    compute, init, Accelerator, CsrMatrix, Device, DeviceKind, Error, Init, MemoryPool,
    PoolConfig, Result, Shape, SimulatedAccelerator, TensorStorage,
};

#[cfg(feature = "cuda")]
pub use sable_core::CudaAccelerator;

pub use graph::{
    BackwardOp, GraphNode, GraphRegistry, History, NodeKey, RegistryConfig, RegistrySet,
    StorageType, UnitKey, UnitState,
};
pub use layers::Linear;

/// Everything needed to build and differentiate a graph.
pub mod prelude {
    pub use crate::graph::{GraphRegistry, NodeKey, RegistryConfig, RegistrySet, UnitState};
    pub use crate::layers::Linear;
    pub use crate::ops;
    pub use sable_core::{Device, Error, MemoryPool, PoolConfig, Result, Shape, TensorStorage};
}
