//! # sable-core
//!
//! Device-aware tensor storage for Sable.
//!
//! This crate provides:
//! - [`TensorStorage`]: the padded host/device/sparse buffers of one tensor
//! - [`MemoryPool`]: a caching allocator for host and accelerator buffers
//! - [`Accelerator`]: the device runtime seam ([`SimulatedAccelerator`], and
//!   `CudaAccelerator` behind the `cuda` feature)
//! - [`broadcast::dispatch`]: splits a broadcasting operation into kernel
//!   calls over contiguous chunks
//! - [`compute`]: elementwise, matrix and gradient entry points on storages
//! - [`Shape`] / [`Layout`] / [`Device`]: shapes, padded layouts and residency

// - Shape / Device: logical extents and residency tags
// - Layout: padded buffer layout and CSR conversion
// - MemoryPool / Accelerator: where buffers come from
// - TensorStorage: one tensor's buffers, copy and residency moves
// - broadcast / kernels / compute: running operations over storages

pub mod accelerator;
pub mod broadcast;
pub mod compute;
pub mod config;
pub mod device;
pub mod error;
pub mod init;
pub mod kernels;
pub mod layout;
pub mod pool;
pub mod shape;
pub mod sparse;
pub mod storage;

#[cfg(feature = "cuda")]
pub use accelerator::CudaAccelerator;
pub use accelerator::{Accelerator, DeviceBuffer, DeviceChunk, SimulatedAccelerator};
pub use broadcast::Operand;
pub use config::PoolConfig;
pub use device::{Device, DeviceKind};
pub use error::{Error, Result};
pub use init::Init;
pub use kernels::{Chunk, Kernel};
pub use layout::Layout;
pub use pool::{HostBuffer, MemoryPool, PoolStats};
pub use shape::Shape;
pub use sparse::CsrMatrix;
pub use storage::{BusyGuard, TensorStorage};
