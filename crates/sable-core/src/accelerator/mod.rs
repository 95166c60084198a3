// Accelerator — A device with its own address space
//
// The storage layer never dereferences accelerator memory. It holds opaque
// `DeviceBuffer` handles and asks the Accelerator to move bytes across the
// host/device boundary or to launch a `Kernel` on device-resident chunks.
//
// Two implementations ship with the crate:
//   - SimulatedAccelerator: emulates a separate address space in host
//     memory. Used by default and throughout the tests.
//   - CudaAccelerator (feature `cuda`): NVIDIA GPUs through cudarc.
//
// OWNERSHIP
//
//   A DeviceBuffer is not Clone. Whoever holds it owns the allocation, and
//   giving it back (`Accelerator::free`, or `MemoryPool::release_device`)
//   consumes the handle, so a buffer cannot be freed twice.

use std::fmt;

use crate::error::Result;
use crate::kernels::{Chunk, Kernel};

mod simulated;
pub use simulated::SimulatedAccelerator;

#[cfg(feature = "cuda")]
mod cuda;
#[cfg(feature = "cuda")]
pub use cuda::CudaAccelerator;

/// Exclusive handle to `len` f32 elements of accelerator memory.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    device: usize,
    id: u64,
    len: usize,
}

impl DeviceBuffer {
    /// Wrap an allocation made by an accelerator. Only accelerator
    /// implementations should construct handles.
    pub fn new(device: usize, id: u64, len: usize) -> Self {
        DeviceBuffer { device, id, len }
    }

    /// Accelerator ordinal the memory lives on.
    pub fn device(&self) -> usize {
        self.device
    }

    /// Implementation-defined allocation id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Capacity in elements.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole buffer as one chunk.
    pub fn full_chunk(&self) -> DeviceChunk<'_> {
        DeviceChunk {
            buffer: self,
            chunk: Chunk::new(0, self.len),
        }
    }
}

/// A chunk of a device buffer, the unit a kernel launch operates on.
#[derive(Debug, Clone, Copy)]
pub struct DeviceChunk<'a> {
    pub buffer: &'a DeviceBuffer,
    pub chunk: Chunk,
}

impl<'a> DeviceChunk<'a> {
    pub fn new(buffer: &'a DeviceBuffer, chunk: Chunk) -> Self {
        DeviceChunk { buffer, chunk }
    }
}

/// A runtime managing one or more accelerator devices.
///
/// All calls are synchronous: they return once the device work is complete.
pub trait Accelerator: fmt::Debug + Send + Sync {
    /// Human-readable backend name (e.g. "sim", "cuda").
    fn name(&self) -> String;

    /// Number of devices this runtime exposes.
    fn device_count(&self) -> usize;

    /// Allocate `len` zeroed elements on `device`.
    fn allocate(&self, device: usize, len: usize) -> Result<DeviceBuffer>;

    /// Return memory to the device.
    fn free(&self, buffer: DeviceBuffer) -> Result<()>;

    /// Copy `src` into the start of `dst`.
    fn upload(&self, dst: &DeviceBuffer, src: &[f32]) -> Result<()>;

    /// Copy the start of `src` into `dst`.
    fn download(&self, src: &DeviceBuffer, dst: &mut [f32]) -> Result<()>;

    /// Copy `len` elements between two buffers on the same device.
    fn copy(&self, dst: &DeviceBuffer, src: &DeviceBuffer, len: usize) -> Result<()>;

    /// Execute `kernel` with the same leaf semantics as `kernels::run`.
    /// Inputs may alias the output.
    fn launch(&self, kernel: &Kernel, out: DeviceChunk<'_>, inputs: &[DeviceChunk<'_>])
        -> Result<()>;
}
