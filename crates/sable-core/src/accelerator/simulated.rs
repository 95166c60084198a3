// SimulatedAccelerator — Device memory emulated in host RAM
//
// Every allocation lives in a private arena keyed by handle id, so the only
// way to reach the data is through upload/download/launch, exactly as with a
// real device. Launches run the host kernels on snapshots of the input
// chunks, which makes aliasing between inputs and output harmless.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::trace;

use super::{Accelerator, DeviceBuffer, DeviceChunk};
use crate::error::{Error, Result};
use crate::kernels::{self, Kernel};

/// An accelerator whose device memory is emulated in host memory.
#[derive(Debug)]
pub struct SimulatedAccelerator {
    devices: usize,
    arena: Mutex<HashMap<u64, Vec<f32>>>,
    next_id: AtomicU64,
}

impl SimulatedAccelerator {
    /// Create a runtime exposing `devices` accelerators.
    pub fn new(devices: usize) -> Self {
        SimulatedAccelerator {
            devices,
            arena: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of allocations currently live on all devices.
    pub fn live_allocations(&self) -> usize {
        self.arena.lock().map(|a| a.len()).unwrap_or(0)
    }

    fn check_device(&self, device: usize) -> Result<()> {
        if device >= self.devices {
            return Err(Error::Accelerator(format!(
                "device {device} out of range ({} devices)",
                self.devices
            )));
        }
        Ok(())
    }
}

impl Default for SimulatedAccelerator {
    fn default() -> Self {
        Self::new(1)
    }
}

fn unknown(buffer: &DeviceBuffer) -> Error {
    Error::Accelerator(format!(
        "unknown buffer {} on device {}",
        buffer.id(),
        buffer.device()
    ))
}

impl Accelerator for SimulatedAccelerator {
    fn name(&self) -> String {
        "sim".to_string()
    }

    fn device_count(&self) -> usize {
        self.devices
    }

    fn allocate(&self, device: usize, len: usize) -> Result<DeviceBuffer> {
        self.check_device(device)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("arena"))?;
        arena.insert(id, vec![0.0; len]);
        Ok(DeviceBuffer::new(device, id, len))
    }

    fn free(&self, buffer: DeviceBuffer) -> Result<()> {
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("arena"))?;
        arena.remove(&buffer.id()).map(|_| ()).ok_or_else(|| unknown(&buffer))
    }

    fn upload(&self, dst: &DeviceBuffer, src: &[f32]) -> Result<()> {
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("arena"))?;
        let mem = arena.get_mut(&dst.id()).ok_or_else(|| unknown(dst))?;
        if src.len() > mem.len() {
            return Err(Error::Accelerator(format!(
                "upload of {} elements into buffer of {}",
                src.len(),
                mem.len()
            )));
        }
        mem[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn download(&self, src: &DeviceBuffer, dst: &mut [f32]) -> Result<()> {
        let arena = self.arena.lock().map_err(|_| Error::poisoned("arena"))?;
        let mem = arena.get(&src.id()).ok_or_else(|| unknown(src))?;
        if dst.len() > mem.len() {
            return Err(Error::Accelerator(format!(
                "download of {} elements from buffer of {}",
                dst.len(),
                mem.len()
            )));
        }
        dst.copy_from_slice(&mem[..dst.len()]);
        Ok(())
    }

    fn copy(&self, dst: &DeviceBuffer, src: &DeviceBuffer, len: usize) -> Result<()> {
        if dst.device() != src.device() {
            return Err(Error::Accelerator(format!(
                "device-to-device copy across devices {} and {}",
                src.device(),
                dst.device()
            )));
        }
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("arena"))?;
        let data = arena
            .get(&src.id())
            .ok_or_else(|| unknown(src))?
            .get(..len)
            .map(|s| s.to_vec())
            .ok_or_else(|| Error::Accelerator(format!("copy of {len} elements overruns source")))?;
        let mem = arena.get_mut(&dst.id()).ok_or_else(|| unknown(dst))?;
        mem.get_mut(..len)
            .ok_or_else(|| Error::Accelerator(format!("copy of {len} elements overruns target")))?
            .copy_from_slice(&data);
        Ok(())
    }

    fn launch(
        &self,
        kernel: &Kernel,
        out: DeviceChunk<'_>,
        inputs: &[DeviceChunk<'_>],
    ) -> Result<()> {
        trace!(kernel = kernel.name(), out = ?out.chunk, "sim launch");
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("arena"))?;

        let mut snapshots = Vec::with_capacity(inputs.len());
        for input in inputs {
            if input.buffer.device() != out.buffer.device() {
                return Err(Error::Accelerator(
                    "kernel inputs span several devices".to_string(),
                ));
            }
            let mem = arena.get(&input.buffer.id()).ok_or_else(|| unknown(input.buffer))?;
            let slice = mem
                .get(input.chunk.range())
                .ok_or_else(|| Error::Accelerator(format!("chunk {:?} out of bounds", input.chunk)))?;
            snapshots.push(slice.to_vec());
        }
        let views: Vec<&[f32]> = snapshots.iter().map(|s| s.as_slice()).collect();

        let mem = arena.get_mut(&out.buffer.id()).ok_or_else(|| unknown(out.buffer))?;
        let target = mem
            .get_mut(out.chunk.range())
            .ok_or_else(|| Error::Accelerator(format!("chunk {:?} out of bounds", out.chunk)))?;
        kernels::run(kernel, target, &views)
    }
}
