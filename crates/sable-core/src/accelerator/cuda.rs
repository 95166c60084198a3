// CudaAccelerator — NVIDIA GPUs through cudarc
//
// Each DeviceBuffer handle maps to a CudaSlice<f32> held in an arena keyed by
// handle id. Kernels are compiled once per device with NVRTC and take explicit
// (offset, len) pairs for every chunk, so a launch never needs sub-slice
// views. Modulo indexing on inputs matches the host kernels exactly.
//
// A launch takes the output slice out of the arena for the duration of the
// call (it needs `&mut`); an input that aliases the output is cloned on the
// device first. Every call synchronizes before returning.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, DeviceRepr, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::compile_ptx;
use tracing::debug;

use super::{Accelerator, DeviceBuffer, DeviceChunk};
use crate::error::{Error, Result};
use crate::kernels::{Chunk, Kernel};

const MODULE_NAME: &str = "sable_kernels";

const KERNEL_NAMES: &[&str] = &["fill_f32", "unary_f32", "binary_f32", "reduce_sum_f32", "gemm_f32", "transpose_f32"];

const KERNEL_SOURCE: &str = r#"
struct GemmArgs {
    unsigned int m, n, k, lda, ldb, ldc;
    unsigned int trans_a, trans_b, accumulate;
    unsigned int a_off, b_off, c_off, batch;
};

struct TransposeArgs {
    unsigned int rows, cols, ld_in, ld_out;
    unsigned int in_off, out_off, batch;
};

extern "C" __global__ void fill_f32(float* out, unsigned int off, unsigned int n, float val) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i < n) out[off + i] = val;
}

// op: 0 scale, 1 relu, 2 add_scaled (accumulates)
extern "C" __global__ void unary_f32(float* out, unsigned int off, unsigned int n,
                                     const float* a, unsigned int a_off, unsigned int a_len,
                                     unsigned int op, float s) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float x = a[a_off + i % a_len];
    switch (op) {
        case 0: out[off + i] = x * s; break;
        case 1: out[off + i] = x > 0.0f ? x : 0.0f; break;
        case 2: out[off + i] += x * s; break;
    }
}

// op: 0 add, 1 sub, 2 mul, 3 div, 4 relu_grad (+=), 5 mul_add (+=)
extern "C" __global__ void binary_f32(float* out, unsigned int off, unsigned int n,
                                      const float* a, unsigned int a_off, unsigned int a_len,
                                      const float* b, unsigned int b_off, unsigned int b_len,
                                      unsigned int op) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float x = a[a_off + i % a_len];
    float y = b[b_off + i % b_len];
    switch (op) {
        case 0: out[off + i] = x + y; break;
        case 1: out[off + i] = x - y; break;
        case 2: out[off + i] = x * y; break;
        case 3: out[off + i] = x / y; break;
        case 4: if (y > 0.0f) out[off + i] += x; break;
        case 5: out[off + i] += x * y; break;
    }
}

// One thread per output element; folds every input index congruent to it.
extern "C" __global__ void reduce_sum_f32(float* out, unsigned int off, unsigned int n,
                                          const float* a, unsigned int a_off, unsigned int a_len,
                                          float factor) {
    unsigned int i = blockIdx.x * blockDim.x + threadIdx.x;
    if (i >= n) return;
    float acc = 0.0f;
    for (unsigned int j = i; j < a_len; j += n) acc += a[a_off + j];
    out[off + i] += acc * factor;
}

extern "C" __global__ void gemm_f32(float* c, const float* a, const float* b, GemmArgs p) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int per = p.m * p.n;
    if (idx >= per * p.batch) return;
    unsigned int bi = idx / per, i = (idx % per) / p.n, j = idx % p.n;
    const float* ab = a + p.a_off + bi * (p.trans_a ? p.k : p.m) * p.lda;
    const float* bb = b + p.b_off + bi * (p.trans_b ? p.n : p.k) * p.ldb;
    float sum = 0.0f;
    for (unsigned int q = 0; q < p.k; ++q) {
        float av = p.trans_a ? ab[q * p.lda + i] : ab[i * p.lda + q];
        float bv = p.trans_b ? bb[j * p.ldb + q] : bb[q * p.ldb + j];
        sum += av * bv;
    }
    float* cell = c + p.c_off + bi * p.m * p.ldc + i * p.ldc + j;
    if (p.accumulate) *cell += sum; else *cell = sum;
}

extern "C" __global__ void transpose_f32(float* out, const float* in, TransposeArgs p) {
    unsigned int idx = blockIdx.x * blockDim.x + threadIdx.x;
    unsigned int per = p.rows * p.cols;
    if (idx >= per * p.batch) return;
    unsigned int bi = idx / per, i = (idx % per) / p.cols, j = idx % p.cols;
    out[p.out_off + bi * p.cols * p.ld_out + j * p.ld_out + i] =
        in[p.in_off + bi * p.rows * p.ld_in + i * p.ld_in + j];
}
"#;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct GemmArgs {
    m: u32,
    n: u32,
    k: u32,
    lda: u32,
    ldb: u32,
    ldc: u32,
    trans_a: u32,
    trans_b: u32,
    accumulate: u32,
    a_off: u32,
    b_off: u32,
    c_off: u32,
    batch: u32,
}

unsafe impl DeviceRepr for GemmArgs {}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct TransposeArgs {
    rows: u32,
    cols: u32,
    ld_in: u32,
    ld_out: u32,
    in_off: u32,
    out_off: u32,
    batch: u32,
}

unsafe impl DeviceRepr for TransposeArgs {}

fn cuda_err(context: &str) -> impl Fn(cudarc::driver::DriverError) -> Error + '_ {
    move |e| Error::Accelerator(format!("{context}: {e}"))
}

/// Standard launch configuration for `n` threads.
fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

enum Source<'a> {
    Arena(&'a CudaSlice<f32>),
    Copy(CudaSlice<f32>),
}

impl Source<'_> {
    fn get(&self) -> &CudaSlice<f32> {
        match self {
            Source::Arena(s) => s,
            Source::Copy(s) => s,
        }
    }
}

/// NVIDIA GPUs driven through cudarc.
pub struct CudaAccelerator {
    devices: Vec<Arc<CudaDevice>>,
    arena: Mutex<HashMap<u64, CudaSlice<f32>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for CudaAccelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaAccelerator")
            .field("devices", &self.devices.len())
            .finish()
    }
}

impl CudaAccelerator {
    /// Open the first `count` GPUs and compile the kernels for each.
    pub fn new(count: usize) -> Result<Self> {
        let ptx = compile_ptx(KERNEL_SOURCE)
            .map_err(|e| Error::Accelerator(format!("NVRTC compilation failed: {e}")))?;
        let mut devices = Vec::with_capacity(count);
        for ordinal in 0..count {
            let dev = CudaDevice::new(ordinal).map_err(cuda_err("CUDA device creation"))?;
            dev.load_ptx(ptx.clone(), MODULE_NAME, KERNEL_NAMES)
                .map_err(cuda_err("PTX load"))?;
            debug!(ordinal, "CUDA device ready");
            devices.push(dev);
        }
        Ok(CudaAccelerator {
            devices,
            arena: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn device(&self, index: usize) -> Result<&Arc<CudaDevice>> {
        self.devices.get(index).ok_or_else(|| {
            Error::Accelerator(format!(
                "device {index} out of range ({} devices)",
                self.devices.len()
            ))
        })
    }

    fn func(&self, dev: &Arc<CudaDevice>, name: &str) -> Result<CudaFunction> {
        dev.get_func(MODULE_NAME, name)
            .ok_or_else(|| Error::Accelerator(format!("CUDA kernel '{name}' not found")))
    }

    /// Launch `unary_f32`; `op` selects scale (0), relu (1) or add_scaled (2).
    fn unary(
        &self,
        dev: &Arc<CudaDevice>,
        out: &mut CudaSlice<f32>,
        chunk: Chunk,
        (a, a_off, a_len): (&CudaSlice<f32>, u32, u32),
        op: u32,
        s: f32,
    ) -> Result<()> {
        let (off, len) = (chunk.offset as u32, chunk.len as u32);
        let f = self.func(dev, "unary_f32")?;
        unsafe { f.launch(launch_cfg(chunk.len), (out, off, len, a, a_off, a_len, op, s)) }
            .map_err(cuda_err("kernel launch"))
    }

    fn run(
        &self,
        kernel: &Kernel,
        dev: &Arc<CudaDevice>,
        out: &mut CudaSlice<f32>,
        out_chunk: DeviceChunk<'_>,
        inputs: &[(&CudaSlice<f32>, DeviceChunk<'_>)],
    ) -> Result<()> {
        let off = out_chunk.chunk.offset as u32;
        let n = out_chunk.chunk.len;
        let len = n as u32;
        let input = |i: usize| {
            inputs
                .get(i)
                .map(|(s, c)| (*s, c.chunk.offset as u32, c.chunk.len as u32))
                .ok_or_else(|| Error::invalid_argument(format!("kernel {} missing input {i}", kernel.name())))
        };
        let launch = cuda_err("kernel launch");

        match *kernel {
            Kernel::Fill(val) => {
                let f = self.func(dev, "fill_f32")?;
                unsafe { f.launch(launch_cfg(n), (out, off, len, val)) }.map_err(launch)?;
            }
            Kernel::Scale(s) => self.unary(dev, out, out_chunk.chunk, input(0)?, 0, s)?,
            Kernel::Relu => self.unary(dev, out, out_chunk.chunk, input(0)?, 1, 0.0)?,
            Kernel::AddScaled(s) => self.unary(dev, out, out_chunk.chunk, input(0)?, 2, s)?,
            Kernel::Add | Kernel::Sub | Kernel::Mul | Kernel::Div | Kernel::ReluGrad | Kernel::MulAdd => {
                let op: u32 = match *kernel {
                    Kernel::Add => 0,
                    Kernel::Sub => 1,
                    Kernel::Mul => 2,
                    Kernel::Div => 3,
                    Kernel::ReluGrad => 4,
                    _ => 5,
                };
                let (a, a_off, a_len) = input(0)?;
                let (b, b_off, b_len) = input(1)?;
                let f = self.func(dev, "binary_f32")?;
                unsafe {
                    f.launch(
                        launch_cfg(n),
                        (out, off, len, a, a_off, a_len, b, b_off, b_len, op),
                    )
                }
                .map_err(launch)?;
            }
            Kernel::ReduceSum(factor) => {
                let (a, a_off, a_len) = input(0)?;
                let f = self.func(dev, "reduce_sum_f32")?;
                unsafe { f.launch(launch_cfg(n), (out, off, len, a, a_off, a_len, factor)) }
                    .map_err(launch)?;
            }
            Kernel::Gemm(p) => {
                let batch = n / p.stride_c();
                let (a, a_off, _) = input(0)?;
                let (b, b_off, _) = input(1)?;
                let args = GemmArgs {
                    m: p.m as u32,
                    n: p.n as u32,
                    k: p.k as u32,
                    lda: p.lda as u32,
                    ldb: p.ldb as u32,
                    ldc: p.ldc as u32,
                    trans_a: p.trans_a as u32,
                    trans_b: p.trans_b as u32,
                    accumulate: p.accumulate as u32,
                    a_off,
                    b_off,
                    c_off: off,
                    batch: batch as u32,
                };
                let f = self.func(dev, "gemm_f32")?;
                unsafe { f.launch(launch_cfg(batch * p.m * p.n), (out, a, b, args)) }
                    .map_err(launch)?;
            }
            Kernel::Transpose(p) => {
                let batch = n / (p.cols * p.ld_out);
                let (a, in_off, _) = input(0)?;
                let args = TransposeArgs {
                    rows: p.rows as u32,
                    cols: p.cols as u32,
                    ld_in: p.ld_in as u32,
                    ld_out: p.ld_out as u32,
                    in_off,
                    out_off: off,
                    batch: batch as u32,
                };
                let f = self.func(dev, "transpose_f32")?;
                unsafe { f.launch(launch_cfg(batch * p.rows * p.cols), (out, a, args)) }
                    .map_err(launch)?;
            }
        }
        dev.synchronize().map_err(cuda_err("synchronize"))
    }
}

fn unknown(buffer: &DeviceBuffer) -> Error {
    Error::Accelerator(format!("unknown CUDA buffer {}", buffer.id()))
}

impl Accelerator for CudaAccelerator {
    fn name(&self) -> String {
        "cuda".to_string()
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn allocate(&self, device: usize, len: usize) -> Result<DeviceBuffer> {
        let dev = self.device(device)?;
        let slice = dev.alloc_zeros::<f32>(len).map_err(cuda_err("alloc"))?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.arena
            .lock()
            .map_err(|_| Error::poisoned("cuda arena"))?
            .insert(id, slice);
        Ok(DeviceBuffer::new(device, id, len))
    }

    fn free(&self, buffer: DeviceBuffer) -> Result<()> {
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("cuda arena"))?;
        arena.remove(&buffer.id()).map(drop).ok_or_else(|| unknown(&buffer))
    }

    fn upload(&self, dst: &DeviceBuffer, src: &[f32]) -> Result<()> {
        let dev = self.device(dst.device())?;
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("cuda arena"))?;
        let slice = arena.get_mut(&dst.id()).ok_or_else(|| unknown(dst))?;
        if src.len() > dst.len() {
            return Err(Error::Accelerator(format!(
                "upload of {} elements into buffer of {}",
                src.len(),
                dst.len()
            )));
        }
        let mut view = slice.slice_mut(0..src.len());
        dev.htod_sync_copy_into(src, &mut view).map_err(cuda_err("htod"))
    }

    fn download(&self, src: &DeviceBuffer, dst: &mut [f32]) -> Result<()> {
        let dev = self.device(src.device())?;
        let arena = self.arena.lock().map_err(|_| Error::poisoned("cuda arena"))?;
        let slice = arena.get(&src.id()).ok_or_else(|| unknown(src))?;
        if dst.len() > src.len() {
            return Err(Error::Accelerator(format!(
                "download of {} elements from buffer of {}",
                dst.len(),
                src.len()
            )));
        }
        dev.dtoh_sync_copy_into(&slice.slice(0..dst.len()), dst)
            .map_err(cuda_err("dtoh"))
    }

    fn copy(&self, dst: &DeviceBuffer, src: &DeviceBuffer, len: usize) -> Result<()> {
        if dst.device() != src.device() {
            return Err(Error::Accelerator(
                "device-to-device copy across GPUs".to_string(),
            ));
        }
        if dst.id() == src.id() {
            return Ok(());
        }
        let dev = self.device(dst.device())?;
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("cuda arena"))?;
        let mut target = arena.remove(&dst.id()).ok_or_else(|| unknown(dst))?;
        let result = match arena.get(&src.id()) {
            Some(source) => dev
                .dtod_copy(&source.slice(0..len), &mut target.slice_mut(0..len))
                .map_err(cuda_err("dtod")),
            None => Err(unknown(src)),
        };
        arena.insert(dst.id(), target);
        result
    }

    fn launch(
        &self,
        kernel: &Kernel,
        out: DeviceChunk<'_>,
        inputs: &[DeviceChunk<'_>],
    ) -> Result<()> {
        let dev = self.device(out.buffer.device())?;
        let mut arena = self.arena.lock().map_err(|_| Error::poisoned("cuda arena"))?;
        let mut target = arena.remove(&out.buffer.id()).ok_or_else(|| unknown(out.buffer))?;

        let result = (|| {
            let mut sources = Vec::with_capacity(inputs.len());
            for input in inputs {
                let source = if input.buffer.id() == out.buffer.id() {
                    Source::Copy(target.try_clone().map_err(cuda_err("clone"))?)
                } else {
                    Source::Arena(arena.get(&input.buffer.id()).ok_or_else(|| unknown(input.buffer))?)
                };
                sources.push((source, *input));
            }
            let bound: Vec<(&CudaSlice<f32>, DeviceChunk<'_>)> =
                sources.iter().map(|(s, c)| (s.get(), *c)).collect();
            self.run(kernel, dev, &mut target, out, &bound)
        })();

        arena.insert(out.buffer.id(), target);
        result
    }
}
