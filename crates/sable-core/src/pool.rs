// Memory Pool — Caching allocator for host and accelerator buffers
//
// Every TensorStorage gets its buffers from a MemoryPool and gives them back
// when it is dropped. Released buffers are not returned to the system;
// they are parked in per-size free lists and handed out again on the next
// request of the same element count. This is the same scheme as a CUDA
// caching allocator, applied to both address spaces:
//
//   host:   len            → stack of Vec<f32>
//   device: (device, len)  → stack of DeviceBuffer
//
// Buffers are always zeroed when handed out, whether fresh or recycled.
//
// ACCOUNTING
//
//   `outstanding()` counts buffers handed out and not yet released. A
//   create/drop pair on TensorStorage leaves it unchanged, which is how the
//   tests check for leaks. Hits and misses are cumulative atomics.

use std::collections::HashMap;
use std::hash::Hash;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::accelerator::{Accelerator, DeviceBuffer};
use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::kernels::Kernel;

const ELEM_BYTES: usize = std::mem::size_of::<f32>();

/// A host allocation handed out by a [`MemoryPool`].
#[derive(Debug, PartialEq)]
pub struct HostBuffer(Vec<f32>);

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Deref for HostBuffer {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl DerefMut for HostBuffer {
    fn deref_mut(&mut self) -> &mut [f32] {
        &mut self.0
    }
}

/// Snapshot of the pool's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total bytes currently held in the free lists.
    pub cached_bytes: usize,
    /// Number of buffers currently in the free lists.
    pub cached_buffers: usize,
    /// Cumulative requests served from the free lists.
    pub hits: u64,
    /// Cumulative requests that fell through to a fresh allocation.
    pub misses: u64,
    /// Host buffers handed out and not yet released.
    pub outstanding_host: usize,
    /// Device buffers handed out and not yet released.
    pub outstanding_device: usize,
}

// Free-list bucket

/// Maps an allocation key to a stack of free buffers.
struct FreeList<K, T> {
    buckets: Mutex<HashMap<K, Vec<T>>>,
}

impl<K: Eq + Hash + Copy, T> FreeList<K, T> {
    fn new() -> Self {
        FreeList {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn try_pop(&self, key: K) -> Result<Option<T>> {
        let mut map = self.buckets.lock().map_err(|_| Error::poisoned("free list"))?;
        Ok(map.get_mut(&key).and_then(|stack| stack.pop()))
    }

    /// Park `item`; hands it back when the list is poisoned.
    fn push(&self, key: K, item: T) -> std::result::Result<(), T> {
        match self.buckets.lock() {
            Ok(mut map) => {
                map.entry(key).or_default().push(item);
                Ok(())
            }
            Err(_) => Err(item),
        }
    }

    fn drain(&self) -> Result<Vec<T>> {
        let mut map = self.buckets.lock().map_err(|_| Error::poisoned("free list"))?;
        Ok(map.drain().flat_map(|(_, stack)| stack).collect())
    }

    /// Count of cached buffers and total cached elements.
    fn stats(&self, elems: impl Fn(&K) -> usize) -> Result<(usize, usize)> {
        let map = self.buckets.lock().map_err(|_| Error::poisoned("free list"))?;
        Ok(map.iter().fold((0, 0), |(count, total), (key, stack)| {
            (count + stack.len(), total + elems(key) * stack.len())
        }))
    }
}

/// A caching allocator for host and accelerator buffers.
pub struct MemoryPool {
    config: PoolConfig,
    accelerator: Option<Arc<dyn Accelerator>>,
    host: FreeList<usize, Vec<f32>>,
    device: FreeList<(usize, usize), DeviceBuffer>,

    hits: AtomicU64,
    misses: AtomicU64,
    outstanding_host: AtomicUsize,
    outstanding_device: AtomicUsize,
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("config", &self.config)
            .field("accelerator", &self.accelerator.as_ref().map(|a| a.name()))
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl MemoryPool {
    /// Create a pool. Without an accelerator, device requests fail.
    pub fn new(config: PoolConfig, accelerator: Option<Arc<dyn Accelerator>>) -> Self {
        MemoryPool {
            config,
            accelerator,
            host: FreeList::new(),
            device: FreeList::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            outstanding_host: AtomicUsize::new(0),
            outstanding_device: AtomicUsize::new(0),
        }
    }

    /// A host-only pool with default configuration.
    pub fn host_only() -> Arc<Self> {
        Arc::new(Self::new(PoolConfig::default(), None))
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The accelerator runtime backing device allocations, if any.
    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accelerator.as_ref()
    }

    pub(crate) fn require_accelerator(&self) -> Result<&Arc<dyn Accelerator>> {
        self.accelerator
            .as_ref()
            .ok_or_else(|| Error::Accelerator("pool has no accelerator".to_string()))
    }

    /// Acquire `len` zeroed host elements.
    pub fn acquire_host(&self, len: usize) -> Result<HostBuffer> {
        if len == 0 {
            return Err(Error::Allocation {
                requested: 0,
                reason: "zero-length host buffer".to_string(),
            });
        }
        let buf = match self.host.try_pop(len)? {
            Some(mut buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                buf.fill(0.0);
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![0.0; len]
            }
        };
        self.outstanding_host.fetch_add(1, Ordering::Relaxed);
        Ok(HostBuffer(buf))
    }

    /// Acquire `len` zeroed elements on accelerator `device`.
    pub fn acquire_device(&self, len: usize, device: usize) -> Result<DeviceBuffer> {
        if len == 0 {
            return Err(Error::Allocation {
                requested: 0,
                reason: "zero-length device buffer".to_string(),
            });
        }
        let acc = self.accelerator.as_ref().ok_or_else(|| Error::Allocation {
            requested: len,
            reason: "pool has no accelerator".to_string(),
        })?;
        if device >= acc.device_count() {
            return Err(Error::Allocation {
                requested: len,
                reason: format!(
                    "device {device} out of range for {} ({} devices)",
                    acc.name(),
                    acc.device_count()
                ),
            });
        }

        let buf = match self.device.try_pop((device, len))? {
            Some(buf) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                acc.launch(&Kernel::Fill(0.0), buf.full_chunk(), &[])?;
                buf
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(len, device, backend = %acc.name(), "device allocation");
                acc.allocate(device, len).map_err(|e| Error::Allocation {
                    requested: len,
                    reason: e.to_string(),
                })?
            }
        };
        self.outstanding_device.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    /// Give a host buffer back to the pool.
    pub fn release_host(&self, buf: HostBuffer) -> Result<()> {
        self.outstanding_host.fetch_sub(1, Ordering::Relaxed);
        let len = buf.len();
        if self.may_cache(len)? {
            self.host
                .push(len, buf.0)
                .map_err(|_| Error::poisoned("free list"))?;
        }
        Ok(())
    }

    /// Give a device buffer back to the pool.
    ///
    /// A buffer that cannot be cached is freed on the accelerator, including
    /// when the cache bookkeeping itself fails.
    pub fn release_device(&self, buf: DeviceBuffer) -> Result<()> {
        self.outstanding_device.fetch_sub(1, Ordering::Relaxed);
        let acc = self.require_accelerator()?;
        match self.may_cache(buf.len()) {
            Ok(true) => self.device.push((buf.device(), buf.len()), buf).or_else(|buf| {
                acc.free(buf)?;
                Err(Error::poisoned("free list"))
            }),
            Ok(false) => acc.free(buf),
            Err(e) => {
                acc.free(buf)?;
                Err(e)
            }
        }
    }

    /// Number of buffers (host and device) handed out and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding_host.load(Ordering::Relaxed)
            + self.outstanding_device.load(Ordering::Relaxed)
    }

    /// Current pool statistics.
    pub fn stats(&self) -> Result<PoolStats> {
        let (host_count, host_elems) = self.host.stats(|len| *len)?;
        let (dev_count, dev_elems) = self.device.stats(|(_, len)| *len)?;
        Ok(PoolStats {
            cached_bytes: (host_elems + dev_elems) * ELEM_BYTES,
            cached_buffers: host_count + dev_count,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            outstanding_host: self.outstanding_host.load(Ordering::Relaxed),
            outstanding_device: self.outstanding_device.load(Ordering::Relaxed),
        })
    }

    /// Release every cached buffer. Outstanding buffers are unaffected.
    pub fn empty_cache(&self) -> Result<()> {
        let host = self.host.drain()?;
        let device = self.device.drain()?;
        debug!(host = host.len(), device = device.len(), "emptying pool cache");
        if device.is_empty() {
            return Ok(());
        }
        let acc = self.require_accelerator()?;
        for buf in device {
            acc.free(buf)?;
        }
        Ok(())
    }

    fn may_cache(&self, len: usize) -> Result<bool> {
        if !self.config.caching {
            return Ok(false);
        }
        let Some(limit) = self.config.max_cached_bytes else {
            return Ok(true);
        };
        let cached = self.stats()?.cached_bytes;
        Ok(cached + len * ELEM_BYTES <= limit)
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        if let Err(e) = self.empty_cache() {
            warn!(error = %e, "failed to empty pool cache on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::SimulatedAccelerator;

    fn sim_pool(config: PoolConfig) -> (Arc<SimulatedAccelerator>, MemoryPool) {
        let acc = Arc::new(SimulatedAccelerator::new(2));
        let pool = MemoryPool::new(config, Some(acc.clone()));
        (acc, pool)
    }

    #[test]
    fn test_host_reuse_counts_hit() {
        let pool = MemoryPool::new(PoolConfig::default(), None);
        let mut a = pool.acquire_host(16).unwrap();
        a[0] = 5.0;
        pool.release_host(a).unwrap();
        let b = pool.acquire_host(16).unwrap();
        assert_eq!(b[0], 0.0);
        let stats = pool.stats().unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(pool.outstanding(), 1);
        pool.release_host(b).unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_zero_length_rejected() {
        let pool = MemoryPool::new(PoolConfig::default(), None);
        assert!(matches!(pool.acquire_host(0), Err(Error::Allocation { .. })));
    }

    #[test]
    fn test_device_requires_accelerator() {
        let pool = MemoryPool::new(PoolConfig::default(), None);
        assert!(matches!(
            pool.acquire_device(8, 0),
            Err(Error::Allocation { .. })
        ));
    }

    #[test]
    fn test_device_bad_index() {
        let (_, pool) = sim_pool(PoolConfig::default());
        assert!(matches!(
            pool.acquire_device(8, 5),
            Err(Error::Allocation { .. })
        ));
    }

    #[test]
    fn test_device_reuse_is_zeroed() {
        let (acc, pool) = sim_pool(PoolConfig::default());
        let buf = pool.acquire_device(4, 1).unwrap();
        acc.upload(&buf, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        pool.release_device(buf).unwrap();
        let buf = pool.acquire_device(4, 1).unwrap();
        let mut out = [9.0; 4];
        acc.download(&buf, &mut out).unwrap();
        assert_eq!(out, [0.0; 4]);
        pool.release_device(buf).unwrap();
        pool.empty_cache().unwrap();
        assert_eq!(acc.live_allocations(), 0);
    }

    #[test]
    fn test_caching_disabled_frees_immediately() {
        let (acc, pool) = sim_pool(PoolConfig::default().with_caching(false));
        let buf = pool.acquire_device(4, 0).unwrap();
        pool.release_device(buf).unwrap();
        assert_eq!(acc.live_allocations(), 0);
        assert_eq!(pool.stats().unwrap().cached_buffers, 0);
    }

    #[test]
    fn test_max_cached_bytes_bound() {
        let pool = MemoryPool::new(PoolConfig::default().with_max_cached_bytes(64), None);
        let a = pool.acquire_host(16).unwrap();
        let b = pool.acquire_host(16).unwrap();
        pool.release_host(a).unwrap();
        pool.release_host(b).unwrap();
        let stats = pool.stats().unwrap();
        assert_eq!(stats.cached_buffers, 1);
        assert_eq!(stats.cached_bytes, 64);
    }

    fn poison_device_list(pool: &MemoryPool) {
        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                let _map = pool.device.buckets.lock().unwrap();
                panic!("poisoning the device free list");
            });
            assert!(handle.join().is_err());
        });
    }

    #[test]
    fn test_release_device_frees_when_cache_check_fails() {
        let (acc, pool) = sim_pool(PoolConfig::default().with_max_cached_bytes(1024));
        let buf = pool.acquire_device(4, 0).unwrap();
        poison_device_list(&pool);
        assert!(pool.release_device(buf).is_err());
        assert_eq!(acc.live_allocations(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_release_device_frees_when_push_fails() {
        let (acc, pool) = sim_pool(PoolConfig::default());
        let buf = pool.acquire_device(4, 1).unwrap();
        poison_device_list(&pool);
        assert!(pool.release_device(buf).is_err());
        assert_eq!(acc.live_allocations(), 0);
    }

    #[test]
    fn test_drop_frees_cached_device_buffers() {
        let (acc, pool) = sim_pool(PoolConfig::default());
        let buf = pool.acquire_device(4, 0).unwrap();
        pool.release_device(buf).unwrap();
        assert_eq!(acc.live_allocations(), 1);
        drop(pool);
        assert_eq!(acc.live_allocations(), 0);
    }
}
