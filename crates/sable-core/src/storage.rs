// TensorStorage — The buffers behind one tensor instance
//
// A TensorStorage owns everything needed to hold the values of one tensor at
// one point in the graph: the padded dense host buffer (always allocated), a
// device buffer when the storage is tagged with an accelerator, and, for
// sparse storage, one CSR matrix per `rows x cols` matrix of the batch.
//
// RESIDENCY
//
//   The device tag decides which buffer is authoritative:
//     host         → the host buffer (or the CSR list, for sparse storage)
//     accelerator  → the device buffer; the host buffer is a staging area
//
//   `send_to` moves data between the two in a fixed two-step protocol: on the
//   way to an accelerator the tag is switched first and the data moved
//   second (`to_device`), on the way back the data is moved first (`to_host`)
//   and the tag switched second. Both helpers refuse to run when the tag does
//   not match the direction, so the steps cannot be reordered.
//
//   After an accelerator → host move the device buffer is kept, so a later
//   move back to the same accelerator reuses it. A failed upload restores
//   the previous tag and releases any buffer acquired for it.
//
// BUSY FLAG
//
//   `copy` serializes on a per-storage try-lock (`BusyGuard`). A storage that
//   is already part of a copy makes the next copy return `Ok(false)` at once,
//   before any buffer is touched; the guard clears the flag on every exit
//   path.
//
// LIFETIME
//
//   Buffers go back to the MemoryPool on drop (or `destroy`, which reports
//   release errors). Storage is not Clone, so a buffer can only be released
//   once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::accelerator::{Accelerator, DeviceBuffer};
use crate::device::{Device, DeviceKind};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::pool::{HostBuffer, MemoryPool};
use crate::shape::Shape;
use crate::sparse::CsrMatrix;

/// Buffers and length fields guarded by the storage lock.
#[derive(Debug)]
pub(crate) struct StorageData {
    host: Option<HostBuffer>,
    device: Option<DeviceBuffer>,
    sparse: Option<Vec<CsrMatrix>>,
    /// Valid elements in the dense region, padding included.
    dense_len: usize,
    /// Stored values across all CSR matrices.
    sparse_len: usize,
}

impl StorageData {
    pub(crate) fn host(&self) -> Result<&[f32]> {
        let len = self.dense_len;
        self.host
            .as_deref()
            .and_then(|h| h.get(..len))
            .ok_or_else(|| Error::msg("host buffer released"))
    }

    pub(crate) fn host_mut(&mut self) -> Result<&mut [f32]> {
        let len = self.dense_len;
        self.host
            .as_deref_mut()
            .and_then(|h| h.get_mut(..len))
            .ok_or_else(|| Error::msg("host buffer released"))
    }

    pub(crate) fn device_buffer(&self) -> Result<&DeviceBuffer> {
        self.device
            .as_ref()
            .ok_or_else(|| Error::msg("storage has no device buffer"))
    }

    fn matrices(&self) -> Result<&[CsrMatrix]> {
        self.sparse
            .as_deref()
            .ok_or_else(|| Error::msg("sparse representation released"))
    }
}

/// Clears the busy flag of a storage when dropped.
#[derive(Debug)]
pub struct BusyGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Owned buffers for one tensor instance.
#[derive(Debug)]
pub struct TensorStorage {
    layout: Layout,
    device: Device,
    is_sparse: bool,
    data: RwLock<StorageData>,
    busy: AtomicBool,
    pool: Arc<MemoryPool>,
}

fn layout_name(is_sparse: bool) -> &'static str {
    if is_sparse {
        "sparse"
    } else {
        "dense"
    }
}

impl TensorStorage {
    /// Allocate storage for `batch_size` tensors of `shape` on `device`.
    ///
    /// The host buffer is always allocated; an accelerator device also gets
    /// a device buffer holding the dense region. Sparse storage is
    /// host-resident only.
    pub fn create(
        shape: Shape,
        device: Device,
        is_sparse: bool,
        batch_size: usize,
        pool: &Arc<MemoryPool>,
    ) -> Result<Self> {
        if is_sparse && device.is_accelerator() {
            return Err(Error::Unimplemented("sparse storage on an accelerator"));
        }
        let layout = Layout::new(shape, batch_size, pool.config().pad_unit())?;
        let host = pool.acquire_host(layout.host_capacity())?;
        let device_buf = if device.is_accelerator() {
            match pool.acquire_device(layout.dense_len(), device.index()) {
                Ok(buf) => Some(buf),
                Err(e) => {
                    pool.release_host(host)?;
                    return Err(e);
                }
            }
        } else {
            None
        };
        let sparse: Option<Vec<CsrMatrix>> = is_sparse.then(|| {
            (0..layout.matrix_count())
                .map(|_| CsrMatrix::empty(layout.rows(), layout.cols()))
                .collect()
        });
        debug!(
            shape = %layout.shape(),
            batch = batch_size,
            %device,
            layout = layout_name(is_sparse),
            "storage created"
        );
        Ok(TensorStorage {
            data: RwLock::new(StorageData {
                host: Some(host),
                device: device_buf,
                sparse,
                dense_len: layout.dense_len(),
                sparse_len: 0,
            }),
            layout,
            device,
            is_sparse,
            busy: AtomicBool::new(false),
            pool: pool.clone(),
        })
    }

    /// Release all buffers to the pool, reporting any release failure.
    pub fn destroy(mut self) -> Result<()> {
        self.release_buffers()
    }

    fn release_buffers(&mut self) -> Result<()> {
        let data = self.data.get_mut().map_err(|_| Error::poisoned("storage"))?;
        data.sparse = None;
        if let Some(host) = data.host.take() {
            self.pool.release_host(host)?;
        }
        if let Some(buf) = data.device.take() {
            self.pool.release_device(buf)?;
        }
        Ok(())
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn is_sparse(&self) -> bool {
        self.is_sparse
    }

    pub fn batch_size(&self) -> usize {
        self.layout.batch_size()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    /// Element count of the dense region, padding included.
    pub fn element_count(&self) -> usize {
        self.layout.dense_len()
    }

    /// Stored values across all CSR matrices; 0 for dense storage.
    pub fn nnz(&self) -> Result<usize> {
        Ok(self.read()?.sparse_len)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, StorageData>> {
        self.data.read().map_err(|_| Error::poisoned("storage"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, StorageData>> {
        self.data.write().map_err(|_| Error::poisoned("storage"))
    }

    pub(crate) fn accelerator(&self) -> Result<&Arc<dyn Accelerator>> {
        self.pool.require_accelerator()
    }

    // Busy flag

    /// Try to mark the storage busy. `None` if it already is.
    pub fn try_acquire(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| BusyGuard { flag: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    // Copy

    /// Copy `src` into `dest`, both residing on `device`.
    ///
    /// Returns `Ok(false)` without touching either buffer when one of them is
    /// busy. When the layouts differ the values are converted (dense ↔ CSR);
    /// sparse → sparse copies the matrices verbatim.
    pub fn copy(dest: &TensorStorage, src: &TensorStorage, device: Device) -> Result<bool> {
        if dest.shape() != src.shape() || dest.batch_size() != src.batch_size() {
            return Err(Error::ShapeMismatch {
                expected: dest.shape().with_leading(dest.batch_size())?,
                got: src.shape().with_leading(src.batch_size())?,
            });
        }
        for storage in [dest, src] {
            if storage.device != device {
                return Err(Error::DeviceMismatch {
                    expected: device,
                    got: storage.device,
                });
            }
        }
        if std::ptr::eq(dest, src) {
            return Ok(true);
        }
        if device.is_accelerator() && !Arc::ptr_eq(src.accelerator()?, dest.accelerator()?) {
            crate::bail!("copy between storages of different accelerator runtimes");
        }

        let Some(_src_guard) = src.try_acquire() else {
            warn!(shape = %src.shape(), "copy rejected: source busy");
            return Ok(false);
        };
        let Some(_dest_guard) = dest.try_acquire() else {
            warn!(shape = %dest.shape(), "copy rejected: destination busy");
            return Ok(false);
        };

        match (src.is_sparse, dest.is_sparse) {
            (false, false) if device.is_accelerator() => {
                let (s, d) = (src.read()?, dest.read()?);
                let acc = dest.accelerator()?;
                if same_padding(src, dest) {
                    acc.copy(d.device_buffer()?, s.device_buffer()?, src.layout.dense_len())?;
                } else {
                    let mut staged = vec![0.0; src.layout.dense_len()];
                    acc.download(s.device_buffer()?, &mut staged)?;
                    let mut repadded = vec![0.0; dest.layout.dense_len()];
                    dest.layout.scatter(&src.layout.gather(&staged)?, &mut repadded)?;
                    acc.upload(d.device_buffer()?, &repadded)?;
                }
            }
            (false, false) => {
                let values = src.read()?.host()?.to_vec();
                let mut d = dest.write()?;
                if same_padding(src, dest) {
                    d.host_mut()?.copy_from_slice(&values);
                } else {
                    dest.layout.scatter(&src.layout.gather(&values)?, d.host_mut()?)?;
                }
                d.dense_len = dest.layout.dense_len();
            }
            (false, true) => {
                let values = src.read()?.host()?.to_vec();
                let matrices = src.layout.compress_csr(&values)?;
                let mut d = dest.write()?;
                d.sparse_len = matrices.iter().map(CsrMatrix::nnz).sum();
                d.sparse = Some(matrices);
            }
            (true, false) => {
                let matrices = src.read()?.matrices()?.to_vec();
                let mut d = dest.write()?;
                dest.layout.expand_csr(&matrices, d.host_mut()?)?;
                d.dense_len = dest.layout.dense_len();
            }
            (true, true) => {
                let s = src.read()?;
                let (matrices, nnz) = (s.matrices()?.to_vec(), s.sparse_len);
                drop(s);
                let mut d = dest.write()?;
                d.sparse = Some(matrices);
                d.sparse_len = nnz;
            }
        }
        debug!(
            shape = %dest.shape(),
            %device,
            from = layout_name(src.is_sparse),
            to = layout_name(dest.is_sparse),
            "copied storage"
        );
        Ok(true)
    }

    // Residency

    /// Move the storage to `device`. A no-op when already resident there.
    pub fn send_to(&mut self, device: Device) -> Result<()> {
        if self.device == device {
            return Ok(());
        }
        if self.is_sparse {
            return Err(Error::Unimplemented("sparse storage on an accelerator"));
        }
        debug!(from = %self.device, to = %device, shape = %self.shape(), "send_to");
        match (self.device.kind(), device.kind()) {
            (DeviceKind::Host, DeviceKind::Accelerator) => {
                let previous = self.device;
                self.device = device;
                if let Err(e) = self.to_device() {
                    self.device = previous;
                    return Err(e);
                }
                Ok(())
            }
            (DeviceKind::Accelerator, DeviceKind::Host) => {
                self.to_host()?;
                self.device = device;
                Ok(())
            }
            (DeviceKind::Accelerator, DeviceKind::Accelerator) => {
                let previous = self.device;
                self.to_host()?;
                self.device = device;
                // to_device keeps the old buffer until the upload succeeds.
                if let Err(e) = self.to_device() {
                    self.device = previous;
                    return Err(e);
                }
                Ok(())
            }
            (DeviceKind::Host, DeviceKind::Host) => {
                self.device = device;
                Ok(())
            }
        }
    }

    /// Upload the host buffer to the accelerator named by the device tag.
    fn to_device(&mut self) -> Result<()> {
        if !self.device.is_accelerator() {
            return Err(Error::invalid_argument(format!(
                "to_device on storage tagged {}",
                self.device
            )));
        }
        let index = self.device.index();
        let dense_len = self.layout.dense_len();
        let pool = self.pool.clone();
        let acc = pool.require_accelerator()?;
        let data = self.data.get_mut().map_err(|_| Error::poisoned("storage"))?;

        if data.device.as_ref().is_some_and(|b| b.device() == index) {
            return acc.upload(data.device_buffer()?, data.host()?);
        }
        let fresh = pool.acquire_device(dense_len, index)?;
        if let Err(e) = data.host().and_then(|host| acc.upload(&fresh, host)) {
            pool.release_device(fresh)?;
            return Err(e);
        }
        if let Some(old) = data.device.replace(fresh) {
            pool.release_device(old)?;
        }
        Ok(())
    }

    /// Download the device buffer into the host buffer. The device buffer
    /// stays allocated.
    fn to_host(&mut self) -> Result<()> {
        if !self.device.is_accelerator() {
            return Err(Error::invalid_argument(format!(
                "to_host on storage tagged {}",
                self.device
            )));
        }
        let index = self.device.index();
        let acc = self.pool.require_accelerator()?.clone();
        let data = self.data.get_mut().map_err(|_| Error::poisoned("storage"))?;
        let StorageData { host, device, dense_len, .. } = data;
        let buf = device
            .as_ref()
            .filter(|b| b.device() == index)
            .ok_or_else(|| {
                Error::invalid_argument(format!("no device buffer on accelerator {index}"))
            })?;
        let host = host
            .as_deref_mut()
            .and_then(|h| h.get_mut(..*dense_len))
            .ok_or_else(|| Error::msg("host buffer released"))?;
        acc.download(buf, host)
    }

    // Data access

    /// The logical values (batch-major, padding stripped).
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let data = self.read()?;
        if self.is_sparse {
            let mut dense = vec![0.0; self.layout.dense_len()];
            self.layout.expand_csr(data.matrices()?, &mut dense)?;
            return self.layout.gather(&dense);
        }
        if self.device.is_accelerator() {
            let mut dense = vec![0.0; self.layout.dense_len()];
            self.accelerator()?.download(data.device_buffer()?, &mut dense)?;
            return self.layout.gather(&dense);
        }
        self.layout.gather(data.host()?)
    }

    /// Overwrite the logical values. `values` must hold
    /// `batch_size * shape.elem_count()` elements.
    pub fn load(&self, values: &[f32]) -> Result<()> {
        let mut data = self.write()?;
        if self.is_sparse {
            let mut dense = vec![0.0; self.layout.dense_len()];
            self.layout.scatter(values, &mut dense)?;
            let matrices = self.layout.compress_csr(&dense)?;
            data.sparse_len = matrices.iter().map(CsrMatrix::nnz).sum();
            data.sparse = Some(matrices);
            return Ok(());
        }
        if self.device.is_accelerator() {
            let mut dense = vec![0.0; self.layout.dense_len()];
            self.layout.scatter(values, &mut dense)?;
            return self.accelerator()?.upload(data.device_buffer()?, &dense);
        }
        self.layout.scatter(values, data.host_mut()?)
    }

    /// Set every logical element to `value`. Padding is left untouched.
    pub fn fill(&self, value: f32) -> Result<()> {
        self.load(&vec![value; self.layout.logical_len()])
    }

    /// A copy of the CSR matrix at `index` (batch-major).
    pub fn csr(&self, index: usize) -> Result<CsrMatrix> {
        if !self.is_sparse {
            return Err(Error::TypeMismatch {
                expected: "sparse",
                got: "dense",
            });
        }
        let data = self.read()?;
        data.matrices()?.get(index).cloned().ok_or_else(|| {
            Error::invalid_argument(format!(
                "matrix index {index} out of range ({} matrices)",
                self.layout.matrix_count()
            ))
        })
    }

    /// Fail with `TypeMismatch` unless the storage is dense.
    pub(crate) fn require_dense(&self) -> Result<()> {
        if self.is_sparse {
            return Err(Error::TypeMismatch {
                expected: "dense",
                got: "sparse",
            });
        }
        Ok(())
    }
}

/// Whether both storages pad their rows identically, so the dense regions
/// can be copied element for element.
fn same_padding(a: &TensorStorage, b: &TensorStorage) -> bool {
    a.layout.row_stride() == b.layout.row_stride() && a.layout.dense_len() == b.layout.dense_len()
}

impl Drop for TensorStorage {
    fn drop(&mut self) {
        if let Err(e) = self.release_buffers() {
            warn!(error = %e, "failed to release storage buffers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::SimulatedAccelerator;
    use crate::config::PoolConfig;

    fn sim_pool() -> Arc<MemoryPool> {
        let acc: Arc<dyn Accelerator> = Arc::new(SimulatedAccelerator::new(2));
        Arc::new(MemoryPool::new(PoolConfig::default(), Some(acc)))
    }

    fn shape(dims: &[usize]) -> Shape {
        Shape::new(dims.to_vec()).unwrap()
    }

    #[test]
    fn test_create_host_dense() {
        let pool = sim_pool();
        let t = TensorStorage::create(shape(&[3, 4]), Device::host(), false, 2, &pool).unwrap();
        assert_eq!(t.element_count(), 2 * 3 * 8);
        assert_eq!(t.to_vec().unwrap(), vec![0.0; 24]);
        assert_eq!(pool.outstanding(), 1);
        t.destroy().unwrap();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_create_accelerator_allocates_device_buffer() {
        let pool = sim_pool();
        let t = TensorStorage::create(shape(&[2, 2]), Device::accelerator(1), false, 1, &pool)
            .unwrap();
        assert_eq!(pool.outstanding(), 2);
        assert!(t.read().unwrap().device_buffer().is_ok());
        drop(t);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_sparse_on_accelerator_unimplemented() {
        let pool = sim_pool();
        let err = TensorStorage::create(shape(&[2, 2]), Device::accelerator(0), true, 1, &pool);
        assert!(matches!(err, Err(Error::Unimplemented(_))));
    }

    #[test]
    fn test_busy_guard_is_exclusive() {
        let pool = sim_pool();
        let t = TensorStorage::create(shape(&[2]), Device::host(), false, 1, &pool).unwrap();
        let guard = t.try_acquire().unwrap();
        assert!(t.is_busy());
        assert!(t.try_acquire().is_none());
        drop(guard);
        assert!(!t.is_busy());
        assert!(t.try_acquire().is_some());
    }

    #[test]
    fn test_to_device_checks_tag() {
        let pool = sim_pool();
        let mut t = TensorStorage::create(shape(&[2]), Device::host(), false, 1, &pool).unwrap();
        assert!(matches!(t.to_device(), Err(Error::InvalidArgument(_))));
        assert!(matches!(t.to_host(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_send_to_reuses_retained_buffer() {
        let pool = sim_pool();
        let mut t = TensorStorage::create(shape(&[2, 3]), Device::host(), false, 1, &pool).unwrap();
        t.load(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        t.send_to(Device::accelerator(0)).unwrap();
        t.send_to(Device::host()).unwrap();
        assert_eq!(pool.stats().unwrap().outstanding_device, 1);
        let misses = pool.stats().unwrap().misses;
        t.send_to(Device::accelerator(0)).unwrap();
        assert_eq!(pool.stats().unwrap().misses, misses);
        assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_accelerator_hop_goes_through_host() {
        let pool = sim_pool();
        let mut t =
            TensorStorage::create(shape(&[3]), Device::accelerator(0), false, 1, &pool).unwrap();
        t.load(&[7.0, 8.0, 9.0]).unwrap();
        t.send_to(Device::accelerator(1)).unwrap();
        assert_eq!(t.read().unwrap().device_buffer().unwrap().device(), 1);
        assert_eq!(t.to_vec().unwrap(), vec![7.0, 8.0, 9.0]);
    }

    #[test]
    fn test_csr_view_requires_sparse() {
        let pool = sim_pool();
        let t = TensorStorage::create(shape(&[2, 2]), Device::host(), false, 1, &pool).unwrap();
        assert!(matches!(t.csr(0), Err(Error::TypeMismatch { .. })));
    }

    #[test]
    fn test_sparse_load_and_view() {
        let pool = sim_pool();
        let t = TensorStorage::create(shape(&[2, 2]), Device::host(), true, 2, &pool).unwrap();
        t.load(&[1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0]).unwrap();
        assert_eq!(t.nnz().unwrap(), 3);
        let second = t.csr(1).unwrap();
        assert_eq!(second.row_offsets, vec![0, 0, 1]);
        assert_eq!(second.col_indices, vec![0]);
        assert_eq!(t.to_vec().unwrap(), vec![1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 3.0, 0.0]);
    }
}
