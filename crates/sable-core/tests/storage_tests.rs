// Tests for sable-core: TensorStorage lifecycle, copy, residency and compute

use std::sync::Arc;
use std::thread;

use sable_core::compute;
use sable_core::{
    Accelerator, Device, Error, MemoryPool, PoolConfig, Shape, SimulatedAccelerator,
    TensorStorage,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn accel_pool(devices: usize) -> (Arc<SimulatedAccelerator>, Arc<MemoryPool>) {
    let sim = Arc::new(SimulatedAccelerator::new(devices));
    let acc: Arc<dyn Accelerator> = sim.clone();
    (sim, Arc::new(MemoryPool::new(PoolConfig::default(), Some(acc))))
}

fn dense(pool: &Arc<MemoryPool>, dims: &[usize], device: Device) -> TensorStorage {
    TensorStorage::create(Shape::new(dims.to_vec()).unwrap(), device, false, 1, pool).unwrap()
}

fn sparse(pool: &Arc<MemoryPool>, dims: &[usize]) -> TensorStorage {
    TensorStorage::create(Shape::new(dims.to_vec()).unwrap(), Device::host(), true, 1, pool)
        .unwrap()
}

// Lifecycle

#[test]
fn test_create_destroy_returns_every_buffer() {
    init_tracing();
    let (sim, pool) = accel_pool(1);
    let a = dense(&pool, &[3, 4], Device::accelerator(0));
    let b = dense(&pool, &[5], Device::host());
    assert_eq!(pool.outstanding(), 3);
    a.destroy().unwrap();
    drop(b);
    assert_eq!(pool.outstanding(), 0);

    pool.empty_cache().unwrap();
    assert_eq!(sim.live_allocations(), 0);
}

#[test]
fn test_cached_buffers_are_reused() {
    let pool = MemoryPool::host_only();
    drop(dense(&pool, &[3, 4], Device::host()));
    let before = pool.stats().unwrap();
    let t = dense(&pool, &[3, 4], Device::host());
    let after = pool.stats().unwrap();
    assert_eq!(after.hits, before.hits + 1);
    assert_eq!(after.misses, before.misses);
    assert_eq!(t.to_vec().unwrap(), vec![0.0; 12]);
}

#[test]
fn test_sparse_on_accelerator_unimplemented() {
    let (_sim, pool) = accel_pool(1);
    let err = TensorStorage::create(
        Shape::new(vec![2, 2]).unwrap(),
        Device::accelerator(0),
        true,
        1,
        &pool,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Unimplemented(_)));
    assert_eq!(pool.outstanding(), 0);
}

// Copy

#[test]
fn test_copy_dense_host() {
    let pool = MemoryPool::host_only();
    let src = dense(&pool, &[2, 3], Device::host());
    let dst = dense(&pool, &[2, 3], Device::host());
    src.load(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    assert!(TensorStorage::copy(&dst, &src, Device::host()).unwrap());
    assert_eq!(dst.to_vec().unwrap(), src.to_vec().unwrap());
}

#[test]
fn test_copy_shape_mismatch_leaves_destination() {
    let pool = MemoryPool::host_only();
    let src = dense(&pool, &[2, 3], Device::host());
    let dst = dense(&pool, &[3, 2], Device::host());
    src.fill(1.0).unwrap();
    dst.fill(7.0).unwrap();

    let err = TensorStorage::copy(&dst, &src, Device::host()).unwrap_err();
    assert!(matches!(err, Error::ShapeMismatch { .. }));
    assert_eq!(dst.to_vec().unwrap(), vec![7.0; 6]);
}

#[test]
fn test_copy_device_mismatch() {
    let (_sim, pool) = accel_pool(1);
    let src = dense(&pool, &[4], Device::host());
    let dst = dense(&pool, &[4], Device::accelerator(0));
    let err = TensorStorage::copy(&dst, &src, Device::accelerator(0)).unwrap_err();
    assert!(matches!(err, Error::DeviceMismatch { .. }));
}

#[test]
fn test_copy_busy_rejected() {
    let pool = MemoryPool::host_only();
    let src = dense(&pool, &[4], Device::host());
    let dst = dense(&pool, &[4], Device::host());
    src.fill(2.0).unwrap();

    {
        let _guard = dst.try_acquire().unwrap();
        assert!(!TensorStorage::copy(&dst, &src, Device::host()).unwrap());
        assert_eq!(dst.to_vec().unwrap(), vec![0.0; 4]);
    }
    assert!(!dst.is_busy());
    assert!(TensorStorage::copy(&dst, &src, Device::host()).unwrap());
    assert_eq!(dst.to_vec().unwrap(), vec![2.0; 4]);
}

#[test]
fn test_concurrent_copies_leave_consistent_destination() {
    let pool = MemoryPool::host_only();
    let dst = Arc::new(dense(&pool, &[4, 5], Device::host()));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let src = dense(&pool, &[4, 5], Device::host());
            src.fill(i as f32 + 1.0).unwrap();
            let dst = Arc::clone(&dst);
            thread::spawn(move || {
                let copied = (0..50)
                    .filter(|_| TensorStorage::copy(&dst, &src, Device::host()).unwrap())
                    .count();
                assert!(!src.is_busy());
                copied
            })
        })
        .collect();
    let copied: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    assert!(copied > 0);
    assert!(!dst.is_busy());
    let values = dst.to_vec().unwrap();
    assert!((1.0..=8.0).contains(&values[0]));
    assert!(values.iter().all(|&v| v == values[0]));
}

#[test]
fn test_copy_between_different_paddings() {
    let narrow = MemoryPool::host_only();
    let wide = Arc::new(MemoryPool::new(
        PoolConfig::default().with_alignment_bytes(64),
        None,
    ));
    let values = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let src = dense(&narrow, &[2, 3], Device::host());
    let dst = dense(&wide, &[2, 3], Device::host());
    assert_ne!(src.element_count(), dst.element_count());

    src.load(&values).unwrap();
    assert!(TensorStorage::copy(&dst, &src, Device::host()).unwrap());
    assert_eq!(dst.to_vec().unwrap(), values.to_vec());

    dst.fill(7.0).unwrap();
    assert!(TensorStorage::copy(&src, &dst, Device::host()).unwrap());
    assert_eq!(src.to_vec().unwrap(), vec![7.0; 6]);
}

#[test]
fn test_copy_between_different_paddings_on_accelerator() {
    let sim = Arc::new(SimulatedAccelerator::new(1));
    let acc: Arc<dyn Accelerator> = sim.clone();
    let narrow = Arc::new(MemoryPool::new(PoolConfig::default(), Some(acc.clone())));
    let wide = Arc::new(MemoryPool::new(
        PoolConfig::default().with_alignment_bytes(64),
        Some(acc),
    ));
    let dev = Device::accelerator(0);
    let src = dense(&narrow, &[2, 3], dev);
    let dst = dense(&wide, &[2, 3], dev);
    src.load(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    assert!(TensorStorage::copy(&dst, &src, dev).unwrap());
    assert_eq!(dst.to_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn test_copy_across_accelerator_runtimes_rejected() {
    let (_a, pool_a) = accel_pool(1);
    let (_b, pool_b) = accel_pool(1);
    let dev = Device::accelerator(0);
    let src = dense(&pool_a, &[2], dev);
    let dst = dense(&pool_b, &[2], dev);
    assert!(matches!(
        TensorStorage::copy(&dst, &src, dev),
        Err(Error::Msg(_))
    ));
    assert!(!src.is_busy() && !dst.is_busy());
}

#[test]
fn test_copy_self_is_noop() {
    let pool = MemoryPool::host_only();
    let t = dense(&pool, &[3], Device::host());
    t.load(&[1.0, 2.0, 3.0]).unwrap();
    assert!(TensorStorage::copy(&t, &t, Device::host()).unwrap());
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
}

#[test]
fn test_copy_on_accelerator() {
    let (_sim, pool) = accel_pool(1);
    let dev = Device::accelerator(0);
    let src = dense(&pool, &[2, 2], dev);
    let dst = dense(&pool, &[2, 2], dev);
    src.load(&[1.0, -1.0, 2.0, -2.0]).unwrap();
    assert!(TensorStorage::copy(&dst, &src, dev).unwrap());
    assert_eq!(dst.to_vec().unwrap(), vec![1.0, -1.0, 2.0, -2.0]);
}

#[test]
fn test_copy_dense_sparse_conversions() {
    let pool = MemoryPool::host_only();
    let values = [0.0, 1.0, 0.0, 2.0, 0.0, 3.0];
    let d = dense(&pool, &[2, 3], Device::host());
    d.load(&values).unwrap();

    let s = sparse(&pool, &[2, 3]);
    assert!(TensorStorage::copy(&s, &d, Device::host()).unwrap());
    assert_eq!(s.nnz().unwrap(), 3);
    let csr = s.csr(0).unwrap();
    assert_eq!(csr.row_offsets, vec![0, 1, 3]);
    assert_eq!(csr.col_indices, vec![1, 0, 2]);
    assert_eq!(csr.values, vec![1.0, 2.0, 3.0]);

    let s2 = sparse(&pool, &[2, 3]);
    assert!(TensorStorage::copy(&s2, &s, Device::host()).unwrap());
    assert_eq!(s2.nnz().unwrap(), 3);

    let back = dense(&pool, &[2, 3], Device::host());
    back.fill(9.0).unwrap();
    assert!(TensorStorage::copy(&back, &s2, Device::host()).unwrap());
    assert_eq!(back.to_vec().unwrap(), values.to_vec());
}

// Residency

#[test]
fn test_send_to_round_trip() {
    init_tracing();
    let (_sim, pool) = accel_pool(2);
    let mut t = dense(&pool, &[2, 3], Device::host());
    let values = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    t.load(&values).unwrap();

    t.send_to(Device::accelerator(0)).unwrap();
    assert_eq!(t.device(), Device::accelerator(0));
    assert_eq!(t.to_vec().unwrap(), values);

    t.send_to(Device::accelerator(1)).unwrap();
    assert_eq!(t.to_vec().unwrap(), values);

    t.send_to(Device::host()).unwrap();
    assert!(t.device().is_host());
    assert_eq!(t.to_vec().unwrap(), values);
}

#[test]
fn test_send_to_missing_accelerator_fails() {
    let pool = MemoryPool::host_only();
    let mut t = dense(&pool, &[2], Device::host());
    t.load(&[4.0, 5.0]).unwrap();
    assert!(t.send_to(Device::accelerator(0)).is_err());
    assert_eq!(t.device(), Device::host());
    assert_eq!(t.to_vec().unwrap(), vec![4.0, 5.0]);
}

#[test]
fn test_failed_send_to_keeps_storage_usable() {
    let (sim, pool) = accel_pool(1);
    let mut t = dense(&pool, &[3], Device::host());
    t.load(&[1.0, 2.0, 3.0]).unwrap();

    assert!(t.send_to(Device::accelerator(3)).is_err());
    assert_eq!(t.device(), Device::host());
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    assert_eq!(pool.stats().unwrap().outstanding_device, 0);

    t.send_to(Device::accelerator(0)).unwrap();
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);

    // Failed hop between accelerators leaves the data on the first one.
    assert!(t.send_to(Device::accelerator(2)).is_err());
    assert_eq!(t.device(), Device::accelerator(0));
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);
    t.send_to(Device::host()).unwrap();
    assert_eq!(t.to_vec().unwrap(), vec![1.0, 2.0, 3.0]);

    t.destroy().unwrap();
    assert_eq!(pool.outstanding(), 0);
    drop(pool);
    assert_eq!(sim.live_allocations(), 0);
}

// Compute

#[test]
fn test_add_then_scale_scenario() {
    let pool = MemoryPool::host_only();
    let a = dense(&pool, &[3, 4], Device::host());
    let b = dense(&pool, &[3, 4], Device::host());
    let y = dense(&pool, &[3, 4], Device::host());
    a.fill(2.0).unwrap();
    b.fill(3.0).unwrap();

    compute::add(&y, &a, &b).unwrap();
    compute::scale(&y, &y, 2.0).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![10.0; 12]);
}

#[test]
fn test_add_then_scale_on_accelerator() {
    let (_sim, pool) = accel_pool(1);
    let dev = Device::accelerator(0);
    let a = dense(&pool, &[3, 4], dev);
    let b = dense(&pool, &[1, 4], dev);
    let y = dense(&pool, &[3, 4], dev);
    a.fill(2.0).unwrap();
    b.load(&[1.0, 2.0, 3.0, 4.0]).unwrap();

    compute::add(&y, &a, &b).unwrap();
    compute::scale(&y, &y, 2.0).unwrap();
    let expected: Vec<f32> = (0..12).map(|i| (2.0 + (i % 4 + 1) as f32) * 2.0).collect();
    assert_eq!(y.to_vec().unwrap(), expected);
}

#[test]
fn test_mixed_devices_rejected() {
    let (_sim, pool) = accel_pool(1);
    let a = dense(&pool, &[4], Device::host());
    let b = dense(&pool, &[4], Device::accelerator(0));
    let y = dense(&pool, &[4], Device::host());
    let err = compute::add(&y, &a, &b).unwrap_err();
    assert!(matches!(err, Error::DeviceMismatch { .. }));
}
