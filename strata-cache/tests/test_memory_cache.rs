use std::sync::Arc;

use strata_backend_cpu::CpuBackend;
use strata_cache::{MemoryCache, TensorDescriptor};
use strata_core::{Backend, DType, StrataError, Tensor};

fn descr(rows: usize, cols: usize) -> TensorDescriptor {
    TensorDescriptor::new(vec![rows, cols], DType::F32)
}

#[test]
fn test_descriptor_size() {
    let d = TensorDescriptor::new(vec![2, 3, 4], DType::F16);
    assert_eq!(d.numel(), 24);
    assert_eq!(d.size_bytes(), 48);
}

#[test]
fn test_allocate_and_use() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), None));
    let alloc = cache.allocate_cache(descr(4, 2)).unwrap();
    assert_eq!(cache.current_size_bytes(), 32);
    // Materialized lazily on first use.
    assert_eq!(cache.num_allocated(), 0);

    let entry = cache.use_cache(alloc.handle()).unwrap();
    assert_eq!(entry.shape(), &[4, 2]);
    assert_eq!(cache.num_allocated(), 1);
}

#[test]
fn test_half_precision_is_charged_at_stored_size() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), Some(64)));
    let alloc = cache
        .allocate_cache(TensorDescriptor::new(vec![4, 4], DType::BF16))
        .unwrap();
    // The CPU backend keeps f32, so 16 elements cost 64 bytes, not 32.
    assert_eq!(alloc.size_bytes(), 64);
    assert_eq!(cache.current_size_bytes(), 64);
    let err = cache
        .allocate_cache(TensorDescriptor::new(vec![1, 1], DType::F16))
        .unwrap_err();
    assert!(matches!(err, StrataError::AllocationFailed(_)));
}

#[test]
fn test_handles_are_distinct() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), None));
    let a = cache.allocate_cache(descr(1, 1)).unwrap();
    let b = cache.allocate_cache(descr(1, 1)).unwrap();
    assert_ne!(a.handle(), b.handle());
}

#[test]
fn test_mutation_persists_between_uses() {
    let backend = CpuBackend::new();
    let cache = Arc::new(MemoryCache::new(backend.clone(), None));
    let alloc = cache.allocate_cache(descr(3, 2)).unwrap();

    {
        let mut entry = cache.use_cache(alloc.handle()).unwrap();
        let row = backend.copy_from_host_f32(&[7.0, 8.0], &[1, 2]).unwrap();
        backend.write_rows(&mut entry, 1, &row).unwrap();
    }

    let entry = cache.use_cache(alloc.handle()).unwrap();
    assert_eq!(
        backend.copy_to_host_f32(&entry).unwrap(),
        vec![0.0, 0.0, 7.0, 8.0, 0.0, 0.0]
    );
}

#[test]
fn test_budget_exceeded() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), Some(64)));
    let _first = cache.allocate_cache(descr(4, 2)).unwrap(); // 32 bytes
    let _second = cache.allocate_cache(descr(4, 2)).unwrap(); // 64 bytes total
    let err = cache.allocate_cache(descr(1, 1)).err().unwrap();
    assert!(matches!(err, StrataError::AllocationFailed(_)));
}

#[test]
fn test_drop_frees_budget_and_entry() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), Some(32)));
    let alloc = cache.allocate_cache(descr(4, 2)).unwrap();
    let handle = alloc.handle();
    drop(cache.use_cache(handle).unwrap());
    drop(alloc);

    assert_eq!(cache.current_size_bytes(), 0);
    let err = cache.use_cache(handle).err().unwrap();
    assert!(matches!(err, StrataError::CacheHandleNotFound(h) if h == handle));
    assert_eq!(cache.num_allocated(), 0);

    // Space is reusable.
    cache.allocate_cache(descr(4, 2)).unwrap();
}

#[test]
fn test_unknown_handle() {
    let cache = MemoryCache::new(CpuBackend::new(), None);
    assert!(matches!(
        cache.use_cache(42).err().unwrap(),
        StrataError::CacheHandleNotFound(42)
    ));
}

#[test]
fn test_entry_is_exclusive_while_held() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), None));
    let alloc = cache.allocate_cache(descr(1, 1)).unwrap();
    let guard = cache.use_cache(alloc.handle()).unwrap();
    assert!(cache.use_cache(alloc.handle()).is_err());
    drop(guard);
    assert!(cache.use_cache(alloc.handle()).is_ok());
}

#[test]
fn test_free_while_in_use() {
    let cache = Arc::new(MemoryCache::new(CpuBackend::new(), None));
    let alloc = cache.allocate_cache(descr(1, 1)).unwrap();
    let handle = alloc.handle();
    let guard = cache.use_cache(handle).unwrap();
    drop(alloc);
    drop(guard);
    assert!(matches!(
        cache.use_cache(handle).err().unwrap(),
        StrataError::CacheHandleNotFound(_)
    ));
}
