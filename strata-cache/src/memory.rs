//! Memory cache for attention state.
//!
//! Allocation and release are cheap bookkeeping done by whoever opens an
//! inference session: they reserve bytes against the budget and queue a
//! message. Tensors are only materialized (or dropped) by the runtime side,
//! when it next calls [`MemoryCache::use_cache`].

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use strata_core::{Backend, DType, Result, StrataError};

/// Opaque key of one cache entry.
pub type Handle = u64;

/// Shape and dtype of a tensor that has not been allocated yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDescriptor {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl TensorDescriptor {
    pub fn new(shape: Vec<usize>, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> usize {
        self.numel() * self.dtype.size_in_bytes()
    }
}

enum CacheMessage {
    Allocate(Handle, TensorDescriptor),
    Free(Handle),
}

struct Metadata {
    current_size_bytes: usize,
    handle_counter: Handle,
}

/// Entries are `None` while a [`CacheEntryGuard`] holds them.
type Entries<T> = HashMap<Handle, Option<T>>;

pub struct MemoryCache<B: Backend> {
    backend: B,
    max_size_bytes: usize,
    metadata: Mutex<Metadata>,
    pending_tx: Mutex<mpsc::Sender<CacheMessage>>,
    pending_rx: Mutex<mpsc::Receiver<CacheMessage>>,
    entries: Mutex<Entries<B::Tensor>>,
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| StrataError::Internal("memory cache lock poisoned".into()))
}

impl<B: Backend> MemoryCache<B> {
    /// `max_size_bytes = None` leaves the cache unbounded.
    pub fn new(backend: B, max_size_bytes: Option<usize>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            backend,
            max_size_bytes: max_size_bytes.unwrap_or(usize::MAX),
            metadata: Mutex::new(Metadata {
                current_size_bytes: 0,
                handle_counter: 0,
            }),
            pending_tx: Mutex::new(tx),
            pending_rx: Mutex::new(rx),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_size_bytes(&self) -> usize {
        self.max_size_bytes
    }

    pub fn current_size_bytes(&self) -> usize {
        self.metadata
            .lock()
            .map(|m| m.current_size_bytes)
            .unwrap_or(0)
    }

    /// Number of materialized entries on the runtime side.
    pub fn num_allocated(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    /// Reserve space for a tensor described by `descr`.
    ///
    /// The entry lives until the returned allocation is dropped. Bytes are
    /// charged at the element size the backend really stores.
    pub fn allocate_cache(self: &Arc<Self>, descr: TensorDescriptor) -> Result<CacheAllocation<B>> {
        let descr = TensorDescriptor::new(descr.shape, self.backend.storage_dtype(descr.dtype));
        let size_bytes = descr.size_bytes();
        let mut meta = lock(&self.metadata)?;
        if meta.current_size_bytes.saturating_add(size_bytes) > self.max_size_bytes {
            return Err(StrataError::AllocationFailed(format!(
                "could not allocate {size_bytes} bytes in cache; cache size = {} bytes; {} already allocated",
                self.max_size_bytes, meta.current_size_bytes
            )));
        }
        let handle = meta.handle_counter;
        meta.handle_counter = meta.handle_counter.wrapping_add(1);
        meta.current_size_bytes += size_bytes;
        self.send(CacheMessage::Allocate(handle, descr))?;
        drop(meta);

        debug!(handle, size_bytes, "allocated cache entry");
        Ok(CacheAllocation {
            cache: Arc::clone(self),
            handle,
            size_bytes,
        })
    }

    /// Exclusive access to the entry behind `handle` until the guard drops.
    pub fn use_cache(&self, handle: Handle) -> Result<CacheEntryGuard<'_, B>> {
        let mut entries = lock(&self.entries)?;
        self.drain_pending(&mut entries)?;
        let tensor = match entries.get_mut(&handle) {
            Some(slot) => slot.take().ok_or_else(|| {
                StrataError::InvalidArgument(format!("cache entry {handle} is already in use"))
            })?,
            None => return Err(StrataError::CacheHandleNotFound(handle)),
        };
        Ok(CacheEntryGuard {
            cache: self,
            handle,
            tensor: Some(tensor),
        })
    }

    fn send(&self, message: CacheMessage) -> Result<()> {
        lock(&self.pending_tx)?
            .send(message)
            .map_err(|_| StrataError::Internal("memory cache message queue closed".into()))
    }

    /// Apply queued allocate/free requests. Caller holds the entries lock.
    fn drain_pending(&self, entries: &mut Entries<B::Tensor>) -> Result<()> {
        let rx = lock(&self.pending_rx)?;
        while let Ok(message) = rx.try_recv() {
            match message {
                CacheMessage::Allocate(handle, descr) => {
                    let tensor = self.backend.allocate_zeros(&descr.shape, descr.dtype)?;
                    entries.insert(handle, Some(tensor));
                }
                CacheMessage::Free(handle) => {
                    if entries.remove(&handle).is_none() {
                        warn!(handle, "asked to free cache handle that does not exist");
                    }
                }
            }
        }
        Ok(())
    }

    fn release(&self, handle: Handle, size_bytes: usize) {
        match self.metadata.lock() {
            Ok(mut meta) => {
                meta.current_size_bytes = meta.current_size_bytes.saturating_sub(size_bytes);
            }
            Err(_) => error!(handle, "memory cache lock poisoned while releasing"),
        }
        if let Err(e) = self.send(CacheMessage::Free(handle)) {
            error!(handle, error = %e, "failed to queue cache release");
        }
        debug!(handle, size_bytes, "released cache entry");
    }

    fn check_in(&self, handle: Handle, tensor: B::Tensor) {
        match self.entries.lock() {
            // A handle freed while in use stays freed.
            Ok(mut entries) => {
                if let Some(slot) = entries.get_mut(&handle) {
                    *slot = Some(tensor);
                }
            }
            Err(_) => error!(handle, "memory cache lock poisoned while returning entry"),
        }
    }
}

/// A reserved cache entry; dropping it frees the entry.
pub struct CacheAllocation<B: Backend> {
    cache: Arc<MemoryCache<B>>,
    handle: Handle,
    size_bytes: usize,
}

impl<B: Backend> std::fmt::Debug for CacheAllocation<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheAllocation")
            .field("handle", &self.handle)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

impl<B: Backend> CacheAllocation<B> {
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }
}

impl<B: Backend> Drop for CacheAllocation<B> {
    fn drop(&mut self) {
        self.cache.release(self.handle, self.size_bytes);
    }
}

/// Scoped, exclusive access to one cache tensor.
pub struct CacheEntryGuard<'a, B: Backend> {
    cache: &'a MemoryCache<B>,
    handle: Handle,
    // Present until drop.
    tensor: Option<B::Tensor>,
}

impl<B: Backend> CacheEntryGuard<'_, B> {
    pub fn handle(&self) -> Handle {
        self.handle
    }
}

impl<B: Backend> Deref for CacheEntryGuard<'_, B> {
    type Target = B::Tensor;

    fn deref(&self) -> &B::Tensor {
        self.tensor.as_ref().expect("cache entry present until drop")
    }
}

impl<B: Backend> DerefMut for CacheEntryGuard<'_, B> {
    fn deref_mut(&mut self) -> &mut B::Tensor {
        self.tensor.as_mut().expect("cache entry present until drop")
    }
}

impl<B: Backend> Drop for CacheEntryGuard<'_, B> {
    fn drop(&mut self) {
        if let Some(tensor) = self.tensor.take() {
            self.cache.check_in(self.handle, tensor);
        }
    }
}
