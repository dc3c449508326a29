//! Strata memory cache: per-sequence attention state addressed by opaque handles.

pub mod memory;

pub use memory::{CacheAllocation, CacheEntryGuard, Handle, MemoryCache, TensorDescriptor};
