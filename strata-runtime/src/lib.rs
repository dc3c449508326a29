//! Strata runtime: batched task pools, the dispatch loop, and the backends
//! that expose hosted blocks through those pools.

pub mod module_backend;
pub mod runtime;
pub mod task_pool;
pub mod transformer_backend;

pub use module_backend::{BackendInfo, ModuleBackend, PoolInfo};
pub use runtime::Runtime;
pub use task_pool::{Pool, ProcessFn, TaskPool};
pub use transformer_backend::{CacheMetadata, TransformerBackend};
