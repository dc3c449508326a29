//! A transformer block served with forward, backward and inference pools.
//!
//! Inference tasks carry a small metadata tensor naming the cache entry that
//! holds the sequence's attention state and how many positions it already
//! covers. The entry is taken from the [`MemoryCache`] for the duration of the
//! step and updated in place.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info};

use strata_block::TransformerBlock;
use strata_cache::{CacheAllocation, Handle, MemoryCache, TensorDescriptor};
use strata_core::{ensure_frozen, Backend, Result, StrataError, Tensor};

use crate::module_backend::{BackendInfo, ModuleBackend, PoolInfo};
use crate::task_pool::{Pool, TaskPool};

/// Largest integer every field of [`CacheMetadata`] can carry exactly in f32.
const FIELD_LIMIT: u64 = 1 << 24;

/// Identifies a cache entry and the number of positions already stored in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetadata {
    pub handle: Handle,
    pub prefix_length: usize,
}

impl CacheMetadata {
    pub fn new(handle: Handle, prefix_length: usize) -> Self {
        Self {
            handle,
            prefix_length,
        }
    }

    /// Encode as a `[1, 3]` tensor: handle high bits, handle low 24 bits,
    /// prefix length.
    pub fn to_tensor<B: Backend>(&self, backend: &B) -> Result<B::Tensor> {
        let high = self.handle >> 24;
        if high >= FIELD_LIMIT || self.prefix_length as u64 >= FIELD_LIMIT {
            return Err(StrataError::InvalidArgument(format!(
                "cache metadata out of range: handle {}, prefix length {}",
                self.handle, self.prefix_length
            )));
        }
        let fields = [
            high as f32,
            (self.handle % FIELD_LIMIT) as f32,
            self.prefix_length as f32,
        ];
        backend.copy_from_host_f32(&fields, &[1, 3])
    }

    pub fn from_tensor<B: Backend>(tensor: &B::Tensor, backend: &B) -> Result<Self> {
        if tensor.shape() != [1, 3] {
            return Err(StrataError::ShapeMismatch {
                expected: vec![1, 3],
                got: tensor.shape().to_vec(),
            });
        }
        let host = backend.copy_to_host_f32(tensor)?;
        let mut fields = [0u64; 3];
        for (field, &value) in fields.iter_mut().zip(&host) {
            if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value >= FIELD_LIMIT as f32
            {
                return Err(StrataError::InvalidArgument(format!(
                    "cache metadata must hold non-negative integers, got {host:?}"
                )));
            }
            *field = value as u64;
        }
        Ok(Self {
            handle: (fields[0] << 24) | fields[1],
            prefix_length: fields[2] as usize,
        })
    }
}

pub struct TransformerBackend<B: Backend> {
    module_backend: ModuleBackend<B, TransformerBlock<B>>,
    memory_cache: Arc<MemoryCache<B>>,
    inference_pool: Arc<TaskPool<B>>,
    backend: B,
}

impl<B: Backend + Clone> TransformerBackend<B> {
    /// Fails if any parameter or buffer of `block` requires gradients.
    pub fn new(
        name: impl Into<String>,
        block: TransformerBlock<B>,
        memory_cache: Arc<MemoryCache<B>>,
        backend: B,
        max_batch_size: usize,
        notify: Arc<Notify>,
    ) -> Result<Self> {
        ensure_frozen::<B, _>(&block)?;

        let name = name.into();
        let hidden_size = block.config().hidden_size;
        let block = Arc::new(block);
        let module_backend = ModuleBackend::new(
            name.clone(),
            block.clone(),
            backend.clone(),
            max_batch_size,
            1,
            notify.clone(),
        );

        let inference_pool = {
            let cache = memory_cache.clone();
            let exec = backend.clone();
            TaskPool::new(
                format!("{name}_inference"),
                1,
                backend.clone(),
                Box::new(move |inputs: &[B::Tensor]| inference_step(&block, &cache, inputs, &exec)),
                notify,
            )
        };

        info!(
            block = %name,
            hidden_size,
            max_batch_size,
            "transformer backend ready"
        );
        Ok(Self {
            module_backend,
            memory_cache,
            inference_pool: Arc::new(inference_pool),
            backend,
        })
    }
}

/// Run one incremental step: `inputs = [metadata, hidden, ..]`. Inputs past
/// the hidden states are accepted and ignored.
fn inference_step<B: Backend>(
    block: &TransformerBlock<B>,
    cache: &MemoryCache<B>,
    inputs: &[B::Tensor],
    backend: &B,
) -> Result<Vec<B::Tensor>> {
    let (metadata, hidden) = match inputs {
        [metadata, hidden, ..] => (metadata, hidden),
        _ => {
            return Err(StrataError::InvalidArgument(format!(
                "inference expects cache metadata and hidden states, got {} tensor(s)",
                inputs.len()
            )))
        }
    };
    let CacheMetadata {
        handle,
        prefix_length,
    } = CacheMetadata::from_tensor(metadata, backend)?;

    let mut entry = cache.use_cache(handle)?;
    debug!(
        handle,
        prefix_length,
        cache_entries = cache.num_allocated(),
        "inference step"
    );
    let output = block.forward_incremental(hidden, &mut *entry, prefix_length, backend)?;
    Ok(vec![output])
}

impl<B: Backend> TransformerBackend<B> {
    pub fn name(&self) -> &str {
        self.module_backend.name()
    }

    pub fn block(&self) -> &Arc<TransformerBlock<B>> {
        self.module_backend.module()
    }

    pub fn memory_cache(&self) -> &Arc<MemoryCache<B>> {
        &self.memory_cache
    }

    pub fn inference_pool(&self) -> &Arc<TaskPool<B>> {
        &self.inference_pool
    }

    pub async fn forward(&self, inputs: Vec<B::Tensor>) -> Result<Vec<B::Tensor>> {
        self.module_backend.forward(inputs).await
    }

    /// `inputs = [hidden, grad_output]`; returns the gradient w.r.t. `hidden`.
    pub async fn backward(&self, inputs: Vec<B::Tensor>) -> Result<Vec<B::Tensor>> {
        self.module_backend.backward(inputs).await
    }

    /// Queue one incremental step for the sequence stored under `metadata`.
    pub async fn inference(
        &self,
        metadata: CacheMetadata,
        hidden: B::Tensor,
    ) -> Result<B::Tensor> {
        let metadata = metadata.to_tensor(&self.backend)?;
        let mut outputs = self
            .inference_pool
            .submit_task(vec![metadata, hidden])
            .await?;
        outputs
            .pop()
            .ok_or_else(|| StrataError::Internal("inference produced no output".into()))
    }

    /// Run an inference step on the calling thread, bypassing the pool.
    pub fn inference_step(&self, inputs: &[B::Tensor]) -> Result<Vec<B::Tensor>> {
        inference_step(self.block(), &self.memory_cache, inputs, &self.backend)
    }

    /// Shape and dtype of the attention state one sequence needs.
    pub fn attention_cache_descriptor(&self) -> TensorDescriptor {
        let block = self.block();
        TensorDescriptor::new(block.attention_cache_shape(), block.config().dtype)
    }

    /// Reserve attention state for a new sequence; freed when dropped.
    pub fn allocate_session(&self) -> Result<CacheAllocation<B>> {
        self.memory_cache
            .allocate_cache(self.attention_cache_descriptor())
    }

    /// Forward, backward and inference pools, in that order.
    pub fn get_pools(&self) -> Vec<Arc<dyn Pool>> {
        let mut pools = self.module_backend.get_pools();
        pools.push(self.inference_pool.clone() as Arc<dyn Pool>);
        pools
    }

    pub fn get_info(&self) -> BackendInfo {
        let mut info = self.module_backend.get_info();
        info.pools
            .push(PoolInfo::of(self.inference_pool.as_ref()));
        let config = self.block().config();
        info.hidden_size = Some(config.hidden_size);
        info.max_length = Some(config.max_length);
        info.cache_size_bytes = Some(self.memory_cache.current_size_bytes());
        info.cache_max_bytes = Some(self.memory_cache.max_size_bytes());
        info.cache_entries = Some(self.memory_cache.num_allocated());
        info
    }
}
