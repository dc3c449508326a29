//! Serves a [`Module`] through forward and backward task pools.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;

use strata_core::{Backend, Module, Result, StrataError};

use crate::task_pool::{Pool, TaskPool};

#[derive(Debug, Clone, Serialize)]
pub struct PoolInfo {
    pub name: String,
    pub max_batch_size: usize,
    pub pending: usize,
}

impl PoolInfo {
    pub fn of(pool: &dyn Pool) -> Self {
        Self {
            name: pool.name().to_string(),
            max_batch_size: pool.max_batch_size(),
            pending: pool.pending(),
        }
    }
}

/// Summary of a hosted backend, as reported by `GET /v1/blocks`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub max_batch_size: usize,
    pub pools: Vec<PoolInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hidden_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_size_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_max_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_entries: Option<usize>,
}

pub struct ModuleBackend<B: Backend, M: Module<B>> {
    name: String,
    module: Arc<M>,
    max_batch_size: usize,
    forward_pool: Arc<TaskPool<B>>,
    backward_pool: Arc<TaskPool<B>>,
}

impl<B: Backend + Clone, M: Module<B> + 'static> ModuleBackend<B, M> {
    /// `num_inputs` is how many leading tensors of a backward task are module
    /// inputs; the rest are gradients of the outputs.
    pub fn new(
        name: impl Into<String>,
        module: Arc<M>,
        backend: B,
        max_batch_size: usize,
        num_inputs: usize,
        notify: Arc<Notify>,
    ) -> Self {
        let name = name.into();

        let forward_pool = {
            let module = module.clone();
            let exec = backend.clone();
            TaskPool::new(
                format!("{name}_forward"),
                max_batch_size,
                backend.clone(),
                Box::new(move |inputs: &[B::Tensor]| module.forward(inputs, &exec)),
                notify.clone(),
            )
        };

        let backward_pool = {
            let module = module.clone();
            let exec = backend.clone();
            TaskPool::new(
                format!("{name}_backward"),
                max_batch_size,
                backend,
                Box::new(move |inputs: &[B::Tensor]| {
                    if inputs.len() <= num_inputs {
                        return Err(StrataError::InvalidArgument(format!(
                            "backward expects {num_inputs} inputs followed by output gradients, got {} tensors",
                            inputs.len()
                        )));
                    }
                    let (inputs, grad_outputs) = inputs.split_at(num_inputs);
                    module.backward(inputs, grad_outputs, &exec)
                }),
                notify,
            )
        };

        Self {
            name,
            module,
            max_batch_size,
            forward_pool: Arc::new(forward_pool),
            backward_pool: Arc::new(backward_pool),
        }
    }
}

impl<B: Backend, M: Module<B>> ModuleBackend<B, M> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &Arc<M> {
        &self.module
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    pub fn forward_pool(&self) -> &Arc<TaskPool<B>> {
        &self.forward_pool
    }

    pub fn backward_pool(&self) -> &Arc<TaskPool<B>> {
        &self.backward_pool
    }

    pub async fn forward(&self, inputs: Vec<B::Tensor>) -> Result<Vec<B::Tensor>> {
        self.forward_pool.submit_task(inputs).await
    }

    /// `inputs` are the module inputs followed by the output gradients.
    pub async fn backward(&self, inputs: Vec<B::Tensor>) -> Result<Vec<B::Tensor>> {
        self.backward_pool.submit_task(inputs).await
    }

    pub fn get_pools(&self) -> Vec<Arc<dyn Pool>> {
        vec![
            self.forward_pool.clone() as Arc<dyn Pool>,
            self.backward_pool.clone() as Arc<dyn Pool>,
        ]
    }

    pub fn get_info(&self) -> BackendInfo {
        BackendInfo {
            name: self.name.clone(),
            max_batch_size: self.max_batch_size,
            pools: self
                .get_pools()
                .iter()
                .map(|pool| PoolInfo::of(pool.as_ref()))
                .collect(),
            hidden_size: None,
            max_length: None,
            cache_size_bytes: None,
            cache_max_bytes: None,
            cache_entries: None,
        }
    }
}
