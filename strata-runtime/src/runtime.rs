//! Runtime: drains task pools, oldest pending task first.

use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tracing::{error, info};

use strata_core::Result;

use crate::task_pool::Pool;

/// Owns the pools of every hosted backend and processes their batches.
///
/// Pools signal the shared [`Notify`] on submission; construct pools with
/// [`Runtime::notifier`] so the loop wakes up for them.
pub struct Runtime {
    pools: Vec<Arc<dyn Pool>>,
    notify: Arc<Notify>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        Self {
            pools: Vec::new(),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    pub fn add_pools(&mut self, pools: impl IntoIterator<Item = Arc<dyn Pool>>) {
        self.pools.extend(pools);
    }

    pub fn pools(&self) -> &[Arc<dyn Pool>] {
        &self.pools
    }

    /// Process one batch from the pool whose oldest task was submitted first.
    ///
    /// Returns the number of tasks resolved, or `None` when every pool is idle.
    pub fn run_once(&self) -> Result<Option<usize>> {
        let next = self
            .pools
            .iter()
            .filter_map(|pool| pool.priority().map(|at| (at, pool)))
            .min_by_key(|(at, _)| *at);
        match next {
            Some((_, pool)) => pool.process_batch().map(Some),
            None => Ok(None),
        }
    }

    /// Main loop. Runs until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(pools = self.pools.len(), "runtime started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            match self.run_once() {
                Ok(Some(_)) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    // The failing tasks already received the error.
                    error!("batch processing failed: {e}");
                    tokio::task::yield_now().await;
                    continue;
                }
            }
            tokio::select! {
                // notify_one keeps a permit when nobody is waiting, so a
                // submission racing run_once still wakes this branch.
                _ = self.notify.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("runtime stopped");
    }
}
