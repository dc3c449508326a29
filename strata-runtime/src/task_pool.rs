//! Batched task queues.
//!
//! Submitters await their own results; the runtime drains pools one batch at
//! a time. Dimension 0 of every input is the batch dimension: tasks are
//! concatenated along it before processing and outputs are split back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use strata_core::{Backend, Result, StrataError, Tensor};

/// Processes one concatenated batch of inputs into batched outputs.
pub type ProcessFn<B> = Box<
    dyn Fn(&[<B as Backend>::Tensor]) -> Result<Vec<<B as Backend>::Tensor>> + Send + Sync,
>;

/// A queue the runtime can drain.
pub trait Pool: Send + Sync {
    fn name(&self) -> &str;
    fn max_batch_size(&self) -> usize;
    /// Number of queued tasks.
    fn pending(&self) -> usize;
    /// Submission time of the oldest queued task, if any.
    fn priority(&self) -> Option<Instant>;
    /// Process one batch; returns how many tasks it resolved.
    fn process_batch(&self) -> Result<usize>;
}

struct Task<T> {
    inputs: Vec<T>,
    batch_size: usize,
    submitted_at: Instant,
    result_tx: oneshot::Sender<Result<Vec<T>>>,
}

pub struct TaskPool<B: Backend> {
    name: String,
    max_batch_size: usize,
    backend: B,
    process: ProcessFn<B>,
    queue: Mutex<VecDeque<Task<B::Tensor>>>,
    notify: Arc<Notify>,
}

impl<B: Backend> TaskPool<B> {
    /// `notify` is signalled on every submission so the runtime can wake up.
    pub fn new(
        name: impl Into<String>,
        max_batch_size: usize,
        backend: B,
        process: ProcessFn<B>,
        notify: Arc<Notify>,
    ) -> Self {
        Self {
            name: name.into(),
            max_batch_size: max_batch_size.max(1),
            backend,
            process,
            queue: Mutex::new(VecDeque::new()),
            notify,
        }
    }

    fn queue(&self) -> Result<MutexGuard<'_, VecDeque<Task<B::Tensor>>>> {
        self.queue
            .lock()
            .map_err(|_| StrataError::Internal(format!("{}: queue lock poisoned", self.name)))
    }

    /// Queue `inputs` and wait for the batch containing them to be processed.
    pub async fn submit_task(&self, inputs: Vec<B::Tensor>) -> Result<Vec<B::Tensor>> {
        let batch_size = self.validate(&inputs)?;
        let (result_tx, result_rx) = oneshot::channel();
        self.queue()?.push_back(Task {
            inputs,
            batch_size,
            submitted_at: Instant::now(),
            result_tx,
        });
        self.notify.notify_one();
        result_rx
            .await
            .map_err(|_| StrataError::PoolClosed(self.name.clone()))?
    }

    fn validate(&self, inputs: &[B::Tensor]) -> Result<usize> {
        let first = inputs.first().ok_or_else(|| {
            StrataError::InvalidArgument(format!("{}: task has no inputs", self.name))
        })?;
        let batch_size = first.shape().first().copied().unwrap_or(0);
        if batch_size == 0 {
            return Err(StrataError::InvalidArgument(format!(
                "{}: inputs need a non-empty batch dimension",
                self.name
            )));
        }
        if let Some(bad) = inputs
            .iter()
            .find(|t| t.shape().first().copied() != Some(batch_size))
        {
            return Err(StrataError::ShapeMismatch {
                expected: vec![batch_size],
                got: bad.shape().to_vec(),
            });
        }
        if batch_size > self.max_batch_size {
            return Err(StrataError::InvalidArgument(format!(
                "{}: batch of {batch_size} exceeds max_batch_size {}",
                self.name, self.max_batch_size
            )));
        }
        Ok(batch_size)
    }

    /// Pop the longest FIFO prefix of compatible tasks that fits the batch limit.
    fn take_batch(&self) -> Result<Vec<Task<B::Tensor>>> {
        let mut queue = self.queue()?;
        let mut batch: Vec<Task<B::Tensor>> = Vec::new();
        let mut rows = 0;
        while let Some(next) = queue.front() {
            if let Some(first) = batch.first() {
                if rows + next.batch_size > self.max_batch_size || !compatible(first, next) {
                    break;
                }
            }
            rows += next.batch_size;
            if let Some(task) = queue.pop_front() {
                batch.push(task);
            }
        }
        Ok(batch)
    }

    fn run(&self, tasks: &[Task<B::Tensor>]) -> Result<Vec<Vec<B::Tensor>>> {
        if let [task] = tasks {
            return Ok(vec![(self.process)(&task.inputs)?]);
        }

        let num_inputs = tasks[0].inputs.len();
        let mut batched = Vec::with_capacity(num_inputs);
        for i in 0..num_inputs {
            let parts: Vec<&B::Tensor> = tasks.iter().map(|t| &t.inputs[i]).collect();
            batched.push(self.backend.cat(&parts, 0)?);
        }
        let outputs = (self.process)(&batched)?;

        let total: usize = tasks.iter().map(|t| t.batch_size).sum();
        let mut per_task: Vec<Vec<B::Tensor>> = tasks.iter().map(|_| Vec::new()).collect();
        for output in &outputs {
            if output.shape().first().copied() != Some(total) {
                return Err(StrataError::ShapeMismatch {
                    expected: vec![total],
                    got: output.shape().to_vec(),
                });
            }
            let mut offset = 0;
            for (task, slot) in tasks.iter().zip(per_task.iter_mut()) {
                slot.push(self.backend.slice_rows(output, offset, task.batch_size)?);
                offset += task.batch_size;
            }
        }
        Ok(per_task)
    }
}

/// Tasks can share a batch when their inputs agree on everything but dimension 0.
fn compatible<T: Tensor>(a: &Task<T>, b: &Task<T>) -> bool {
    a.inputs.len() == b.inputs.len()
        && a
            .inputs
            .iter()
            .zip(&b.inputs)
            .all(|(x, y)| x.shape().len() == y.shape().len() && x.shape()[1..] == y.shape()[1..])
}

impl<B: Backend> Pool for TaskPool<B> {
    fn name(&self) -> &str {
        &self.name
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn pending(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    fn priority(&self) -> Option<Instant> {
        self.queue
            .lock()
            .ok()
            .and_then(|q| q.front().map(|t| t.submitted_at))
    }

    fn process_batch(&self) -> Result<usize> {
        let tasks = self.take_batch()?;
        if tasks.is_empty() {
            return Ok(0);
        }
        let count = tasks.len();
        let rows: usize = tasks.iter().map(|t| t.batch_size).sum();
        debug!(pool = %self.name, tasks = count, rows, "processing batch");

        match self.run(&tasks) {
            Ok(results) => {
                for (task, result) in tasks.into_iter().zip(results) {
                    if task.result_tx.send(Ok(result)).is_err() {
                        debug!(pool = %self.name, "submitter went away before its result");
                    }
                }
                Ok(count)
            }
            Err(e) => {
                warn!(pool = %self.name, tasks = count, error = %e, "batch failed");
                // Every submitter sees the same error kind; the last one gets
                // the original so a single-task batch loses nothing.
                let mut tasks = tasks;
                let last = tasks.pop();
                for task in tasks {
                    let _ = task.result_tx.send(Err(e.duplicate()));
                }
                let summary = e.duplicate();
                if let Some(task) = last {
                    let _ = task.result_tx.send(Err(e));
                }
                Err(summary)
            }
        }
    }
}
