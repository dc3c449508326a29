//! Module contract shared by everything a server can host.

use crate::backend::Backend;
use crate::tensor::Tensor;
use crate::{Result, StrataError};

/// A named tensor owned by a module, together with its gradient flag.
#[derive(Debug, Clone)]
pub struct Parameter<T: Tensor> {
    pub tensor: T,
    pub requires_grad: bool,
}

impl<T: Tensor> Parameter<T> {
    pub fn frozen(tensor: T) -> Self {
        Self {
            tensor,
            requires_grad: false,
        }
    }

    pub fn trainable(tensor: T) -> Self {
        Self {
            tensor,
            requires_grad: true,
        }
    }
}

pub trait Module<B: Backend>: Send + Sync {
    /// Forward pass over batched inputs (dimension 0 is the batch).
    fn forward(&self, inputs: &[B::Tensor], backend: &B) -> Result<Vec<B::Tensor>>;

    /// Gradients with respect to `inputs`, given gradients of the outputs.
    fn backward(
        &self,
        inputs: &[B::Tensor],
        grad_outputs: &[B::Tensor],
        backend: &B,
    ) -> Result<Vec<B::Tensor>>;

    fn named_parameters(&self) -> Vec<(String, &Parameter<B::Tensor>)>;

    fn named_buffers(&self) -> Vec<(String, &Parameter<B::Tensor>)>;
}

/// Reject modules that would accumulate gradients: served blocks are frozen.
pub fn ensure_frozen<B: Backend, M: Module<B> + ?Sized>(module: &M) -> Result<()> {
    let entries = module
        .named_parameters()
        .into_iter()
        .chain(module.named_buffers());
    for (name, param) in entries {
        if param.requires_grad {
            return Err(StrataError::TrainableParameter(format!(
                "block parameters must not accumulate gradients, but {name} does"
            )));
        }
    }
    Ok(())
}
