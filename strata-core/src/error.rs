use thiserror::Error;

use crate::types::DType;

#[derive(Error, Debug)]
pub enum StrataError {
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Cache allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Cache handle not found: {0}")]
    CacheHandleNotFound(u64),

    #[error("{0}")]
    TrainableParameter(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unsupported dtype: {0:?}")]
    UnsupportedDtype(DType),

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Model load error: {0}")]
    ModelLoad(String),

    #[error("Task pool closed: {0}")]
    PoolClosed(String),

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StrataError {
    /// A copy of this error with the same variant. Source errors that cannot
    /// be cloned are rebuilt from their kind and message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::OutOfMemory(m) => Self::OutOfMemory(m.clone()),
            Self::AllocationFailed(m) => Self::AllocationFailed(m.clone()),
            Self::CacheHandleNotFound(h) => Self::CacheHandleNotFound(*h),
            Self::TrainableParameter(m) => Self::TrainableParameter(m.clone()),
            Self::InvalidArgument(m) => Self::InvalidArgument(m.clone()),
            Self::UnsupportedDtype(d) => Self::UnsupportedDtype(*d),
            Self::ShapeMismatch { expected, got } => Self::ShapeMismatch {
                expected: expected.clone(),
                got: got.clone(),
            },
            Self::ModelLoad(m) => Self::ModelLoad(m.clone()),
            Self::PoolClosed(m) => Self::PoolClosed(m.clone()),
            Self::TaskFailed(m) => Self::TaskFailed(m.clone()),
            Self::BlockNotFound(m) => Self::BlockNotFound(m.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::Json(e) => Self::TaskFailed(format!("JSON error: {e}")),
            Self::Internal(m) => Self::Internal(m.clone()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
