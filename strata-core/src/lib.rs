//! Strata core types, traits, and error definitions.

pub mod backend;
pub mod error;
pub mod module;
pub mod tensor;
pub mod types;

pub use backend::Backend;
pub use error::{Result, StrataError};
pub use module::{ensure_frozen, Module, Parameter};
pub use tensor::Tensor;
pub use types::*;
