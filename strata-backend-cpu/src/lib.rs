//! CPU backend for Strata block serving.

mod backend;
pub mod tensor;

pub use backend::CpuBackend;
pub use tensor::CpuTensor;
