use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use strata_backend_cpu::{CpuBackend, CpuTensor};
use strata_core::{Backend, StrataError, Tensor};

/// Dense f32 tensor on the wire, row-major.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TensorPayload {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl TensorPayload {
    pub fn into_tensor(self, backend: &CpuBackend) -> Result<CpuTensor, StrataError> {
        let numel: usize = self.shape.iter().product();
        if numel != self.data.len() {
            return Err(StrataError::InvalidArgument(format!(
                "shape {:?} needs {numel} values, got {}",
                self.shape,
                self.data.len()
            )));
        }
        backend.copy_from_host_f32(&self.data, &self.shape)
    }

    pub fn from_tensor(tensor: &CpuTensor, backend: &CpuBackend) -> Result<Self, StrataError> {
        Ok(Self {
            shape: tensor.shape().to_vec(),
            data: backend.copy_to_host_f32(tensor)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ForwardRequest {
    pub inputs: Vec<TensorPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub outputs: Vec<TensorPayload>,
}

#[derive(Debug, Deserialize)]
pub struct BackwardRequest {
    pub inputs: Vec<TensorPayload>,
    pub grad_outputs: Vec<TensorPayload>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BackwardResponse {
    pub grad_inputs: Vec<TensorPayload>,
}

#[derive(Debug, Default, Deserialize)]
pub struct OpenSessionRequest {
    #[serde(default)]
    pub batch_size: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpenSessionResponse {
    pub handle: u64,
    pub max_length: usize,
}

#[derive(Debug, Deserialize)]
pub struct StepRequest {
    pub hidden: TensorPayload,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StepResponse {
    pub output: TensorPayload,
    /// Positions stored for the session after this step.
    pub prefix_length: usize,
}

/// Error body: `{"error": {"message": ..., "type": ...}}`.
#[derive(Debug)]
pub struct ApiError(pub StrataError);

impl From<StrataError> for ApiError {
    fn from(e: StrataError) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            StrataError::InvalidArgument(_)
            | StrataError::ShapeMismatch { .. }
            | StrataError::UnsupportedDtype(_)
            | StrataError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            StrataError::BlockNotFound(_) | StrataError::CacheHandleNotFound(_) => {
                (StatusCode::NOT_FOUND, "not_found_error")
            }
            StrataError::AllocationFailed(_) | StrataError::OutOfMemory(_) => {
                (StatusCode::INSUFFICIENT_STORAGE, "insufficient_storage_error")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status();
        let body = Json(serde_json::json!({
            "error": { "message": self.0.to_string(), "type": kind }
        }));
        (status, body).into_response()
    }
}
