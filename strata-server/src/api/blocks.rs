//! Block endpoints: batched forward/backward and cached inference sessions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use tracing::{debug, info};

use strata_backend_cpu::{CpuBackend, CpuTensor};
use strata_cache::{CacheAllocation, Handle};
use strata_core::{StrataError, Tensor};
use strata_runtime::{BackendInfo, CacheMetadata, TransformerBackend};

use super::types::*;

pub type ServedBlock = TransformerBackend<CpuBackend>;

/// An open inference session: its cache entry and how many positions it holds.
struct Session {
    allocation: CacheAllocation<CpuBackend>,
    prefix_length: usize,
    last_used: Instant,
}

type SessionKey = (String, Handle);
type SessionTable = HashMap<SessionKey, Arc<tokio::sync::Mutex<Session>>>;

/// Shared application state passed to handlers.
///
/// A session lives until it is closed or, when the server runs a sweeper,
/// until it has sat idle longer than the sweep limit (see [`AppState::evict_idle`]).
pub struct AppState {
    pub backend: CpuBackend,
    blocks: Vec<Arc<ServedBlock>>,
    /// Steps on one session are serialized by its async mutex.
    sessions: Mutex<SessionTable>,
}

impl AppState {
    pub fn new(backend: CpuBackend, blocks: Vec<Arc<ServedBlock>>) -> Self {
        Self {
            backend,
            blocks,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn blocks(&self) -> &[Arc<ServedBlock>] {
        &self.blocks
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Drop sessions whose last step finished more than `max_idle` ago,
    /// releasing their cache entries. Sessions mid-step are skipped.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let Ok(mut sessions) = self.sessions.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = sessions.len();
        sessions.retain(|(name, handle), session| match session.try_lock() {
            Ok(s) if now.duration_since(s.last_used) >= max_idle => {
                info!(block = %name, handle, "session expired");
                false
            }
            _ => true,
        });
        before - sessions.len()
    }

    fn block(&self, name: &str) -> Result<&Arc<ServedBlock>, ApiError> {
        self.blocks
            .iter()
            .find(|b| b.name() == name)
            .ok_or_else(|| StrataError::BlockNotFound(name.to_string()).into())
    }

    fn sessions(&self) -> Result<MutexGuard<'_, SessionTable>, ApiError> {
        self.sessions
            .lock()
            .map_err(|_| StrataError::Internal("session table lock poisoned".into()).into())
    }

    fn session(
        &self,
        name: &str,
        handle: Handle,
    ) -> Result<Arc<tokio::sync::Mutex<Session>>, ApiError> {
        self.sessions()?
            .get(&(name.to_string(), handle))
            .cloned()
            .ok_or_else(|| StrataError::CacheHandleNotFound(handle).into())
    }
}

/// Validate `[batch, seq_len, hidden_size]` for `block`.
fn check_hidden(block: &ServedBlock, tensor: &CpuTensor) -> Result<(), StrataError> {
    let hidden_size = block.block().config().hidden_size;
    let shape = tensor.shape();
    if shape.len() != 3 || shape[2] != hidden_size || shape[0] == 0 || shape[1] == 0 {
        let batch = shape.first().copied().unwrap_or(1);
        let seq_len = shape.get(1).copied().unwrap_or(1);
        return Err(StrataError::ShapeMismatch {
            expected: vec![batch, seq_len, hidden_size],
            got: shape.to_vec(),
        });
    }
    Ok(())
}

fn single_input(
    state: &AppState,
    payloads: Vec<TensorPayload>,
    what: &str,
) -> Result<CpuTensor, StrataError> {
    let mut payloads = payloads.into_iter();
    match (payloads.next(), payloads.next()) {
        (Some(payload), None) => payload.into_tensor(&state.backend),
        _ => Err(StrataError::InvalidArgument(format!(
            "expected exactly one tensor in {what}"
        ))),
    }
}

fn to_payloads(state: &AppState, tensors: &[CpuTensor]) -> Result<Vec<TensorPayload>, ApiError> {
    tensors
        .iter()
        .map(|t| TensorPayload::from_tensor(t, &state.backend).map_err(ApiError::from))
        .collect()
}

/// GET /v1/blocks
pub async fn list_blocks(State(state): State<Arc<AppState>>) -> Json<Vec<BackendInfo>> {
    Json(state.blocks.iter().map(|b| b.get_info()).collect())
}

/// POST /v1/blocks/:name/forward
pub async fn forward(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<ForwardRequest>,
) -> Result<Json<ForwardResponse>, ApiError> {
    let block = state.block(&name)?;
    let hidden = single_input(&state, req.inputs, "inputs")?;
    check_hidden(block, &hidden)?;

    let outputs = block.forward(vec![hidden]).await?;
    Ok(Json(ForwardResponse {
        outputs: to_payloads(&state, &outputs)?,
    }))
}

/// POST /v1/blocks/:name/backward
pub async fn backward(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<BackwardRequest>,
) -> Result<Json<BackwardResponse>, ApiError> {
    let block = state.block(&name)?;
    let hidden = single_input(&state, req.inputs, "inputs")?;
    let grad_output = single_input(&state, req.grad_outputs, "grad_outputs")?;
    check_hidden(block, &hidden)?;
    if grad_output.shape() != hidden.shape() {
        return Err(StrataError::ShapeMismatch {
            expected: hidden.shape().to_vec(),
            got: grad_output.shape().to_vec(),
        }
        .into());
    }

    let grads = block.backward(vec![hidden, grad_output]).await?;
    Ok(Json(BackwardResponse {
        grad_inputs: to_payloads(&state, &grads)?,
    }))
}

/// POST /v1/blocks/:name/sessions
pub async fn open_session(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<Json<OpenSessionResponse>, ApiError> {
    let block = state.block(&name)?;
    if let Some(batch_size) = req.batch_size.filter(|&b| b != 1) {
        return Err(StrataError::InvalidArgument(format!(
            "sessions hold one sequence, got batch_size {batch_size}"
        ))
        .into());
    }

    let allocation = block.allocate_session()?;
    let handle = allocation.handle();
    state.sessions()?.insert(
        (name.clone(), handle),
        Arc::new(tokio::sync::Mutex::new(Session {
            allocation,
            prefix_length: 0,
            last_used: Instant::now(),
        })),
    );
    info!(block = %name, handle, "session opened");
    Ok(Json(OpenSessionResponse {
        handle,
        max_length: block.block().config().max_length,
    }))
}

/// POST /v1/blocks/:name/sessions/:handle/step
pub async fn step(
    State(state): State<Arc<AppState>>,
    Path((name, handle)): Path<(String, Handle)>,
    Json(req): Json<StepRequest>,
) -> Result<Json<StepResponse>, ApiError> {
    let block = state.block(&name)?;
    let session = state.session(&name, handle)?;
    let hidden = req.hidden.into_tensor(&state.backend)?;
    check_hidden(block, &hidden)?;
    let new_tokens = hidden.shape()[1];

    let mut session = session.lock().await;
    let max_length = block.block().config().max_length;
    if hidden.shape()[0] != 1 || session.prefix_length + new_tokens > max_length {
        return Err(StrataError::InvalidArgument(format!(
            "step of shape {:?} does not fit after {} of {max_length} positions",
            hidden.shape(),
            session.prefix_length
        ))
        .into());
    }

    let metadata = CacheMetadata::new(session.allocation.handle(), session.prefix_length);
    let output = block.inference(metadata, hidden).await?;
    session.prefix_length += new_tokens;
    session.last_used = Instant::now();
    debug!(block = %name, handle, prefix_length = session.prefix_length, "session advanced");

    Ok(Json(StepResponse {
        output: TensorPayload::from_tensor(&output, &state.backend)?,
        prefix_length: session.prefix_length,
    }))
}

/// DELETE /v1/blocks/:name/sessions/:handle
pub async fn close_session(
    State(state): State<Arc<AppState>>,
    Path((name, handle)): Path<(String, Handle)>,
) -> Result<StatusCode, ApiError> {
    state.block(&name)?;
    // The cache entry is released once any in-flight step lets go of it.
    state
        .sessions()?
        .remove(&(name.clone(), handle))
        .ok_or(StrataError::CacheHandleNotFound(handle))?;
    info!(block = %name, handle, "session closed");
    Ok(StatusCode::NO_CONTENT)
}
