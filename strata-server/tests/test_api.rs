//! HTTP API tests for the block server.
//!
//! Uses tower::ServiceExt::oneshot against the axum router, with the runtime
//! loop running on the test's tokio runtime and a tiny randomly initialized
//! block.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use tokio::sync::watch;
use tower::ServiceExt;

use strata_backend_cpu::CpuBackend;
use strata_block::TransformerBlock;
use strata_cache::MemoryCache;
use strata_core::{Backend, BlockConfig, DType, Module};
use strata_runtime::{Runtime, TransformerBackend};
use strata_server::api::{self, blocks::AppState, types::TensorPayload};

// ──────────── Test Infrastructure ────────────

fn tiny_config() -> BlockConfig {
    BlockConfig {
        hidden_size: 8,
        num_attention_heads: 2,
        intermediate_size: 16,
        rms_norm_eps: 1e-5,
        rope_theta: 10000.0,
        max_length: 8,
        dtype: DType::F32,
    }
}

struct TestServer {
    app: Router,
    state: Arc<AppState>,
    reference: TransformerBlock<CpuBackend>,
    shutdown: watch::Sender<bool>,
}

/// Serve block "h.0" with a cache that fits `cache_entries` sessions.
fn start(cache_entries: usize) -> TestServer {
    let backend = CpuBackend::new();
    let block = TransformerBlock::random(tiny_config(), 11, &backend).unwrap();
    let reference = TransformerBlock::random(tiny_config(), 11, &backend).unwrap();
    let entry_bytes = 2 * 8 * 8 * 4;
    let cache = Arc::new(MemoryCache::new(
        backend.clone(),
        Some(cache_entries * entry_bytes),
    ));

    let mut runtime = Runtime::new();
    let served =
        TransformerBackend::new("h.0", block, cache, backend.clone(), 4, runtime.notifier())
            .unwrap();
    runtime.add_pools(served.get_pools());

    let (shutdown, shutdown_rx) = watch::channel(false);
    let runtime = Arc::new(runtime);
    tokio::spawn(async move { runtime.run(shutdown_rx).await });

    let state = Arc::new(AppState::new(backend, vec![Arc::new(served)]));
    let app = api::router(state.clone());
    TestServer {
        app,
        state,
        reference,
        shutdown,
    }
}

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let body = match body {
        Some(json) => Body::from(serde_json::to_string(&json).unwrap()),
        None => Body::empty(),
    };
    let req = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn payload(seq_len: usize, salt: f32) -> TensorPayload {
    TensorPayload {
        shape: vec![1, seq_len, 8],
        data: (0..seq_len * 8)
            .map(|i| ((i as f32 * 0.41 + salt).sin()) * 0.6)
            .collect(),
    }
}

fn reference_forward(server: &TestServer, input: &TensorPayload) -> Vec<f32> {
    let backend = CpuBackend::new();
    let x = backend.copy_from_host_f32(&input.data, &input.shape).unwrap();
    let y = server.reference.forward(&[x], &backend).unwrap();
    backend.copy_to_host_f32(&y[0]).unwrap()
}

fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() < tol, "index {i}: {x} vs {y}");
    }
}

fn tensor_of(json: &serde_json::Value) -> TensorPayload {
    serde_json::from_value(json.clone()).unwrap()
}

// ──────────── Tests ────────────

#[tokio::test]
async fn test_health() {
    let server = start(1);
    let (status, json) = call(&server.app, Method::GET, "/strata/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_list_blocks() {
    let server = start(1);
    let (status, json) = call(&server.app, Method::GET, "/v1/blocks", None).await;
    assert_eq!(status, StatusCode::OK);
    let blocks = json.as_array().unwrap();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0]["name"], "h.0");
    assert_eq!(blocks[0]["hidden_size"], 8);
    assert_eq!(blocks[0]["pools"].as_array().unwrap().len(), 3);
    assert_eq!(blocks[0]["pools"][2]["name"], "h.0_inference");
}

#[tokio::test]
async fn test_forward_matches_block() {
    let server = start(1);
    let input = payload(3, 0.0);
    let (status, json) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/forward",
        Some(serde_json::json!({ "inputs": [input] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let out = tensor_of(&json["outputs"][0]);
    assert_eq!(out.shape, vec![1, 3, 8]);
    assert_close(&out.data, &reference_forward(&server, &input), 1e-5);
}

#[tokio::test]
async fn test_backward_returns_input_gradient() {
    let server = start(1);
    let input = payload(2, 0.0);
    let grad = payload(2, 3.0);
    let (status, json) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/backward",
        Some(serde_json::json!({ "inputs": [input], "grad_outputs": [grad] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tensor_of(&json["grad_inputs"][0]).shape, vec![1, 2, 8]);

    let (status, json) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/backward",
        Some(serde_json::json!({ "inputs": [payload(2, 0.0)], "grad_outputs": [payload(3, 0.0)] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_unknown_block_is_404() {
    let server = start(1);
    let (status, json) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.9/forward",
        Some(serde_json::json!({ "inputs": [payload(1, 0.0)] })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["type"], "not_found_error");
}

#[tokio::test]
async fn test_bad_payload_is_400() {
    let server = start(1);
    let bad = serde_json::json!({ "shape": [1, 2, 8], "data": [1.0, 2.0] });
    let (status, _) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/forward",
        Some(serde_json::json!({ "inputs": [bad] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let wrong_hidden = serde_json::json!({ "shape": [1, 1, 4], "data": [0.0, 0.0, 0.0, 0.0] });
    let (status, _) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/forward",
        Some(serde_json::json!({ "inputs": [wrong_hidden] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_session_steps_match_full_forward() {
    let server = start(1);
    let (status, json) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/sessions",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["max_length"], 8);
    let handle = json["handle"].as_u64().unwrap();

    let full = payload(4, 0.2);
    let expected = reference_forward(&server, &full);
    let step_uri = format!("/v1/blocks/h.0/sessions/{handle}/step");

    let mut outputs = Vec::new();
    let mut offset = 0;
    for step in [3usize, 1] {
        let chunk = TensorPayload {
            shape: vec![1, step, 8],
            data: full.data[offset * 8..(offset + step) * 8].to_vec(),
        };
        let (status, json) = call(
            &server.app,
            Method::POST,
            &step_uri,
            Some(serde_json::json!({ "hidden": chunk })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{json}");
        offset += step;
        assert_eq!(json["prefix_length"], offset);
        outputs.extend(tensor_of(&json["output"]).data);
    }
    assert_close(&outputs, &expected, 1e-4);

    // The session holds 4 of 8 positions; 5 more do not fit.
    let (status, _) = call(
        &server.app,
        Method::POST,
        &step_uri,
        Some(serde_json::json!({ "hidden": payload(5, 0.0) })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cache_budget_and_session_close() {
    let server = start(1);
    let open = || {
        call(
            &server.app,
            Method::POST,
            "/v1/blocks/h.0/sessions",
            Some(serde_json::json!({})),
        )
    };

    let (status, json) = open().await;
    assert_eq!(status, StatusCode::OK);
    let handle = json["handle"].as_u64().unwrap();

    let (status, json) = open().await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    assert_eq!(json["error"]["type"], "insufficient_storage_error");

    let uri = format!("/v1/blocks/h.0/sessions/{handle}");
    let (status, _) = call(&server.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&server.app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = open().await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(
        &server.app,
        Method::POST,
        &format!("{uri}/step"),
        Some(serde_json::json!({ "hidden": payload(1, 0.0) })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sessions_hold_one_sequence() {
    let server = start(2);
    let (status, _) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/sessions",
        Some(serde_json::json!({ "batch_size": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    server.shutdown.send(true).unwrap();
}

#[tokio::test]
async fn test_idle_sessions_expire() {
    let server = start(1);
    let (status, json) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/sessions",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let handle = json["handle"].as_u64().unwrap();

    assert_eq!(server.state.evict_idle(Duration::from_secs(3600)), 0);
    assert_eq!(server.state.num_sessions(), 1);

    assert_eq!(server.state.evict_idle(Duration::ZERO), 1);
    assert_eq!(server.state.num_sessions(), 0);

    let (status, _) = call(
        &server.app,
        Method::POST,
        &format!("/v1/blocks/h.0/sessions/{handle}/step"),
        Some(serde_json::json!({ "hidden": payload(1, 0.0) })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The expired entry's bytes are back in the budget.
    let (status, _) = call(
        &server.app,
        Method::POST,
        "/v1/blocks/h.0/sessions",
        Some(serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}
