// End-to-end scenarios against the HTTP facade with an in-process stub
// model, plus the serving-fallback paths against an unreachable endpoint.

use sha2::{Digest, Sha256};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use veridian_engine::{InferenceConfig, InferenceEngine, TOTAL_FEATURE_DIM};
use veridian_model::{ModelLoader, MODEL_FORMAT};
use veridian_rpc::{
    routes, AppContext, ErrorBody, HealthResponse, HealthStatus, Lifecycle, LifecycleState,
    MetricsResponse, ModelInfoResponse,
};
use veridian_serving::{ServingClient, ServingConfig};
use veridian_telemetry::InferenceMetrics;

fn write_artifact(bias: f32) -> tempfile::NamedTempFile {
    let json = serde_json::to_string(&serde_json::json!({
        "format": MODEL_FORMAT,
        "version": "1.4.2",
        "framework_version": "tensorflow-2.13.0",
        "exported_at": "2025-11-03T10:22:41Z",
        "input_name": "identity_features",
        "output_name": "trust_score",
        "input_dim": TOTAL_FEATURE_DIM,
        "output_dim": 1,
        "weights": vec![0.0f32; TOTAL_FEATURE_DIM],
        "bias": bias,
    }))
    .unwrap();
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

fn config() -> InferenceConfig {
    InferenceConfig {
        model_path: "/tmp/model.json".into(),
        model_version: "1.4.2".to_string(),
        expected_model_hash: None,
        request_timeout: Duration::from_millis(500),
        force_cpu: true,
        seed: 42,
        allow_stub_fallback: true,
        pinned_default_vector_hash: None,
    }
}

fn ready_context(bias: f32, serving: Option<Arc<ServingClient>>, allow_fallback: bool) -> (Arc<AppContext>, tempfile::NamedTempFile) {
    let file = write_artifact(bias);
    let artifact = Arc::new(ModelLoader::load(file.path(), TOTAL_FEATURE_DIM, None).unwrap());
    let metrics = Arc::new(InferenceMetrics::new());
    let mut cfg = config();
    cfg.allow_stub_fallback = allow_fallback;
    let engine = InferenceEngine::new(cfg, artifact, serving, metrics).unwrap();

    let lifecycle = Arc::new(Lifecycle::new());
    lifecycle.transition(LifecycleState::Loaded).unwrap();
    lifecycle.transition(LifecycleState::Ready).unwrap();

    let ctx = Arc::new(AppContext {
        engine: Some(Arc::new(engine)),
        lifecycle,
        startup_error: None,
        pipeline_version: "1.0.0".to_string(),
    });
    (ctx, file)
}

fn unreachable_serving() -> Arc<ServingClient> {
    Arc::new(
        ServingClient::new(ServingConfig {
            endpoint: "http://192.0.2.1:1".to_string(),
            model_name: "identity_score".to_string(),
            input_name: "identity_features".to_string(),
            output_name: "trust_score".to_string(),
            timeout: Duration::from_millis(50),
            retries: 0,
        })
        .unwrap(),
    )
}

fn ramp() -> Vec<f32> {
    (0..TOTAL_FEATURE_DIM)
        .map(|i| ((i % 11) as f32) * 0.1)
        .collect()
}

fn le_f32_sha256(values: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for &v in values {
        hasher.update(v.to_bits().to_le_bytes());
    }
    hex::encode(hasher.finalize())
}

const VOCABULARY: [&str; 6] = [
    "SUCCESS",
    "HIGH_CONFIDENCE",
    "LOW_CONFIDENCE",
    "LOW_DOC_QUALITY",
    "LOW_OCR_CONFIDENCE",
    "INSUFFICIENT_SCOPES",
];

// Scenario 1: happy path with the fixed ramp vector.
#[tokio::test]
async fn score_happy_path_with_ramp_vector() {
    let (ctx, _file) = ready_context(72.0, None, true);
    let api = routes(ctx);

    let input = ramp();
    let response = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .json(&serde_json::json!({
            "features": input,
            "metadata": { "account_address": "ve1qxy...", "block_height": 184002, "request_id": "req-1" },
            "return_contributions": true
        }))
        .reply(&api)
        .await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();

    assert_eq!(body["input_hash"].as_str().unwrap(), le_f32_sha256(&input));
    let score = body["score"].as_u64().unwrap();
    assert!(score <= 100);
    for code in body["reason_codes"].as_array().unwrap() {
        assert!(VOCABULARY.contains(&code.as_str().unwrap()));
    }
    assert_eq!(body["request_id"].as_str().unwrap(), "req-1");
    assert!(body["feature_contributions"].is_object());

    // The request landed in exactly one latency bucket.
    let metrics = warp::test::request()
        .method("GET")
        .path("/v1/metrics")
        .reply(&api)
        .await;
    let metrics: MetricsResponse = serde_json::from_slice(metrics.body()).unwrap();
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.successful, 1);
    assert_eq!(metrics.latency_histogram.total(), 1);
    assert!(metrics.last_inference_timestamp.is_some());
}

// Scenario 2: dimension mismatch touches no backend and no last-inference.
#[tokio::test]
async fn score_dimension_mismatch_is_invalid_input() {
    let (ctx, _file) = ready_context(72.0, None, true);
    let api = routes(ctx);

    let response = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .json(&serde_json::json!({ "features": vec![0.0f32; TOTAL_FEATURE_DIM - 1] }))
        .reply(&api)
        .await;

    assert_eq!(response.status(), 400);
    let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body.error.kind, "INVALID_INPUT");

    let metrics = warp::test::request()
        .method("GET")
        .path("/v1/metrics")
        .reply(&api)
        .await;
    let metrics: MetricsResponse = serde_json::from_slice(metrics.body()).unwrap();
    assert_eq!(metrics.total, 1);
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.successful, 0);
    assert!(metrics.last_inference_timestamp.is_none());
}

#[tokio::test]
async fn score_non_finite_value_is_invalid_input() {
    let (ctx, _file) = ready_context(72.0, None, true);
    let api = routes(ctx);

    // JSON cannot carry NaN; Infinity arrives via a large float literal that
    // overflows f32 to +inf during deserialization.
    let mut input = ramp();
    input[0] = f32::INFINITY;
    let raw_body = serde_json::to_string(&serde_json::json!({ "features": input }))
        .unwrap()
        .replace("null", "1e39");

    let response = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .header("content-type", "application/json")
        .body(raw_body)
        .reply(&api)
        .await;

    // Either the body parser or the validator refuses it, never the scorer.
    assert!(response.status() == 400);
}

// Scenario 3: integrity failure at startup leaves an Unhealthy facade.
#[tokio::test]
async fn startup_integrity_failure_reports_unhealthy() {
    let file = write_artifact(60.0);
    let err = ModelLoader::load(file.path(), TOTAL_FEATURE_DIM, Some(&"0".repeat(64)))
        .unwrap_err();

    let ctx = Arc::new(AppContext {
        engine: None,
        lifecycle: Arc::new(Lifecycle::new()),
        startup_error: Some(err.to_string()),
        pipeline_version: "1.0.0".to_string(),
    });
    let api = routes(ctx);

    let response = warp::test::request()
        .method("GET")
        .path("/v1/health")
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let body: HealthResponse = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body.status, HealthStatus::Unhealthy);
    assert!(!body.model_loaded);
    assert!(body.error_message.unwrap().contains("hash mismatch"));

    let refused = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .json(&serde_json::json!({ "features": ramp() }))
        .reply(&api)
        .await;
    assert_eq!(refused.status(), 503);
}

// Scenario 4: serving down, fallback enabled.
#[tokio::test]
async fn serving_down_with_fallback_reports_local_stub() {
    let (ctx, _file) = ready_context(58.0, Some(unreachable_serving()), true);
    let api = routes(ctx);

    let response = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .json(&serde_json::json!({ "features": ramp() }))
        .reply(&api)
        .await;

    assert_eq!(response.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["endpoint_id"].as_str().unwrap(), "local_stub");
    assert_eq!(body["output_hash"].as_str().unwrap(), le_f32_sha256(&[58.0f32]));

    let metrics = warp::test::request()
        .method("GET")
        .path("/v1/metrics")
        .reply(&api)
        .await;
    let metrics: MetricsResponse = serde_json::from_slice(metrics.body()).unwrap();
    assert_eq!(metrics.successful, 1);
}

// Scenario 5: serving down, fallback disabled.
#[tokio::test]
async fn serving_down_without_fallback_is_unavailable() {
    let (ctx, _file) = ready_context(58.0, Some(unreachable_serving()), false);
    let api = routes(ctx);

    let response = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .json(&serde_json::json!({ "features": ramp() }))
        .reply(&api)
        .await;

    assert_eq!(response.status(), 503);
    let body: ErrorBody = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body.error.kind, "UNAVAILABLE");

    let metrics = warp::test::request()
        .method("GET")
        .path("/v1/metrics")
        .reply(&api)
        .await;
    let metrics: MetricsResponse = serde_json::from_slice(metrics.body()).unwrap();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.total, 1);
}

// Scenario 6: named test vector verification, and a forced mismatch.
#[tokio::test]
async fn verify_named_vector_and_forced_mismatch() {
    let (ctx, _file) = ready_context(64.0, None, true);
    let api = routes(ctx);

    let response = warp::test::request()
        .method("POST")
        .path("/v1/verify")
        .json(&serde_json::json!({ "test_vector_id": "v0" }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
    assert_eq!(body["passed"], true);
    assert_eq!(body["test_vector_id"], "v0");
    assert_eq!(body["actual_output_hash"], body["expected_output_hash"]);

    let mismatch = warp::test::request()
        .method("POST")
        .path("/v1/verify")
        .json(&serde_json::json!({
            "test_vector_id": "v0",
            "expected_output_hash": "0".repeat(64)
        }))
        .reply(&api)
        .await;
    let body: serde_json::Value = serde_json::from_slice(mismatch.body()).unwrap();
    assert_eq!(body["passed"], false);
    let differences = body["differences"].as_array().unwrap();
    assert_eq!(differences.len(), 1);
    assert!(differences[0].as_str().unwrap().contains("output_hash"));
}

#[tokio::test]
async fn verify_default_is_idempotent() {
    let (ctx, _file) = ready_context(64.0, None, true);
    let api = routes(ctx);

    let mut hashes = Vec::new();
    for _ in 0..2 {
        let response = warp::test::request()
            .method("POST")
            .path("/v1/verify")
            .json(&serde_json::json!({}))
            .reply(&api)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(body["passed"], true);
        hashes.push(body["actual_output_hash"].as_str().unwrap().to_string());
    }
    assert_eq!(hashes[0], hashes[1]);
}

#[tokio::test]
async fn verify_unknown_vector_is_invalid_input() {
    let (ctx, _file) = ready_context(64.0, None, true);
    let api = routes(ctx);

    let response = warp::test::request()
        .method("POST")
        .path("/v1/verify")
        .json(&serde_json::json!({ "test_vector_id": "missing" }))
        .reply(&api)
        .await;
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn model_info_publishes_layout_and_determinism() {
    let (ctx, _file) = ready_context(64.0, None, true);
    let api = routes(ctx);

    let response = warp::test::request()
        .method("GET")
        .path("/v1/model")
        .reply(&api)
        .await;
    assert_eq!(response.status(), 200);
    let body: ModelInfoResponse = serde_json::from_slice(response.body()).unwrap();

    assert_eq!(body.version, "1.4.2");
    assert_eq!(body.input_dim, TOTAL_FEATURE_DIM);
    assert_eq!(body.output_dim, 1);
    assert_eq!(body.feature_layout.total, TOTAL_FEATURE_DIM);
    assert_eq!(body.determinism.inter_op_parallelism, 1);
    assert_eq!(body.determinism.intra_op_parallelism, 1);
    assert!(body.determinism.deterministic_ops);
    assert_eq!(body.model_hash.len(), 64);
}

#[tokio::test]
async fn draining_refuses_new_requests() {
    let (ctx, _file) = ready_context(64.0, None, true);
    ctx.lifecycle.transition(LifecycleState::Draining).unwrap();
    let api = routes(ctx);

    let score = warp::test::request()
        .method("POST")
        .path("/v1/score")
        .json(&serde_json::json!({ "features": ramp() }))
        .reply(&api)
        .await;
    assert_eq!(score.status(), 503);

    let verify = warp::test::request()
        .method("POST")
        .path("/v1/verify")
        .json(&serde_json::json!({}))
        .reply(&api)
        .await;
    assert_eq!(verify.status(), 503);

    // Health stays observable while draining.
    let health = warp::test::request()
        .method("GET")
        .path("/v1/health")
        .reply(&api)
        .await;
    assert_eq!(health.status(), 200);
}

#[tokio::test]
async fn identical_requests_produce_identical_hashes() {
    let (ctx, _file) = ready_context(64.0, None, true);
    let api = routes(ctx);

    let mut pairs = Vec::new();
    for _ in 0..2 {
        let response = warp::test::request()
            .method("POST")
            .path("/v1/score")
            .json(&serde_json::json!({ "features": ramp() }))
            .reply(&api)
            .await;
        let body: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        pairs.push((
            body["input_hash"].as_str().unwrap().to_string(),
            body["output_hash"].as_str().unwrap().to_string(),
        ));
    }
    assert_eq!(pairs[0], pairs[1]);
}
