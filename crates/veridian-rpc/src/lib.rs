// SERVICE FACADE
// Thin HTTP/JSON surface over the engine: the five operations, the sidecar
// lifecycle, and the error-to-status mapping. No domain state lives here.
//
// Operations:
//   GET  /v1/model    -> model + determinism metadata
//   POST /v1/score    -> one score request
//   GET  /v1/health   -> Healthy / Degraded / Unhealthy
//   GET  /v1/metrics  -> telemetry snapshot
//   POST /v1/verify   -> determinism verification

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};
use warp::http::StatusCode;
use warp::Filter;

use veridian_determinism::DeterminismSummary;
use veridian_engine::{
    InferenceEngine, InferenceError, ReasonCode, ScoreResult, VerificationInput, D_DOC, D_FACE,
    D_META, D_OCR, TOTAL_FEATURE_DIM,
};
use veridian_serving::ServingHealth;
use veridian_telemetry::{memory_usage_mb, LatencyHistogram};

// ==================== LIFECYCLE ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Init,
    Loaded,
    Ready,
    Draining,
    Stopped,
}

impl LifecycleState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Loaded,
            2 => Self::Ready,
            3 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Loaded => 1,
            Self::Ready => 2,
            Self::Draining => 3,
            Self::Stopped => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Loaded => "loaded",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

/// Init -> Loaded -> Ready -> Draining -> Stopped, with Draining -> Ready
/// for out-of-band reloads. Draining and Stopped refuse new work but leave
/// in-flight requests alone.
#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Lifecycle {
    pub fn new() -> Self {
        Self(AtomicU8::new(LifecycleState::Init.as_u8()))
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn transition(&self, to: LifecycleState) -> Result<(), String> {
        let from = self.state();
        let allowed = matches!(
            (from, to),
            (LifecycleState::Init, LifecycleState::Loaded)
                | (LifecycleState::Loaded, LifecycleState::Ready)
                | (LifecycleState::Ready, LifecycleState::Draining)
                | (LifecycleState::Draining, LifecycleState::Ready)
                | (LifecycleState::Draining, LifecycleState::Stopped)
                | (LifecycleState::Init, LifecycleState::Stopped)
        );
        if !allowed {
            return Err(format!(
                "illegal lifecycle transition {} -> {}",
                from.as_str(),
                to.as_str()
            ));
        }
        self.0.store(to.as_u8(), Ordering::Release);
        info!(from = from.as_str(), to = to.as_str(), "lifecycle transition");
        Ok(())
    }

    pub fn accepting_requests(&self) -> bool {
        self.state() == LifecycleState::Ready
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== CONTEXT ====================

/// Shared, read-only request context built once in the composition root.
/// `engine` is None when startup failed the model-integrity gate; the
/// sidecar then serves Unhealthy health checks and refuses everything else.
pub struct AppContext {
    pub engine: Option<Arc<InferenceEngine>>,
    pub lifecycle: Arc<Lifecycle>,
    pub startup_error: Option<String>,
    pub pipeline_version: String,
}

// ==================== WIRE TYPES ====================

#[derive(Debug, Serialize, Deserialize)]
pub struct FeatureLayoutInfo {
    pub d_face: usize,
    pub d_doc: usize,
    pub d_ocr: usize,
    pub d_meta: usize,
    pub total: usize,
}

impl FeatureLayoutInfo {
    pub fn current() -> Self {
        Self {
            d_face: D_FACE,
            d_doc: D_DOC,
            d_ocr: D_OCR,
            d_meta: D_META,
            total: TOTAL_FEATURE_DIM,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub version: String,
    pub model_hash: String,
    pub input_dim: usize,
    pub output_dim: usize,
    pub input_name: String,
    pub output_name: String,
    pub framework_version: String,
    pub export_timestamp: String,
    pub pipeline_version: String,
    pub feature_layout: FeatureLayoutInfo,
    pub determinism: DeterminismSummary,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ScoreRequestMetadata {
    #[serde(default)]
    pub account_address: Option<String>,
    #[serde(default)]
    pub block_height: Option<u64>,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreRequest {
    pub features: Vec<f32>,
    #[serde(default)]
    pub metadata: Option<ScoreRequestMetadata>,
    #[serde(default)]
    pub return_contributions: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ScoreResponse {
    #[serde(flatten)]
    pub result: ScoreResult,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub lifecycle: LifecycleState,
    pub model_loaded: bool,
    pub model_version: String,
    pub model_hash: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inference_timestamp: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetricsResponse {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub avg_latency_ms: f64,
    pub p99_latency_ms: f64,
    pub latency_histogram: LatencyHistogram,
    pub reservoir_samples: usize,
    pub model_version: String,
    pub model_hash: String,
    pub uptime_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_inference_timestamp: Option<u64>,
    pub memory_usage_mb: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VerifyRequest {
    #[serde(default)]
    pub test_vector_id: Option<String>,
    #[serde(default)]
    pub custom_input: Option<Vec<f32>>,
    #[serde(default)]
    pub expected_output_hash: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

// ==================== ERROR MAPPING ====================

pub fn status_for(err: &InferenceError) -> StatusCode {
    match err {
        InferenceError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        InferenceError::BackendTransport(_) | InferenceError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        InferenceError::BackendProtocol(_) => StatusCode::BAD_GATEWAY,
        InferenceError::Cancelled(_) => StatusCode::GATEWAY_TIMEOUT,
        InferenceError::ModelIntegrity(_) | InferenceError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_reply(err: &InferenceError) -> warp::reply::WithStatus<warp::reply::Json> {
    let body = ErrorBody {
        error: ErrorDetail {
            kind: err.kind().to_string(),
            message: err.to_string(),
        },
    };
    warp::reply::with_status(warp::reply::json(&body), status_for(err))
}

fn refusal_reply(message: &str) -> warp::reply::WithStatus<warp::reply::Json> {
    let body = ErrorBody {
        error: ErrorDetail {
            kind: "UNAVAILABLE".to_string(),
            message: message.to_string(),
        },
    };
    warp::reply::with_status(warp::reply::json(&body), StatusCode::SERVICE_UNAVAILABLE)
}

// ==================== ROUTES ====================

fn with_ctx(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (Arc<AppContext>,), Error = Infallible> + Clone {
    warp::any().map(move || ctx.clone())
}

pub fn routes(
    ctx: Arc<AppContext>,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let model_info = warp::path!("v1" / "model")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_model_info);

    let score = warp::path!("v1" / "score")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_score);

    let health = warp::path!("v1" / "health")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_health);

    let metrics = warp::path!("v1" / "metrics")
        .and(warp::get())
        .and(with_ctx(ctx.clone()))
        .and_then(handle_metrics);

    let verify = warp::path!("v1" / "verify")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_ctx(ctx))
        .and_then(handle_verify);

    model_info.or(score).or(health).or(metrics).or(verify)
}

async fn handle_model_info(ctx: Arc<AppContext>) -> Result<impl warp::Reply, Infallible> {
    let Some(engine) = &ctx.engine else {
        return Ok(refusal_reply("model is not loaded"));
    };
    let artifact = engine.artifact();
    let body = ModelInfoResponse {
        version: artifact.version().to_string(),
        model_hash: artifact.hash_hex(),
        input_dim: artifact.input_dim(),
        output_dim: artifact.output_dim(),
        input_name: artifact.input_name().to_string(),
        output_name: artifact.output_name().to_string(),
        framework_version: artifact.framework_version().to_string(),
        export_timestamp: artifact.exported_at().to_rfc3339(),
        pipeline_version: ctx.pipeline_version.clone(),
        feature_layout: FeatureLayoutInfo::current(),
        determinism: engine.determinism().config_summary(),
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&body),
        StatusCode::OK,
    ))
}

async fn handle_score(
    request: ScoreRequest,
    ctx: Arc<AppContext>,
) -> Result<impl warp::Reply, Infallible> {
    let Some(engine) = &ctx.engine else {
        return Ok(refusal_reply("model is not loaded"));
    };
    if !ctx.lifecycle.accepting_requests() {
        return Ok(refusal_reply(&format!(
            "sidecar is {}, not accepting requests",
            ctx.lifecycle.state().as_str()
        )));
    }

    let request_id = request
        .metadata
        .as_ref()
        .and_then(|m| m.request_id.clone());

    match engine
        .compute_score(
            request.features,
            request.return_contributions,
            request_id.as_deref(),
        )
        .await
    {
        Ok(result) => Ok(warp::reply::with_status(
            warp::reply::json(&ScoreResponse { result, request_id }),
            StatusCode::OK,
        )),
        Err(err) => {
            warn!(kind = err.kind(), error = %err, "score request failed");
            Ok(error_reply(&err))
        }
    }
}

async fn handle_health(ctx: Arc<AppContext>) -> Result<impl warp::Reply, Infallible> {
    let body = match &ctx.engine {
        None => HealthResponse {
            status: HealthStatus::Unhealthy,
            lifecycle: ctx.lifecycle.state(),
            model_loaded: false,
            model_version: String::new(),
            model_hash: String::new(),
            uptime_seconds: 0,
            last_inference_timestamp: None,
            error_message: ctx.startup_error.clone(),
        },
        Some(engine) => {
            let artifact = engine.artifact();
            let (status, error_message) = if !artifact.is_loaded() {
                (HealthStatus::Unhealthy, Some("model not loaded".to_string()))
            } else {
                match engine.serving_health().await {
                    None | Some(ServingHealth::Healthy) => (HealthStatus::Healthy, None),
                    Some(ServingHealth::Degraded(reason)) => {
                        (HealthStatus::Degraded, Some(reason))
                    }
                    Some(ServingHealth::Unreachable(reason)) => {
                        (HealthStatus::Degraded, Some(reason))
                    }
                }
            };
            HealthResponse {
                status,
                lifecycle: ctx.lifecycle.state(),
                model_loaded: artifact.is_loaded(),
                model_version: artifact.version().to_string(),
                model_hash: artifact.hash_hex(),
                uptime_seconds: engine.metrics().uptime_seconds(),
                last_inference_timestamp: engine.metrics().last_inference_epoch_ms(),
                error_message,
            }
        }
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&body),
        StatusCode::OK,
    ))
}

async fn handle_metrics(ctx: Arc<AppContext>) -> Result<impl warp::Reply, Infallible> {
    let Some(engine) = &ctx.engine else {
        return Ok(refusal_reply("model is not loaded"));
    };
    let snapshot = engine.metrics().snapshot();
    let artifact = engine.artifact();
    let body = MetricsResponse {
        total: snapshot.total,
        successful: snapshot.successful,
        failed: snapshot.failed,
        avg_latency_ms: snapshot.avg_latency_ms,
        p99_latency_ms: snapshot.p99_latency_ms,
        latency_histogram: snapshot.latency_histogram,
        reservoir_samples: snapshot.reservoir_samples,
        model_version: artifact.version().to_string(),
        model_hash: artifact.hash_hex(),
        uptime_seconds: snapshot.uptime_seconds,
        last_inference_timestamp: snapshot.last_inference_epoch_ms,
        memory_usage_mb: memory_usage_mb(),
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&body),
        StatusCode::OK,
    ))
}

async fn handle_verify(
    request: VerifyRequest,
    ctx: Arc<AppContext>,
) -> Result<impl warp::Reply, Infallible> {
    let Some(engine) = &ctx.engine else {
        return Ok(refusal_reply("model is not loaded"));
    };
    if !ctx.lifecycle.accepting_requests() {
        return Ok(refusal_reply(&format!(
            "sidecar is {}, not accepting requests",
            ctx.lifecycle.state().as_str()
        )));
    }

    let input = match (request.test_vector_id, request.custom_input) {
        (Some(_), Some(_)) => {
            let err = InferenceError::InvalidInput(
                "test_vector_id and custom_input are mutually exclusive".to_string(),
            );
            return Ok(error_reply(&err));
        }
        (Some(id), None) => VerificationInput::TestVector(id),
        (None, Some(values)) => VerificationInput::Custom(values),
        (None, None) => VerificationInput::Default,
    };

    match engine
        .verify_determinism(input, request.expected_output_hash)
        .await
    {
        Ok(report) => Ok(warp::reply::with_status(
            warp::reply::json(&report),
            StatusCode::OK,
        )),
        Err(err) => {
            error!(kind = err.kind(), error = %err, "determinism verification failed");
            Ok(error_reply(&err))
        }
    }
}

// ==================== SERVER ====================

/// Binds the facade and serves until `shutdown` resolves, then drains
/// in-flight requests and marks the lifecycle Stopped.
pub async fn serve(
    ctx: Arc<AppContext>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) {
    let lifecycle = ctx.lifecycle.clone();
    let drain = {
        let lifecycle = lifecycle.clone();
        async move {
            shutdown.await;
            if let Err(reason) = lifecycle.transition(LifecycleState::Draining) {
                warn!(%reason, "drain transition skipped");
            }
        }
    };

    let (bound, server) = warp::serve(routes(ctx)).bind_with_graceful_shutdown(addr, drain);
    info!(addr = %bound, "veridian sidecar listening");
    server.await;

    if let Err(reason) = lifecycle.transition(LifecycleState::Stopped) {
        warn!(%reason, "stop transition skipped");
    }
    info!("veridian sidecar stopped");
}

/// Reason-code vocabulary, as published wire strings.
pub fn reason_code_vocabulary() -> Vec<&'static str> {
    [
        ReasonCode::Success,
        ReasonCode::HighConfidence,
        ReasonCode::LowConfidence,
        ReasonCode::LowDocQuality,
        ReasonCode::LowOcrConfidence,
        ReasonCode::InsufficientScopes,
    ]
    .iter()
    .map(|code| code.as_str())
    .collect()
}

// ==================== TESTS ====================
