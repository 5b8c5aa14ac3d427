// INFERENCE ENGINE
// Orchestrates one score request end to end: validate, run the backend
// under the request deadline, score, derive reason codes, hash, record.

use crate::backend::Backend;
use crate::error::InferenceError;
use crate::features::{feature_contributions, FeatureVector, TOTAL_FEATURE_DIM};
use crate::reason::{derive_reason_codes, ReasonCode};
use crate::vectors::{builtin_vectors, TestVector, DEFAULT_TEST_VECTOR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, instrument};
use veridian_determinism::{hash_hex, DeterminismController, DeterminismPolicy};
use veridian_model::ModelArtifact;
use veridian_serving::ServingClient;
use veridian_telemetry::InferenceMetrics;

// ==================== CONFIG ====================

/// Process-wide inference settings, immutable after startup.
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    /// Artifact location on disk
    pub model_path: PathBuf,

    /// Version the operator expects to be running
    pub model_version: String,

    /// Lowercase hex content hash gate; empty means ungated
    pub expected_model_hash: Option<String>,

    /// Per-request deadline
    pub request_timeout: Duration,

    pub force_cpu: bool,

    pub seed: u64,

    /// Fall back to the in-process stub when remote serving fails
    pub allow_stub_fallback: bool,

    /// Fleet-wide pin for the default test vector's output hash; checked
    /// at startup against the loaded model
    pub pinned_default_vector_hash: Option<String>,
}

// ==================== RESULT TYPES ====================

/// Outcome of one score request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResult {
    /// Bounded integer score, 0..=100
    pub score: u32,

    /// Raw model output, output[0]
    pub raw_score: f32,

    /// Confidence in [0.30, 0.95]
    pub confidence: f32,

    /// SHA-256 of the canonical input encoding, lowercase hex
    pub input_hash: String,

    /// SHA-256 of the canonical raw-output encoding, lowercase hex
    pub output_hash: String,

    pub model_version: String,
    pub model_hash: String,

    /// Which backend produced the raw output
    pub endpoint_id: String,

    /// Version string the remote endpoint reported, when any
    pub model_version_seen: Option<String>,

    pub reason_codes: Vec<ReasonCode>,

    pub feature_contributions: Option<BTreeMap<String, f32>>,

    pub compute_time_ms: u64,
}

/// Selector for a determinism verification run.
#[derive(Debug, Clone)]
pub enum VerificationInput {
    Default,
    TestVector(String),
    Custom(Vec<f32>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    pub passed: bool,
    pub test_vector_id: Option<String>,
    pub actual_output_hash: String,
    pub expected_output_hash: Option<String>,
    pub differences: Vec<String>,
}

// ==================== ENGINE ====================

#[derive(Debug)]
pub struct InferenceEngine {
    config: InferenceConfig,
    determinism: DeterminismController,
    artifact: Arc<ModelArtifact>,
    backend: Backend,
    metrics: Arc<InferenceMetrics>,
    test_vectors: Vec<TestVector>,
}

impl InferenceEngine {
    /// Builds the engine and resolves the test-vector baselines against the
    /// loaded model. The baselines come from the local stub path, so a
    /// remote backend that is not bit-identical to CPU fails verification.
    pub fn new(
        config: InferenceConfig,
        artifact: Arc<ModelArtifact>,
        serving: Option<Arc<ServingClient>>,
        metrics: Arc<InferenceMetrics>,
    ) -> Result<Self, InferenceError> {
        let determinism = DeterminismController::new(DeterminismPolicy::new(
            config.seed,
            config.force_cpu,
        ));

        let backend = match (serving, config.allow_stub_fallback) {
            (Some(serving), true) => Backend::Both {
                serving,
                stub: artifact.clone(),
            },
            (Some(serving), false) => Backend::Remote(serving),
            (None, _) => Backend::Local(artifact.clone()),
        };

        let mut test_vectors = builtin_vectors();
        for vector in &mut test_vectors {
            let outputs = artifact
                .run(&vector.features)
                .map_err(|e| InferenceError::ModelIntegrity(e.to_string()))?;
            vector.expected_output_hash = Some(hash_hex(&determinism.output_hash(&outputs)));
        }

        if let Some(pinned) = &config.pinned_default_vector_hash {
            let resolved = test_vectors
                .iter()
                .find(|v| v.id == DEFAULT_TEST_VECTOR)
                .and_then(|v| v.expected_output_hash.clone())
                .unwrap_or_default();
            if !pinned.eq_ignore_ascii_case(&resolved) {
                return Err(InferenceError::ModelIntegrity(format!(
                    "default test vector hash {resolved} does not match pinned {pinned}"
                )));
            }
        }

        Ok(Self {
            config,
            determinism,
            artifact,
            backend,
            metrics,
            test_vectors,
        })
    }

    pub fn config(&self) -> &InferenceConfig {
        &self.config
    }

    pub fn artifact(&self) -> &ModelArtifact {
        &self.artifact
    }

    pub fn determinism(&self) -> &DeterminismController {
        &self.determinism
    }

    pub fn metrics(&self) -> &InferenceMetrics {
        &self.metrics
    }

    pub fn test_vectors(&self) -> &[TestVector] {
        &self.test_vectors
    }

    /// Health of the remote backend, None when the engine is stub-only.
    pub async fn serving_health(&self) -> Option<veridian_serving::ServingHealth> {
        match self.backend.serving_client() {
            Some(client) => Some(client.health().await),
            None => None,
        }
    }

    /// One score request. Telemetry is recorded exactly once on every
    /// terminal path; only successes touch last_inference.
    #[instrument(skip(self, features), fields(request_id = request_id.unwrap_or("-")))]
    pub async fn compute_score(
        &self,
        features: Vec<f32>,
        include_contributions: bool,
        request_id: Option<&str>,
    ) -> Result<ScoreResult, InferenceError> {
        let start = Instant::now();
        match self.compute_inner(features, include_contributions, start).await {
            Ok(result) => {
                self.metrics.record_success(elapsed_ms(start));
                info!(
                    score = result.score,
                    endpoint = %result.endpoint_id,
                    latency_ms = result.compute_time_ms,
                    "score computed"
                );
                Ok(result)
            }
            Err(err) => {
                self.metrics.record_failure(elapsed_ms(start));
                Err(err)
            }
        }
    }

    async fn compute_inner(
        &self,
        features: Vec<f32>,
        include_contributions: bool,
        start: Instant,
    ) -> Result<ScoreResult, InferenceError> {
        let vector = FeatureVector::new(features)?;

        let output = tokio::time::timeout(
            self.config.request_timeout,
            self.backend.run(vector.as_slice()),
        )
        .await
        .map_err(|_| {
            InferenceError::Cancelled(format!(
                "deadline of {:?} exceeded",
                self.config.request_timeout
            ))
        })??;

        let raw_score = *output
            .outputs
            .first()
            .ok_or_else(|| InferenceError::BackendProtocol("empty output vector".to_string()))?;
        if !raw_score.is_finite() {
            return Err(InferenceError::BackendProtocol(
                "non-finite raw score".to_string(),
            ));
        }

        let score = raw_score.round().clamp(0.0, 100.0) as u32;
        let confidence = confidence_for(raw_score);
        let reason_codes = derive_reason_codes(score, confidence, &vector);

        let input_hash = hash_hex(&self.determinism.feature_hash(vector.as_slice()));
        let output_hash = hash_hex(&self.determinism.output_hash(&output.outputs));

        let contributions = include_contributions.then(|| feature_contributions(&vector));

        Ok(ScoreResult {
            score,
            raw_score,
            confidence,
            input_hash,
            output_hash,
            model_version: self.artifact.version().to_string(),
            model_hash: self.artifact.hash_hex(),
            endpoint_id: output.endpoint_id,
            model_version_seen: output.model_version_seen,
            reason_codes,
            feature_contributions: contributions,
            compute_time_ms: elapsed_ms(start) as u64,
        })
    }

    /// Runs one inference and compares the output hash against the recorded
    /// baseline, a caller-supplied expectation, or nothing (neutral pass).
    /// Verification runs do not count toward request telemetry.
    pub async fn verify_determinism(
        &self,
        input: VerificationInput,
        expected_override: Option<String>,
    ) -> Result<VerificationReport, InferenceError> {
        let (vector_id, vector, recorded) = match input {
            VerificationInput::Default => self.lookup_vector(DEFAULT_TEST_VECTOR)?,
            VerificationInput::TestVector(id) => self.lookup_vector(&id)?,
            VerificationInput::Custom(values) => (None, FeatureVector::new(values)?, None),
        };

        let output = tokio::time::timeout(
            self.config.request_timeout,
            self.backend.run(vector.as_slice()),
        )
        .await
        .map_err(|_| {
            InferenceError::Cancelled(format!(
                "deadline of {:?} exceeded",
                self.config.request_timeout
            ))
        })??;

        let actual = hash_hex(&self.determinism.output_hash(&output.outputs));
        let expected = expected_override
            .map(|h| h.to_ascii_lowercase())
            .or(recorded);

        let mut differences = Vec::new();
        let passed = match &expected {
            None => true,
            Some(e) if *e == actual => true,
            Some(e) => {
                differences.push(format!("output_hash: expected {e}, actual {actual}"));
                false
            }
        };

        Ok(VerificationReport {
            passed,
            test_vector_id: vector_id,
            actual_output_hash: actual,
            expected_output_hash: expected,
            differences,
        })
    }

    fn lookup_vector(
        &self,
        id: &str,
    ) -> Result<(Option<String>, FeatureVector, Option<String>), InferenceError> {
        let vector = self
            .test_vectors
            .iter()
            .find(|v| v.id == id)
            .ok_or_else(|| InferenceError::InvalidInput(format!("unknown test vector id {id:?}")))?;
        Ok((
            Some(vector.id.to_string()),
            FeatureVector::new(vector.features.clone())?,
            vector.expected_output_hash.clone(),
        ))
    }
}

/// `clamp(0.5 + 0.4 * |raw - 50| / 50, 0.30, 0.95)`. The 0.30 floor cannot
/// bind (the formula bottoms out at 0.50) but stays as the published bound.
pub fn confidence_for(raw_score: f32) -> f32 {
    (0.5 + 0.4 * (raw_score - 50.0).abs() / 50.0).clamp(0.30, 0.95)
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

// ==================== TESTS ====================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{DOC_OFFSET, META_OFFSET, OCR_OFFSET, OCR_PAIRS};
    use crate::vectors::ramp;
    use std::io::Write;
    use veridian_model::{ModelLoader, MODEL_FORMAT};
    use veridian_serving::ServingConfig;

    fn write_artifact(weights: Vec<f32>, bias: f32) -> tempfile::NamedTempFile {
        let json = serde_json::to_string(&serde_json::json!({
            "format": MODEL_FORMAT,
            "version": "1.4.2",
            "framework_version": "tensorflow-2.13.0",
            "exported_at": "2025-11-03T10:22:41Z",
            "input_name": "identity_features",
            "output_name": "trust_score",
            "input_dim": TOTAL_FEATURE_DIM,
            "output_dim": 1,
            "weights": weights,
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
            model_path: PathBuf::from("/tmp/model.json"),
            model_version: "1.4.2".to_string(),
            expected_model_hash: None,
            request_timeout: Duration::from_millis(500),
            force_cpu: true,
            seed: 42,
            allow_stub_fallback: true,
            pinned_default_vector_hash: None,
        }
    }

    fn stub_engine(bias: f32) -> (InferenceEngine, tempfile::NamedTempFile) {
        let file = write_artifact(vec![0.0; TOTAL_FEATURE_DIM], bias);
        let artifact = Arc::new(ModelLoader::load(file.path(), TOTAL_FEATURE_DIM, None).unwrap());
        let metrics = Arc::new(InferenceMetrics::new());
        let engine = InferenceEngine::new(config(), artifact, None, metrics).unwrap();
        (engine, file)
    }

    fn unreachable_serving(timeout: Duration) -> Arc<ServingClient> {
        Arc::new(
            ServingClient::new(ServingConfig {
                endpoint: "http://192.0.2.1:1".to_string(),
                model_name: "identity_score".to_string(),
                input_name: "identity_features".to_string(),
                output_name: "trust_score".to_string(),
                timeout,
                retries: 0,
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn happy_path_ramp_vector() {
        let (engine, _file) = stub_engine(72.0);
        let result = engine
            .compute_score(ramp(), false, Some("req-1"))
            .await
            .unwrap();

        assert_eq!(result.score, 72);
        assert_eq!(result.raw_score, 72.0);
        assert_eq!(result.input_hash.len(), 64);
        assert_eq!(result.output_hash.len(), 64);
        assert_eq!(result.endpoint_id, "local_stub");
        assert!(result.reason_codes.contains(&ReasonCode::Success));
        assert_eq!(engine.metrics().successful(), 1);
        assert_eq!(engine.metrics().total(), 1);
    }

    #[tokio::test]
    async fn input_hash_matches_controller_encoding() {
        let (engine, _file) = stub_engine(50.0);
        let input = ramp();
        let expected = hash_hex(&engine.determinism().feature_hash(&input));
        let result = engine.compute_score(input, false, None).await.unwrap();
        assert_eq!(result.input_hash, expected);
    }

    #[tokio::test]
    async fn identical_inputs_yield_identical_hashes() {
        let (engine, _file) = stub_engine(63.0);
        let a = engine.compute_score(ramp(), false, None).await.unwrap();
        let b = engine.compute_score(ramp(), false, None).await.unwrap();
        assert_eq!(a.input_hash, b.input_hash);
        assert_eq!(a.output_hash, b.output_hash);
    }

    #[tokio::test]
    async fn dimension_mismatch_is_invalid_input() {
        let (engine, _file) = stub_engine(50.0);
        let err = engine
            .compute_score(vec![0.0; TOTAL_FEATURE_DIM - 1], false, None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
        assert_eq!(engine.metrics().failed(), 1);
        assert_eq!(engine.metrics().total(), 1);
        assert!(engine.metrics().last_inference_epoch_ms().is_none());
    }

    #[tokio::test]
    async fn non_finite_input_is_invalid_before_hashing() {
        let (engine, _file) = stub_engine(50.0);
        let mut input = ramp();
        input[7] = f32::NAN;
        let err = engine.compute_score(input, false, None).await.unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn confidence_boundaries() {
        // raw 50: distance 0, formula bottoms out at 0.50.
        let (engine, _file) = stub_engine(50.0);
        let result = engine.compute_score(ramp_zeros(), false, None).await.unwrap();
        assert!((result.confidence - 0.50).abs() < 1e-6);

        // raw 0 and raw 100: 0.5 + 0.4 = 0.90, under the 0.95 cap.
        let (engine, _file) = stub_engine(0.0);
        let result = engine.compute_score(ramp_zeros(), false, None).await.unwrap();
        assert!((result.confidence - 0.90).abs() < 1e-6);

        let (engine, _file) = stub_engine(100.0);
        let result = engine.compute_score(ramp_zeros(), false, None).await.unwrap();
        assert!((result.confidence - 0.90).abs() < 1e-6);
    }

    fn ramp_zeros() -> Vec<f32> {
        vec![0.0; TOTAL_FEATURE_DIM]
    }

    #[test]
    fn confidence_floor_never_binds() {
        for raw in 0..=100 {
            let confidence = confidence_for(raw as f32);
            assert!(confidence >= 0.50);
            assert!(confidence <= 0.95);
        }
    }

    #[tokio::test]
    async fn contributions_included_on_request() {
        let (engine, _file) = stub_engine(60.0);
        let with = engine.compute_score(ramp(), true, None).await.unwrap();
        assert!(with.feature_contributions.is_some());
        let without = engine.compute_score(ramp(), false, None).await.unwrap();
        assert!(without.feature_contributions.is_none());
    }

    #[tokio::test]
    async fn reason_codes_for_clean_high_score() {
        let (engine, _file) = stub_engine(95.0);
        let mut input = ramp_zeros();
        input[DOC_OFFSET] = 0.9;
        for pair in 0..OCR_PAIRS {
            input[OCR_OFFSET + 2 * pair] = 0.8;
        }
        input[META_OFFSET] = 0.4;
        let result = engine.compute_score(input, false, None).await.unwrap();
        assert_eq!(
            result.reason_codes,
            vec![ReasonCode::Success, ReasonCode::HighConfidence]
        );
    }

    #[tokio::test]
    async fn serving_failure_falls_back_to_stub() {
        let file = write_artifact(vec![0.0; TOTAL_FEATURE_DIM], 58.0);
        let artifact = Arc::new(ModelLoader::load(file.path(), TOTAL_FEATURE_DIM, None).unwrap());
        let metrics = Arc::new(InferenceMetrics::new());
        let engine = InferenceEngine::new(
            config(),
            artifact,
            Some(unreachable_serving(Duration::from_millis(50))),
            metrics,
        )
        .unwrap();

        let result = engine.compute_score(ramp(), false, None).await.unwrap();
        assert_eq!(result.endpoint_id, "local_stub");
        assert_eq!(result.score, 58);
        assert_eq!(engine.metrics().successful(), 1);
    }

    #[tokio::test]
    async fn serving_failure_without_fallback_is_unavailable() {
        let file = write_artifact(vec![0.0; TOTAL_FEATURE_DIM], 58.0);
        let artifact = Arc::new(ModelLoader::load(file.path(), TOTAL_FEATURE_DIM, None).unwrap());
        let metrics = Arc::new(InferenceMetrics::new());
        let mut cfg = config();
        cfg.allow_stub_fallback = false;
        let engine = InferenceEngine::new(
            cfg,
            artifact,
            Some(unreachable_serving(Duration::from_millis(50))),
            metrics,
        )
        .unwrap();

        let err = engine.compute_score(ramp(), false, None).await.unwrap_err();
        assert_eq!(err.kind(), "UNAVAILABLE");
        assert_eq!(engine.metrics().failed(), 1);
        assert_eq!(engine.metrics().total(), 1);
    }

    #[tokio::test]
    async fn verify_default_vector_passes_idempotently() {
        let (engine, _file) = stub_engine(64.0);
        let first = engine
            .verify_determinism(VerificationInput::Default, None)
            .await
            .unwrap();
        let second = engine
            .verify_determinism(VerificationInput::Default, None)
            .await
            .unwrap();

        assert!(first.passed);
        assert!(second.passed);
        assert_eq!(first.actual_output_hash, second.actual_output_hash);
        assert_eq!(first.test_vector_id.as_deref(), Some("v0"));
        assert_eq!(
            first.expected_output_hash.as_deref(),
            Some(first.actual_output_hash.as_str())
        );
    }

    #[tokio::test]
    async fn verify_named_vector_against_recorded_baseline() {
        let (engine, _file) = stub_engine(64.0);
        let report = engine
            .verify_determinism(VerificationInput::TestVector("v1".to_string()), None)
            .await
            .unwrap();
        assert!(report.passed);
        assert!(report.differences.is_empty());
    }

    #[tokio::test]
    async fn verify_unknown_vector_is_invalid_input() {
        let (engine, _file) = stub_engine(64.0);
        let err = engine
            .verify_determinism(VerificationInput::TestVector("nope".to_string()), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "INVALID_INPUT");
    }

    #[tokio::test]
    async fn verify_mismatched_expectation_reports_difference() {
        let (engine, _file) = stub_engine(64.0);
        let report = engine
            .verify_determinism(
                VerificationInput::Default,
                Some("0".repeat(64)),
            )
            .await
            .unwrap();
        assert!(!report.passed);
        assert_eq!(report.differences.len(), 1);
        assert!(report.differences[0].contains("output_hash"));
    }

    #[tokio::test]
    async fn verify_custom_input_without_expectation_is_neutral_pass() {
        let (engine, _file) = stub_engine(64.0);
        let report = engine
            .verify_determinism(VerificationInput::Custom(ramp()), None)
            .await
            .unwrap();
        assert!(report.passed);
        assert!(report.expected_output_hash.is_none());
        assert_eq!(report.actual_output_hash.len(), 64);
    }

    #[tokio::test]
    async fn verify_does_not_touch_request_counters() {
        let (engine, _file) = stub_engine(64.0);
        engine
            .verify_determinism(VerificationInput::Default, None)
            .await
            .unwrap();
        assert_eq!(engine.metrics().total(), 0);
    }

    #[test]
    fn pinned_default_hash_mismatch_refuses_startup() {
        let file = write_artifact(vec![0.0; TOTAL_FEATURE_DIM], 64.0);
        let artifact = Arc::new(ModelLoader::load(file.path(), TOTAL_FEATURE_DIM, None).unwrap());
        let metrics = Arc::new(InferenceMetrics::new());
        let mut cfg = config();
        cfg.pinned_default_vector_hash = Some("f".repeat(64));
        let err = InferenceEngine::new(cfg, artifact, None, metrics).unwrap_err();
        assert_eq!(err.kind(), "MODEL_INTEGRITY");
    }

    #[test]
    fn replacing_the_model_changes_the_baseline() {
        let file_a = write_artifact(vec![0.0; TOTAL_FEATURE_DIM], 10.0);
        let file_b = write_artifact(vec![0.0; TOTAL_FEATURE_DIM], 90.0);
        let metrics = Arc::new(InferenceMetrics::new());

        let artifact_a =
            Arc::new(ModelLoader::load(file_a.path(), TOTAL_FEATURE_DIM, None).unwrap());
        let artifact_b =
            Arc::new(ModelLoader::load(file_b.path(), TOTAL_FEATURE_DIM, None).unwrap());

        let engine_a =
            InferenceEngine::new(config(), artifact_a, None, metrics.clone()).unwrap();
        let engine_b = InferenceEngine::new(config(), artifact_b, None, metrics).unwrap();

        let baseline = |engine: &InferenceEngine| {
            engine
                .test_vectors()
                .iter()
                .find(|v| v.id == "v0")
                .and_then(|v| v.expected_output_hash.clone())
                .unwrap()
        };
        assert_ne!(baseline(&engine_a), baseline(&engine_b));
    }
}
