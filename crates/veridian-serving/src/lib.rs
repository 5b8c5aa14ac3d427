// SERVING CLIENT
// Remote inference over the model server's REST surface.
//
// ERROR CLASSES:
// - Transport: connect/timeout, retryable at the caller's discretion
// - Protocol: malformed response, unexpected status, tensor shape mismatch
// - Backend: an error the model server itself reported
//
// The client performs exactly one attempt per call; fallback policy lives
// in the engine, not here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Endpoint id reported when the in-process stub served the request.
pub const LOCAL_STUB_ENDPOINT: &str = "local_stub";

// ==================== CONFIG ====================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServingConfig {
    /// Base URL of the serving endpoint, e.g. `http://scoring:8501`
    pub endpoint: String,

    /// Model name in the serving registry
    pub model_name: String,

    /// Input tensor name
    pub input_name: String,

    /// Output tensor name
    pub output_name: String,

    /// Per-request deadline
    pub timeout: Duration,

    /// Accepted for operator visibility; the engine policy is one attempt,
    /// so this stays 0.
    pub retries: u32,
}

// ==================== ERROR TYPES ====================

#[derive(Debug, Error)]
pub enum ServingError {
    #[error("transport error contacting {endpoint}: {reason}")]
    Transport { endpoint: String, reason: String },

    #[error("protocol error from {endpoint}: {reason}")]
    Protocol { endpoint: String, reason: String },

    #[error("backend error from {endpoint}: {reason}")]
    Backend { endpoint: String, reason: String },
}

/// Health probe outcome, surfaced in HealthCheck.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServingHealth {
    Healthy,
    Degraded(String),
    Unreachable(String),
}

// ==================== WIRE TYPES ====================

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    inputs: BTreeMap<&'a str, Vec<&'a [f32]>>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    #[serde(default)]
    outputs: BTreeMap<String, Vec<Vec<f32>>>,
    #[serde(default)]
    model_version: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelStatusResponse {
    #[serde(default)]
    model_version_status: Vec<ModelVersionStatus>,
}

#[derive(Debug, Deserialize)]
struct ModelVersionStatus {
    #[serde(default)]
    state: String,
}

/// Result of a remote predict call.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub outputs: Vec<f32>,
    pub endpoint_id: String,
    pub model_version_seen: Option<String>,
}

// ==================== CLIENT ====================

#[derive(Debug)]
pub struct ServingClient {
    config: ServingConfig,
    http: reqwest::Client,
}

impl ServingClient {
    pub fn new(mut config: ServingConfig) -> Result<Self, ServingError> {
        while config.endpoint.ends_with('/') {
            config.endpoint.pop();
        }
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServingError::Transport {
                endpoint: config.endpoint.clone(),
                reason: e.to_string(),
            })?;
        Ok(Self { config, http })
    }

    pub fn endpoint_id(&self) -> &str {
        &self.config.endpoint
    }

    pub fn config(&self) -> &ServingConfig {
        &self.config
    }

    fn predict_url(&self) -> String {
        format!(
            "{}/v1/models/{}:predict",
            self.config.endpoint, self.config.model_name
        )
    }

    fn status_url(&self) -> String {
        format!("{}/v1/models/{}", self.config.endpoint, self.config.model_name)
    }

    /// One predict attempt under the configured deadline.
    pub async fn predict(&self, features: &[f32]) -> Result<Prediction, ServingError> {
        let mut inputs = BTreeMap::new();
        inputs.insert(self.config.input_name.as_str(), vec![features]);
        let request = PredictRequest { inputs };

        let response = self
            .http
            .post(self.predict_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(&e))?;

        if !status.is_success() {
            return Err(self.classify_failure_body(status.as_u16(), &body));
        }

        let parsed: PredictResponse =
            serde_json::from_slice(&body).map_err(|e| ServingError::Protocol {
                endpoint: self.config.endpoint.clone(),
                reason: format!("malformed predict response: {e}"),
            })?;

        let outputs = extract_outputs(&parsed, &self.config.output_name).map_err(|reason| {
            ServingError::Protocol {
                endpoint: self.config.endpoint.clone(),
                reason,
            }
        })?;

        debug!(
            endpoint = %self.config.endpoint,
            outputs = outputs.len(),
            version = ?parsed.model_version,
            "remote predict completed"
        );

        Ok(Prediction {
            outputs,
            endpoint_id: self.config.endpoint.clone(),
            model_version_seen: parsed.model_version,
        })
    }

    /// Probe the model status endpoint.
    pub async fn health(&self) -> ServingHealth {
        let response = match self.http.get(self.status_url()).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(endpoint = %self.config.endpoint, error = %e, "serving health probe unreachable");
                return ServingHealth::Unreachable(e.to_string());
            }
        };

        let status = response.status();
        if !status.is_success() {
            return ServingHealth::Degraded(format!("status endpoint returned {status}"));
        }

        match response.json::<ModelStatusResponse>().await {
            Ok(parsed) => classify_model_status(&parsed),
            Err(e) => ServingHealth::Degraded(format!("malformed status response: {e}")),
        }
    }

    fn transport_error(&self, err: &reqwest::Error) -> ServingError {
        let reason = if err.is_timeout() {
            format!("deadline of {:?} exceeded", self.config.timeout)
        } else {
            err.to_string()
        };
        ServingError::Transport {
            endpoint: self.config.endpoint.clone(),
            reason,
        }
    }

    fn classify_failure_body(&self, status: u16, body: &[u8]) -> ServingError {
        classify_failure(&self.config.endpoint, status, body)
    }
}

// ==================== RESPONSE CLASSIFICATION ====================

/// Non-2xx responses: a serving-reported `{"error": ...}` body is a model
/// problem (Backend); anything else is a broken exchange (Protocol).
fn classify_failure(endpoint: &str, status: u16, body: &[u8]) -> ServingError {
    if let Ok(parsed) = serde_json::from_slice::<PredictResponse>(body) {
        if let Some(message) = parsed.error {
            return ServingError::Backend {
                endpoint: endpoint.to_string(),
                reason: format!("serving rejected request ({status}): {message}"),
            };
        }
    }
    ServingError::Protocol {
        endpoint: endpoint.to_string(),
        reason: format!("unexpected status {status}"),
    }
}

fn extract_outputs(parsed: &PredictResponse, output_name: &str) -> Result<Vec<f32>, String> {
    if let Some(message) = &parsed.error {
        return Err(format!("error field in success response: {message}"));
    }
    let rows = parsed
        .outputs
        .get(output_name)
        .ok_or_else(|| format!("output tensor {output_name:?} missing from response"))?;
    if rows.len() != 1 {
        return Err(format!("expected 1 output row, got {}", rows.len()));
    }
    let row = &rows[0];
    if row.is_empty() {
        return Err("empty output row".to_string());
    }
    if row.iter().any(|v| !v.is_finite()) {
        return Err("non-finite value in output row".to_string());
    }
    Ok(row.clone())
}

fn classify_model_status(parsed: &ModelStatusResponse) -> ServingHealth {
    match parsed.model_version_status.first() {
        Some(version) if version.state == "AVAILABLE" => ServingHealth::Healthy,
        Some(version) => ServingHealth::Degraded(format!("model state {}", version.state)),
        None => ServingHealth::Degraded("no model version reported".to_string()),
    }
}

// ==================== TESTS ====================
