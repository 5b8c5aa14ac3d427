// BACKEND SELECTION
// The process actually executing the forward pass: a remote serving
// endpoint, the in-process stub, or remote-with-stub-fallback. The variant
// is fixed at startup from the configuration; per-request policy lives in
// `run`.

use crate::error::InferenceError;
use std::sync::Arc;
use tracing::warn;
use veridian_model::{ModelArtifact, RunError};
use veridian_serving::{ServingClient, LOCAL_STUB_ENDPOINT};

/// Raw result of one forward pass, before scoring.
#[derive(Debug, Clone)]
pub struct BackendOutput {
    pub outputs: Vec<f32>,
    pub endpoint_id: String,
    pub model_version_seen: Option<String>,
}

#[derive(Debug)]
pub enum Backend {
    /// Remote serving only; a failure surfaces to the caller.
    Remote(Arc<ServingClient>),

    /// In-process stub only.
    Local(Arc<ModelArtifact>),

    /// Remote serving, falling back to the stub when the remote call fails.
    Both {
        serving: Arc<ServingClient>,
        stub: Arc<ModelArtifact>,
    },
}

impl Backend {
    pub async fn run(&self, features: &[f32]) -> Result<BackendOutput, InferenceError> {
        match self {
            // Without a fallback path a transport failure means the request
            // had no usable backend at all.
            Backend::Remote(serving) => remote(serving, features).await.map_err(|err| match err {
                InferenceError::BackendTransport(reason) => InferenceError::Unavailable(format!(
                    "serving unreachable and stub fallback disabled: {reason}"
                )),
                other => other,
            }),
            Backend::Local(stub) => local(stub, features),
            Backend::Both { serving, stub } => match remote(serving, features).await {
                Ok(output) => Ok(output),
                Err(err) => {
                    warn!(error = %err, "remote serving failed, falling back to local stub");
                    local(stub, features)
                }
            },
        }
    }

    pub fn describes_remote(&self) -> bool {
        matches!(self, Backend::Remote(_) | Backend::Both { .. })
    }

    pub fn serving_client(&self) -> Option<&Arc<ServingClient>> {
        match self {
            Backend::Remote(serving) | Backend::Both { serving, .. } => Some(serving),
            Backend::Local(_) => None,
        }
    }
}

async fn remote(serving: &ServingClient, features: &[f32]) -> Result<BackendOutput, InferenceError> {
    let prediction = serving.predict(features).await?;
    Ok(BackendOutput {
        outputs: prediction.outputs,
        endpoint_id: prediction.endpoint_id,
        model_version_seen: prediction.model_version_seen,
    })
}

fn local(stub: &ModelArtifact, features: &[f32]) -> Result<BackendOutput, InferenceError> {
    let outputs = stub.run(features).map_err(|err| match err {
        RunError::NotLoaded => InferenceError::Unavailable("local stub has no loaded model".to_string()),
        RunError::DimensionMismatch { .. } => InferenceError::Internal(err.to_string()),
    })?;
    Ok(BackendOutput {
        outputs,
        endpoint_id: LOCAL_STUB_ENDPOINT.to_string(),
        model_version_seen: Some(stub.version().to_string()),
    })
}
