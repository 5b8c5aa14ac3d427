// MODEL LOADER + ARTIFACT
// Loads the scoring model from disk, gates on its content hash, and exposes
// the deterministic local execution path used when no serving endpoint is
// reachable.
//
// INVARIANTS:
// 1. Content hash = SHA-256 over the raw artifact bytes
// 2. If an expected hash is configured and differs, loading fails and the
//    process must not become Ready
// 3. The stub forward pass is bit-exact: f32 accumulation in index order,
//    no parallel or fused ops
// 4. The artifact is read-only after load; unload is idempotent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tracing::info;

/// Format tag the loader accepts.
pub const MODEL_FORMAT: &str = "veridian-model/1";

// ==================== ERROR TYPES ====================

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read model artifact {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed model artifact: {0}")]
    Malformed(String),

    #[error("unsupported artifact format: {0}")]
    UnsupportedFormat(String),

    #[error("model declares input_dim {declared}, sidecar expects {expected}")]
    DimensionMismatch { declared: usize, expected: usize },

    #[error("model hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("model is not loaded")]
    NotLoaded,

    #[error("stub expects {expected} features, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

// ==================== MANIFEST ====================

/// On-disk artifact shape. The content hash covers the raw file bytes, so
/// formatting of the manifest is part of the model identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ModelManifest {
    format: String,
    version: String,
    framework_version: String,
    exported_at: DateTime<Utc>,
    input_name: String,
    output_name: String,
    input_dim: usize,
    output_dim: usize,
    weights: Vec<f32>,
    bias: f32,
}

// ==================== ARTIFACT ====================

/// Loaded model: metadata plus the dense-layer parameters for the stub path.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    version: String,
    hash: [u8; 32],
    framework_version: String,
    exported_at: DateTime<Utc>,
    input_name: String,
    output_name: String,
    input_dim: usize,
    output_dim: usize,
    weights: Vec<f32>,
    bias: f32,
    loaded: bool,
}

impl ModelArtifact {
    pub fn version(&self) -> &str {
        &self.version
    }

    /// 32-byte content hash of the artifact file.
    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    pub fn framework_version(&self) -> &str {
        &self.framework_version
    }

    pub fn exported_at(&self) -> DateTime<Utc> {
        self.exported_at
    }

    pub fn input_name(&self) -> &str {
        &self.input_name
    }

    pub fn output_name(&self) -> &str {
        &self.output_name
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Local stub inference. Single dense layer, f32 accumulation in index
    /// order, result clamped to the score range. Same inputs on any host
    /// produce the same bits.
    pub fn run(&self, features: &[f32]) -> Result<Vec<f32>, RunError> {
        if !self.loaded {
            return Err(RunError::NotLoaded);
        }
        if features.len() != self.input_dim {
            return Err(RunError::DimensionMismatch {
                expected: self.input_dim,
                actual: features.len(),
            });
        }

        let mut acc = self.bias;
        for (weight, value) in self.weights.iter().zip(features.iter()) {
            acc += weight * value;
        }
        Ok(vec![acc.clamp(0.0, 100.0)])
    }

    /// Releases the weight buffer. Idempotent; a later `run` fails with
    /// `NotLoaded`.
    pub fn unload(&mut self) {
        self.weights = Vec::new();
        self.loaded = false;
    }
}

// ==================== LOADER ====================

pub struct ModelLoader;

impl ModelLoader {
    /// Read, validate, and hash the artifact at `path`.
    ///
    /// `expected_input_dim` is the feature dimension compiled into the
    /// sidecar; `expected_hash` (lowercase hex), when present, gates startup.
    pub fn load(
        path: &Path,
        expected_input_dim: usize,
        expected_hash: Option<&str>,
    ) -> Result<ModelArtifact, LoadError> {
        let bytes = std::fs::read(path).map_err(|source| LoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let hash: [u8; 32] = {
            let mut hasher = Sha256::new();
            hasher.update(&bytes);
            hasher.finalize().into()
        };
        let hash_hex = hex::encode(hash);

        if let Some(expected) = expected_hash {
            if !expected.eq_ignore_ascii_case(&hash_hex) {
                return Err(LoadError::HashMismatch {
                    expected: expected.to_ascii_lowercase(),
                    actual: hash_hex,
                });
            }
        }

        let manifest: ModelManifest = serde_json::from_slice(&bytes)
            .map_err(|e| LoadError::Malformed(e.to_string()))?;

        if manifest.format != MODEL_FORMAT {
            return Err(LoadError::UnsupportedFormat(manifest.format));
        }
        if manifest.input_dim != expected_input_dim {
            return Err(LoadError::DimensionMismatch {
                declared: manifest.input_dim,
                expected: expected_input_dim,
            });
        }
        if manifest.output_dim != 1 {
            return Err(LoadError::Malformed(format!(
                "output_dim must be 1, got {}",
                manifest.output_dim
            )));
        }
        if manifest.weights.len() != manifest.input_dim {
            return Err(LoadError::Malformed(format!(
                "weight count {} does not match input_dim {}",
                manifest.weights.len(),
                manifest.input_dim
            )));
        }
        if manifest.weights.iter().any(|w| !w.is_finite()) || !manifest.bias.is_finite() {
            return Err(LoadError::Malformed(
                "non-finite weight or bias in artifact".to_string(),
            ));
        }

        info!(
            version = %manifest.version,
            hash = %&hash_hex[..16],
            input_dim = manifest.input_dim,
            framework = %manifest.framework_version,
            "model artifact loaded"
        );

        Ok(ModelArtifact {
            version: manifest.version,
            hash,
            framework_version: manifest.framework_version,
            exported_at: manifest.exported_at,
            input_name: manifest.input_name,
            output_name: manifest.output_name,
            input_dim: manifest.input_dim,
            output_dim: manifest.output_dim,
            weights: manifest.weights,
            bias: manifest.bias,
            loaded: true,
        })
    }
}

// ==================== TESTS ====================
