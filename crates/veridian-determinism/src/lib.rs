// DETERMINISM CONTROLLER
// Owns the numeric-determinism policy and the canonical hash encoding.
//
// INVARIANTS:
// 1. Same feature vector -> same 32-byte hash on every host
// 2. Canonical encoding is little-endian IEEE-754 f32, index order
// 3. Backend threading is pinned to 1/1, deterministic kernels only
// 4. Policy is immutable after construction and safe to share
//
// The encoding is the contract with the rest of the validator set. Any
// change to element width, endianness, or ordering breaks cross-host
// verification, so it lives here and nowhere else.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ==================== POLICY ====================

/// Fixed set of knobs that make inference reproducible across hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismPolicy {
    /// Random seed exported to the backend
    pub seed: u64,

    /// Refuse GPU execution paths
    pub force_cpu: bool,

    /// Inter-op parallelism (always 1)
    pub inter_op_parallelism: u32,

    /// Intra-op parallelism (always 1)
    pub intra_op_parallelism: u32,

    /// Deterministic kernels only
    pub deterministic_ops: bool,
}

impl DeterminismPolicy {
    pub fn new(seed: u64, force_cpu: bool) -> Self {
        Self {
            seed,
            force_cpu,
            inter_op_parallelism: 1,
            intra_op_parallelism: 1,
            deterministic_ops: true,
        }
    }
}

// ==================== CONTROLLER ====================

/// Immutable after construction; shared read-only by request handlers.
#[derive(Debug, Clone)]
pub struct DeterminismController {
    policy: DeterminismPolicy,
}

impl DeterminismController {
    pub fn new(policy: DeterminismPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &DeterminismPolicy {
        &self.policy
    }

    /// Backend-tuning variables the embedding process applies at startup.
    ///
    /// Advisory: callers must apply an entry only when the variable is not
    /// already set, so operators can override in tests.
    pub fn environment_overrides(&self) -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("OMP_NUM_THREADS".to_string(), "1".to_string());
        vars.insert("TF_NUM_INTEROP_THREADS".to_string(), "1".to_string());
        vars.insert("TF_NUM_INTRAOP_THREADS".to_string(), "1".to_string());
        vars.insert("TF_DETERMINISTIC_OPS".to_string(), "1".to_string());
        vars.insert("TF_CUDNN_DETERMINISTIC".to_string(), "1".to_string());
        vars.insert("PYTHONHASHSEED".to_string(), self.policy.seed.to_string());
        if self.policy.force_cpu {
            vars.insert("CUDA_VISIBLE_DEVICES".to_string(), String::new());
        }
        vars
    }

    /// Canonical hash of a feature vector (commitment to the input).
    pub fn feature_hash(&self, features: &[f32]) -> [u8; 32] {
        hash_f32_le(features)
    }

    /// Canonical hash of a raw output vector (commitment to the output).
    pub fn output_hash(&self, outputs: &[f32]) -> [u8; 32] {
        hash_f32_le(outputs)
    }

    /// Structured record surfaced in ModelInfo.
    pub fn config_summary(&self) -> DeterminismSummary {
        DeterminismSummary {
            seed: self.policy.seed,
            force_cpu: self.policy.force_cpu,
            inter_op_parallelism: self.policy.inter_op_parallelism,
            intra_op_parallelism: self.policy.intra_op_parallelism,
            deterministic_ops: self.policy.deterministic_ops,
        }
    }
}

/// Wire form of the policy, reported by GetModelInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismSummary {
    pub seed: u64,
    pub force_cpu: bool,
    pub inter_op_parallelism: u32,
    pub intra_op_parallelism: u32,
    pub deterministic_ops: bool,
}

// ==================== CANONICAL ENCODING ====================

/// Little-endian IEEE-754 f32 bytes, concatenated in index order.
pub fn canonical_f32_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &val in values {
        bytes.extend_from_slice(&val.to_bits().to_le_bytes());
    }
    bytes
}

fn hash_f32_le(values: &[f32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for &val in values {
        hasher.update(val.to_bits().to_le_bytes());
    }
    hasher.finalize().into()
}

/// Lowercase hex rendering used on every wire surface.
pub fn hash_hex(hash: &[u8; 32]) -> String {
    hex::encode(hash)
}

// ==================== TESTS ====================
