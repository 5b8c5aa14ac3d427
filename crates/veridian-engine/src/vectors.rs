// TEST VECTORS
// Compiled-in inputs for determinism verification. Expected output hashes
// are resolved against the loaded model at startup (the output depends on
// the artifact, so they cannot be baked into the binary); `v0` is the
// default vector.

use crate::features::TOTAL_FEATURE_DIM;

pub const DEFAULT_TEST_VECTOR: &str = "v0";

#[derive(Debug, Clone)]
pub struct TestVector {
    pub id: &'static str,
    pub features: Vec<f32>,
    /// Lowercase hex output hash; None until resolved.
    pub expected_output_hash: Option<String>,
}

/// The static table: a ramp, all-zeros, all-ones.
pub fn builtin_vectors() -> Vec<TestVector> {
    vec![
        TestVector {
            id: DEFAULT_TEST_VECTOR,
            features: ramp(),
            expected_output_hash: None,
        },
        TestVector {
            id: "v1",
            features: vec![0.0; TOTAL_FEATURE_DIM],
            expected_output_hash: None,
        },
        TestVector {
            id: "v2",
            features: vec![1.0; TOTAL_FEATURE_DIM],
            expected_output_hash: None,
        },
    ]
}

/// 0.0, 0.1, ..., 1.0, wrapping back to 0.0.
pub fn ramp() -> Vec<f32> {
    (0..TOTAL_FEATURE_DIM)
        .map(|i| ((i % 11) as f32) * 0.1)
        .collect()
}
