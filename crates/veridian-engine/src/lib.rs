// SCORING ENGINE
//
// The orchestrator between the service facade and the execution backends.
// Validates feature vectors, selects remote serving or the local stub,
// derives reason codes and interpretability summaries, and commits to the
// input and output with canonical hashes.
//
// KEY INVARIANTS:
// 1. Every accepted vector has exactly TOTAL_FEATURE_DIM finite elements
// 2. (input_hash, output_hash) is byte-identical across hosts for a fixed
//    (model, vector) pair
// 3. score = clamp(round(raw), 0, 100); confidence in [0.30, 0.95]
// 4. Telemetry is updated exactly once per terminal path

pub mod backend;
pub mod engine;
pub mod error;
pub mod features;
pub mod reason;
pub mod vectors;

pub use backend::{Backend, BackendOutput};
pub use engine::{
    InferenceConfig, InferenceEngine, ScoreResult, VerificationInput, VerificationReport,
};
pub use error::InferenceError;
pub use features::{
    FeatureVector, D_DOC, D_FACE, D_META, D_OCR, TOTAL_FEATURE_DIM,
};
pub use reason::ReasonCode;
pub use vectors::TestVector;
