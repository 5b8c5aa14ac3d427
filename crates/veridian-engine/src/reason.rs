// REASON CODES
// Derived purely from the feature vector and the final score/confidence.
// The ordering below is normative for the wire; duplicates are impossible
// because each rule fires at most once.

use crate::features::FeatureVector;
use serde::{Deserialize, Serialize};

/// Stable reason-code vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Success,
    HighConfidence,
    LowConfidence,
    LowDocQuality,
    LowOcrConfidence,
    InsufficientScopes,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::HighConfidence => "HIGH_CONFIDENCE",
            Self::LowConfidence => "LOW_CONFIDENCE",
            Self::LowDocQuality => "LOW_DOC_QUALITY",
            Self::LowOcrConfidence => "LOW_OCR_CONFIDENCE",
            Self::InsufficientScopes => "INSUFFICIENT_SCOPES",
        }
    }
}

/// Appends codes in normative order:
/// score, confidence band, doc quality, OCR values, scope count.
pub fn derive_reason_codes(score: u32, confidence: f32, vec: &FeatureVector) -> Vec<ReasonCode> {
    let mut codes = Vec::new();

    if score >= 50 {
        codes.push(ReasonCode::Success);
    }

    if confidence >= 0.80 {
        codes.push(ReasonCode::HighConfidence);
    } else if confidence < 0.50 {
        codes.push(ReasonCode::LowConfidence);
    }

    if vec.doc_quality() < 0.60 {
        codes.push(ReasonCode::LowDocQuality);
    }

    if vec.ocr_value_mean() < 0.50 {
        codes.push(ReasonCode::LowOcrConfidence);
    }

    if vec.scope_count() < 2 {
        codes.push(ReasonCode::InsufficientScopes);
    }

    codes
}
