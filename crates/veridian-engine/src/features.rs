// FEATURE LAYOUT
// The fixed partition of the flat vector the scoring model consumes.
//
// Layout, in index order:
//   [0,                 D_FACE)                      face embedding
//   [D_FACE,            D_FACE+D_DOC)                document quality, slot 0 = quality score
//   [D_FACE+D_DOC,      D_FACE+D_DOC+D_OCR)          OCR fields, (value, confidence) pairs
//   [D_FACE+D_DOC+D_OCR, TOTAL_FEATURE_DIM)          metadata, slot 0 = scope count / 10

use crate::error::InferenceError;
use std::collections::BTreeMap;

pub const D_FACE: usize = 128;
pub const D_DOC: usize = 16;
pub const D_OCR: usize = 32;
pub const D_META: usize = 8;

pub const TOTAL_FEATURE_DIM: usize = D_FACE + D_DOC + D_OCR + D_META;

pub const FACE_OFFSET: usize = 0;
pub const DOC_OFFSET: usize = D_FACE;
pub const OCR_OFFSET: usize = D_FACE + D_DOC;
pub const META_OFFSET: usize = D_FACE + D_DOC + D_OCR;

/// Number of (value, confidence) pairs in the OCR block.
pub const OCR_PAIRS: usize = D_OCR / 2;

/// Validated per-request feature vector. Immutable once constructed.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector {
    values: Vec<f32>,
}

impl FeatureVector {
    /// Accepts exactly TOTAL_FEATURE_DIM finite floats. Non-finite values
    /// are rejected here, before any hashing.
    pub fn new(values: Vec<f32>) -> Result<Self, InferenceError> {
        if values.len() != TOTAL_FEATURE_DIM {
            return Err(InferenceError::InvalidInput(format!(
                "expected {} features, got {}",
                TOTAL_FEATURE_DIM,
                values.len()
            )));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(InferenceError::InvalidInput(format!(
                "non-finite value at index {idx}"
            )));
        }
        Ok(Self { values })
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    pub fn face_embedding(&self) -> &[f32] {
        &self.values[FACE_OFFSET..FACE_OFFSET + D_FACE]
    }

    pub fn doc_block(&self) -> &[f32] {
        &self.values[DOC_OFFSET..DOC_OFFSET + D_DOC]
    }

    /// Document-quality score, slot 0 of the doc block.
    pub fn doc_quality(&self) -> f32 {
        self.values[DOC_OFFSET]
    }

    pub fn ocr_block(&self) -> &[f32] {
        &self.values[OCR_OFFSET..OCR_OFFSET + D_OCR]
    }

    /// OCR (value, confidence) pairs, stride 2.
    pub fn ocr_pairs(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.ocr_block().chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }

    /// Mean of OCR field values (even offsets within the block).
    pub fn ocr_value_mean(&self) -> f32 {
        let sum: f32 = self.ocr_pairs().map(|(value, _)| value).sum();
        sum / OCR_PAIRS as f32
    }

    pub fn metadata_block(&self) -> &[f32] {
        &self.values[META_OFFSET..META_OFFSET + D_META]
    }

    /// Scope count, stored scaled by 1/10 in metadata slot 0.
    pub fn scope_count(&self) -> i64 {
        (self.values[META_OFFSET] * 10.0).round() as i64
    }
}

// ==================== CONTRIBUTIONS ====================

/// Block-level interpretability summary. Deterministic and bounded-time:
/// one pass per block, BTreeMap keys, no dependence on allocator order.
/// The `contribution_*` entries are |mean|-normalized and sum to 1.0
/// (uniform split when every block mean is zero).
pub fn feature_contributions(vec: &FeatureVector) -> BTreeMap<String, f32> {
    let face_mean = mean(vec.face_embedding());
    let doc_mean = mean(vec.doc_block());
    let ocr_value_mean = vec.ocr_value_mean();
    let ocr_conf_mean = {
        let sum: f32 = vec.ocr_pairs().map(|(_, conf)| conf).sum();
        sum / OCR_PAIRS as f32
    };
    let meta_mean = mean(vec.metadata_block());

    // Dominant OCR field: highest value, lowest pair index on ties, so the
    // result is stable under permutation of identical values.
    let mut dominant_field = 0usize;
    let mut dominant_value = f32::NEG_INFINITY;
    for (idx, (value, _)) in vec.ocr_pairs().enumerate() {
        if value > dominant_value {
            dominant_value = value;
            dominant_field = idx;
        }
    }

    let weights = [
        face_mean.abs(),
        doc_mean.abs(),
        ocr_value_mean.abs(),
        meta_mean.abs(),
    ];
    let total: f32 = weights.iter().sum();
    let shares: [f32; 4] = if total > 0.0 {
        [
            weights[0] / total,
            weights[1] / total,
            weights[2] / total,
            weights[3] / total,
        ]
    } else {
        [0.25; 4]
    };

    let mut out = BTreeMap::new();
    out.insert("face_embedding_mean".to_string(), face_mean);
    out.insert("doc_quality_mean".to_string(), doc_mean);
    out.insert("doc_quality_score".to_string(), vec.doc_quality());
    out.insert("ocr_value_mean".to_string(), ocr_value_mean);
    out.insert("ocr_confidence_mean".to_string(), ocr_conf_mean);
    out.insert("metadata_mean".to_string(), meta_mean);
    out.insert("dominant_ocr_field".to_string(), dominant_field as f32);
    out.insert("scope_count".to_string(), vec.scope_count() as f32);
    out.insert("contribution_face_embedding".to_string(), shares[0]);
    out.insert("contribution_doc_quality".to_string(), shares[1]);
    out.insert("contribution_ocr_fields".to_string(), shares[2]);
    out.insert("contribution_metadata".to_string(), shares[3]);
    out
}

fn mean(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let sum: f32 = values.iter().sum();
    sum / values.len() as f32
}

// ==================== TESTS ====================
