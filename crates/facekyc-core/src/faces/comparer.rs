use serde::Serialize;

use crate::errors::{AppError, AppResult};
use crate::faces::embedding::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Similarity {
    pub score: f64,
    #[serde(rename = "match")]
    pub matched: bool,
    pub threshold: f64,
}

/// Scores `probe` against `reference` and applies `threshold`.
pub fn compare(probe: &[f64], reference: &[f64], threshold: Threshold) -> AppResult<Similarity> {
    if probe.len() != reference.len() {
        return Err(AppError::DimensionMismatch {
            expected: reference.len(),
            found: probe.len(),
        });
    }

    let score = cosine_similarity(probe, reference);
    Ok(Similarity {
        score,
        matched: score >= threshold.value(),
        threshold: threshold.value(),
    })
}

/// Cosine similarity of two equal-length slices.
///
/// Each operand is divided by its largest absolute component first, so the
/// sums stay in range for any finite input. A zero-magnitude operand scores
/// 0.0. The result is clamped to `[-1, 1]` so rounding cannot push it out of
/// range.
pub fn cosine_similarity(lhs: &[f64], rhs: &[f64]) -> f64 {
    let scale_lhs = max_abs(lhs);
    let scale_rhs = max_abs(rhs);
    if scale_lhs == 0.0 || scale_rhs == 0.0 {
        return 0.0;
    }

    let mut dot = 0.0;
    let mut norm_lhs = 0.0;
    let mut norm_rhs = 0.0;

    for (l, r) in lhs.iter().zip(rhs.iter()) {
        let l = l / scale_lhs;
        let r = r / scale_rhs;
        dot += l * r;
        norm_lhs += l * l;
        norm_rhs += r * r;
    }

    // Both norms are at least 1 after scaling. sqrt(a*b) rather than
    // sqrt(a)*sqrt(b): identical operands score exactly 1.0.
    let score = dot / (norm_lhs * norm_rhs).sqrt();
    if score.is_nan() {
        return 0.0;
    }
    score.clamp(-1.0, 1.0)
}

fn max_abs(values: &[f64]) -> f64 {
    values.iter().fold(0.0, |acc: f64, v| acc.max(v.abs()))
}
