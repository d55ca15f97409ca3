use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

pub const DEFAULT_THRESHOLD: f64 = 0.8;

/// Face embedding produced by an external model.
///
/// The dimension is whatever the model emitted; equality of dimensions is
/// only checked when two embeddings are compared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f64>")]
pub struct Embedding(Vec<f64>);

impl Embedding {
    pub fn new(values: Vec<f64>) -> AppResult<Self> {
        if values.is_empty() {
            return Err(AppError::InvalidEmbedding("embedding vector is empty".into()));
        }
        if let Some(idx) = values.iter().position(|value| !value.is_finite()) {
            return Err(AppError::InvalidEmbedding(format!(
                "value at index {idx} is not a finite number"
            )));
        }
        Ok(Self(values))
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<f64> {
        self.0
    }
}

impl AsRef<[f64]> for Embedding {
    fn as_ref(&self) -> &[f64] {
        &self.0
    }
}

impl TryFrom<Vec<f64>> for Embedding {
    type Error = AppError;

    fn try_from(values: Vec<f64>) -> AppResult<Self> {
        Self::new(values)
    }
}

/// Minimum similarity required for a match, always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Threshold(f64);

impl Threshold {
    pub fn new(value: f64) -> AppResult<Self> {
        if !(0.0..=1.0).contains(&value) {
            return Err(AppError::InvalidThreshold(value));
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

impl TryFrom<f64> for Threshold {
    type Error = AppError;

    fn try_from(value: f64) -> AppResult<Self> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_non_finite_vectors() {
        assert!(matches!(
            Embedding::new(Vec::new()),
            Err(AppError::InvalidEmbedding(_))
        ));
        let err = Embedding::new(vec![0.1, f64::NAN, 0.3]).unwrap_err();
        assert!(err.to_string().contains("index 1"));
        assert!(Embedding::new(vec![f64::INFINITY]).is_err());
    }

    #[test]
    fn deserialization_applies_validation() {
        let parsed: Embedding = serde_json::from_str("[0.5, 0.25]").unwrap();
        assert_eq!(parsed.dimension(), 2);
        assert_eq!(serde_json::to_string(&parsed).unwrap(), "[0.5,0.25]");
        assert!(serde_json::from_str::<Embedding>("[]").is_err());
    }

    #[test]
    fn threshold_bounds_are_inclusive() {
        assert_eq!(Threshold::new(0.0).unwrap().value(), 0.0);
        assert_eq!(Threshold::new(1.0).unwrap().value(), 1.0);
        assert!(matches!(
            Threshold::new(1.01),
            Err(AppError::InvalidThreshold(_))
        ));
        assert!(Threshold::new(-0.1).is_err());
        assert!(Threshold::new(f64::NAN).is_err());
        assert_eq!(Threshold::default().value(), DEFAULT_THRESHOLD);
    }
}
