//! Feature normalization for model inference.
//!
//! Reproduces the scaling applied when the ensemble was trained: `amount`
//! and `time` go through a robust scaler with frozen statistics, the PCA
//! components pass through untouched.

use crate::config::{NormalizationConfig, ScalingStats};
use crate::error::{FieldIssue, FieldProblem, ValidationError};
use crate::types::transaction::{component_name, TransactionRecord, RECORD_FIELDS};

/// Feature names in the exact order the models were trained on
pub const FEATURE_NAMES: [&str; RECORD_FIELDS] = [
    "amount", "time", "v1", "v2", "v3", "v4", "v5", "v6", "v7", "v8", "v9", "v10", "v11", "v12",
    "v13", "v14", "v15", "v16", "v17", "v18", "v19", "v20", "v21", "v22", "v23", "v24", "v25",
    "v26", "v27", "v28",
];

/// Normalized model input.
///
/// Fixed width, so a vector with the wrong number of columns cannot exist.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector {
    values: [f64; RECORD_FIELDS],
}

impl FeatureVector {
    pub fn values(&self) -> &[f64; RECORD_FIELDS] {
        &self.values
    }

    /// Values converted for ONNX `float` inputs
    pub fn to_f32(&self) -> Vec<f32> {
        self.values.iter().map(|&v| v as f32).collect()
    }
}

/// Robust scaler applying `(x - median) / iqr`
#[derive(Debug, Clone, Copy)]
pub struct RobustScaler {
    median: f64,
    iqr: f64,
}

impl RobustScaler {
    pub fn new(stats: ScalingStats) -> Self {
        Self {
            median: stats.median,
            iqr: stats.iqr,
        }
    }

    pub fn transform(&self, x: f64) -> f64 {
        (x - self.median) / self.iqr
    }
}

/// Turns transaction records into model inputs
#[derive(Debug, Clone)]
pub struct Normalizer {
    amount: RobustScaler,
    time: RobustScaler,
}

impl Normalizer {
    pub fn new(config: &NormalizationConfig) -> Self {
        Self {
            amount: RobustScaler::new(config.amount),
            time: RobustScaler::new(config.time),
        }
    }

    /// Normalize a record into the training-time feature layout
    pub fn normalize(&self, record: &TransactionRecord) -> Result<FeatureVector, ValidationError> {
        let raw = record.values();
        let issues: Vec<FieldIssue> = raw
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_finite())
            .map(|(i, _)| FieldIssue::new(field_name(i), FieldProblem::NotFinite))
            .collect();
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }

        let mut values = raw;
        values[0] = self.amount.transform(raw[0]);
        values[1] = self.time.transform(raw[1]);

        // Every value must survive the narrowing to f32
        let issues: Vec<FieldIssue> = values
            .iter()
            .enumerate()
            .filter(|(_, v)| !(**v as f32).is_finite())
            .map(|(i, _)| FieldIssue::new(field_name(i), FieldProblem::OutOfRange))
            .collect();
        if !issues.is_empty() {
            return Err(ValidationError { issues });
        }

        Ok(FeatureVector { values })
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(&NormalizationConfig::default())
    }
}

fn field_name(i: usize) -> String {
    match i {
        0 => "amount".to_string(),
        1 => "time".to_string(),
        _ => component_name(i - 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::transaction::PCA_COMPONENTS;

    fn record(amount: f64, time: f64) -> TransactionRecord {
        let mut components = [0.0; PCA_COMPONENTS];
        for (i, c) in components.iter_mut().enumerate() {
            *c = (i as f64 - 14.0) / 7.0;
        }
        TransactionRecord::new(None, amount, time, components).unwrap()
    }

    #[test]
    fn test_robust_scaling() {
        let normalizer = Normalizer::default();
        let features = normalizer.normalize(&record(22.0, 84692.0 + 85119.0)).unwrap();

        assert_eq!(features.values()[0], 0.0);
        assert_eq!(features.values()[1], 1.0);
    }

    #[test]
    fn test_components_pass_through() {
        let normalizer = Normalizer::default();
        let rec = record(100.0, 3600.0);
        let features = normalizer.normalize(&rec).unwrap();

        assert_eq!(&features.values()[2..], &rec.components()[..]);
        assert_eq!(features.values()[2], rec.components()[0]);
        assert_eq!(features.values()[RECORD_FIELDS - 1], rec.components()[27]);
    }

    #[test]
    fn test_feature_layout() {
        assert_eq!(FEATURE_NAMES.len(), 30);
        for i in 0..RECORD_FIELDS {
            assert_eq!(FEATURE_NAMES[i], field_name(i));
        }
    }

    #[test]
    fn test_non_finite_rejected() {
        let mut components = [0.0; PCA_COMPONENTS];
        components[16] = f64::NAN;

        let err = TransactionRecord::new(None, 10.0, 10.0, components).unwrap_err();
        assert_eq!(err.fields(), vec!["v17"]);
    }

    #[test]
    fn test_values_beyond_f32_rejected() {
        let normalizer = Normalizer::default();

        let err = normalizer.normalize(&record(1e41, 3600.0)).unwrap_err();
        assert_eq!(err.fields(), vec!["amount"]);
        assert_eq!(err.issues[0].problem, FieldProblem::OutOfRange);

        let err = normalizer.normalize(&record(10.0, -1e45)).unwrap_err();
        assert_eq!(err.fields(), vec!["time"]);

        let features = normalizer.normalize(&record(1e30, 3600.0)).unwrap();
        assert!(features.to_f32().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_normalization_is_deterministic() {
        let normalizer = Normalizer::default();
        let a = normalizer.normalize(&record(123.45, 4000.0)).unwrap();
        let _ = normalizer.normalize(&record(9.0, 1.0)).unwrap();
        let b = normalizer.normalize(&record(123.45, 4000.0)).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.to_f32().len(), RECORD_FIELDS);
    }
}
