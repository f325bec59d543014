//! The normalize → score → aggregate path, shared by the stream pipeline and
//! direct invocation.

use crate::config::AppConfig;
use crate::error::{FieldIssue, ScoringError};
use crate::metrics::PipelineMetrics;
use crate::models::{Aggregator, EnsembleScorer, ModelRegistry};
use crate::normalizer::Normalizer;
use crate::pipeline::EventStage;
use crate::types::result::EnsembleResult;
use crate::types::transaction::TransactionRecord;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Scoring core: pure with respect to its inputs, so the same record always
/// yields the same result.
#[derive(Clone)]
pub struct Ensemble {
    normalizer: Normalizer,
    registry: Arc<ModelRegistry>,
    scorer: EnsembleScorer,
    aggregator: Aggregator,
}

impl Ensemble {
    pub fn new(
        normalizer: Normalizer,
        registry: Arc<ModelRegistry>,
        scorer: EnsembleScorer,
        aggregator: Aggregator,
    ) -> Self {
        Self {
            normalizer,
            registry,
            scorer,
            aggregator,
        }
    }

    /// Wire the core from configuration around an already loaded registry
    pub fn from_config(
        config: &AppConfig,
        registry: Arc<ModelRegistry>,
        metrics: Option<Arc<PipelineMetrics>>,
    ) -> Self {
        let mut scorer = EnsembleScorer::new(config.pipeline.parallel_models);
        if let Some(metrics) = metrics {
            scorer = scorer.with_metrics(metrics);
        }
        Self::new(
            Normalizer::new(&config.normalization),
            registry,
            scorer,
            Aggregator::from_config(config),
        )
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn threshold(&self) -> f64 {
        self.aggregator.threshold()
    }

    /// Score one record
    pub fn evaluate(&self, record: &TransactionRecord) -> Result<EnsembleResult, ScoringError> {
        self.evaluate_observed(record, |_| {})
    }

    /// Score one record, reporting each stage reached to `on_stage`
    pub fn evaluate_observed(
        &self,
        record: &TransactionRecord,
        mut on_stage: impl FnMut(EventStage),
    ) -> Result<EnsembleResult, ScoringError> {
        let features = self.normalizer.normalize(record)?;
        on_stage(EventStage::Normalized);

        let scores = self.scorer.score(&features, &self.registry)?;
        on_stage(EventStage::Scored);

        let result = self.aggregator.aggregate(record.transaction_id(), &scores)?;
        on_stage(EventStage::Aggregated);

        debug!(
            transaction_id = %result.transaction_id,
            fraud_probability = result.fraud_probability,
            verdict = %result.verdict,
            models_used = result.models_used,
            "Record scored"
        );
        Ok(result)
    }

    /// Direct invocation from a parsed JSON object.
    ///
    /// Never fails: errors come back as a structured response.
    pub fn evaluate_json(&self, value: &Value) -> DirectResponse {
        let outcome = TransactionRecord::from_json_value(value)
            .map_err(ScoringError::from)
            .and_then(|record| self.evaluate(&record));
        DirectResponse::from(outcome)
    }

    /// Direct invocation from raw JSON bytes
    pub fn evaluate_slice(&self, payload: &[u8]) -> DirectResponse {
        let outcome = TransactionRecord::from_json_slice(payload)
            .map_err(ScoringError::from)
            .and_then(|record| self.evaluate(&record));
        DirectResponse::from(outcome)
    }
}

/// Structured error for interactive callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldIssue>,
}

impl From<&ScoringError> for ErrorReport {
    fn from(error: &ScoringError) -> Self {
        let fields = match error {
            ScoringError::Validation(v) => v.issues.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            fields,
        }
    }
}

/// Response of the direct invocation path
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DirectResponse {
    Ok { result: EnsembleResult },
    Error { error: ErrorReport },
}

impl DirectResponse {
    pub fn result(&self) -> Option<&EnsembleResult> {
        match self {
            DirectResponse::Ok { result } => Some(result),
            DirectResponse::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ErrorReport> {
        match self {
            DirectResponse::Ok { .. } => None,
            DirectResponse::Error { error } => Some(error),
        }
    }
}

impl From<Result<EnsembleResult, ScoringError>> for DirectResponse {
    fn from(outcome: Result<EnsembleResult, ScoringError>) -> Self {
        match outcome {
            Ok(result) => DirectResponse::Ok { result },
            Err(e) => DirectResponse::Error {
                error: ErrorReport::from(&e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FieldProblem;
    use crate::testing::{failing_registry, record_json, stub_ensemble, stub_registry};
    use crate::types::result::Verdict;

    #[test]
    fn test_direct_invocation_ok() {
        let ensemble = stub_ensemble(stub_registry());
        let response = ensemble.evaluate_json(&record_json(7));

        let result = response.result().expect("scored");
        assert_eq!(result.models_used, 4);
        assert!((0.0..=1.0).contains(&result.fraud_probability));

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["result"]["verdict"] == "FRAUD" || json["result"]["verdict"] == "NORMAL");
    }

    #[test]
    fn test_direct_invocation_reports_validation_error() {
        let ensemble = stub_ensemble(stub_registry());
        let mut value = record_json(7);
        value.as_object_mut().unwrap().remove("v17");

        let response = ensemble.evaluate_json(&value);
        let error = response.error().expect("validation error");
        assert_eq!(error.kind, "validation");
        assert_eq!(error.fields[0].field, "v17");
        assert_eq!(error.fields[0].problem, FieldProblem::Missing);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"]["fields"][0]["field"], "v17");
    }

    #[test]
    fn test_direct_invocation_reports_scoring_failure() {
        let ensemble = stub_ensemble(failing_registry());
        let response = ensemble.evaluate_json(&record_json(1));

        assert_eq!(response.error().unwrap().kind, "scoring_failed");
    }

    #[test]
    fn test_garbage_bytes() {
        let ensemble = stub_ensemble(stub_registry());
        let response = ensemble.evaluate_slice(b"{not json");
        assert_eq!(response.error().unwrap().kind, "validation");
    }

    #[test]
    fn test_stages_reported_in_order() {
        let ensemble = stub_ensemble(stub_registry());
        let record = TransactionRecord::from_json_value(&record_json(3)).unwrap();

        let mut stages = Vec::new();
        ensemble
            .evaluate_observed(&record, |stage| stages.push(stage))
            .unwrap();
        assert_eq!(
            stages,
            vec![EventStage::Normalized, EventStage::Scored, EventStage::Aggregated]
        );
    }

    #[test]
    fn test_same_record_same_result() {
        let ensemble = stub_ensemble(stub_registry());
        let record = TransactionRecord::from_json_value(&record_json(11)).unwrap();

        let first = ensemble.evaluate(&record).unwrap();
        let second = ensemble.evaluate(&record).unwrap();
        assert_eq!(
            first.fraud_probability.to_bits(),
            second.fraud_probability.to_bits()
        );
        assert_eq!(first, second);
        assert!(matches!(first.verdict, Verdict::Fraud | Verdict::Normal));
    }
}
