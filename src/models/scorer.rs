//! Multi-model inference over the ensemble registry

use crate::error::{RoleFailure, ScoringError};
use crate::metrics::PipelineMetrics;
use crate::models::registry::{ModelHandle, ModelRegistry};
use crate::normalizer::FeatureVector;
use crate::types::result::{ModelRole, RoleOutcome, ScoreBoard};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, error};

const NOT_LOADED: &str = "model not loaded";

/// Runs one feature vector through every registered model
#[derive(Clone, Default)]
pub struct EnsembleScorer {
    /// Run the models of one event on scoped threads
    parallel: bool,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl EnsembleScorer {
    pub fn new(parallel: bool) -> Self {
        Self {
            parallel,
            metrics: None,
        }
    }

    /// Report per-role inference latency to `metrics`
    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Score `features` with every role.
    ///
    /// A failing model marks only its own role unavailable. Fails with
    /// `ScoringFailed` when no role produced a score.
    pub fn score(
        &self,
        features: &FeatureVector,
        registry: &ModelRegistry,
    ) -> Result<ScoreBoard, ScoringError> {
        let board = if self.parallel {
            self.score_parallel(features, registry)
        } else {
            ModelRole::ALL
                .into_iter()
                .map(|role| (role, self.run_role(role, registry.get(role), features)))
                .collect()
        };

        let failures: Vec<RoleFailure> = board
            .iter()
            .filter_map(|(role, outcome)| match outcome {
                RoleOutcome::Unavailable { reason } => Some(RoleFailure {
                    role: *role,
                    reason: reason.clone(),
                }),
                RoleOutcome::Scored { .. } => None,
            })
            .collect();

        if failures.len() == ModelRole::ALL.len() {
            error!(failures = ?failures, "Every model failed for this event");
            return Err(ScoringError::ScoringFailed { failures });
        }

        Ok(board)
    }

    fn score_parallel(&self, features: &FeatureVector, registry: &ModelRegistry) -> ScoreBoard {
        thread::scope(|scope| {
            let workers: Vec<_> = ModelRole::ALL
                .into_iter()
                .map(|role| {
                    let handle = registry.get(role);
                    (
                        role,
                        scope.spawn(move || self.run_role(role, handle, features)),
                    )
                })
                .collect();

            workers
                .into_iter()
                .map(|(role, worker)| {
                    let outcome = worker
                        .join()
                        .unwrap_or_else(|_| RoleOutcome::unavailable("inference thread panicked"));
                    (role, outcome)
                })
                .collect()
        })
    }

    /// Run a single model, converting every failure into `Unavailable`
    fn run_role(
        &self,
        role: ModelRole,
        handle: Option<&ModelHandle>,
        features: &FeatureVector,
    ) -> RoleOutcome {
        let Some(model) = handle else {
            return RoleOutcome::unavailable(NOT_LOADED);
        };

        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| model.predict_proba(features)));
        if let Some(metrics) = &self.metrics {
            metrics.record_model_time(role, started.elapsed());
        }

        match result {
            Ok(Ok(score)) => {
                debug!(role = %role, p_fraud = score.p_fraud, "Model scored");
                RoleOutcome::scored(score)
            }
            Ok(Err(e)) => {
                error!(role = %role, model = model.name(), error = %e, "Model inference failed");
                RoleOutcome::unavailable(e.to_string())
            }
            Err(_) => {
                error!(role = %role, model = model.name(), "Model inference panicked");
                RoleOutcome::unavailable("model panicked during inference")
            }
        }
    }
}
