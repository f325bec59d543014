//! Score aggregation for the four-model ensemble

use crate::config::AppConfig;
use crate::error::ScoringError;
use crate::types::result::{EnsembleResult, ModelRole, RoleOutcome, ScoreBoard, Verdict};
use std::collections::HashMap;

/// Combines per-role scores into one fraud probability and verdict.
///
/// The combined probability is the weighted mean of the available roles'
/// `p_fraud`, summed in role order. With the default weights of 1.0 this is
/// the plain mean.
#[derive(Debug, Clone)]
pub struct Aggregator {
    /// Per-role weights; roles not listed weigh 1.0
    weights: HashMap<ModelRole, f64>,
    /// Verdict threshold (inclusive)
    threshold: f64,
}

impl Aggregator {
    pub fn new(threshold: f64) -> Self {
        Self {
            weights: HashMap::new(),
            threshold,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            weights: config.models.weights.clone(),
            threshold: config.detection.threshold,
        }
    }

    /// Set weight for a specific role
    pub fn with_weight(mut self, role: ModelRole, weight: f64) -> Self {
        self.weights.insert(role, weight);
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn weight(&self, role: ModelRole) -> f64 {
        self.weights.get(&role).copied().unwrap_or(1.0)
    }

    /// Aggregate a score board into the result for `transaction_id`.
    ///
    /// Unavailable roles are left out of both numerator and denominator.
    /// Fails with `NoModelScores` when nothing contributes.
    pub fn aggregate(
        &self,
        transaction_id: &str,
        scores: &ScoreBoard,
    ) -> Result<EnsembleResult, ScoringError> {
        let mut weighted_sum = 0.0;
        let mut total_weight = 0.0;
        let mut max_fraud: f64 = 0.0;
        let mut models_used = 0;

        // BTreeMap iteration follows ModelRole order
        for (role, outcome) in scores {
            let Some(score) = outcome.score() else {
                continue;
            };
            let weight = self.weight(*role);
            if weight <= 0.0 {
                continue;
            }
            weighted_sum += score.p_fraud * weight;
            total_weight += weight;
            max_fraud = max_fraud.max(score.p_fraud);
            models_used += 1;
        }

        if models_used == 0 {
            return Err(ScoringError::NoModelScores);
        }

        let fraud_probability = (weighted_sum / total_weight).clamp(0.0, 1.0);
        let verdict = Verdict::from_probability(fraud_probability, self.threshold);

        let model_scores = scores
            .iter()
            .map(|(role, outcome)| (*role, self.with_role_verdict(outcome)))
            .collect();

        Ok(EnsembleResult {
            transaction_id: transaction_id.to_string(),
            model_scores,
            fraud_probability,
            max_fraud_probability: max_fraud,
            verdict,
            threshold: self.threshold,
            models_used,
        })
    }

    fn with_role_verdict(&self, outcome: &RoleOutcome) -> RoleOutcome {
        match outcome {
            RoleOutcome::Scored { score, .. } => RoleOutcome::Scored {
                score: *score,
                verdict: Some(Verdict::from_probability(score.p_fraud, self.threshold)),
            },
            unavailable => unavailable.clone(),
        }
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new(0.5)
    }
}
