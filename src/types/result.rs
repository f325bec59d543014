//! Per-model scores and the aggregated ensemble verdict

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Tolerance for `p_normal + p_fraud == 1`
pub const PROBABILITY_TOLERANCE: f64 = 1e-4;

/// Fixed ensemble roles.
///
/// Declaration order is the aggregation order, so sums are reproducible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    /// Logistic regression
    Linear,
    /// k-nearest neighbours
    Neighbor,
    /// Support vector classifier
    Margin,
    /// Decision tree
    Tree,
}

impl ModelRole {
    pub const ALL: [ModelRole; 4] = [
        ModelRole::Linear,
        ModelRole::Neighbor,
        ModelRole::Margin,
        ModelRole::Tree,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::Linear => "linear",
            ModelRole::Neighbor => "neighbor",
            ModelRole::Margin => "margin",
            ModelRole::Tree => "tree",
        }
    }

    /// Artifact file name used when the configuration does not override it
    pub fn default_artifact(&self) -> &'static str {
        match self {
            ModelRole::Linear => "logistic.onnx",
            ModelRole::Neighbor => "kneighbors.onnx",
            ModelRole::Margin => "svc.onnx",
            ModelRole::Tree => "tree.onnx",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model's class probabilities for one feature vector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelScore {
    pub p_normal: f64,
    pub p_fraud: f64,
}

impl ModelScore {
    /// Validate a probability pair produced by a model
    pub fn new(p_normal: f64, p_fraud: f64) -> Result<Self, String> {
        if !(0.0..=1.0).contains(&p_fraud) || !(0.0..=1.0).contains(&p_normal) {
            return Err(format!(
                "probabilities out of range: p_normal={}, p_fraud={}",
                p_normal, p_fraud
            ));
        }
        if ((p_normal + p_fraud) - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(format!(
                "probabilities do not sum to 1: p_normal={}, p_fraud={}",
                p_normal, p_fraud
            ));
        }
        Ok(Self { p_normal, p_fraud })
    }

    /// Build from a single positive-class probability
    pub fn from_fraud(p_fraud: f64) -> Result<Self, String> {
        Self::new(1.0 - p_fraud, p_fraud)
    }
}

/// What the scorer produced for one role
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoleOutcome {
    Scored {
        #[serde(flatten)]
        score: ModelScore,
        /// This model's own verdict at the ensemble threshold
        #[serde(skip_serializing_if = "Option::is_none", default)]
        verdict: Option<Verdict>,
    },
    Unavailable {
        reason: String,
    },
}

impl RoleOutcome {
    pub fn scored(score: ModelScore) -> Self {
        RoleOutcome::Scored {
            score,
            verdict: None,
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        RoleOutcome::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn score(&self) -> Option<&ModelScore> {
        match self {
            RoleOutcome::Scored { score, .. } => Some(score),
            RoleOutcome::Unavailable { .. } => None,
        }
    }
}

/// Role → outcome mapping, iterated in role order
pub type ScoreBoard = BTreeMap<ModelRole, RoleOutcome>;

/// Binary ensemble decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Fraud,
    Normal,
}

impl Verdict {
    /// Inclusive threshold: a probability equal to the threshold is FRAUD
    pub fn from_probability(probability: f64, threshold: f64) -> Self {
        if probability >= threshold {
            Verdict::Fraud
        } else {
            Verdict::Normal
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Fraud => f.write_str("FRAUD"),
            Verdict::Normal => f.write_str("NORMAL"),
        }
    }
}

/// Aggregated outcome for one transaction record.
///
/// Holds no wall-clock data; scoring the same record twice yields an equal
/// value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleResult {
    /// Source record identifier
    pub transaction_id: String,
    /// Per-role outcomes
    pub model_scores: ScoreBoard,
    /// Combined fraud probability (0.0 - 1.0)
    pub fraud_probability: f64,
    /// Highest single-model fraud probability
    pub max_fraud_probability: f64,
    pub verdict: Verdict,
    /// Threshold the verdict was taken at
    pub threshold: f64,
    /// Number of roles that contributed to the combined probability
    pub models_used: usize,
}

impl EnsembleResult {
    pub fn is_fraud(&self) -> bool {
        self.verdict == Verdict::Fraud
    }

    /// True when fewer than the full ensemble contributed
    pub fn is_degraded(&self) -> bool {
        self.models_used < ModelRole::ALL.len()
    }

    /// Fraud probabilities of the roles that scored, in role order
    pub fn fraud_probabilities(&self) -> Vec<(ModelRole, f64)> {
        self.model_scores
            .iter()
            .filter_map(|(role, outcome)| outcome.score().map(|s| (*role, s.p_fraud)))
            .collect()
    }
}
