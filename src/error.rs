//! Error taxonomy for scoring and dispatch

use crate::types::result::ModelRole;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// What is wrong with a single record field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldProblem {
    Missing,
    NotNumeric,
    NotFinite,
    Negative,
    /// Too large for the models' `float` inputs once scaled
    OutOfRange,
    Malformed,
}

impl fmt::Display for FieldProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FieldProblem::Missing => "missing",
            FieldProblem::NotNumeric => "not numeric",
            FieldProblem::NotFinite => "not finite",
            FieldProblem::Negative => "negative",
            FieldProblem::OutOfRange => "out of range",
            FieldProblem::Malformed => "malformed",
        };
        f.write_str(text)
    }
}

/// One offending field in a transaction record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub problem: FieldProblem,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, problem: FieldProblem) -> Self {
        Self {
            field: field.into(),
            problem,
            detail: None,
        }
    }
}

/// A transaction record that cannot be scored.
///
/// Lists every offending field, not just the first one found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub issues: Vec<FieldIssue>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, problem: FieldProblem) -> Self {
        Self {
            issues: vec![FieldIssue::new(field, problem)],
        }
    }

    /// Payload-level failure (not JSON, not an object)
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self {
            issues: vec![FieldIssue {
                field: "payload".to_string(),
                problem: FieldProblem::Malformed,
                detail: Some(reason.into()),
            }],
        }
    }

    /// Names of the offending fields, in the order they were found
    pub fn fields(&self) -> Vec<&str> {
        self.issues.iter().map(|i| i.field.as_str()).collect()
    }

    pub fn mentions(&self, field: &str) -> bool {
        self.issues.iter().any(|i| i.field == field)
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transaction record:")?;
        for (i, issue) in self.issues.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{}{} `{}`", sep, issue.problem, issue.field)?;
            if let Some(detail) = &issue.detail {
                write!(f, " ({})", detail)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

/// A model that failed during inference for one event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoleFailure {
    pub role: ModelRole,
    pub reason: String,
}

/// Errors that move an event to the FAILED state
#[derive(Debug, Clone, Error)]
pub enum ScoringError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("model artifacts unavailable for roles: {}", join_roles(.roles))]
    ModelUnavailable { roles: Vec<ModelRole> },

    #[error("every model failed during inference ({} failures)", .failures.len())]
    ScoringFailed { failures: Vec<RoleFailure> },

    #[error("no model scores available to aggregate")]
    NoModelScores,

    #[error("event processing exceeded {after_ms}ms")]
    Timeout { after_ms: u64 },
}

impl ScoringError {
    /// Stable identifier used in structured responses and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ScoringError::Validation(_) => "validation",
            ScoringError::ModelUnavailable { .. } => "model_unavailable",
            ScoringError::ScoringFailed { .. } => "scoring_failed",
            ScoringError::NoModelScores => "no_model_scores",
            ScoringError::Timeout { .. } => "timeout",
        }
    }

    /// Whether the inbound channel should offer the event again
    pub fn is_redeliverable(&self) -> bool {
        matches!(self, ScoringError::Timeout { .. })
    }
}

fn join_roles(roles: &[ModelRole]) -> String {
    roles
        .iter()
        .map(|r| r.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Failure to hand a finished result to a collaborator
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("publish to `{subject}` failed: {reason}")]
    Publish { subject: String, reason: String },

    #[error("persisting result failed: {0}")]
    Persist(#[from] std::io::Error),

    #[error("result serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
