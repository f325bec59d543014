//! Type definitions for the scoring pipeline

pub mod result;
pub mod transaction;

pub use result::{EnsembleResult, ModelRole, ModelScore, RoleOutcome, ScoreBoard, Verdict};
pub use transaction::TransactionRecord;
