//! Fraud Ensemble Library
//!
//! Real-time transaction fraud scoring with a fixed four-model ONNX
//! ensemble: robust feature scaling, parallel inference, mean-probability
//! aggregation and an at-least-once JetStream ingestion path.

pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod ensemble;
pub mod error;
pub mod metrics;
pub mod models;
pub mod normalizer;
pub mod pipeline;
pub mod producer;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use config::AppConfig;
pub use consumer::TransactionConsumer;
pub use ensemble::{DirectResponse, Ensemble};
pub use error::{DispatchError, ScoringError, ValidationError};
pub use models::ModelRegistry;
pub use normalizer::Normalizer;
pub use pipeline::{EventStage, StreamPipeline};
pub use producer::ResultPublisher;
pub use store::ResultStore;
pub use types::{result::EnsembleResult, transaction::TransactionRecord};
