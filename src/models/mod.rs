//! Ensemble model components

pub mod aggregator;
pub mod loader;
pub mod registry;
pub mod scorer;

use crate::normalizer::FeatureVector;
use crate::types::result::ModelScore;

pub use aggregator::Aggregator;
pub use loader::{ModelLoader, OnnxClassifier};
pub use registry::ModelRegistry;
pub use scorer::EnsembleScorer;

/// A pre-fitted binary classifier.
///
/// Implementations are immutable after loading and may be called from many
/// threads at once.
pub trait Classifier: Send + Sync {
    /// Class probabilities for one feature vector
    fn predict_proba(&self, features: &FeatureVector) -> anyhow::Result<ModelScore>;

    /// Name used in logs
    fn name(&self) -> &str;
}
