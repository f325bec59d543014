//! Registry holding one loaded classifier per ensemble role

use crate::config::ModelsConfig;
use crate::error::ScoringError;
use crate::models::loader::ModelLoader;
use crate::models::Classifier;
use crate::types::result::ModelRole;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared handle to a loaded model
pub type ModelHandle = Arc<dyn Classifier>;

/// Immutable role → model mapping, built once at startup
#[derive(Clone)]
pub struct ModelRegistry {
    handles: BTreeMap<ModelRole, ModelHandle>,
}

impl ModelRegistry {
    /// Load every role's ONNX artifact.
    ///
    /// Fails with `ModelUnavailable` when any role is missing, unless
    /// `degraded_mode` is set; even then at least one role must load.
    pub fn load(config: &ModelsConfig) -> Result<Self, ScoringError> {
        let loader = match ModelLoader::with_threads(config.onnx_threads) {
            Ok(loader) => loader,
            Err(e) => {
                error!(error = %e, "ONNX Runtime initialization failed");
                return Err(ScoringError::ModelUnavailable {
                    roles: ModelRole::ALL.to_vec(),
                });
            }
        };

        let mut handles: BTreeMap<ModelRole, ModelHandle> = BTreeMap::new();
        let mut missing = Vec::new();
        for role in ModelRole::ALL {
            let path = config.artifact_path(role);
            match loader.load_model(&path, role) {
                Ok(model) => {
                    handles.insert(role, Arc::new(model));
                }
                Err(e) => {
                    error!(role = %role, path = %path.display(), error = %e, "Failed to load model");
                    missing.push(role);
                }
            }
        }

        Self::assemble(handles, missing, config.degraded_mode)
    }

    /// Build a registry from already-constructed classifiers
    pub fn from_handles<I>(handles: I) -> Self
    where
        I: IntoIterator<Item = (ModelRole, ModelHandle)>,
    {
        Self {
            handles: handles.into_iter().collect(),
        }
    }

    /// Apply the full-ensemble / degraded-mode rule to a partial load
    fn assemble(
        handles: BTreeMap<ModelRole, ModelHandle>,
        missing: Vec<ModelRole>,
        degraded_mode: bool,
    ) -> Result<Self, ScoringError> {
        if handles.is_empty() || (!missing.is_empty() && !degraded_mode) {
            return Err(ScoringError::ModelUnavailable { roles: missing });
        }
        if !missing.is_empty() {
            warn!(
                missing = ?missing,
                loaded = handles.len(),
                "Degraded mode: scoring with a partial ensemble"
            );
        }

        info!(count = handles.len(), "Model registry ready");
        Ok(Self { handles })
    }

    pub fn get(&self, role: ModelRole) -> Option<&ModelHandle> {
        self.handles.get(&role)
    }

    /// Loaded roles in aggregation order
    pub fn roles(&self) -> Vec<ModelRole> {
        self.handles.keys().copied().collect()
    }

    /// Roles with no loaded model
    pub fn missing_roles(&self) -> Vec<ModelRole> {
        ModelRole::ALL
            .into_iter()
            .filter(|r| !self.handles.contains_key(r))
            .collect()
    }

    /// Get the number of loaded models
    pub fn model_count(&self) -> usize {
        self.handles.len()
    }

    pub fn is_complete(&self) -> bool {
        self.handles.len() == ModelRole::ALL.len()
    }
}
