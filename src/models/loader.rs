//! ONNX model loader and the ONNX-backed classifier

use crate::models::Classifier;
use crate::normalizer::FeatureVector;
use crate::types::result::{ModelRole, ModelScore};
use anyhow::{anyhow, Context, Result};
use ort::memory::Allocator;
use ort::session::{builder::GraphOptimizationLevel, Session, SessionOutputs};
use ort::value::{DowncastableTarget, DynMapValueType, DynSequenceValueType, DynValue, Tensor};
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

/// Pre-fitted classifier exported to ONNX.
///
/// An ONNX Runtime session needs exclusive access while running, so calls on
/// one handle are serialized; different roles still run in parallel.
pub struct OnnxClassifier {
    role: ModelRole,
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
}

impl OnnxClassifier {
    /// Extract `(p_normal, p_fraud)` from the session outputs.
    ///
    /// Handles tensor outputs (`[1, 2]` probabilities) and `seq(map)` outputs
    /// as produced by skl2onnx's ZipMap.
    fn extract_probabilities(&self, outputs: &SessionOutputs) -> Result<(f64, f64)> {
        if let Some(output) = outputs.get(self.output_name.as_str()) {
            if let Some(pair) = self.try_extract(output) {
                return pair;
            }
        }

        // Fallback: first output that is not the label
        for (name, output) in outputs.iter() {
            if name.contains("label") {
                continue;
            }
            if let Some(pair) = self.try_extract(&output) {
                debug!(role = %self.role, output = %name, "Extracted from fallback output");
                return pair;
            }
        }

        Err(anyhow!("no probability output found"))
    }

    fn try_extract(&self, output: &DynValue) -> Option<Result<(f64, f64)>> {
        if let Ok((shape, data)) = output.try_extract_tensor::<f32>() {
            let dims: Vec<i64> = shape.iter().copied().collect();
            return Some(pair_from_tensor(&dims, data));
        }
        let dtype = output.dtype();
        if DynSequenceValueType::can_downcast(&dtype) {
            return Some(self.extract_from_sequence_map(output));
        }
        None
    }

    /// Read class probabilities from `seq(map(int64, float))`
    fn extract_from_sequence_map(&self, output: &DynValue) -> Result<(f64, f64)> {
        let allocator = Allocator::default();

        let sequence = output
            .downcast_ref::<DynSequenceValueType>()
            .map_err(|e| anyhow!("Failed to downcast to sequence: {}", e))?;
        let maps = sequence.try_extract_sequence::<DynMapValueType>(&allocator)?;
        let map_value = maps.first().ok_or_else(|| anyhow!("Empty sequence"))?;
        let kv_pairs = map_value.try_extract_key_values::<i64, f32>()?;

        let class = |id: i64| {
            kv_pairs
                .iter()
                .find(|(class_id, _)| *class_id == id)
                .map(|(_, p)| *p as f64)
        };
        match (class(0), class(1)) {
            (Some(normal), Some(fraud)) => Ok((normal, fraud)),
            (None, Some(fraud)) => Ok((1.0 - fraud, fraud)),
            (Some(normal), None) => Ok((normal, 1.0 - normal)),
            (None, None) => Err(anyhow!("No probability found in map")),
        }
    }
}

impl Classifier for OnnxClassifier {
    fn predict_proba(&self, features: &FeatureVector) -> Result<ModelScore> {
        let values = features.to_f32();
        let shape = vec![1_i64, values.len() as i64];
        let input_tensor =
            Tensor::from_array((shape, values)).context("Failed to create input tensor")?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow!("session lock poisoned: {}", e))?;
        let outputs = session.run(ort::inputs![self.input_name.as_str() => input_tensor])?;
        let (p_normal, p_fraud) = self.extract_probabilities(&outputs)?;

        ModelScore::new(p_normal, p_fraud).map_err(|e| anyhow!(e))
    }

    fn name(&self) -> &str {
        self.role.as_str()
    }
}

/// Probability pair from a dense output tensor
fn pair_from_tensor(dims: &[i64], data: &[f32]) -> Result<(f64, f64)> {
    let classes = dims.last().copied().unwrap_or(0);
    match (classes, data) {
        // [batch, 2] or [2]: class 0 then class 1
        (c, [normal, fraud, ..]) if c >= 2 => Ok((*normal as f64, *fraud as f64)),
        // [batch, 1] or [1]: positive-class probability only
        (1, [fraud, ..]) => Ok((1.0 - *fraud as f64, *fraud as f64)),
        _ => Err(anyhow!("unexpected probability tensor shape {:?}", dims)),
    }
}

/// Loader for ONNX models
pub struct ModelLoader {
    /// Number of threads for ONNX inference
    onnx_threads: usize,
}

impl ModelLoader {
    /// Create a new model loader with specified number of threads
    pub fn with_threads(onnx_threads: usize) -> Result<Self> {
        ort::init().commit()?;
        info!(onnx_threads = onnx_threads, "ONNX Runtime initialized");
        Ok(Self { onnx_threads })
    }

    /// Load the artifact for one role
    pub fn load_model<P: AsRef<Path>>(&self, path: P, role: ModelRole) -> Result<OnnxClassifier> {
        let path = path.as_ref();
        if !path.exists() {
            anyhow::bail!("model file not found: {}", path.display());
        }

        info!(role = %role, path = %path.display(), threads = self.onnx_threads, "Loading ONNX model");

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(self.onnx_threads)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .unwrap_or_else(|| "float_input".to_string());

        let output_name = session
            .outputs
            .iter()
            .find(|o| o.name.contains("prob"))
            .or_else(|| session.outputs.last())
            .map(|o| o.name.clone())
            .unwrap_or_else(|| "probabilities".to_string());

        info!(
            role = %role,
            input = %input_name,
            output = %output_name,
            "Model loaded successfully"
        );

        Ok(OnnxClassifier {
            role,
            session: Mutex::new(session),
            input_name,
            output_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_from_two_class_tensor() {
        let (normal, fraud) = pair_from_tensor(&[1, 2], &[0.25, 0.75]).unwrap();
        assert_eq!(normal, 0.25);
        assert_eq!(fraud, 0.75);
    }

    #[test]
    fn test_pair_from_single_probability() {
        let (normal, fraud) = pair_from_tensor(&[1, 1], &[0.5]).unwrap();
        assert_eq!(normal, 0.5);
        assert_eq!(fraud, 0.5);
    }

    #[test]
    fn test_pair_rejects_empty_tensor() {
        assert!(pair_from_tensor(&[1, 0], &[]).is_err());
        assert!(pair_from_tensor(&[], &[]).is_err());
    }
}
