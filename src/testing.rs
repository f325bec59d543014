//! Deterministic stand-ins for models, sinks and the inbound channel.
//!
//! Used by unit tests and by the integration tests under `tests/`.

use crate::consumer::{Acknowledger, InboundEvent, InboundStream};
use crate::dispatch::ResultSink;
use crate::ensemble::Ensemble;
use crate::error::DispatchError;
use crate::models::registry::ModelHandle;
use crate::models::{Aggregator, Classifier, EnsembleScorer, ModelRegistry};
use crate::normalizer::FeatureVector;
use crate::types::result::{EnsembleResult, ModelRole, ModelScore, RoleOutcome, Verdict};
use crate::types::transaction::{component_name, RECORD_FIELDS};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Logistic model with fixed per-role weights over the scaled features
pub struct StubClassifier {
    name: String,
    weights: [f64; RECORD_FIELDS],
    bias: f64,
}

impl StubClassifier {
    pub fn for_role(role: ModelRole) -> Self {
        let k = ModelRole::ALL.iter().position(|r| *r == role).unwrap_or(0);
        let mut weights = [0.0; RECORD_FIELDS];
        for (i, w) in weights.iter_mut().enumerate() {
            *w = (((i * 7 + k * 13) % 11) as f64 - 5.0) * 0.08;
        }
        Self {
            name: format!("stub-{}", role),
            weights,
            bias: -1.0 + 0.3 * k as f64,
        }
    }
}

impl Classifier for StubClassifier {
    fn predict_proba(&self, features: &FeatureVector) -> Result<ModelScore> {
        let z = features
            .values()
            .iter()
            .zip(self.weights.iter())
            .fold(self.bias, |acc, (x, w)| acc + x * w);
        let p_fraud = 1.0 / (1.0 + (-z).exp());
        ModelScore::from_fraud(p_fraud).map_err(|e| anyhow!(e))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Always returns the same fraud probability
pub struct FixedClassifier(pub f64);

impl Classifier for FixedClassifier {
    fn predict_proba(&self, _features: &FeatureVector) -> Result<ModelScore> {
        ModelScore::from_fraud(self.0).map_err(|e| anyhow!(e))
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Always errors
pub struct FailingClassifier;

impl Classifier for FailingClassifier {
    fn predict_proba(&self, _features: &FeatureVector) -> Result<ModelScore> {
        Err(anyhow!("inference backend unavailable"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Blocks the calling thread before answering
pub struct SlowClassifier {
    pub delay: Duration,
    pub p_fraud: f64,
}

impl Classifier for SlowClassifier {
    fn predict_proba(&self, _features: &FeatureVector) -> Result<ModelScore> {
        std::thread::sleep(self.delay);
        ModelScore::from_fraud(self.p_fraud).map_err(|e| anyhow!(e))
    }

    fn name(&self) -> &str {
        "slow"
    }
}

fn registry_of<F>(make: F) -> Arc<ModelRegistry>
where
    F: Fn(ModelRole) -> ModelHandle,
{
    Arc::new(ModelRegistry::from_handles(
        ModelRole::ALL.into_iter().map(|role| (role, make(role))),
    ))
}

/// Full ensemble of `StubClassifier`s
pub fn stub_registry() -> Arc<ModelRegistry> {
    registry_of(|role| Arc::new(StubClassifier::for_role(role)) as ModelHandle)
}

/// Full ensemble where every model errors
pub fn failing_registry() -> Arc<ModelRegistry> {
    registry_of(|_| Arc::new(FailingClassifier) as ModelHandle)
}

/// Full ensemble where every model sleeps for `delay`
pub fn slow_registry(delay: Duration) -> Arc<ModelRegistry> {
    registry_of(|_| {
        Arc::new(SlowClassifier {
            delay,
            p_fraud: 0.3,
        }) as ModelHandle
    })
}

/// Registry holding only the given roles, each with a fixed probability
pub fn fixed_registry(scores: &[(ModelRole, f64)]) -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::from_handles(scores.iter().map(|(role, p)| {
        (*role, Arc::new(FixedClassifier(*p)) as ModelHandle)
    })))
}

/// Ensemble with default scaling, parallel scoring and a 0.5 threshold
pub fn stub_ensemble(registry: Arc<ModelRegistry>) -> Ensemble {
    Ensemble::new(
        Default::default(),
        registry,
        EnsembleScorer::new(true),
        Aggregator::default(),
    )
}

/// Pseudo-random but reproducible record JSON for `seed`
pub fn record_json(seed: u64) -> Value {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut object = Map::new();
    object.insert("transaction_id".into(), json!(format!("tx_{:06}", seed)));
    object.insert("amount".into(), json!(rng.gen_range(0.0..500.0)));
    object.insert("time".into(), json!(rng.gen_range(0.0..172_792.0)));
    for i in 0..28 {
        object.insert(component_name(i), json!(rng.gen_range(-3.0..3.0)));
    }
    Value::Object(object)
}

/// Result where every role reported `p_fraud`
pub fn sample_result(transaction_id: &str, p_fraud: f64) -> EnsembleResult {
    let model_scores = ModelRole::ALL
        .into_iter()
        .map(|role| {
            let score = ModelScore {
                p_normal: 1.0 - p_fraud,
                p_fraud,
            };
            (
                role,
                RoleOutcome::Scored {
                    score,
                    verdict: Some(Verdict::from_probability(p_fraud, 0.5)),
                },
            )
        })
        .collect();

    EnsembleResult {
        transaction_id: transaction_id.to_string(),
        model_scores,
        fraud_probability: p_fraud,
        max_fraud_probability: p_fraud,
        verdict: Verdict::from_probability(p_fraud, 0.5),
        threshold: 0.5,
        models_used: ModelRole::ALL.len(),
    }
}

/// Keeps every delivered result in memory
pub struct MemorySink {
    name: String,
    results: Mutex<Vec<EnsembleResult>>,
}

impl MemorySink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            results: Mutex::new(Vec::new()),
        }
    }

    pub fn results(&self) -> Vec<EnsembleResult> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ResultSink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, result: &EnsembleResult) -> Result<(), DispatchError> {
        self.results
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(result.clone());
        Ok(())
    }
}

/// Refuses every result
pub struct FailingSink {
    name: String,
}

impl FailingSink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ResultSink for FailingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, _result: &EnsembleResult) -> Result<(), DispatchError> {
        Err(DispatchError::Publish {
            subject: self.name.clone(),
            reason: "sink unavailable".to_string(),
        })
    }
}

/// Counts acks and naks of in-memory deliveries
#[derive(Clone, Default)]
pub struct AckLedger {
    acked: Arc<AtomicUsize>,
    naked: Arc<AtomicUsize>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    pub fn naked(&self) -> usize {
        self.naked.load(Ordering::SeqCst)
    }

    fn event(&self, payload: Vec<u8>) -> InboundEvent {
        InboundEvent::new(payload, Box::new(LedgerAcker(self.clone())))
    }
}

struct LedgerAcker(AckLedger);

#[async_trait]
impl Acknowledger for LedgerAcker {
    async fn ack(&self) -> Result<()> {
        self.0.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.0.naked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Finite inbound stream over `payloads`
pub fn memory_events(payloads: Vec<Vec<u8>>, ledger: &AckLedger) -> InboundStream {
    let ledger = ledger.clone();
    futures::stream::iter(payloads)
        .map(move |payload| ledger.event(payload))
        .boxed()
}

/// Open-ended inbound stream fed through the returned sender
pub fn event_channel(ledger: &AckLedger) -> (mpsc::UnboundedSender<Vec<u8>>, InboundStream) {
    let (tx, rx) = mpsc::unbounded();
    let ledger = ledger.clone();
    (tx, rx.map(move |payload| ledger.event(payload)).boxed())
}
