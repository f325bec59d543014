//! Hand-off of finished results to downstream collaborators

use crate::error::DispatchError;
use crate::metrics::PipelineMetrics;
use crate::types::result::EnsembleResult;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// A collaborator that accepts finished results (message stream, results log)
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &str;

    async fn deliver(&self, result: &EnsembleResult) -> Result<(), DispatchError>;
}

/// A sink that refused a result
#[derive(Debug)]
pub struct SinkFailure {
    pub sink: String,
    pub error: DispatchError,
}

/// Fans a result out to every configured sink.
///
/// Sinks are best-effort: a failing sink never stops the others and never
/// invalidates the result.
#[derive(Clone, Default)]
pub struct Dispatcher {
    sinks: Vec<Arc<dyn ResultSink>>,
    metrics: Option<Arc<PipelineMetrics>>,
}

impl Dispatcher {
    pub fn new(sinks: Vec<Arc<dyn ResultSink>>) -> Self {
        Self {
            sinks,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn sink_names(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.name()).collect()
    }

    /// Deliver `result` to every sink, returning the ones that failed
    pub async fn dispatch(&self, result: &EnsembleResult) -> Vec<SinkFailure> {
        let deliveries = self.sinks.iter().map(|sink| async move {
            (sink.name().to_string(), sink.deliver(result).await)
        });

        let mut failures = Vec::new();
        for (sink, outcome) in futures::future::join_all(deliveries).await {
            match outcome {
                Ok(()) => debug!(sink = %sink, transaction_id = %result.transaction_id, "Result delivered"),
                Err(e) => {
                    error!(
                        sink = %sink,
                        transaction_id = %result.transaction_id,
                        error = %e,
                        "Dispatch failed"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_dispatch_failure(&sink);
                    }
                    failures.push(SinkFailure { sink, error: e });
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{sample_result, FailingSink, MemorySink};

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let memory = Arc::new(MemorySink::new("memory"));
        let metrics = Arc::new(PipelineMetrics::new());
        let dispatcher = Dispatcher::new(vec![
            Arc::new(FailingSink::new("broken")) as Arc<dyn ResultSink>,
            memory.clone() as Arc<dyn ResultSink>,
        ])
        .with_metrics(metrics.clone());

        let result = sample_result("tx_9", 0.7);
        let failures = dispatcher.dispatch(&result).await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].sink, "broken");
        assert_eq!(memory.results(), vec![result]);
        assert_eq!(metrics.get_dispatch_failures()["broken"], 1);
        assert_eq!(dispatcher.sink_names(), vec!["broken", "memory"]);
    }

    #[tokio::test]
    async fn test_no_sinks() {
        let failures = Dispatcher::default()
            .dispatch(&sample_result("tx", 0.1))
            .await;
        assert!(failures.is_empty());
    }
}
