//! Performance metrics and statistics tracking for the scoring pipeline.

use crate::types::result::{EnsembleResult, ModelRole};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Metrics collector for pipeline performance
pub struct PipelineMetrics {
    /// Events that reached an ensemble result
    pub events_scored: AtomicU64,
    /// Results with a FRAUD verdict
    pub fraud_verdicts: AtomicU64,
    /// Results produced by fewer than four models
    pub degraded_results: AtomicU64,
    /// Failed events by error kind
    failures_by_kind: RwLock<HashMap<&'static str, u64>>,
    /// Dispatch failures by sink name
    dispatch_failures: RwLock<HashMap<String, u64>>,
    /// Processing times (in microseconds)
    processing_times: RwLock<Vec<u64>>,
    /// Model inference times (in microseconds)
    model_times: RwLock<HashMap<ModelRole, Vec<u64>>>,
    /// Fraud probability distribution buckets
    score_buckets: RwLock<[u64; 10]>,
    /// Start time for rate calculation
    start_time: Instant,
    /// Model agreement tracking (how often models agree)
    model_agreements: RwLock<Vec<f64>>,
}

impl PipelineMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            events_scored: AtomicU64::new(0),
            fraud_verdicts: AtomicU64::new(0),
            degraded_results: AtomicU64::new(0),
            failures_by_kind: RwLock::new(HashMap::new()),
            dispatch_failures: RwLock::new(HashMap::new()),
            processing_times: RwLock::new(Vec::with_capacity(1000)),
            model_times: RwLock::new(HashMap::new()),
            score_buckets: RwLock::new([0; 10]),
            start_time: Instant::now(),
            model_agreements: RwLock::new(Vec::with_capacity(1000)),
        }
    }

    /// Record a scored event
    pub fn record_result(&self, processing_time: Duration, result: &EnsembleResult) {
        self.events_scored.fetch_add(1, Ordering::Relaxed);
        if result.is_fraud() {
            self.fraud_verdicts.fetch_add(1, Ordering::Relaxed);
        }
        if result.is_degraded() {
            self.degraded_results.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut times) = self.processing_times.write() {
            times.push(processing_time.as_micros() as u64);
            // Keep only last 10000 for memory efficiency
            if times.len() > 10000 {
                times.drain(0..5000);
            }
        }

        let bucket = (result.fraud_probability * 10.0).clamp(0.0, 9.0) as usize;
        if let Ok(mut buckets) = self.score_buckets.write() {
            buckets[bucket] += 1;
        }

        self.record_model_agreement(result);
    }

    /// Record an event that ended in FAILED
    pub fn record_failure(&self, kind: &'static str) {
        if let Ok(mut by_kind) = self.failures_by_kind.write() {
            *by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    /// Record a sink that could not take a finished result
    pub fn record_dispatch_failure(&self, sink: &str) {
        if let Ok(mut by_sink) = self.dispatch_failures.write() {
            *by_sink.entry(sink.to_string()).or_insert(0) += 1;
        }
    }

    /// Record model inference time
    pub fn record_model_time(&self, role: ModelRole, duration: Duration) {
        if let Ok(mut times) = self.model_times.write() {
            let role_times = times.entry(role).or_default();
            role_times.push(duration.as_micros() as u64);
            // Keep only last 1000 per model
            if role_times.len() > 1000 {
                role_times.drain(0..500);
            }
        }
    }

    /// Record model agreement (1 - std dev of per-role fraud probabilities)
    fn record_model_agreement(&self, result: &EnsembleResult) {
        let scores: Vec<f64> = result
            .fraud_probabilities()
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        if scores.len() < 2 {
            return;
        }

        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let variance = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / scores.len() as f64;
        let agreement = 1.0 - variance.sqrt().min(1.0);

        if let Ok(mut agreements) = self.model_agreements.write() {
            agreements.push(agreement);
            if agreements.len() > 1000 {
                agreements.drain(0..500);
            }
        }
    }

    /// Get processing time statistics
    pub fn get_processing_stats(&self) -> ProcessingStats {
        let times = self
            .processing_times
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if times.is_empty() {
            return ProcessingStats::default();
        }

        let mut sorted: Vec<u64> = times.clone();
        sorted.sort_unstable();

        let sum: u64 = sorted.iter().sum();
        let count = sorted.len();

        ProcessingStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: percentile(&sorted, 0.50),
            p95_us: percentile(&sorted, 0.95),
            p99_us: percentile(&sorted, 0.99),
            max_us: *sorted.last().unwrap_or(&0),
        }
    }

    /// Get per-role inference stats
    pub fn get_model_stats(&self) -> BTreeMap<ModelRole, ModelStats> {
        let times = self.model_times.read().unwrap_or_else(|e| e.into_inner());
        let mut stats = BTreeMap::new();

        for (role, role_times) in times.iter() {
            if role_times.is_empty() {
                continue;
            }

            let mut sorted: Vec<u64> = role_times.clone();
            sorted.sort_unstable();
            let sum: u64 = sorted.iter().sum();

            stats.insert(
                *role,
                ModelStats {
                    calls: sorted.len() as u64,
                    mean_us: sum / sorted.len() as u64,
                    p50_us: percentile(&sorted, 0.50),
                    p99_us: percentile(&sorted, 0.99),
                },
            );
        }

        stats
    }

    /// Get average model agreement
    pub fn get_avg_agreement(&self) -> f64 {
        let agreements = self
            .model_agreements
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if agreements.is_empty() {
            return 0.0;
        }
        agreements.iter().sum::<f64>() / agreements.len() as f64
    }

    /// Get current throughput (events per second)
    pub fn get_throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.events_scored.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn get_score_distribution(&self) -> [u64; 10] {
        *self.score_buckets.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_failures(&self) -> HashMap<&'static str, u64> {
        self.failures_by_kind
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_dispatch_failures(&self) -> HashMap<String, u64> {
        self.dispatch_failures
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Log summary statistics
    pub fn print_summary(&self) {
        let scored = self.events_scored.load(Ordering::Relaxed);
        let fraud = self.fraud_verdicts.load(Ordering::Relaxed);
        let degraded = self.degraded_results.load(Ordering::Relaxed);
        let fraud_rate = if scored > 0 {
            (fraud as f64 / scored as f64) * 100.0
        } else {
            0.0
        };

        let processing = self.get_processing_stats();
        info!(
            scored,
            fraud,
            degraded,
            fraud_rate = format!("{:.1}%", fraud_rate),
            throughput = format!("{:.1} tx/s", self.get_throughput()),
            mean_us = processing.mean_us,
            p50_us = processing.p50_us,
            p95_us = processing.p95_us,
            p99_us = processing.p99_us,
            agreement = format!("{:.1}%", self.get_avg_agreement() * 100.0),
            "Pipeline metrics"
        );

        let failures = self.get_failures();
        if !failures.is_empty() {
            info!(failures = ?failures, "Failed events by kind");
        }
        let dispatch = self.get_dispatch_failures();
        if !dispatch.is_empty() {
            info!(dispatch_failures = ?dispatch, "Dispatch failures by sink");
        }

        let score_dist = self.get_score_distribution();
        let total: u64 = score_dist.iter().sum();
        if total > 0 {
            for (i, &count) in score_dist.iter().enumerate() {
                let pct = (count as f64 / total as f64) * 100.0;
                let bar: String = "█".repeat(((pct / 2.0) as usize).min(20));
                info!(
                    "  {:.1}-{:.1}: {:>6} ({:>5.1}%) {}",
                    i as f64 / 10.0,
                    (i + 1) as f64 / 10.0,
                    count,
                    pct,
                    bar
                );
            }
        }

        for (role, stats) in &self.get_model_stats() {
            info!(
                role = %role,
                mean_us = stats.mean_us,
                p50_us = stats.p50_us,
                p99_us = stats.p99_us,
                calls = stats.calls,
                "Model inference time"
            );
        }
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
    sorted[idx]
}

/// Processing time statistics
#[derive(Debug, Default)]
pub struct ProcessingStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Per-role inference statistics
#[derive(Debug)]
pub struct ModelStats {
    pub calls: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
}

/// Periodic metrics summary logger
pub struct MetricsReporter {
    metrics: Arc<PipelineMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<PipelineMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::result::{ModelScore, RoleOutcome, ScoreBoard, Verdict};

    fn result(probabilities: &[(ModelRole, f64)], fraud: f64) -> EnsembleResult {
        let model_scores: ScoreBoard = probabilities
            .iter()
            .map(|(r, p)| (*r, RoleOutcome::scored(ModelScore::from_fraud(*p).unwrap())))
            .collect();
        EnsembleResult {
            transaction_id: "tx".to_string(),
            models_used: model_scores.len(),
            model_scores,
            fraud_probability: fraud,
            max_fraud_probability: fraud,
            verdict: Verdict::from_probability(fraud, 0.5),
            threshold: 0.5,
        }
    }

    #[test]
    fn test_metrics_recording() {
        let metrics = PipelineMetrics::new();
        let full: Vec<_> = ModelRole::ALL.iter().map(|r| (*r, 0.2)).collect();

        metrics.record_result(Duration::from_micros(100), &result(&full, 0.2));
        metrics.record_result(
            Duration::from_micros(200),
            &result(&[(ModelRole::Tree, 1.0)], 1.0),
        );
        metrics.record_failure("validation");
        metrics.record_failure("validation");
        metrics.record_dispatch_failure("nats");

        assert_eq!(metrics.events_scored.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.fraud_verdicts.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.degraded_results.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.get_failures()["validation"], 2);
        assert_eq!(metrics.get_dispatch_failures()["nats"], 1);

        let dist = metrics.get_score_distribution();
        assert_eq!(dist[2], 1);
        assert_eq!(dist[9], 1);

        let stats = metrics.get_processing_stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max_us, 200);
    }

    #[test]
    fn test_model_agreement() {
        let metrics = PipelineMetrics::new();
        let close = [
            (ModelRole::Linear, 0.8),
            (ModelRole::Neighbor, 0.82),
            (ModelRole::Margin, 0.79),
        ];
        metrics.record_result(Duration::from_micros(10), &result(&close, 0.8));

        assert!(metrics.get_avg_agreement() > 0.9);
    }

    #[test]
    fn test_model_times() {
        let metrics = PipelineMetrics::new();
        metrics.record_model_time(ModelRole::Margin, Duration::from_micros(40));
        metrics.record_model_time(ModelRole::Margin, Duration::from_micros(60));

        let stats = metrics.get_model_stats();
        assert_eq!(stats[&ModelRole::Margin].calls, 2);
        assert_eq!(stats[&ModelRole::Margin].mean_us, 50);
    }
}
