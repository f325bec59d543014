//! Streaming pipeline: bounded, concurrent processing of inbound events

use crate::config::PipelineConfig;
use crate::consumer::InboundEvent;
use crate::dispatch::Dispatcher;
use crate::ensemble::Ensemble;
use crate::error::{RoleFailure, ScoringError};
use crate::metrics::PipelineMetrics;
use crate::types::result::EnsembleResult;
use crate::types::transaction::TransactionRecord;
use futures::{Stream, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Lifecycle of one inbound event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventStage {
    Received = 0,
    Normalized = 1,
    Scored = 2,
    Aggregated = 3,
    Dispatched = 4,
    Failed = 5,
}

impl EventStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStage::Received => "RECEIVED",
            EventStage::Normalized => "NORMALIZED",
            EventStage::Scored => "SCORED",
            EventStage::Aggregated => "AGGREGATED",
            EventStage::Dispatched => "DISPATCHED",
            EventStage::Failed => "FAILED",
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => EventStage::Normalized,
            2 => EventStage::Scored,
            3 => EventStage::Aggregated,
            4 => EventStage::Dispatched,
            5 => EventStage::Failed,
            _ => EventStage::Received,
        }
    }
}

impl fmt::Display for EventStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of one event
#[derive(Debug)]
pub enum EventOutcome {
    Dispatched {
        result: EnsembleResult,
        /// Sinks that refused the result
        sink_failures: usize,
    },
    Failed {
        /// Last stage completed before the failure
        last_stage: EventStage,
        error: ScoringError,
    },
}

impl EventOutcome {
    /// Terminal stage: DISPATCHED or FAILED
    pub fn stage(&self) -> EventStage {
        match self {
            EventOutcome::Dispatched { .. } => EventStage::Dispatched,
            EventOutcome::Failed { .. } => EventStage::Failed,
        }
    }

    pub fn result(&self) -> Option<&EnsembleResult> {
        match self {
            EventOutcome::Dispatched { result, .. } => Some(result),
            EventOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&ScoringError> {
        match self {
            EventOutcome::Dispatched { .. } => None,
            EventOutcome::Failed { error, .. } => Some(error),
        }
    }

    /// Timed-out events go back to the channel; everything else is settled
    pub fn should_redeliver(&self) -> bool {
        self.error().is_some_and(ScoringError::is_redeliverable)
    }
}

/// Totals for one `run` of the pipeline
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub received: u64,
    pub dispatched: u64,
    pub failed: u64,
    pub redelivery_requested: u64,
    pub sink_failures: u64,
}

impl PipelineSummary {
    fn settle(&mut self, outcome: &EventOutcome) {
        match outcome {
            EventOutcome::Dispatched { sink_failures, .. } => {
                self.dispatched += 1;
                self.sink_failures += *sink_failures as u64;
            }
            EventOutcome::Failed { .. } => {
                self.failed += 1;
                if outcome.should_redeliver() {
                    self.redelivery_requested += 1;
                }
            }
        }
    }
}

/// Drives inbound events through the ensemble and out to the sinks
#[derive(Clone)]
pub struct StreamPipeline {
    ensemble: Arc<Ensemble>,
    dispatcher: Dispatcher,
    metrics: Arc<PipelineMetrics>,
    workers: usize,
    timeout: Duration,
    /// Held by each blocking scoring task until it returns, even past its timeout
    inference: Arc<Semaphore>,
}

impl StreamPipeline {
    pub fn new(
        ensemble: Arc<Ensemble>,
        dispatcher: Dispatcher,
        metrics: Arc<PipelineMetrics>,
        config: &PipelineConfig,
    ) -> Self {
        let workers = config.workers.max(1);
        Self {
            ensemble,
            dispatcher,
            metrics,
            workers,
            timeout: config.timeout(),
            inference: Arc::new(Semaphore::new(workers)),
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.metrics
    }

    /// Take one raw payload from RECEIVED to DISPATCHED or FAILED
    pub async fn process_payload(&self, payload: &[u8]) -> EventOutcome {
        let start = Instant::now();

        let record = match TransactionRecord::from_json_slice(payload) {
            Ok(record) => record,
            Err(e) => return self.fail(EventStage::Received, e.into(), None),
        };
        let transaction_id = record.transaction_id().to_string();

        let result = match self.score_within_budget(record).await {
            Ok(result) => result,
            Err((last_stage, e)) => return self.fail(last_stage, e, Some(&transaction_id)),
        };
        self.metrics.record_result(start.elapsed(), &result);

        let sink_failures = self.dispatcher.dispatch(&result).await.len();
        debug!(
            transaction_id = %result.transaction_id,
            stage = %EventStage::Dispatched,
            sink_failures,
            "Event processed"
        );

        EventOutcome::Dispatched {
            result,
            sink_failures,
        }
    }

    /// Run scoring on the blocking pool under the per-event timeout.
    ///
    /// Waiting for an inference slot counts against the timeout. A timed-out
    /// task keeps its slot until the models return. On failure also returns
    /// the last stage the event completed.
    async fn score_within_budget(
        &self,
        record: TransactionRecord,
    ) -> Result<EnsembleResult, (EventStage, ScoringError)> {
        let progress = Arc::new(AtomicU8::new(EventStage::Received as u8));
        let tracker = progress.clone();
        let ensemble = self.ensemble.clone();
        let inference = self.inference.clone();

        let task = async move {
            // The semaphore is never closed
            let slot = inference.acquire_owned().await.ok();
            tokio::task::spawn_blocking(move || {
                let _slot = slot;
                ensemble.evaluate_observed(&record, |stage| {
                    tracker.store(stage as u8, Ordering::Release)
                })
            })
            .await
        };
        let last_stage = || EventStage::from_u8(progress.load(Ordering::Acquire));

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err((last_stage(), e)),
            Ok(Err(join_error)) => {
                let failures = self
                    .ensemble
                    .registry()
                    .roles()
                    .into_iter()
                    .map(|role| RoleFailure {
                        role,
                        reason: format!("scoring task aborted: {}", join_error),
                    })
                    .collect();
                Err((last_stage(), ScoringError::ScoringFailed { failures }))
            }
            Err(_) => Err((
                last_stage(),
                ScoringError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                },
            )),
        }
    }

    fn fail(
        &self,
        last_stage: EventStage,
        error: ScoringError,
        transaction_id: Option<&str>,
    ) -> EventOutcome {
        self.metrics.record_failure(error.kind());
        warn!(
            transaction_id = transaction_id.unwrap_or("-"),
            stage = %last_stage,
            kind = error.kind(),
            error = %error,
            "Event failed"
        );
        EventOutcome::Failed { last_stage, error }
    }

    /// Process one delivery and settle it with the channel
    async fn handle_event(&self, event: InboundEvent) -> EventOutcome {
        if let Some(attempt) = event.delivery_attempt.filter(|a| *a > 1) {
            debug!(attempt, "Processing redelivered event");
        }

        let outcome = self.process_payload(&event.payload).await;

        let settled = if outcome.should_redeliver() {
            event.acker.nak().await
        } else {
            event.acker.ack().await
        };
        if let Err(e) = settled {
            error!(error = %e, stage = %outcome.stage(), "Failed to settle delivery");
        }
        outcome
    }

    /// Block until no scoring task, including timed-out ones, is running
    async fn wait_for_inference(&self) {
        let running = self.workers.saturating_sub(self.inference.available_permits());
        if running > 0 {
            info!(running, "Waiting for abandoned scoring tasks");
        }
        if let Ok(all) = self.inference.acquire_many(self.workers as u32).await {
            drop(all);
        }
    }

    /// Consume `events` until the stream ends or a shutdown signal arrives.
    ///
    /// At most `workers` events are in flight. On shutdown no further events
    /// are pulled and in-flight events are drained before returning. Any
    /// change on `shutdown`, or dropping its sender, counts as the signal.
    pub async fn run<S>(&self, mut events: S, mut shutdown: watch::Receiver<bool>) -> PipelineSummary
    where
        S: Stream<Item = InboundEvent> + Unpin + Send,
    {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut in_flight: JoinSet<EventOutcome> = JoinSet::new();
        let mut summary = PipelineSummary::default();

        info!(workers = self.workers, timeout_ms = self.timeout.as_millis() as u64, "Pipeline started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = events.next() => match next {
                    Some(event) => event,
                    None => {
                        info!("Inbound stream closed");
                        break;
                    }
                },
            };

            summary.received += 1;
            let pipeline = self.clone();
            in_flight.spawn(async move {
                let outcome = pipeline.handle_event(event).await;
                drop(permit);
                outcome
            });

            while let Some(done) = in_flight.try_join_next() {
                settle(&mut summary, done);
            }
        }

        info!(in_flight = in_flight.len(), "Stopped accepting events, draining");
        while let Some(done) = in_flight.join_next().await {
            settle(&mut summary, done);
        }
        self.wait_for_inference().await;

        info!(
            received = summary.received,
            dispatched = summary.dispatched,
            failed = summary.failed,
            redelivery_requested = summary.redelivery_requested,
            "Pipeline drained"
        );
        summary
    }
}

fn settle(summary: &mut PipelineSummary, done: Result<EventOutcome, tokio::task::JoinError>) {
    match done {
        Ok(outcome) => summary.settle(&outcome),
        Err(e) => {
            error!(error = %e, "Event task aborted");
            summary.failed += 1;
        }
    }
}
