//! Pipeline runner
//!
//! Pops trace identifiers from the queue and drives each one through
//! analysis and commit. Errors for a single trace are caught at the
//! iteration boundary; the loop only stops on shutdown.
//!
//! # Failure Log Integration
//!
//! When a failure log is attached, traces that fail for reasons other than a
//! missing trace or endpoint are recorded there. A later clean analysis of
//! the same trace clears its record.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::analysis::Analyzer;
use crate::domain::{RiskScore, TraceId};
use crate::infra::{
    AnalysisFailure, AnalysisStore, AnalyzerError, FailureLog, FailureReason, InFlightTracker,
    QueueSource, Result, RetryConfig, ShutdownSignal,
};
use crate::metrics::{metric_names, timed, MetricsRegistry};

use super::Committer;

/// Pipeline runner configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Worker name used in logs
    pub worker_id: String,

    /// First sleep after an empty pop
    pub poll_interval: Duration,

    /// Cap for the idle backoff
    pub max_poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker-0".to_string(),
            poll_interval: Duration::from_millis(100),
            max_poll_interval: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }
}

/// Per-worker statistics
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub processed: u64,
    pub analyzed: u64,
    pub skipped: u64,
    pub failed: u64,
    pub alerts_raised: u64,
    pub commit_retries: u64,
    pub empty_polls: u64,
    pub queue_errors: u64,
}

/// What happened to one popped trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceOutcome {
    /// Committed
    Analyzed {
        trace_id: TraceId,
        alerts_inserted: u64,
        risk_score: RiskScore,
        attempts: u32,
    },
    /// Trace or endpoint missing; nothing written
    Skipped {
        trace_id: Option<TraceId>,
        reason: &'static str,
    },
    /// Analysis or commit failed; nothing written
    Failed {
        trace_id: Option<TraceId>,
        reason: FailureReason,
    },
}

/// A single pipeline worker
pub struct PipelineRunner {
    config: PipelineConfig,
    queue: Arc<dyn QueueSource>,
    store: Arc<dyn AnalysisStore>,
    analyzer: Arc<Analyzer>,
    committer: Arc<Committer>,
    failure_log: Option<Arc<dyn FailureLog>>,
    metrics: Arc<MetricsRegistry>,
    in_flight: Arc<InFlightTracker>,
    stats: RwLock<PipelineStats>,
}

impl PipelineRunner {
    pub fn new(
        config: PipelineConfig,
        queue: Arc<dyn QueueSource>,
        store: Arc<dyn AnalysisStore>,
        analyzer: Arc<Analyzer>,
        committer: Arc<Committer>,
    ) -> Self {
        Self {
            config,
            queue,
            store,
            analyzer,
            committer,
            failure_log: None,
            metrics: Arc::new(MetricsRegistry::new()),
            in_flight: Arc::new(InFlightTracker::new()),
            stats: RwLock::new(PipelineStats::default()),
        }
    }

    /// Record failed traces in a failure log
    pub fn with_failure_log(mut self, failure_log: Arc<dyn FailureLog>) -> Self {
        self.failure_log = Some(failure_log);
        self
    }

    /// Share a metrics registry with other workers
    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share an in-flight tracker with the shutdown coordinator
    pub fn with_in_flight(mut self, in_flight: Arc<InFlightTracker>) -> Self {
        self.in_flight = in_flight;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Get current statistics
    pub async fn stats(&self) -> PipelineStats {
        self.stats.read().await.clone()
    }

    /// Run until the shutdown signal fires
    pub async fn run(&self, shutdown: ShutdownSignal) -> PipelineStats {
        let backoff = RetryConfig::polling(self.config.poll_interval, self.config.max_poll_interval);
        let mut idle_polls: u32 = 0;

        info!(worker = %self.config.worker_id, "Pipeline worker started");

        while !shutdown.is_shutdown() {
            match self.run_once().await {
                Ok(Some(_)) => idle_polls = 0,
                Ok(None) => {
                    let delay = backoff.delay_for_attempt(idle_polls);
                    idle_polls = idle_polls.saturating_add(1);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => break,
                    }
                }
                Err(e) => {
                    warn!(
                        worker = %self.config.worker_id,
                        error = %e,
                        "Queue pop failed"
                    );
                    let delay = backoff.delay_for_attempt(idle_polls);
                    idle_polls = idle_polls.saturating_add(1);

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.wait() => break,
                    }
                }
            }
        }

        let stats = self.stats().await;
        info!(
            worker = %self.config.worker_id,
            processed = stats.processed,
            analyzed = stats.analyzed,
            skipped = stats.skipped,
            failed = stats.failed,
            "Pipeline worker stopped"
        );
        stats
    }

    /// Pop one identifier and process it
    ///
    /// Returns `Ok(None)` when the queue was empty. Only queue failures are
    /// returned as errors; every per-trace failure becomes an outcome.
    pub async fn run_once(&self) -> Result<Option<TraceOutcome>> {
        let trace_id = match self.queue.pop_next().await {
            Ok(Some(trace_id)) => trace_id,
            Ok(None) => {
                self.stats.write().await.empty_polls += 1;
                self.metrics
                    .inc_counter(metric_names::QUEUE_EMPTY_POLLS)
                    .await;
                return Ok(None);
            }
            // The token was consumed; nothing to retry.
            Err(AnalyzerError::InvalidTraceId(token)) => {
                warn!(token = %token, "Discarding invalid queue entry");
                let outcome = TraceOutcome::Failed {
                    trace_id: None,
                    reason: FailureReason::Unknown,
                };
                self.record_outcome(&outcome).await;
                return Ok(Some(outcome));
            }
            Err(e) => {
                self.stats.write().await.queue_errors += 1;
                self.metrics.inc_counter(metric_names::QUEUE_ERRORS).await;
                return Err(e);
            }
        };

        let _guard = self.in_flight.start();
        let outcome = self.handle(trace_id).await;
        self.record_outcome(&outcome).await;
        Ok(Some(outcome))
    }

    /// Analyze and commit one trace
    #[instrument(skip(self), fields(worker = %self.config.worker_id))]
    pub async fn process_trace(&self, trace_id: TraceId) -> Result<TraceOutcome> {
        let trace = self
            .store
            .load_trace(trace_id)
            .await?
            .ok_or(AnalyzerError::TraceNotFound(trace_id))?;
        let endpoint = self
            .store
            .load_endpoint(trace.endpoint_id, true)
            .await?
            .ok_or(AnalyzerError::EndpointNotFound(trace.endpoint_id))?;

        let analysis = timed(&self.metrics, metric_names::ANALYZE_LATENCY, async {
            self.analyzer.analyze(&trace, &endpoint)
        })
        .await?;

        let committed = self.committer.commit(&analysis).await?;

        debug!(
            endpoint_id = %analysis.endpoint_id,
            alerts_inserted = committed.alerts_inserted,
            attempts = committed.attempts,
            "Trace committed"
        );

        Ok(TraceOutcome::Analyzed {
            trace_id,
            alerts_inserted: committed.alerts_inserted,
            risk_score: committed.risk_score,
            attempts: committed.attempts,
        })
    }

    async fn handle(&self, trace_id: TraceId) -> TraceOutcome {
        match self.process_trace(trace_id).await {
            Ok(outcome) => {
                if let Some(failure_log) = &self.failure_log {
                    if let Err(e) = failure_log.clear(trace_id).await {
                        warn!(trace_id = %trace_id, error = %e, "Failed to clear failure record");
                    }
                }
                outcome
            }
            Err(e) if e.is_not_found() => {
                info!(trace_id = %trace_id, reason = e.reason(), "Skipping trace");
                TraceOutcome::Skipped {
                    trace_id: Some(trace_id),
                    reason: e.reason(),
                }
            }
            Err(e) => {
                error!(trace_id = %trace_id, error = %e, "Trace analysis failed");
                self.send_to_failure_log(trace_id, &e).await;
                TraceOutcome::Failed {
                    trace_id: Some(trace_id),
                    reason: FailureReason::from_error(&e),
                }
            }
        }
    }

    async fn send_to_failure_log(&self, trace_id: TraceId, err: &AnalyzerError) {
        if let Some(failure_log) = &self.failure_log {
            if let Err(e) = failure_log.record(AnalysisFailure::new(trace_id, err)).await {
                error!(trace_id = %trace_id, error = %e, "Failed to record analysis failure");
            }
        }
    }

    async fn record_outcome(&self, outcome: &TraceOutcome) {
        {
            let mut stats = self.stats.write().await;
            stats.processed += 1;
            match outcome {
                TraceOutcome::Analyzed {
                    alerts_inserted,
                    attempts,
                    ..
                } => {
                    stats.analyzed += 1;
                    stats.alerts_raised += alerts_inserted;
                    stats.commit_retries += u64::from(attempts.saturating_sub(1));
                }
                TraceOutcome::Skipped { .. } => stats.skipped += 1,
                TraceOutcome::Failed { .. } => stats.failed += 1,
            }
        }

        self.metrics.inc_counter(metric_names::TRACES_PROCESSED).await;
        match outcome {
            TraceOutcome::Analyzed {
                alerts_inserted,
                attempts,
                ..
            } => {
                self.metrics.inc_counter(metric_names::TRACES_ANALYZED).await;
                self.metrics
                    .add_counter(metric_names::ALERTS_RAISED, *alerts_inserted)
                    .await;
                self.metrics
                    .add_counter(
                        metric_names::COMMIT_RETRIES,
                        u64::from(attempts.saturating_sub(1)),
                    )
                    .await;
            }
            TraceOutcome::Skipped { .. } => {
                self.metrics.inc_counter(metric_names::TRACES_SKIPPED).await;
            }
            TraceOutcome::Failed { .. } => {
                self.metrics.inc_counter(metric_names::TRACES_FAILED).await;
            }
        }
    }
}
