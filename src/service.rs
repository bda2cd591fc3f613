//! Worker service bootstrap for the trace analyzer.
//!
//! This module wires together:
//! - configuration
//! - database connection pool and migrations
//! - the Redis trace queue
//! - a pool of pipeline workers and their shutdown coordinator

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::analysis::{Analyzer, AnalyzerConfig, ClassifierConfig, RiskPolicy};
use crate::infra::{
    shutdown_signal, AnalysisStore, AnalyzerError, FailureLog, PgAnalysisStore, PgFailureLog,
    QueueSource, RedisTraceQueue, ShutdownCoordinator, DEFAULT_QUEUE_KEY,
};
use crate::metrics::MetricsRegistry;
use crate::pipeline::{Committer, PipelineConfig, PipelineRunner, DEFAULT_MAX_ATTEMPTS};
use crate::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL.
    pub database_url: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// List key traces are queued under.
    pub queue_key: String,
    /// Number of concurrent pipeline workers.
    pub worker_count: usize,
    /// Maximum database connections.
    pub max_connections: u32,
    pub migrate_on_startup: bool,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    /// Commit attempts per trace, the first one included.
    pub commit_max_attempts: u32,
    pub max_payload_depth: usize,
    /// How long shutdown waits for in-flight traces.
    pub shutdown_drain: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let parsed_u32 = |key: &str| parsed(key).and_then(|v| u32::try_from(v).ok());
        let parsed_usize = |key: &str| parsed(key).and_then(|v| usize::try_from(v).ok());

        let migrate_on_startup = lookup("DB_MIGRATE_ON_STARTUP")
            .map(|v| {
                !matches!(
                    v.trim().to_ascii_lowercase().as_str(),
                    "0" | "false" | "off"
                )
            })
            .unwrap_or(true);

        Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgres://localhost/trace_analyzer".to_string()),
            redis_url: lookup("REDIS_URL").unwrap_or_else(|| "redis://127.0.0.1/".to_string()),
            queue_key: lookup("TRACES_QUEUE_KEY").unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string()),
            worker_count: parsed_usize("WORKER_COUNT").unwrap_or(2),
            max_connections: parsed_u32("MAX_DB_CONNECTIONS").unwrap_or(10),
            migrate_on_startup,
            poll_interval: Duration::from_millis(parsed("ANALYZER_POLL_INTERVAL_MS").unwrap_or(100)),
            max_poll_interval: Duration::from_millis(
                parsed("ANALYZER_MAX_POLL_INTERVAL_MS").unwrap_or(2000),
            ),
            commit_max_attempts: parsed_u32("ANALYZER_COMMIT_MAX_ATTEMPTS")
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            max_payload_depth: parsed_usize("ANALYZER_MAX_PAYLOAD_DEPTH").unwrap_or(64),
            shutdown_drain: Duration::from_secs(
                parsed("ANALYZER_SHUTDOWN_DRAIN_SECS").unwrap_or(30),
            ),
        }
    }

    /// Reject settings the workers cannot run with
    pub fn validate(&self) -> Result<(), AnalyzerError> {
        if self.worker_count == 0 {
            return Err(AnalyzerError::Configuration(
                "WORKER_COUNT must be at least 1".into(),
            ));
        }
        if self.commit_max_attempts == 0 {
            return Err(AnalyzerError::Configuration(
                "ANALYZER_COMMIT_MAX_ATTEMPTS must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(AnalyzerError::Configuration(
                "ANALYZER_POLL_INTERVAL_MS must be positive".into(),
            ));
        }
        if self.max_payload_depth == 0 {
            return Err(AnalyzerError::Configuration(
                "ANALYZER_MAX_PAYLOAD_DEPTH must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            classifier: ClassifierConfig {
                max_depth: self.max_payload_depth,
                ..ClassifierConfig::default()
            },
            risk: RiskPolicy::default(),
        }
    }

    pub fn pipeline_config(&self, worker: usize) -> PipelineConfig {
        PipelineConfig {
            worker_id: format!("worker-{worker}"),
            poll_interval: self.poll_interval,
            max_poll_interval: self.max_poll_interval,
        }
    }
}

/// Start the analyzer workers and run until SIGINT/SIGTERM.
pub async fn run() -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::from_env())?;

    info!("Starting trace analyzer v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env();
    config.validate()?;
    info!(
        workers = config.worker_count,
        queue_key = %config.queue_key,
        max_connections = config.max_connections,
        commit_max_attempts = config.commit_max_attempts,
        "Configuration loaded"
    );

    info!("Connecting to PostgreSQL...");
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await?;
    info!("Connected to PostgreSQL");

    if config.migrate_on_startup {
        info!("Running database migrations...");
        crate::migrations::run_postgres(&pool).await?;
        info!("Database migrations applied");
    } else {
        info!("DB migrations skipped (DB_MIGRATE_ON_STARTUP=0)");
    }

    let queue: Arc<dyn QueueSource> =
        Arc::new(RedisTraceQueue::connect(&config.redis_url, config.queue_key.clone()).await?);
    let store: Arc<dyn AnalysisStore> = Arc::new(PgAnalysisStore::new(pool.clone()));
    let failure_log: Arc<dyn FailureLog> = Arc::new(PgFailureLog::new(pool.clone()));

    let analyzer = Arc::new(Analyzer::new(config.analyzer_config())?);
    let committer = Arc::new(Committer::new(
        store.clone(),
        Committer::retry_config(config.commit_max_attempts),
        analyzer.risk_policy().clone(),
    ));
    let metrics = Arc::new(MetricsRegistry::new());
    let coordinator = ShutdownCoordinator::new();

    let mut workers = Vec::with_capacity(config.worker_count);
    for worker in 0..config.worker_count {
        let runner = PipelineRunner::new(
            config.pipeline_config(worker),
            queue.clone(),
            store.clone(),
            analyzer.clone(),
            committer.clone(),
        )
        .with_failure_log(failure_log.clone())
        .with_metrics(metrics.clone())
        .with_in_flight(coordinator.in_flight());

        let signal = coordinator.signal();
        workers.push(tokio::spawn(async move { runner.run(signal).await }));
    }

    info!("Trace analyzer is processing the queue");
    shutdown_signal().await;

    if !coordinator.graceful_shutdown(config.shutdown_drain).await {
        warn!("Shutdown drain timed out; some traces stay queued for redelivery");
    }

    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "Pipeline worker panicked");
        }
    }

    info!(metrics = %metrics.to_json().await, "Final metrics");
    pool.close().await;
    shutdown_telemetry();

    Ok(())
}
