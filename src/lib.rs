//! Trace Analyzer Library
//!
//! Consumes captured API traces from a queue, classifies the data they carry,
//! detects drift from each endpoint's known contract, raises deduplicated
//! alerts and keeps a per-endpoint risk score and activity window.
//!
//! ## Modules
//!
//! - [`domain`] - Core domain types (traces, endpoints, data fields, alerts)
//! - [`analysis`] - Read-only stages (classifier, schema diff, alerts, risk)
//! - [`pipeline`] - Queue loop and transactional committer
//! - [`infra`] - Infrastructure implementations (PostgreSQL, Redis, in-memory)
//! - [`metrics`] - In-process metrics
//! - [`telemetry`] - Logging and OpenTelemetry integration
//! - [`service`] - Worker service bootstrap

pub mod analysis;
pub mod domain;
pub mod infra;
pub mod metrics;
pub mod migrations;
pub mod pipeline;
pub mod service;
pub mod telemetry;

// Re-export commonly used types
pub use domain::{
    Alert, AlertKind, AlertSeverity, AlertStatus, ApiEndpoint, ApiTrace, DataClass, DataField,
    DataSection, DataType, EndpointId, RiskScore, TraceId,
};

pub use analysis::{Analyzer, AnalyzerConfig, TraceAnalysis};
pub use infra::{AnalysisStore, AnalyzerError, QueueSource, Result, UnitOfWork};
pub use pipeline::{Committer, PipelineRunner, TraceOutcome};
