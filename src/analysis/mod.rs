//! Read-only analysis of a single trace
//!
//! Classification, schema diffing and alert construction run before any
//! transaction is opened. Their output is a [`TraceAnalysis`] that the
//! committer merges with durable state.

pub mod alerts;
pub mod classifier;
pub mod risk;
pub mod schema_diff;

use chrono::{DateTime, Utc};

use crate::domain::{Alert, ApiEndpoint, ApiTrace, EndpointId, TraceId};
use crate::infra::{AnalyzerError, Result};

pub use alerts::AlertBuilder;
pub use classifier::{Classifier, ClassifierConfig, Observation, ObservedField};
pub use risk::{advance_activity, RiskPolicy};
pub use schema_diff::{Deviation, DriftFinding};

/// Analyzer configuration
#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfig {
    pub classifier: ClassifierConfig,
    pub risk: RiskPolicy,
}

/// Everything derived from one trace, ready to commit
#[derive(Debug, Clone)]
pub struct TraceAnalysis {
    pub trace_id: TraceId,
    pub endpoint_id: EndpointId,
    /// Capture time of the trace
    pub observed_at: DateTime<Utc>,
    pub observation: Observation,
    pub drift: Vec<DriftFinding>,
    pub alerts: Vec<Alert>,
}

impl TraceAnalysis {
    /// Observed fields that are persisted as data fields
    pub fn fields(&self) -> impl Iterator<Item = &ObservedField> {
        self.observation.leaves()
    }
}

/// Runs the read-only stages for one trace
pub struct Analyzer {
    classifier: Classifier,
    risk: RiskPolicy,
}

impl Analyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        Ok(Self {
            classifier: Classifier::new(config.classifier)?,
            risk: config.risk,
        })
    }

    pub fn risk_policy(&self) -> &RiskPolicy {
        &self.risk
    }

    /// Classify a trace and diff it against its endpoint's contract
    pub fn analyze(&self, trace: &ApiTrace, endpoint: &ApiEndpoint) -> Result<TraceAnalysis> {
        if trace.endpoint_id != endpoint.endpoint_id {
            return Err(AnalyzerError::Internal(format!(
                "trace {} belongs to endpoint {}, not {}",
                trace.trace_id, trace.endpoint_id, endpoint.endpoint_id
            )));
        }

        let observation = self.classifier.observe(trace)?;
        let drift = schema_diff::diff(endpoint.known_schema.as_ref(), &observation);

        let alerts = AlertBuilder::new(endpoint.endpoint_id, trace.trace_id, Utc::now())
            .sensitive_fields(observation.leaves())
            .drift(&drift)
            .build();

        tracing::debug!(
            trace_id = %trace.trace_id,
            endpoint_id = %endpoint.endpoint_id,
            fields = observation.leaves().count(),
            drift = drift.len(),
            alerts = alerts.len(),
            "Trace analyzed"
        );

        Ok(TraceAnalysis {
            trace_id: trace.trace_id,
            endpoint_id: endpoint.endpoint_id,
            observed_at: trace.created_at,
            observation,
            drift,
            alerts,
        })
    }
}
