//! Trait definitions for the analyzer's external collaborators

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::domain::{
    Alert, ApiEndpoint, ApiTrace, DataField, EndpointActivity, EndpointId, EndpointUpdate, TraceId,
};

use super::dead_letter::AnalysisFailure;
use super::Result;

/// Source of trace identifiers awaiting analysis.
///
/// Delivery is at-least-once; an identifier may be popped more than once.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Pop the next identifier, or `None` when the queue is empty
    async fn pop_next(&self) -> Result<Option<TraceId>>;
}

/// Read access to traces and endpoints, plus scoped write units.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Load a captured trace
    async fn load_trace(&self, trace_id: TraceId) -> Result<Option<ApiTrace>>;

    /// Load an endpoint; with `include_schema` the known contract is loaded
    /// too
    async fn load_endpoint(
        &self,
        endpoint_id: EndpointId,
        include_schema: bool,
    ) -> Result<Option<ApiEndpoint>>;

    /// Open a unit of work. Nothing written through it is visible until
    /// `commit` succeeds.
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// One atomic group of writes.
///
/// Dropping a unit without committing discards every write made through it.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Flip a trace's `analyzed` flag
    async fn mark_trace_analyzed(&mut self, trace_id: TraceId) -> Result<()>;

    /// Current activity window of an endpoint
    async fn endpoint_activity(&mut self, endpoint_id: EndpointId) -> Result<EndpointActivity>;

    /// Data fields currently on record for an endpoint
    async fn data_fields(&mut self, endpoint_id: EndpointId) -> Result<Vec<DataField>>;

    /// Insert or overwrite fields by natural key
    async fn upsert_data_fields(&mut self, fields: &[DataField]) -> Result<()>;

    /// Insert alerts, ignoring natural-key conflicts; returns rows inserted
    async fn insert_alerts(&mut self, alerts: &[Alert]) -> Result<u64>;

    /// Alerts currently on record for an endpoint
    async fn alerts(&mut self, endpoint_id: EndpointId) -> Result<Vec<Alert>>;

    /// Write the endpoint aggregate
    async fn update_endpoint(&mut self, update: &EndpointUpdate) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Record of traces whose analysis failed.
///
/// Writing here never touches data fields, alerts or endpoints.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Record a failure; repeats for the same trace bump the attempt counter
    async fn record(&self, failure: AnalysisFailure) -> Result<()>;

    /// Drop the record for a trace once it analyzes cleanly
    async fn clear(&self, trace_id: TraceId) -> Result<bool>;

    /// Most recent failures first
    async fn list(&self, limit: i64) -> Result<Vec<AnalysisFailure>>;
}
