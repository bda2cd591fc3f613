//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use trace_analyzer::analysis::{Analyzer, AnalyzerConfig, RiskPolicy};
use trace_analyzer::domain::{
    ApiEndpoint, ApiTrace, DataSection, DataType, EndpointSchema, Pair, SchemaField, TraceRequest,
    TraceResponse, TraceUrl,
};
use trace_analyzer::infra::{
    AnalysisStore, InMemoryAnalysisStore, InMemoryFailureLog, InMemoryTraceQueue, RetryConfig,
};
use trace_analyzer::metrics::MetricsRegistry;
use trace_analyzer::pipeline::{Committer, PipelineConfig, PipelineRunner, DEFAULT_MAX_ATTEMPTS};

/// Fixed capture time used as T1
pub fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

/// A capture time one hour after T1
pub fn t2() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 13, 0, 0).unwrap()
}

/// Endpoint without a known contract
pub fn signup_endpoint() -> ApiEndpoint {
    ApiEndpoint::new("shop.example.com", "/api/signup", "POST")
}

/// Endpoint whose contract expects `email` and `name` in the request body
pub fn contracted_endpoint() -> ApiEndpoint {
    ApiEndpoint::new("shop.example.com", "/api/profile", "PUT").with_schema(EndpointSchema::new(
        vec![
            SchemaField::new(DataSection::RequestBody, "email", DataType::String).required(),
            SchemaField::new(DataSection::RequestBody, "name", DataType::String),
        ],
    ))
}

/// A trace for `endpoint` with a JSON request body and no headers
pub fn json_trace(
    endpoint: &ApiEndpoint,
    body: serde_json::Value,
    created_at: DateTime<Utc>,
) -> ApiTrace {
    raw_trace(endpoint, &body.to_string(), created_at)
}

pub fn raw_trace(endpoint: &ApiEndpoint, body: &str, created_at: DateTime<Utc>) -> ApiTrace {
    ApiTrace::new(
        endpoint.endpoint_id,
        TraceRequest {
            url: TraceUrl {
                host: endpoint.host.clone(),
                path: endpoint.path.clone(),
                parameters: vec![],
            },
            headers: vec![],
            method: endpoint.method.clone(),
            body: body.to_string(),
        },
        TraceResponse {
            status: 200,
            headers: vec![],
            body: String::new(),
        },
    )
    .with_created_at(created_at)
}

/// The canonical single-email trace
pub fn email_trace(endpoint: &ApiEndpoint, created_at: DateTime<Utc>) -> ApiTrace {
    json_trace(endpoint, json!({ "email": "a@b.com" }), created_at)
}

/// A trace carrying sensitive values in every section
pub fn busy_trace(endpoint: &ApiEndpoint, created_at: DateTime<Utc>) -> ApiTrace {
    let mut trace = json_trace(
        endpoint,
        json!({
            "user": { "email": "jane@example.com", "phone": "+1 415-555-0100" },
            "card": "4111 1111 1111 1111",
            "password": "hunter2",
            "tags": ["a", "b"],
        }),
        created_at,
    );
    trace.request.url.parameters = vec![Pair::new("session_id", "abc123")];
    trace.request.headers = vec![Pair::new("Authorization", "Bearer abc.def")];
    trace.response.headers = vec![Pair::new("X-Forwarded-For", "10.0.0.1")];
    trace
}

/// Bodies nested deeper than the classifier accepts
pub fn deeply_nested_body(depth: usize) -> String {
    let mut body = String::from("1");
    for _ in 0..depth {
        body = format!("{{\"a\":{body}}}");
    }
    body
}

/// An in-memory pipeline with fast retries
pub struct Harness {
    pub store: InMemoryAnalysisStore,
    pub queue: Arc<InMemoryTraceQueue>,
    pub failures: Arc<InMemoryFailureLog>,
    pub metrics: Arc<MetricsRegistry>,
    pub analyzer: Arc<Analyzer>,
    pub committer: Arc<Committer>,
}

impl Harness {
    pub fn new() -> Self {
        let store = InMemoryAnalysisStore::new();
        let dyn_store: Arc<dyn AnalysisStore> = Arc::new(store.clone());
        let committer = Committer::new(
            dyn_store,
            RetryConfig::fast().with_max_retries(DEFAULT_MAX_ATTEMPTS - 1),
            RiskPolicy::default(),
        );

        Self {
            store,
            queue: Arc::new(InMemoryTraceQueue::new()),
            failures: Arc::new(InMemoryFailureLog::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            analyzer: Arc::new(Analyzer::new(AnalyzerConfig::default()).unwrap()),
            committer: Arc::new(committer),
        }
    }

    /// Register an endpoint
    pub fn endpoint(&self, endpoint: &ApiEndpoint) {
        self.store.insert_endpoint(endpoint.clone()).unwrap();
    }

    /// Store a trace and enqueue its id
    pub fn enqueue(&self, trace: &ApiTrace) {
        self.store.insert_trace(trace.clone()).unwrap();
        self.queue.push(trace.trace_id);
    }

    pub fn runner(&self, worker: &str) -> PipelineRunner {
        let config = PipelineConfig {
            worker_id: worker.to_string(),
            poll_interval: std::time::Duration::from_millis(5),
            max_poll_interval: std::time::Duration::from_millis(20),
        };
        PipelineRunner::new(
            config,
            self.queue.clone(),
            Arc::new(self.store.clone()),
            self.analyzer.clone(),
            self.committer.clone(),
        )
        .with_failure_log(self.failures.clone())
        .with_metrics(self.metrics.clone())
    }

    /// Process queued traces until the queue is empty
    pub async fn drain(&self) -> Vec<trace_analyzer::pipeline::TraceOutcome> {
        let runner = self.runner("drain");
        let mut outcomes = Vec::new();
        while let Some(outcome) = runner.run_once().await.unwrap() {
            outcomes.push(outcome);
        }
        outcomes
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
