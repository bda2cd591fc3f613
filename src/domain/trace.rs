//! Captured API traces
//!
//! A trace is one observed request/response pair. Traces are immutable once
//! captured; the only field the analyzer changes is `analyzed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{EndpointId, TraceId};

/// A name/value pair (header or query parameter)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pair {
    pub name: String,
    pub value: String,
}

impl Pair {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Request URL as captured
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceUrl {
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub parameters: Vec<Pair>,
}

/// Captured request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRequest {
    pub url: TraceUrl,
    #[serde(default)]
    pub headers: Vec<Pair>,
    pub method: String,
    /// Raw body text (usually JSON)
    #[serde(default)]
    pub body: String,
}

/// Captured response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<Pair>,
    #[serde(default)]
    pub body: String,
}

/// One captured API call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTrace {
    pub trace_id: TraceId,
    pub endpoint_id: EndpointId,
    /// Capture timestamp
    pub created_at: DateTime<Utc>,
    pub request: TraceRequest,
    pub response: TraceResponse,
    /// Capture metadata (source/destination addresses, environment)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    pub analyzed: bool,
}

impl ApiTrace {
    /// Create an unanalyzed trace captured now
    pub fn new(endpoint_id: EndpointId, request: TraceRequest, response: TraceResponse) -> Self {
        Self {
            trace_id: TraceId::new(),
            endpoint_id,
            created_at: Utc::now(),
            request,
            response,
            meta: None,
            analyzed: false,
        }
    }

    /// Set the capture timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Set capture metadata
    pub fn with_meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}
