//! Alerts raised by the analyzer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{DataSection, EndpointId, RiskScore, TraceId};

/// Kind of finding an alert represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SchemaDrift,
    SensitiveData,
    Other,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SchemaDrift => "schema_drift",
            AlertKind::SensitiveData => "sensitive_data",
            AlertKind::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schema_drift" => Some(AlertKind::SchemaDrift),
            "sensitive_data" => Some(AlertKind::SensitiveData),
            "other" => Some(AlertKind::Other),
            _ => None,
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "low",
            AlertSeverity::Medium => "medium",
            AlertSeverity::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(AlertSeverity::Low),
            "medium" => Some(AlertSeverity::Medium),
            "high" => Some(AlertSeverity::High),
            _ => None,
        }
    }

    /// Severity expressed on the endpoint risk scale
    pub fn as_risk(&self) -> RiskScore {
        match self {
            AlertSeverity::Low => RiskScore::Low,
            AlertSeverity::Medium => RiskScore::Medium,
            AlertSeverity::High => RiskScore::High,
        }
    }
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-managed alert lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Open,
    Resolved,
    Ignored,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Ignored => "ignored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "open" => Some(AlertStatus::Open),
            "resolved" => Some(AlertStatus::Resolved),
            "ignored" => Some(AlertStatus::Ignored),
            _ => None,
        }
    }

    pub fn is_unresolved(&self) -> bool {
        matches!(self, AlertStatus::Open)
    }
}

/// Natural key of an alert: (endpoint, kind, locator)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlertKey {
    pub endpoint_id: EndpointId,
    pub kind: AlertKind,
    pub locator: String,
}

/// A durable, deduplicated finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub endpoint_id: EndpointId,
    pub kind: AlertKind,
    /// Stable finding locator, unique per endpoint and kind
    pub locator: String,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub description: String,
    /// Structured evidence (section, path, class, deviation)
    pub context: serde_json::Value,
    pub data_section: Option<DataSection>,
    pub data_path: Option<String>,
    /// Trace that first raised the alert
    pub trace_id: Option<TraceId>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn key(&self) -> AlertKey {
        AlertKey {
            endpoint_id: self.endpoint_id,
            kind: self.kind,
            locator: self.locator.clone(),
        }
    }
}
