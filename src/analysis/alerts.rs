//! Alert aggregator
//!
//! Turns classified fields and drift findings into alert rows keyed by
//! `(endpoint, kind, locator)`. Duplicates are dropped by the store on insert,
//! so the same finding never produces a second alert and a resolved alert is
//! never reopened.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::domain::{
    Alert, AlertKey, AlertKind, AlertSeverity, AlertStatus, DataClass, DataSection, EndpointId,
    TraceId,
};

use super::classifier::ObservedField;
use super::schema_diff::{Deviation, DriftFinding};

/// Severity of a sensitive-data alert for a class
pub fn class_severity(class: DataClass) -> AlertSeverity {
    match class {
        DataClass::Credential | DataClass::Financial => AlertSeverity::High,
        DataClass::PersonalIdentifier => AlertSeverity::Medium,
        DataClass::NetworkIdentifier => AlertSeverity::Low,
    }
}

/// Severity of a schema-drift alert for a deviation
pub fn deviation_severity(deviation: &Deviation) -> AlertSeverity {
    match deviation {
        Deviation::NewField => AlertSeverity::Low,
        Deviation::TypeMismatch(_) | Deviation::MissingRequiredField => AlertSeverity::Medium,
    }
}

/// Locator for a sensitive-data alert: `section:path:class`
pub fn sensitive_locator(section: DataSection, path: &str, class: DataClass) -> String {
    format!("{}:{}:{}", section, path, class)
}

/// Locator for a drift alert: `section:path:deviation`
pub fn drift_locator(finding: &DriftFinding) -> String {
    format!("{}:{}:{}", finding.section, finding.path, finding.deviation)
}

fn display_path(section: DataSection, path: &str) -> String {
    if path.is_empty() {
        section.to_string()
    } else {
        format!("{}.{}", section, path)
    }
}

/// Builds the alerts one analyzed trace raises
pub struct AlertBuilder {
    endpoint_id: EndpointId,
    trace_id: TraceId,
    raised_at: DateTime<Utc>,
    alerts: BTreeMap<AlertKey, Alert>,
}

impl AlertBuilder {
    pub fn new(endpoint_id: EndpointId, trace_id: TraceId, raised_at: DateTime<Utc>) -> Self {
        Self {
            endpoint_id,
            trace_id,
            raised_at,
            alerts: BTreeMap::new(),
        }
    }

    /// One alert per `(field, class)` the field carries
    pub fn sensitive_fields<'a>(mut self, fields: impl IntoIterator<Item = &'a ObservedField>) -> Self {
        for field in fields {
            for class in &field.data_classes {
                let locator = sensitive_locator(field.section, &field.path, *class);
                let description = format!(
                    "{} data detected in {}",
                    class,
                    display_path(field.section, &field.path)
                );
                let context = json!({
                    "section": field.section,
                    "path": field.path,
                    "data_class": class,
                    "data_type": field.data_type(),
                });
                self.push(
                    AlertKind::SensitiveData,
                    locator,
                    class_severity(*class),
                    description,
                    context,
                    field.section,
                    &field.path,
                );
            }
        }
        self
    }

    /// One alert per drift finding
    pub fn drift<'a>(mut self, findings: impl IntoIterator<Item = &'a DriftFinding>) -> Self {
        for finding in findings {
            let location = display_path(finding.section, &finding.path);
            let description = match finding.deviation {
                Deviation::NewField => format!("new field {} is not in the known schema", location),
                Deviation::TypeMismatch(t) => {
                    format!("field {} carried unexpected type {}", location, t)
                }
                Deviation::MissingRequiredField => {
                    format!("required field {} was missing", location)
                }
            };
            let context = json!({
                "section": finding.section,
                "path": finding.path,
                "deviation": finding.deviation.kind(),
                "observed_type": match finding.deviation {
                    Deviation::TypeMismatch(t) => Some(t),
                    _ => None,
                },
            });
            self.push(
                AlertKind::SchemaDrift,
                drift_locator(finding),
                deviation_severity(&finding.deviation),
                description,
                context,
                finding.section,
                &finding.path,
            );
        }
        self
    }

    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        kind: AlertKind,
        locator: String,
        severity: AlertSeverity,
        description: String,
        context: serde_json::Value,
        section: DataSection,
        path: &str,
    ) {
        let alert = Alert {
            alert_id: Uuid::new_v4(),
            endpoint_id: self.endpoint_id,
            kind,
            locator,
            severity,
            status: AlertStatus::Open,
            description,
            context,
            data_section: Some(section),
            data_path: Some(path.to_string()),
            trace_id: Some(self.trace_id),
            created_at: self.raised_at,
        };
        self.alerts.entry(alert.key()).or_insert(alert);
    }

    /// Alerts ordered by natural key
    pub fn build(self) -> Vec<Alert> {
        self.alerts.into_values().collect()
    }
}
