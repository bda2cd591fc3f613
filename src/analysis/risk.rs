//! Endpoint risk scoring
//!
//! The score is a function of durable state only: the data classes
//! accumulated on the endpoint's fields and the severities of its open
//! alerts. Re-running it over the same rows always gives the same score.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::domain::{Alert, DataClass, DataField, EndpointActivity, RiskScore};

/// Risk level assigned to each data class
#[derive(Debug, Clone)]
pub struct RiskPolicy {
    class_levels: BTreeMap<DataClass, RiskScore>,
    /// Whether open alert severities contribute to the score
    include_alerts: bool,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            class_levels: BTreeMap::from([
                (DataClass::Credential, RiskScore::High),
                (DataClass::Financial, RiskScore::High),
                (DataClass::PersonalIdentifier, RiskScore::Medium),
                (DataClass::NetworkIdentifier, RiskScore::Low),
            ]),
            include_alerts: true,
        }
    }
}

impl RiskPolicy {
    /// Override the level of one class
    pub fn with_class_level(mut self, class: DataClass, level: RiskScore) -> Self {
        self.class_levels.insert(class, level);
        self
    }

    pub fn with_alerts(mut self, include: bool) -> Self {
        self.include_alerts = include;
        self
    }

    pub fn class_level(&self, class: DataClass) -> RiskScore {
        self.class_levels.get(&class).copied().unwrap_or_default()
    }

    /// Highest level among field classes and open alert severities
    pub fn score(&self, fields: &[DataField], alerts: &[Alert]) -> RiskScore {
        let from_fields = fields
            .iter()
            .flat_map(|f| f.data_classes.iter())
            .map(|c| self.class_level(*c))
            .max()
            .unwrap_or_default();

        let from_alerts = if self.include_alerts {
            alerts
                .iter()
                .filter(|a| a.status.is_unresolved())
                .map(|a| a.severity.as_risk())
                .max()
                .unwrap_or_default()
        } else {
            RiskScore::None
        };

        from_fields.max(from_alerts)
    }
}

/// Widen an endpoint's activity window to include a trace timestamp
pub fn advance_activity(
    current: EndpointActivity,
    observed_at: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let first = current
        .first_detected
        .map_or(observed_at, |first| first.min(observed_at));
    let last = current
        .last_active
        .map_or(observed_at, |last| last.max(observed_at));
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        AlertKind, AlertSeverity, AlertStatus, DataSection, DataType, EndpointId, TraceId,
    };
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn field(classes: &[DataClass]) -> DataField {
        DataField {
            endpoint_id: EndpointId::new(),
            data_section: DataSection::RequestBody,
            data_path: "x".into(),
            data_classes: classes.iter().copied().collect::<BTreeSet<_>>(),
            data_type: DataType::String,
            data_tag: None,
            matches: 1,
            updated_at: Utc::now(),
        }
    }

    fn alert(severity: AlertSeverity, status: AlertStatus) -> Alert {
        Alert {
            alert_id: uuid::Uuid::new_v4(),
            endpoint_id: EndpointId::new(),
            kind: AlertKind::SchemaDrift,
            locator: "req_body:x:new_field".into(),
            severity,
            status,
            description: String::new(),
            context: serde_json::Value::Null,
            data_section: None,
            data_path: None,
            trace_id: Some(TraceId::new()),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_endpoint_scores_none() {
        assert_eq!(RiskPolicy::default().score(&[], &[]), RiskScore::None);
        assert_eq!(
            RiskPolicy::default().score(&[field(&[])], &[]),
            RiskScore::None
        );
    }

    #[test]
    fn test_highest_class_wins() {
        let policy = RiskPolicy::default();
        let fields = vec![
            field(&[DataClass::NetworkIdentifier]),
            field(&[DataClass::PersonalIdentifier]),
        ];
        assert_eq!(policy.score(&fields, &[]), RiskScore::Medium);

        let fields = vec![field(&[DataClass::Credential])];
        assert_eq!(policy.score(&fields, &[]), RiskScore::High);
    }

    #[test]
    fn test_only_open_alerts_count() {
        let policy = RiskPolicy::default();
        let alerts = vec![
            alert(AlertSeverity::High, AlertStatus::Resolved),
            alert(AlertSeverity::Low, AlertStatus::Open),
        ];
        assert_eq!(policy.score(&[], &alerts), RiskScore::Low);
        assert_eq!(
            policy.with_alerts(false).score(&[], &alerts),
            RiskScore::None
        );
    }

    #[test]
    fn test_policy_override() {
        let policy =
            RiskPolicy::default().with_class_level(DataClass::NetworkIdentifier, RiskScore::High);
        let fields = vec![field(&[DataClass::NetworkIdentifier])];
        assert_eq!(policy.score(&fields, &[]), RiskScore::High);
    }

    #[test]
    fn test_activity_window_is_monotone() {
        let t1 = Utc::now();
        let earlier = t1 - Duration::minutes(5);
        let later = t1 + Duration::minutes(5);

        let (first, last) = advance_activity(EndpointActivity::default(), t1);
        assert_eq!((first, last), (t1, t1));

        let current = EndpointActivity {
            first_detected: Some(first),
            last_active: Some(last),
        };
        assert_eq!(advance_activity(current, earlier), (earlier, t1));
        assert_eq!(advance_activity(current, later), (t1, later));
    }
}
