//! API endpoint aggregates and their known contracts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{DataSection, DataType, EndpointId, RiskScore};

/// One field declared by an endpoint's contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaField {
    pub section: DataSection,
    pub path: String,
    /// Types the contract allows at this path
    pub types: BTreeSet<DataType>,
    #[serde(default)]
    pub required: bool,
}

impl SchemaField {
    pub fn new(section: DataSection, path: impl Into<String>, data_type: DataType) -> Self {
        Self {
            section,
            path: path.into(),
            types: BTreeSet::from([data_type]),
            required: false,
        }
    }

    /// Mark the field as required
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Allow an additional type (e.g. `null`)
    pub fn or_type(mut self, data_type: DataType) -> Self {
        self.types.insert(data_type);
        self
    }
}

/// Known contract of an endpoint, imported or inferred from earlier traffic
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSchema {
    pub fields: Vec<SchemaField>,
}

impl EndpointSchema {
    pub fn new(fields: Vec<SchemaField>) -> Self {
        Self { fields }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether the contract describes anything in a section
    pub fn covers(&self, section: DataSection) -> bool {
        self.fields.iter().any(|f| f.section == section)
    }
}

/// API endpoint aggregate (host + path + method)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiEndpoint {
    pub endpoint_id: EndpointId,
    pub host: String,
    pub path: String,
    pub method: String,
    pub first_detected: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
    pub risk_score: RiskScore,
    /// Known contract, only populated when loaded with schema
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_schema: Option<EndpointSchema>,
}

impl ApiEndpoint {
    /// Register a new endpoint that has not been observed yet
    pub fn new(host: impl Into<String>, path: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            endpoint_id: EndpointId::new(),
            host: host.into(),
            path: path.into(),
            method: method.into().to_ascii_uppercase(),
            first_detected: None,
            last_active: None,
            risk_score: RiskScore::None,
            known_schema: None,
        }
    }

    /// Attach a known contract
    pub fn with_schema(mut self, schema: EndpointSchema) -> Self {
        self.known_schema = Some(schema);
        self
    }

    pub fn activity(&self) -> EndpointActivity {
        EndpointActivity {
            first_detected: self.first_detected,
            last_active: self.last_active,
        }
    }
}

/// The monotone activity window of an endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointActivity {
    pub first_detected: Option<DateTime<Utc>>,
    pub last_active: Option<DateTime<Utc>>,
}

/// Aggregate write applied to an endpoint at the end of an analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointUpdate {
    pub endpoint_id: EndpointId,
    pub first_detected: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub risk_score: RiskScore,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_endpoint_is_unobserved() {
        let endpoint = ApiEndpoint::new("api.example.com", "/login", "post");
        assert_eq!(endpoint.method, "POST");
        assert!(endpoint.first_detected.is_none());
        assert!(endpoint.last_active.is_none());
        assert_eq!(endpoint.risk_score, RiskScore::None);
    }

    #[test]
    fn test_schema_covers_section() {
        let schema = EndpointSchema::new(vec![SchemaField::new(
            DataSection::RequestBody,
            "email",
            DataType::String,
        )
        .required()]);

        assert!(schema.covers(DataSection::RequestBody));
        assert!(!schema.covers(DataSection::ResponseBody));
        assert!(schema.fields[0].required);
    }
}
