//! Core type definitions for the trace analyzer
//!
//! Identifiers and the small closed vocabularies (sections, data types,
//! sensitive-data classes, risk levels) shared by every analysis stage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Trace identifier (the unit of work popped from the queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraceId(pub uuid::Uuid);

impl TraceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }

    /// Parse a queue token into a trace identifier
    pub fn parse(token: &str) -> Option<Self> {
        uuid::Uuid::parse_str(token.trim()).ok().map(Self)
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Endpoint identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub uuid::Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn from_uuid(id: uuid::Uuid) -> Self {
        Self(id)
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Part of a request/response pair a data field was found in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataSection {
    #[serde(rename = "req_query")]
    RequestQuery,
    #[serde(rename = "req_headers")]
    RequestHeaders,
    #[serde(rename = "req_body")]
    RequestBody,
    #[serde(rename = "res_headers")]
    ResponseHeaders,
    #[serde(rename = "res_body")]
    ResponseBody,
}

impl DataSection {
    pub const ALL: [DataSection; 5] = [
        DataSection::RequestQuery,
        DataSection::RequestHeaders,
        DataSection::RequestBody,
        DataSection::ResponseHeaders,
        DataSection::ResponseBody,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataSection::RequestQuery => "req_query",
            DataSection::RequestHeaders => "req_headers",
            DataSection::RequestBody => "req_body",
            DataSection::ResponseHeaders => "res_headers",
            DataSection::ResponseBody => "res_body",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Header names are case-insensitive
    pub fn is_headers(&self) -> bool {
        matches!(self, DataSection::RequestHeaders | DataSection::ResponseHeaders)
    }
}

impl fmt::Display for DataSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inferred primitive type of a value at a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Null,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::String,
        DataType::Number,
        DataType::Boolean,
        DataType::Object,
        DataType::Array,
        DataType::Null,
    ];

    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => DataType::Null,
            serde_json::Value::Bool(_) => DataType::Boolean,
            serde_json::Value::Number(_) => DataType::Number,
            serde_json::Value::String(_) => DataType::String,
            serde_json::Value::Array(_) => DataType::Array,
            serde_json::Value::Object(_) => DataType::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::String => "string",
            DataType::Number => "number",
            DataType::Boolean => "boolean",
            DataType::Object => "object",
            DataType::Array => "array",
            DataType::Null => "null",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sensitive-data category detected in a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    /// Emails, phone numbers, national identifiers
    PersonalIdentifier,
    /// Passwords, API keys, tokens
    Credential,
    /// Card numbers, bank accounts
    Financial,
    /// IP addresses
    NetworkIdentifier,
}

impl DataClass {
    pub const ALL: [DataClass; 4] = [
        DataClass::PersonalIdentifier,
        DataClass::Credential,
        DataClass::Financial,
        DataClass::NetworkIdentifier,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataClass::PersonalIdentifier => "personal_identifier",
            DataClass::Credential => "credential",
            DataClass::Financial => "financial",
            DataClass::NetworkIdentifier => "network_identifier",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == value)
    }

    /// Whether the class makes a field personally identifiable
    pub fn is_pii(&self) -> bool {
        matches!(self, DataClass::PersonalIdentifier | DataClass::Financial)
    }
}

impl fmt::Display for DataClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tag attached to a data field for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataTag {
    Pii,
}

impl DataTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataTag::Pii => "pii",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pii" => Some(DataTag::Pii),
            _ => None,
        }
    }
}

/// Endpoint risk level, ordered from no exposure to high exposure
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskScore {
    #[default]
    None,
    Low,
    Medium,
    High,
}

impl RiskScore {
    pub const ALL: [RiskScore; 4] = [
        RiskScore::None,
        RiskScore::Low,
        RiskScore::Medium,
        RiskScore::High,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskScore::None => "none",
            RiskScore::Low => "low",
            RiskScore::Medium => "medium",
            RiskScore::High => "high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == value)
    }
}

impl fmt::Display for RiskScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id_parse() {
        let id = TraceId::new();
        assert_eq!(TraceId::parse(&id.to_string()), Some(id));
        assert_eq!(TraceId::parse(&format!(" {}\n", id)), Some(id));
        assert_eq!(TraceId::parse("not-a-uuid"), None);
    }

    #[test]
    fn test_enum_string_round_trip() {
        for section in DataSection::ALL {
            assert_eq!(DataSection::parse(section.as_str()), Some(section));
        }
        for class in DataClass::ALL {
            assert_eq!(DataClass::parse(class.as_str()), Some(class));
        }
        for risk in RiskScore::ALL {
            assert_eq!(RiskScore::parse(risk.as_str()), Some(risk));
        }
        assert_eq!(DataType::parse("boolean"), Some(DataType::Boolean));
        assert_eq!(DataType::parse("integer"), None);
    }

    #[test]
    fn test_risk_ordering() {
        assert!(RiskScore::None < RiskScore::Low);
        assert!(RiskScore::Low < RiskScore::Medium);
        assert!(RiskScore::Medium < RiskScore::High);
        assert_eq!(RiskScore::default(), RiskScore::None);
    }

    #[test]
    fn test_data_type_of_value() {
        assert_eq!(DataType::of(&serde_json::json!("a")), DataType::String);
        assert_eq!(DataType::of(&serde_json::json!(1.5)), DataType::Number);
        assert_eq!(DataType::of(&serde_json::json!(null)), DataType::Null);
        assert_eq!(DataType::of(&serde_json::json!([])), DataType::Array);
    }
}
