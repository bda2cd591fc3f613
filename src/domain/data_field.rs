//! Classified data fields tracked per endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{DataClass, DataSection, DataTag, DataType, EndpointId};

/// Natural key of a data field: (endpoint, section, path)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataFieldKey {
    pub endpoint_id: EndpointId,
    pub section: DataSection,
    pub path: String,
}

/// A classified location within an endpoint's traffic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataField {
    pub endpoint_id: EndpointId,
    pub data_section: DataSection,
    pub data_path: String,
    pub data_classes: BTreeSet<DataClass>,
    pub data_type: DataType,
    pub data_tag: Option<DataTag>,
    /// Number of analyses that observed this field
    pub matches: i64,
    pub updated_at: DateTime<Utc>,
}

impl DataField {
    pub fn key(&self) -> DataFieldKey {
        DataFieldKey {
            endpoint_id: self.endpoint_id,
            section: self.data_section,
            path: self.data_path.clone(),
        }
    }

    pub fn is_sensitive(&self) -> bool {
        !self.data_classes.is_empty()
    }

    /// Human-readable locator, e.g. `req_body.email`
    pub fn locator(&self) -> String {
        if self.data_path.is_empty() {
            self.data_section.as_str().to_string()
        } else {
            format!("{}.{}", self.data_section, self.data_path)
        }
    }
}
