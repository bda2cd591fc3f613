//! Schema diff engine
//!
//! Compares what a trace actually carried with the endpoint's known
//! contract. The comparison tolerates supersets: sections the contract does
//! not describe are never reported, and required fields that sit below an
//! observed empty array are not considered missing. An empty object is
//! still missing its required keys.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::domain::{DataSection, DataType, EndpointSchema, SchemaField};

use super::classifier::Observation;

/// How an observation deviates from the contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Deviation {
    /// Path is absent from the contract
    NewField,
    /// Path carried a type the contract does not allow
    TypeMismatch(DataType),
    /// Required path was not present in the trace
    MissingRequiredField,
}

impl Deviation {
    pub fn kind(&self) -> &'static str {
        match self {
            Deviation::NewField => "new_field",
            Deviation::TypeMismatch(_) => "type_mismatch",
            Deviation::MissingRequiredField => "missing_required_field",
        }
    }
}

impl fmt::Display for Deviation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Deviation::TypeMismatch(t) => write!(f, "type_mismatch:{}", t),
            other => f.write_str(other.kind()),
        }
    }
}

/// One reported deviation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DriftFinding {
    pub section: DataSection,
    pub path: String,
    pub deviation: Deviation,
}

impl DriftFinding {
    fn new(section: DataSection, path: &str, deviation: Deviation) -> Self {
        Self {
            section,
            path: path.to_string(),
            deviation,
        }
    }
}

/// Diff an observation against a known contract
///
/// Returns findings ordered by `(section, path, deviation)`, each reported
/// once. No contract means no findings.
pub fn diff(schema: Option<&EndpointSchema>, observation: &Observation) -> Vec<DriftFinding> {
    let schema = match schema {
        Some(schema) if !schema.is_empty() => normalize_schema(schema),
        _ => return Vec::new(),
    };

    let known = index(&schema);
    let mut findings = BTreeSet::new();

    for node in observation.nodes() {
        if !schema.covers(node.section) {
            continue;
        }

        match known.get(&(node.section, node.path.as_str())) {
            Some(field) => {
                for observed in &node.types {
                    if !field.types.contains(observed) {
                        findings.insert(DriftFinding::new(
                            node.section,
                            &node.path,
                            Deviation::TypeMismatch(*observed),
                        ));
                    }
                }
            }
            None => {
                if !is_ancestor_of_known(&known, node.section, &node.path) {
                    findings.insert(DriftFinding::new(
                        node.section,
                        &node.path,
                        Deviation::NewField,
                    ));
                }
            }
        }
    }

    for ((section, path), field) in &known {
        if !field.required || !observation.has_section(*section) {
            continue;
        }
        if observation.get(*section, path).is_some() {
            continue;
        }
        if under_empty_array(observation, *section, path) {
            continue;
        }
        findings.insert(DriftFinding::new(
            *section,
            path,
            Deviation::MissingRequiredField,
        ));
    }

    findings.into_iter().collect()
}

type KnownFields<'a> = BTreeMap<(DataSection, &'a str), &'a SchemaField>;

fn index(schema: &EndpointSchema) -> KnownFields<'_> {
    schema
        .fields
        .iter()
        .map(|f| ((f.section, f.path.as_str()), f))
        .collect()
}

/// `parent` is `child` itself, or an object/array step above it
fn is_prefix_path(parent: &str, child: &str) -> bool {
    if parent.is_empty() {
        return true;
    }
    match child.strip_prefix(parent) {
        Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with("[]"),
        None => false,
    }
}

fn is_ancestor_of_known(known: &KnownFields<'_>, section: DataSection, path: &str) -> bool {
    known
        .keys()
        .any(|(s, known_path)| *s == section && is_prefix_path(path, known_path))
}

/// `path` reaches through the elements of an array that was observed empty
fn under_empty_array(observation: &Observation, section: DataSection, path: &str) -> bool {
    observation.nodes().iter().any(|node| {
        node.section == section
            && node.empty_container
            && node.types.contains(&DataType::Array)
            && path
                .strip_prefix(node.path.as_str())
                .is_some_and(|rest| rest.starts_with("[]"))
    })
}

/// Header names are case-insensitive
fn normalize_schema(schema: &EndpointSchema) -> EndpointSchema {
    EndpointSchema::new(
        schema
            .fields
            .iter()
            .map(|f| {
                let mut f = f.clone();
                if f.section.is_headers() {
                    f.path = f.path.to_ascii_lowercase();
                }
                f
            })
            .collect(),
    )
}
