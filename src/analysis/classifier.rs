//! Data field classifier
//!
//! Walks every section of a trace (query parameters, headers, bodies) into a
//! flat set of `(section, path)` observations, infers the value type at each
//! path and tags sensitive-data classes from key names and sampled values.
//!
//! Paths join object keys with `.` and flatten array elements with `[]`, so
//! `{"items": [{"sku": "a"}]}` yields `items`, `items[]` and `items[].sku`.
//! The root of a body has the empty path. Bodies that are not JSON are
//! observed as a single string at the root.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::domain::{
    ApiTrace, DataClass, DataField, DataSection, DataTag, DataType, EndpointId, Pair,
};
use crate::infra::{AnalyzerError, Result};

/// Default nesting limit for payload walking
pub const DEFAULT_MAX_DEPTH: usize = 64;

/// Default number of string samples kept per path
pub const DEFAULT_MAX_SAMPLES: usize = 8;

/// Classifier configuration
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// Maximum nesting depth before a payload is rejected as malformed
    pub max_depth: usize,
    /// Maximum string samples inspected per path
    pub max_samples: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }
}

/// Everything observed at one `(section, path)` within a single trace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedField {
    pub section: DataSection,
    pub path: String,
    /// Every type seen at this path (arrays can mix element types)
    pub types: BTreeSet<DataType>,
    pub data_classes: BTreeSet<DataClass>,
    /// Whether a scalar or empty container was seen here
    pub leaf: bool,
    /// Whether an empty object or array was seen here
    pub empty_container: bool,
}

impl ObservedField {
    /// Single reported type; a non-null type wins over `null`
    pub fn data_type(&self) -> DataType {
        self.types
            .iter()
            .copied()
            .find(|t| *t != DataType::Null)
            .unwrap_or(DataType::Null)
    }

    pub fn data_tag(&self) -> Option<DataTag> {
        tag_for(&self.data_classes)
    }

    /// Merge this observation into the field already on record
    ///
    /// Classes accumulate, the type follows the latest observation and the
    /// evidence counter goes up by one per processed trace.
    pub fn merge_into(
        &self,
        endpoint_id: EndpointId,
        prior: Option<&DataField>,
        now: DateTime<Utc>,
    ) -> DataField {
        let mut data_classes = prior
            .map(|p| p.data_classes.clone())
            .unwrap_or_default();
        data_classes.extend(self.data_classes.iter().copied());

        DataField {
            endpoint_id,
            data_section: self.section,
            data_path: self.path.clone(),
            data_tag: tag_for(&data_classes),
            data_classes,
            data_type: self.data_type(),
            matches: prior.map(|p| p.matches).unwrap_or(0) + 1,
            updated_at: now,
        }
    }
}

fn tag_for(classes: &BTreeSet<DataClass>) -> Option<DataTag> {
    classes.iter().any(DataClass::is_pii).then_some(DataTag::Pii)
}

/// All observations for one trace, ordered by `(section, path)`
#[derive(Debug, Clone, Default)]
pub struct Observation {
    fields: Vec<ObservedField>,
}

impl Observation {
    /// Every node, including non-empty containers
    pub fn nodes(&self) -> &[ObservedField] {
        &self.fields
    }

    /// Nodes that become data fields
    pub fn leaves(&self) -> impl Iterator<Item = &ObservedField> {
        self.fields.iter().filter(|f| f.leaf)
    }

    pub fn get(&self, section: DataSection, path: &str) -> Option<&ObservedField> {
        self.fields
            .iter()
            .find(|f| f.section == section && f.path == path)
    }

    pub fn has_section(&self, section: DataSection) -> bool {
        self.fields.iter().any(|f| f.section == section)
    }
}

/// How a rule inspects a field
enum Matcher {
    /// Matches the last key segment of the path
    Key(Regex),
    /// Matches a sampled string value, optionally confirmed by a checksum
    Value(Regex, Option<fn(&str) -> bool>),
}

struct Rule {
    name: &'static str,
    class: DataClass,
    matcher: Matcher,
}

impl Rule {
    fn key(name: &'static str, class: DataClass, pattern: &str) -> Result<Self> {
        Ok(Self {
            name,
            class,
            matcher: Matcher::Key(compile(pattern)?),
        })
    }

    fn value(
        name: &'static str,
        class: DataClass,
        pattern: &str,
        check: Option<fn(&str) -> bool>,
    ) -> Result<Self> {
        Ok(Self {
            name,
            class,
            matcher: Matcher::Value(compile(pattern)?, check),
        })
    }

    fn matches(&self, key: &str, samples: &[String]) -> bool {
        match &self.matcher {
            Matcher::Key(re) => !key.is_empty() && re.is_match(key),
            Matcher::Value(re, check) => samples.iter().any(|sample| {
                let sample = sample.trim();
                re.is_match(sample) && check.map_or(true, |f| f(sample))
            }),
        }
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| AnalyzerError::Internal(format!("invalid classifier pattern: {}", e)))
}

/// Sensitive-data classifier
pub struct Classifier {
    config: ClassifierConfig,
    rules: Vec<Rule>,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Result<Self> {
        let rules = vec![
            Rule::key(
                "credential_key",
                DataClass::Credential,
                r"(?i)^(password|passwd|pwd|pass|secret|client_secret|api[_-]?key|x-api-key|access[_-]?token|refresh[_-]?token|auth[_-]?token|token|authorization|proxy-authorization|private[_-]?key|session[_-]?id|cookie|set-cookie)$",
            )?,
            Rule::value(
                "email",
                DataClass::PersonalIdentifier,
                r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$",
                None,
            )?,
            Rule::value(
                "us_ssn",
                DataClass::PersonalIdentifier,
                r"^[0-9]{3}-[0-9]{2}-[0-9]{4}$",
                None,
            )?,
            Rule::value(
                "phone",
                DataClass::PersonalIdentifier,
                r"^\+?(?:[0-9]{1,3}[-. ]?)?\(?[0-9]{3}\)?[-. ]?[0-9]{3}[-. ]?[0-9]{4}$",
                None,
            )?,
            Rule::value(
                "credit_card",
                DataClass::Financial,
                r"^(?:[0-9][ -]?){12,18}[0-9]$",
                Some(luhn_valid),
            )?,
            Rule::value(
                "iban",
                DataClass::Financial,
                r"^[A-Z]{2}[0-9]{2}(?: ?[A-Z0-9]){11,30}$",
                Some(iban_valid),
            )?,
            Rule::value(
                "ipv4",
                DataClass::NetworkIdentifier,
                r"^(?:(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])\.){3}(?:25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])$",
                None,
            )?,
            Rule::value(
                "jwt",
                DataClass::Credential,
                r"^eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]*$",
                None,
            )?,
            Rule::value(
                "bearer_token",
                DataClass::Credential,
                r"(?i)^(?:bearer|basic)\s+[A-Za-z0-9\-._~+/]+=*$",
                None,
            )?,
        ];

        Ok(Self { config, rules })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Observe and classify every field in a trace
    pub fn observe(&self, trace: &ApiTrace) -> Result<Observation> {
        let mut collector = Collector::new(self.config.max_samples);

        collect_pairs(
            &mut collector,
            DataSection::RequestQuery,
            &trace.request.url.parameters,
        );
        collect_pairs(
            &mut collector,
            DataSection::RequestHeaders,
            &trace.request.headers,
        );
        self.collect_body(&mut collector, DataSection::RequestBody, &trace.request.body)?;
        collect_pairs(
            &mut collector,
            DataSection::ResponseHeaders,
            &trace.response.headers,
        );
        self.collect_body(
            &mut collector,
            DataSection::ResponseBody,
            &trace.response.body,
        )?;

        let fields = collector
            .nodes
            .into_iter()
            .map(|((section, path), node)| {
                let data_classes = if node.leaf {
                    self.classify(last_key(&path), &node.samples)
                } else {
                    BTreeSet::new()
                };
                ObservedField {
                    section,
                    path,
                    types: node.types,
                    data_classes,
                    leaf: node.leaf,
                    empty_container: node.empty_container,
                }
            })
            .collect();

        Ok(Observation { fields })
    }

    /// Classes matched by a key name and its sampled string values
    pub fn classify(&self, key: &str, samples: &[String]) -> BTreeSet<DataClass> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(key, samples))
            .inspect(|rule| tracing::trace!(rule = rule.name, key, "classifier rule matched"))
            .map(|rule| rule.class)
            .collect()
    }

    fn collect_body(
        &self,
        collector: &mut Collector,
        section: DataSection,
        body: &str,
    ) -> Result<()> {
        if body.trim().is_empty() {
            return Ok(());
        }

        match serde_json::from_str::<Value>(body) {
            Ok(value) => self.walk(collector, section, String::new(), &value, 0),
            Err(err) => {
                let depth = nesting_depth(body);
                if depth > self.config.max_depth || is_recursion_limit(&err) {
                    return Err(AnalyzerError::MalformedPayload(format!(
                        "{} nesting of {} exceeds depth {}",
                        section, depth, self.config.max_depth
                    )));
                }
                collector.record_scalar(section, String::new(), DataType::String, Some(body));
                Ok(())
            }
        }
    }

    fn walk(
        &self,
        collector: &mut Collector,
        section: DataSection,
        path: String,
        value: &Value,
        depth: usize,
    ) -> Result<()> {
        if depth > self.config.max_depth {
            return Err(AnalyzerError::MalformedPayload(format!(
                "{} nesting exceeds depth {} at '{}'",
                section, self.config.max_depth, path
            )));
        }

        match value {
            Value::Object(map) if map.is_empty() => {
                collector.record_empty(section, path, DataType::Object)
            }
            Value::Array(items) if items.is_empty() => {
                collector.record_empty(section, path, DataType::Array)
            }
            Value::Object(map) => {
                collector.record_container(section, path.clone(), DataType::Object);
                // serde_json maps iterate in key order
                for (key, child) in map {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", path, key)
                    };
                    self.walk(collector, section, child_path, child, depth + 1)?;
                }
            }
            Value::Array(items) => {
                collector.record_container(section, path.clone(), DataType::Array);
                let element_path = format!("{}[]", path);
                for item in items {
                    self.walk(collector, section, element_path.clone(), item, depth + 1)?;
                }
            }
            Value::String(s) => {
                collector.record_scalar(section, path, DataType::String, Some(s));
            }
            other => {
                collector.record_scalar(section, path, DataType::of(other), None);
            }
        }

        Ok(())
    }
}

fn collect_pairs(collector: &mut Collector, section: DataSection, pairs: &[Pair]) {
    for pair in pairs {
        let name = if section.is_headers() {
            pair.name.trim().to_ascii_lowercase()
        } else {
            pair.name.clone()
        };
        collector.record_scalar(section, name, DataType::String, Some(&pair.value));
    }
}

/// Deepest bracket nesting outside of string literals
fn nesting_depth(body: &str) -> usize {
    let mut depth = 0usize;
    let mut deepest = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for c in body.chars() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => {
                depth += 1;
                deepest = deepest.max(depth);
            }
            '}' | ']' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }

    deepest
}

/// serde_json refuses documents nested past its own recursion limit
fn is_recursion_limit(err: &serde_json::Error) -> bool {
    err.is_syntax() && err.to_string().starts_with("recursion limit exceeded")
}

/// Key segment a path ends with (`items[].card_number` -> `card_number`)
fn last_key(path: &str) -> &str {
    let trimmed = path.trim_end_matches("[]");
    trimmed.rsplit('.').next().unwrap_or(trimmed)
}

#[derive(Default)]
struct Node {
    types: BTreeSet<DataType>,
    samples: Vec<String>,
    leaf: bool,
    empty_container: bool,
}

struct Collector {
    max_samples: usize,
    nodes: BTreeMap<(DataSection, String), Node>,
}

impl Collector {
    fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            nodes: BTreeMap::new(),
        }
    }

    fn node(&mut self, section: DataSection, path: String) -> &mut Node {
        self.nodes.entry((section, path)).or_default()
    }

    fn record_container(&mut self, section: DataSection, path: String, data_type: DataType) {
        self.node(section, path).types.insert(data_type);
    }

    fn record_empty(&mut self, section: DataSection, path: String, data_type: DataType) {
        let node = self.node(section, path);
        node.types.insert(data_type);
        node.leaf = true;
        node.empty_container = true;
    }

    fn record_scalar(
        &mut self,
        section: DataSection,
        path: String,
        data_type: DataType,
        sample: Option<&str>,
    ) {
        let max_samples = self.max_samples;
        let node = self.node(section, path);
        node.types.insert(data_type);
        node.leaf = true;
        if let Some(sample) = sample {
            if node.samples.len() < max_samples {
                node.samples.push(sample.to_string());
            }
        }
    }
}

/// Luhn checksum over the digits of a card-like string
pub fn luhn_valid(value: &str) -> bool {
    let digits: Vec<u32> = value.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }

    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();

    sum % 10 == 0
}

/// ISO 13616 mod-97 check
pub fn iban_valid(value: &str) -> bool {
    let compact: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.len() < 15 || compact.len() > 34 || !compact.is_ascii() {
        return false;
    }

    let (head, tail) = compact.split_at(4);
    let mut remainder: u64 = 0;
    for c in tail.chars().chain(head.chars()) {
        let n = match c.to_digit(36) {
            Some(n) => n as u64,
            None => return false,
        };
        remainder = if n >= 10 {
            (remainder * 100 + n) % 97
        } else {
            (remainder * 10 + n) % 97
        };
    }

    remainder == 1
}
