//! # Domain Types
//!
//! Addressable objects, their descriptors and the telemetry samples flowing
//! through the provider chains. Everything here is plain data: cheap to clone,
//! safe to share between the ingestion task and the distribution timer.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// Key of the reserved root sentinel.
pub const ROOT_KEY: &str = "ROOT";

/// Value key carrying the sample time (milliseconds since the Unix epoch).
pub const TIMESTAMP_KEY: &str = "timestamp";

/// # Object Identifier
///
/// Globally unique composite key of a domain object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    /// The provider namespace, e.g. `example.telemetry`.
    pub namespace: String,
    /// The object key inside the namespace.
    pub key: String,
}

impl Identifier {
    /// Creates an identifier from a namespace and a key.
    pub fn new(namespace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            key: key.into(),
        }
    }

    /// The root sentinel. It resolves without any registered provider.
    pub fn root() -> Self {
        Self::new("", ROOT_KEY)
    }

    /// True for the root sentinel.
    pub fn is_root(&self) -> bool {
        self.namespace.is_empty() && self.key == ROOT_KEY
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.key)
        } else {
            write!(f, "{}:{}", self.namespace, self.key)
        }
    }
}

/// Parent location of an object: either another object or the root sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Directly under the root.
    Root,
    /// Inside another object.
    Object(Identifier),
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Location::Root => serializer.serialize_str(ROOT_KEY),
            Location::Object(identifier) => identifier.serialize(serializer),
        }
    }
}

/// Rank hints for a telemetry value. A `domain` value is an independent axis
/// (time), a `range` value is a dependent measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueHints {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<u32>,
}

/// Describes one value of a telemetry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueMetadata {
    pub key: String,
    pub name: String,
    pub format: String,
    pub hints: ValueHints,
}

impl ValueMetadata {
    /// An independent axis value with the given rank.
    pub fn domain(key: &str, name: &str, format: &str, rank: u32) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            format: format.to_string(),
            hints: ValueHints { domain: Some(rank), range: None },
        }
    }

    /// A dependent measurement with the given rank.
    pub fn range(key: &str, name: &str, format: &str, rank: u32) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            format: format.to_string(),
            hints: ValueHints { domain: None, range: Some(rank) },
        }
    }
}

/// Rejections raised while validating [`TelemetryMetadata`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetadataError {
    #[error("telemetry metadata declares no domain value")]
    NoDomain,
    #[error("telemetry metadata declares several domain values: {0:?}")]
    MultipleDomains(Vec<String>),
    #[error("telemetry value key '{0}' is declared twice")]
    DuplicateKey(String),
}

/// # Telemetry Metadata
///
/// Ordered value descriptions of a telemetry point. Construction enforces the
/// single time axis invariant: exactly one value carries a `domain` hint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TelemetryMetadata {
    values: Vec<ValueMetadata>,
}

impl TelemetryMetadata {
    /// Validates and wraps the value list.
    pub fn new(values: Vec<ValueMetadata>) -> Result<Self, MetadataError> {
        let mut seen = std::collections::HashSet::new();
        for value in &values {
            if !seen.insert(value.key.as_str()) {
                return Err(MetadataError::DuplicateKey(value.key.clone()));
            }
        }

        let domains: Vec<String> = values
            .iter()
            .filter(|v| v.hints.domain.is_some())
            .map(|v| v.key.clone())
            .collect();
        match domains.len() {
            0 => Err(MetadataError::NoDomain),
            1 => Ok(Self { values }),
            _ => Err(MetadataError::MultipleDomains(domains)),
        }
    }

    /// All values in declaration order.
    pub fn values(&self) -> &[ValueMetadata] {
        &self.values
    }

    /// The independent (time) axis.
    pub fn domain(&self) -> &ValueMetadata {
        // `new` guarantees exactly one domain value.
        self.values
            .iter()
            .find(|v| v.hints.domain.is_some())
            .unwrap_or(&self.values[0])
    }

    /// Range values ordered by their rank.
    pub fn ranges(&self) -> Vec<&ValueMetadata> {
        let mut ranges: Vec<&ValueMetadata> =
            self.values.iter().filter(|v| v.hints.range.is_some()).collect();
        ranges.sort_by_key(|v| v.hints.range);
        ranges
    }

    /// Looks up one value by key.
    pub fn value(&self, key: &str) -> Option<&ValueMetadata> {
        self.values.iter().find(|v| v.key == key)
    }
}

/// A type definition contributed by a module (e.g. `folder`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectType {
    pub key: String,
    pub name: String,
    pub description: String,
    pub creatable: bool,
}

impl ObjectType {
    pub fn new(key: &str, name: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            creatable: false,
        }
    }
}

/// # Object Descriptor
///
/// The resolved description of a domain object, produced on demand by an
/// object provider and never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectDescriptor {
    pub identifier: Identifier,
    pub name: String,
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<TelemetryMetadata>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub composition: Vec<Identifier>,
}

impl ObjectDescriptor {
    pub fn new(identifier: Identifier, name: impl Into<String>, object_type: impl Into<String>) -> Self {
        Self {
            identifier,
            name: name.into(),
            object_type: object_type.into(),
            location: None,
            telemetry: None,
            composition: Vec::new(),
        }
    }

    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetryMetadata) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn with_composition(mut self, composition: Vec<Identifier>) -> Self {
        self.composition = composition;
        self
    }
}

/// A single telemetry value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    /// Converts a JSON value. `null`, arrays and objects are not scalars.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Scalar::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Scalar::Integer(i)),
                None => n.as_f64().map(Scalar::Float),
            },
            serde_json::Value::String(s) => Some(Scalar::Text(s.clone())),
            _ => None,
        }
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Integer(i) => Some(*i as f64),
            Scalar::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<f64> for Scalar {
    fn from(value: f64) -> Self {
        Scalar::Float(value)
    }
}

impl From<i64> for Scalar {
    fn from(value: i64) -> Self {
        Scalar::Integer(value)
    }
}

/// # Telemetry Datum
///
/// One timestamped sample: a flat map of value key to scalar, tagged with the
/// owning object. A key that is absent means no sample for that value, never
/// an implicit zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryDatum {
    pub identifier: Identifier,
    pub values: BTreeMap<String, Scalar>,
}

impl TelemetryDatum {
    /// Creates a datum holding only its timestamp.
    pub fn new(identifier: Identifier, timestamp: i64) -> Self {
        let mut values = BTreeMap::new();
        values.insert(TIMESTAMP_KEY.to_string(), Scalar::Integer(timestamp));
        Self { identifier, values }
    }

    pub fn with_value(mut self, key: &str, value: impl Into<Scalar>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Scalar>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Scalar> {
        self.values.get(key)
    }

    /// Sample time in epoch milliseconds.
    pub fn timestamp(&self) -> Option<i64> {
        match self.values.get(TIMESTAMP_KEY) {
            Some(Scalar::Integer(ts)) => Some(*ts),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_sentinel_is_distinct_from_namespaced_root_keys() {
        assert!(Identifier::root().is_root());
        assert!(!Identifier::new("example.telemetry", "ROOT").is_root());
        assert_eq!(Identifier::root().to_string(), "ROOT");
        assert_eq!(Identifier::new("a", "b").to_string(), "a:b");
    }

    #[test]
    fn metadata_requires_exactly_one_domain() {
        let lat = ValueMetadata::range("latitude", "Latitude", "float", 1);
        assert_eq!(
            TelemetryMetadata::new(vec![lat.clone()]),
            Err(MetadataError::NoDomain)
        );

        let t1 = ValueMetadata::domain("timestamp", "Timestamp", "utc", 1);
        let t2 = ValueMetadata::domain("met", "Mission Time", "duration", 2);
        assert!(matches!(
            TelemetryMetadata::new(vec![t1.clone(), t2, lat.clone()]),
            Err(MetadataError::MultipleDomains(keys)) if keys.len() == 2
        ));

        let metadata = TelemetryMetadata::new(vec![t1, lat]).unwrap();
        assert_eq!(metadata.domain().key, "timestamp");
    }

    #[test]
    fn metadata_rejects_duplicate_keys_and_orders_ranges() {
        let t = ValueMetadata::domain("timestamp", "Timestamp", "utc", 1);
        let dup = ValueMetadata::range("timestamp", "Again", "float", 1);
        assert_eq!(
            TelemetryMetadata::new(vec![t.clone(), dup]),
            Err(MetadataError::DuplicateKey("timestamp".into()))
        );

        let metadata = TelemetryMetadata::new(vec![
            t,
            ValueMetadata::range("longitude", "Longitude", "float", 2),
            ValueMetadata::range("latitude", "Latitude", "float", 1),
        ])
        .unwrap();
        let keys: Vec<&str> = metadata.ranges().iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["latitude", "longitude"]);
    }

    #[test]
    fn datum_keeps_missing_values_absent() {
        let datum = TelemetryDatum::new(Identifier::new("ns", "x"), 1000).with_value("lat", 1.0);
        assert_eq!(datum.timestamp(), Some(1000));
        assert_eq!(datum.get("lat"), Some(&Scalar::Float(1.0)));
        assert_eq!(datum.get("lon"), None);
    }

    #[test]
    fn descriptor_serializes_root_location_as_sentinel() {
        let folder = ObjectDescriptor::new(Identifier::new("ns", "root"), "Folder", "folder")
            .with_location(Location::Root);
        let json = serde_json::to_value(&folder).unwrap();
        assert_eq!(json["location"], "ROOT");
        assert_eq!(json["type"], "folder");
    }
}
