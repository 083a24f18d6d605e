//! Data model shared by the exporter, importer and stream codecs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, FailureKind};

/// Current version of the export bundle format.
pub const FORMAT_VERSION: &str = "1.0";

/// Response shape of a CMS instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiShape {
    /// Nested shape: `{ id, attributes: { ... } }`, relations wrapped in `{ data }`.
    V4,
    /// Flattened shape: `{ id, documentId, ...fields }`.
    #[default]
    V5,
}

impl fmt::Display for ApiShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => f.write_str("v4"),
            Self::V5 => f.write_str("v5"),
        }
    }
}

/// Identity of an entity on one CMS instance.
///
/// Nested-shape instances only know numeric ids; flattened-shape instances
/// carry a string document id as well. Relation values may reference either.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    /// Both identifiers are known.
    Both {
        /// Numeric id.
        id: u64,
        /// String document id.
        document_id: String,
    },
    /// Numeric id only.
    Numeric(u64),
    /// Document id only.
    Document(String),
}

impl EntityId {
    /// Builds an id from optional parts. Returns `None` if both are missing.
    #[must_use]
    pub fn from_parts(id: Option<u64>, document_id: Option<String>) -> Option<Self> {
        match (id, document_id) {
            (Some(id), Some(document_id)) => Some(Self::Both { id, document_id }),
            (Some(id), None) => Some(Self::Numeric(id)),
            (None, Some(document_id)) => Some(Self::Document(document_id)),
            (None, None) => None,
        }
    }

    /// Parses a relation or media reference value (number, numeric string or
    /// document id string, or an object with `id` / `documentId`).
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(Self::Numeric),
            Value::String(s) if !s.is_empty() => Some(Self::Document(s.clone())),
            Value::Object(map) => {
                let id = map.get("id").and_then(Value::as_u64);
                let document_id = map
                    .get("documentId")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Self::from_parts(id, document_id)
            }
            _ => None,
        }
    }

    /// Numeric id, if known.
    #[must_use]
    pub fn numeric(&self) -> Option<u64> {
        match self {
            Self::Both { id, .. } | Self::Numeric(id) => Some(*id),
            Self::Document(_) => None,
        }
    }

    /// Document id, if known.
    #[must_use]
    pub fn document_id(&self) -> Option<&str> {
        match self {
            Self::Both { document_id, .. } | Self::Document(document_id) => Some(document_id),
            Self::Numeric(_) => None,
        }
    }

    /// Picks the identifier used to address this entity on an instance of the
    /// given shape. The same rule is used for endpoint paths and relation values.
    #[must_use]
    pub fn key_for(&self, shape: ApiShape) -> EntityKey {
        match (self, shape) {
            (Self::Both { document_id, .. }, ApiShape::V5) => {
                EntityKey::Document(document_id.clone())
            }
            (Self::Both { id, .. }, ApiShape::V4) => EntityKey::Numeric(*id),
            (Self::Numeric(id), _) => EntityKey::Numeric(*id),
            (Self::Document(document_id), _) => EntityKey::Document(document_id.clone()),
        }
    }

    /// True if the two ids share a numeric id or a document id.
    #[must_use]
    pub fn matches(&self, other: &EntityId) -> bool {
        let numeric = matches!((self.numeric(), other.numeric()), (Some(a), Some(b)) if a == b);
        let document =
            matches!((self.document_id(), other.document_id()), (Some(a), Some(b)) if a == b);
        numeric || document
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Both { id, document_id } => write!(f, "{id}/{document_id}"),
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Document(document_id) => f.write_str(document_id),
        }
    }
}

/// A single identifier used in an endpoint path or a relation field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityKey {
    /// Numeric id.
    Numeric(u64),
    /// Document id.
    Document(String),
}

impl EntityKey {
    /// JSON value written into relation fields.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Numeric(id) => Value::from(*id),
            Self::Document(document_id) => Value::from(document_id.as_str()),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Document(document_id) => f.write_str(document_id),
        }
    }
}

/// One segment of a [`FieldPath`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathSegment {
    /// Object field.
    Field(String),
    /// Array index (repeatable component or dynamic zone item).
    Index(usize),
}

/// Location of a relation or media field inside an entity body.
///
/// Rendered as `author`, `seo.image` or `blocks[0].author`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct FieldPath(Vec<PathSegment>);

impl FieldPath {
    /// Path with a single top-level field.
    #[must_use]
    pub fn field(name: impl Into<String>) -> Self {
        Self(vec![PathSegment::Field(name.into())])
    }

    /// Returns a new path extended with a field segment.
    #[must_use]
    pub fn join(&self, name: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Field(name.to_string()));
        Self(segments)
    }

    /// Returns a new path extended with an index segment.
    #[must_use]
    pub fn index(&self, idx: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(idx));
        Self(segments)
    }

    /// Path segments.
    #[must_use]
    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    /// Top-level field this path starts with.
    #[must_use]
    pub fn root(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Field(name)) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Field(name) if i == 0 => f.write_str(name)?,
                PathSegment::Field(name) => write!(f, ".{name}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::Serialization(format!("invalid field path '{s}'"));
        let mut segments = Vec::new();
        for part in s.split('.') {
            let (name, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };
            if name.is_empty() {
                return Err(invalid());
            }
            segments.push(PathSegment::Field(name.to_string()));
            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(invalid)?;
                let idx = rest[1..close].parse::<usize>().map_err(|_| invalid())?;
                segments.push(PathSegment::Index(idx));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid());
                }
            }
        }
        Ok(Self(segments))
    }
}

impl Serialize for FieldPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FieldPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Relation cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// At most one referenced entity.
    One,
    /// Ordered list of referenced entities.
    Many,
}

/// Relation references extracted from one relation field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEntry {
    /// Location of the field in the entity body.
    pub path: FieldPath,
    /// Target content type uid (unknown in heuristic mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Cardinality of the field.
    pub cardinality: Cardinality,
    /// Referenced source ids, in field order.
    pub refs: Vec<EntityId>,
}

/// Media references extracted from one media field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaEntry {
    /// Location of the field in the entity body.
    pub path: FieldPath,
    /// Whether the field holds a list of media.
    pub multiple: bool,
    /// Referenced source media ids.
    pub ids: Vec<u64>,
}

/// One exported entity: relation-free body plus extracted references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedEntity {
    /// Content type uid (e.g. `api::article.article`).
    pub content_type: String,
    /// Source identity.
    pub id: EntityId,
    /// Attribute body with relation and media fields removed.
    pub body: Map<String, Value>,
    /// Extracted relation references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relations: Vec<RelationEntry>,
    /// Extracted media references.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaEntry>,
}

impl ExportedEntity {
    /// Iterates over every referenced source id with its relation entry.
    pub fn relation_refs(&self) -> impl Iterator<Item = (&RelationEntry, &EntityId)> {
        self.relations
            .iter()
            .flat_map(|entry| entry.refs.iter().map(move |id| (entry, id)))
    }
}

/// Media manifest record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    /// Source media id.
    pub id: u64,
    /// File name.
    pub name: String,
    /// MIME type.
    #[serde(default)]
    pub mime: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Source URL.
    #[serde(default)]
    pub url: String,
    /// Hash reported by the source instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
    /// SHA-256 of the downloaded content (hex).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// File name inside the bundle's media directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

/// Per-entity failure recorded in results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityFailure {
    /// Content type uid.
    pub content_type: String,
    /// Source identity, when the failure concerns one entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<EntityId>,
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable reason.
    pub reason: String,
}

impl EntityFailure {
    /// Builds a failure record from an error.
    #[must_use]
    pub fn from_error(content_type: &str, source_id: Option<EntityId>, error: &Error) -> Self {
        Self {
            content_type: content_type.to_string(),
            source_id,
            kind: error.kind(),
            reason: error.to_string(),
        }
    }
}

/// Per-asset media failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFailure {
    /// Source media id.
    pub media_id: u64,
    /// Human-readable reason.
    pub reason: String,
}

/// A relation reference that could not be resolved (or validated).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnresolvedRelation {
    /// Content type of the referencing entity.
    pub content_type: String,
    /// Source identity of the referencing entity.
    pub source_id: EntityId,
    /// Relation path inside the referencing entity.
    pub path: String,
    /// Target content type, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// The referenced source id that is missing.
    pub missing: EntityId,
}

/// Metadata describing one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportMetadata {
    /// Bundle format version.
    pub format_version: String,
    /// Export timestamp.
    pub exported_at: DateTime<Utc>,
    /// Source instance fingerprint (diagnostics only).
    pub source_fingerprint: String,
    /// Response shape of the source instance.
    pub source_shape: ApiShape,
    /// Content types requested.
    pub content_types: Vec<String>,
    /// Entities written per content type.
    pub entity_counts: BTreeMap<String, u64>,
    /// Media records written to the manifest.
    pub media_count: u64,
    /// Content types exported with heuristic relation detection.
    #[serde(default)]
    pub heuristic_content_types: Vec<String>,
    /// Failures recorded during export.
    #[serde(default)]
    pub failures: Vec<EntityFailure>,
    /// Media assets that could not be downloaded.
    #[serde(default)]
    pub media_failures: Vec<MediaFailure>,
    /// Relation references to entities outside the export set.
    #[serde(default)]
    pub relation_violations: Vec<UnresolvedRelation>,
    /// Whether the export was cancelled before completion.
    #[serde(default)]
    pub cancelled: bool,
}

impl ExportMetadata {
    /// Creates empty metadata for a new export.
    #[must_use]
    pub fn new(
        content_types: Vec<String>,
        source_fingerprint: String,
        source_shape: ApiShape,
    ) -> Self {
        Self {
            format_version: FORMAT_VERSION.to_string(),
            exported_at: Utc::now(),
            source_fingerprint,
            source_shape,
            content_types,
            entity_counts: BTreeMap::new(),
            media_count: 0,
            heuristic_content_types: Vec::new(),
            failures: Vec::new(),
            media_failures: Vec::new(),
            relation_violations: Vec::new(),
            cancelled: false,
        }
    }

    /// Total entities written across all content types.
    #[must_use]
    pub fn total_entities(&self) -> u64 {
        self.entity_counts.values().sum()
    }

    /// True if the export finished without recorded failures.
    #[must_use]
    pub fn is_complete_success(&self) -> bool {
        !self.cancelled && self.failures.is_empty() && self.media_failures.is_empty()
    }
}

/// Result of a buffered export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportData {
    /// Export metadata.
    pub metadata: ExportMetadata,
    /// Exported entities, in export order.
    pub entities: Vec<ExportedEntity>,
    /// Media manifest.
    pub media: Vec<MediaRecord>,
}
