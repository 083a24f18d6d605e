//! Content-type schemas and the process-wide schema cache.
//!
//! A [`ContentTypeSchema`] is an ordered list of fields whose kinds form a
//! tree: components and dynamic zones embed the schemas of their members, so
//! relation extraction can walk nested structures without further lookups.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::client::{RawSchema, SchemaSource};
use crate::error::{Error, Result};
use crate::model::Cardinality;

/// Maximum component nesting depth accepted when resolving a schema.
pub const MAX_COMPONENT_DEPTH: usize = 16;

/// Kind of a schema field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    /// Plain value copied as-is.
    Scalar,
    /// Media reference(s).
    Media {
        /// Whether the field holds a list.
        multiple: bool,
    },
    /// Reference(s) to entities of another content type.
    Relation {
        /// Target content type uid.
        target: String,
        /// Single or list.
        cardinality: Cardinality,
    },
    /// Embedded component.
    Component {
        /// Component schema.
        schema: Arc<ContentTypeSchema>,
        /// Whether the field holds a list of instances.
        repeatable: bool,
    },
    /// Ordered list of heterogeneous components tagged by `__component`.
    DynamicZone {
        /// Allowed component schemas keyed by uid.
        schemas: BTreeMap<String, Arc<ContentTypeSchema>>,
    },
}

/// One field of a schema.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSchema {
    /// Field name.
    pub name: String,
    /// Field kind.
    pub kind: FieldKind,
}

/// Schema of a content type or component.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContentTypeSchema {
    /// Content type or component uid.
    pub uid: String,
    /// REST plural name (content types only).
    pub plural_name: Option<String>,
    /// Fields in declaration order.
    pub fields: Vec<FieldSchema>,
}

impl ContentTypeSchema {
    /// Looks up a field by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// True if any field, including nested component fields, is a relation.
    #[must_use]
    pub fn has_relations(&self) -> bool {
        self.fields.iter().any(|f| match &f.kind {
            FieldKind::Relation { .. } => true,
            FieldKind::Component { schema, .. } => schema.has_relations(),
            FieldKind::DynamicZone { schemas } => schemas.values().any(|s| s.has_relations()),
            _ => false,
        })
    }
}

/// Attribute definition as it appears in a raw schema, before nested
/// component schemas are resolved.
#[derive(Debug, Clone, PartialEq)]
enum RawKind {
    Scalar,
    Media { multiple: bool },
    Relation { target: String, cardinality: Cardinality },
    Component { uid: String, repeatable: bool },
    DynamicZone { uids: Vec<String> },
}

fn relation_cardinality(relation: &str) -> Cardinality {
    match relation {
        "oneToOne" | "manyToOne" | "oneWay" => Cardinality::One,
        _ => Cardinality::Many,
    }
}

fn parse_attribute(definition: &Value) -> RawKind {
    let str_field = |key: &str| definition.get(key).and_then(Value::as_str);
    match str_field("type") {
        Some("relation") => {
            let relation = str_field("relation").unwrap_or_default();
            match str_field("target") {
                Some(target) if !relation.starts_with("morph") => RawKind::Relation {
                    target: target.to_string(),
                    cardinality: relation_cardinality(relation),
                },
                _ => RawKind::Scalar,
            }
        }
        Some("media") => RawKind::Media {
            multiple: definition
                .get("multiple")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        },
        Some("component") => match str_field("component") {
            Some(uid) => RawKind::Component {
                uid: uid.to_string(),
                repeatable: definition
                    .get("repeatable")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            None => RawKind::Scalar,
        },
        Some("dynamiczone") => RawKind::DynamicZone {
            uids: definition
                .get("components")
                .and_then(Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        _ => RawKind::Scalar,
    }
}

/// Lazily fetched, process-lifetime cache of content-type and component schemas.
pub struct SchemaCache {
    source: Arc<dyn SchemaSource>,
    content_types: RwLock<HashMap<String, Arc<ContentTypeSchema>>>,
    components: RwLock<HashMap<String, Arc<ContentTypeSchema>>>,
    fetches: AtomicUsize,
}

impl SchemaCache {
    /// Creates an empty cache over a schema source.
    pub fn new(source: Arc<dyn SchemaSource>) -> Self {
        Self {
            source,
            content_types: RwLock::new(HashMap::new()),
            components: RwLock::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Returns the schema of a content type, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaUnavailable`] if the schema or one of its nested
    /// component schemas cannot be fetched.
    pub async fn get_schema(&self, uid: &str) -> Result<Arc<ContentTypeSchema>> {
        let cached = self.content_types.read().get(uid).cloned();
        if let Some(schema) = cached {
            return Ok(schema);
        }
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let raw = self
            .source
            .fetch_content_type(uid)
            .await
            .map_err(|e| Self::unavailable(uid, e))?;
        let schema = Arc::new(self.build(raw, 0).await?);
        debug!("Cached schema for {} ({} fields)", uid, schema.fields.len());
        self.content_types
            .write()
            .insert(uid.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    /// Returns the schema of a component, fetching it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SchemaUnavailable`] if the schema cannot be fetched.
    pub async fn get_component_schema(&self, uid: &str) -> Result<Arc<ContentTypeSchema>> {
        self.component(uid.to_string(), 0).await
    }

    /// Drops every cached schema.
    pub fn clear(&self) {
        self.content_types.write().clear();
        self.components.write().clear();
    }

    /// Number of cached schemas (content types and components).
    #[must_use]
    pub fn len(&self) -> usize {
        self.content_types.read().len() + self.components.read().len()
    }

    /// True if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetches issued to the schema source.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn unavailable(uid: &str, error: Error) -> Error {
        match error {
            Error::SchemaUnavailable { .. } => error,
            other => Error::schema_unavailable(uid, other),
        }
    }

    fn component(&self, uid: String, depth: usize) -> BoxFuture<'_, Result<Arc<ContentTypeSchema>>> {
        Box::pin(async move {
            if depth > MAX_COMPONENT_DEPTH {
                return Err(Error::schema_unavailable(
                    uid,
                    format!("component nesting deeper than {}", MAX_COMPONENT_DEPTH),
                ));
            }
            let cached = self.components.read().get(&uid).cloned();
            if let Some(schema) = cached {
                return Ok(schema);
            }
            self.fetches.fetch_add(1, Ordering::Relaxed);
            let raw = self
                .source
                .fetch_component(&uid)
                .await
                .map_err(|e| Self::unavailable(&uid, e))?;
            let schema = Arc::new(self.build(raw, depth + 1).await?);
            self.components.write().insert(uid, Arc::clone(&schema));
            Ok(schema)
        })
    }

    async fn build(&self, raw: RawSchema, depth: usize) -> Result<ContentTypeSchema> {
        let mut fields = Vec::with_capacity(raw.attributes.len());
        for (name, definition) in &raw.attributes {
            let kind = match parse_attribute(definition) {
                RawKind::Scalar => FieldKind::Scalar,
                RawKind::Media { multiple } => FieldKind::Media { multiple },
                RawKind::Relation {
                    target,
                    cardinality,
                } => FieldKind::Relation {
                    target,
                    cardinality,
                },
                RawKind::Component { uid, repeatable } => FieldKind::Component {
                    schema: self.component(uid, depth).await?,
                    repeatable,
                },
                RawKind::DynamicZone { uids } => {
                    let mut schemas = BTreeMap::new();
                    for uid in uids {
                        let schema = self.component(uid.clone(), depth).await?;
                        schemas.insert(uid, schema);
                    }
                    FieldKind::DynamicZone { schemas }
                }
            };
            fields.push(FieldSchema {
                name: name.clone(),
                kind,
            });
        }
        Ok(ContentTypeSchema {
            uid: raw.uid,
            plural_name: raw.plural_name,
            fields,
        })
    }
}

#[cfg(test)]
#[path = "schema_tests.rs"]
mod tests;
