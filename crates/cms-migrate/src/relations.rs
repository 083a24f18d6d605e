//! Relation extraction and reinsertion.
//!
//! Export splits every entity into a relation-free body and a list of
//! [`RelationEntry`] / [`MediaEntry`] records keyed by [`FieldPath`]. Import
//! writes the body first, then puts the references back once every target id
//! is known.
//!
//! Both relation encodings are accepted on extraction: the nested shape wraps
//! references in `{"data": ...}`, the flattened shape inlines them as objects,
//! bare ids or arrays.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::mapping::IdResolver;
use crate::model::{
    ApiShape, Cardinality, EntityId, FieldPath, MediaEntry, PathSegment, RelationEntry,
};
use crate::schema::{ContentTypeSchema, FieldKind};

/// Output of relation extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extracted {
    /// Body with relation and media fields removed.
    pub body: Map<String, Value>,
    /// Relation references, in schema field order.
    pub relations: Vec<RelationEntry>,
    /// Media references, in schema field order.
    pub media: Vec<MediaEntry>,
}

/// A reference that could not be written back.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedRef {
    /// Relation path.
    pub path: FieldPath,
    /// Target content type, if known.
    pub target: Option<String>,
    /// Source id without a mapping entry.
    pub missing: EntityId,
}

/// Parses a relation field value into source ids, in order.
#[must_use]
pub fn relation_refs(value: &Value) -> Vec<EntityId> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.iter().filter_map(EntityId::from_json).collect(),
        Value::Object(map) if map.contains_key("data") => relation_refs(&map["data"]),
        other => EntityId::from_json(other).into_iter().collect(),
    }
}

/// Parses a media field value into media ids, in order.
#[must_use]
pub fn media_ids(value: &Value) -> Vec<u64> {
    match value {
        Value::Null => Vec::new(),
        Value::Number(n) => n.as_u64().into_iter().collect(),
        Value::Array(items) => items.iter().flat_map(media_ids).collect(),
        Value::Object(map) if map.contains_key("data") => media_ids(&map["data"]),
        Value::Object(map) => map.get("id").and_then(Value::as_u64).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn child_path(prefix: Option<&FieldPath>, name: &str) -> FieldPath {
    match prefix {
        Some(prefix) => prefix.join(name),
        None => FieldPath::field(name),
    }
}

/// Extracts relations and media from `body` following `schema`.
///
/// Component instances lose their `id`. A dynamic zone item whose
/// `__component` is not declared by the schema fails the whole entity.
pub fn extract(body: &Map<String, Value>, schema: &ContentTypeSchema) -> Result<Extracted> {
    let mut relations = Vec::new();
    let mut media = Vec::new();
    let body = walk_schema(body, schema, None, &mut relations, &mut media)?;
    Ok(Extracted {
        body,
        relations,
        media,
    })
}

fn walk_schema(
    body: &Map<String, Value>,
    schema: &ContentTypeSchema,
    prefix: Option<&FieldPath>,
    relations: &mut Vec<RelationEntry>,
    media: &mut Vec<MediaEntry>,
) -> Result<Map<String, Value>> {
    let mut out = body.clone();
    for field in &schema.fields {
        let Some(value) = body.get(&field.name) else {
            continue;
        };
        let path = child_path(prefix, &field.name);
        match &field.kind {
            FieldKind::Scalar => {}
            FieldKind::Relation {
                target,
                cardinality,
            } => {
                out.shift_remove(&field.name);
                let refs = relation_refs(value);
                if !refs.is_empty() {
                    relations.push(RelationEntry {
                        path,
                        target: Some(target.clone()),
                        cardinality: *cardinality,
                        refs,
                    });
                }
            }
            FieldKind::Media { multiple } => {
                out.shift_remove(&field.name);
                let ids = media_ids(value);
                if !ids.is_empty() {
                    media.push(MediaEntry {
                        path,
                        multiple: *multiple,
                        ids,
                    });
                }
            }
            FieldKind::Component {
                schema: component,
                repeatable,
            } => {
                let rewritten = match (value, repeatable) {
                    (Value::Array(items), true) => {
                        let mut instances = Vec::with_capacity(items.len());
                        for (idx, item) in items.iter().enumerate() {
                            instances.push(walk_component(
                                item,
                                component,
                                &path.index(idx),
                                relations,
                                media,
                            )?);
                        }
                        Value::Array(instances)
                    }
                    (item, _) => walk_component(item, component, &path, relations, media)?,
                };
                out.insert(field.name.clone(), rewritten);
            }
            FieldKind::DynamicZone { schemas } => {
                let Value::Array(items) = value else {
                    continue;
                };
                let mut rewritten = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    let uid = item
                        .get("__component")
                        .and_then(Value::as_str)
                        .unwrap_or_default();
                    let component = schemas.get(uid).ok_or_else(|| {
                        Error::schema_unavailable(
                            uid,
                            format!("not declared by dynamic zone '{}'", path),
                        )
                    })?;
                    rewritten.push(walk_component(
                        item,
                        component,
                        &path.index(idx),
                        relations,
                        media,
                    )?);
                }
                out.insert(field.name.clone(), Value::Array(rewritten));
            }
        }
    }
    Ok(out)
}

fn walk_component(
    value: &Value,
    schema: &ContentTypeSchema,
    path: &FieldPath,
    relations: &mut Vec<RelationEntry>,
    media: &mut Vec<MediaEntry>,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            let mut body = walk_schema(map, schema, Some(path), relations, media)?;
            body.shift_remove("id");
            Ok(Value::Object(body))
        }
        other => Ok(other.clone()),
    }
}

fn is_media_object(value: &Value) -> bool {
    value.get("mime").is_some()
        || value
            .get("attributes")
            .and_then(|attrs| attrs.get("mime"))
            .is_some()
}

fn is_entity_object(value: &Value) -> bool {
    value.get("documentId").is_some()
}

/// Extracts relations and media without a schema.
///
/// `{"data": ...}` wrappers and objects carrying `documentId` are relations,
/// objects carrying `mime` are media. Relation targets stay unknown.
#[must_use]
pub fn extract_heuristic(body: &Map<String, Value>) -> Extracted {
    let mut relations = Vec::new();
    let mut media = Vec::new();
    let body = walk_heuristic(body, None, &mut relations, &mut media);
    Extracted {
        body,
        relations,
        media,
    }
}

fn walk_heuristic(
    body: &Map<String, Value>,
    prefix: Option<&FieldPath>,
    relations: &mut Vec<RelationEntry>,
    media: &mut Vec<MediaEntry>,
) -> Map<String, Value> {
    let mut out = Map::new();
    for (name, value) in body {
        let path = child_path(prefix, name);
        match classify(value) {
            Heuristic::Relation(cardinality) => {
                let refs = relation_refs(value);
                if !refs.is_empty() {
                    relations.push(RelationEntry {
                        path,
                        target: None,
                        cardinality,
                        refs,
                    });
                }
            }
            Heuristic::Media(multiple) => {
                let ids = media_ids(value);
                if !ids.is_empty() {
                    media.push(MediaEntry {
                        path,
                        multiple,
                        ids,
                    });
                }
            }
            Heuristic::Nested => {
                let rewritten = match value {
                    Value::Object(map) => {
                        Value::Object(heuristic_component(map, &path, relations, media))
                    }
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .enumerate()
                            .map(|(idx, item)| match item {
                                Value::Object(map) => Value::Object(heuristic_component(
                                    map,
                                    &path.index(idx),
                                    relations,
                                    media,
                                )),
                                other => other.clone(),
                            })
                            .collect(),
                    ),
                    other => other.clone(),
                };
                out.insert(name.clone(), rewritten);
            }
            Heuristic::Scalar => {
                out.insert(name.clone(), value.clone());
            }
        }
    }
    out
}

fn heuristic_component(
    map: &Map<String, Value>,
    path: &FieldPath,
    relations: &mut Vec<RelationEntry>,
    media: &mut Vec<MediaEntry>,
) -> Map<String, Value> {
    let mut body = walk_heuristic(map, Some(path), relations, media);
    if body.contains_key("__component") {
        body.shift_remove("id");
    }
    body
}

enum Heuristic {
    Relation(Cardinality),
    Media(bool),
    Nested,
    Scalar,
}

fn classify(value: &Value) -> Heuristic {
    match value {
        Value::Object(map) if map.contains_key("data") => match &map["data"] {
            Value::Array(items) if items.iter().any(is_media_object) => Heuristic::Media(true),
            Value::Array(_) => Heuristic::Relation(Cardinality::Many),
            item if is_media_object(item) => Heuristic::Media(false),
            _ => Heuristic::Relation(Cardinality::One),
        },
        Value::Object(_) if is_media_object(value) => Heuristic::Media(false),
        Value::Object(_) if is_entity_object(value) => Heuristic::Relation(Cardinality::One),
        Value::Object(_) => Heuristic::Nested,
        Value::Array(items) if !items.is_empty() && items.iter().all(is_media_object) => {
            Heuristic::Media(true)
        }
        Value::Array(items) if !items.is_empty() && items.iter().all(is_entity_object) => {
            Heuristic::Relation(Cardinality::Many)
        }
        Value::Array(items) if items.iter().any(Value::is_object) => Heuristic::Nested,
        _ => Heuristic::Scalar,
    }
}

/// Writes `value` at `path` inside `body`. Missing object levels are
/// created; a missing array element fails the write.
fn set_path(body: &mut Map<String, Value>, path: &FieldPath, value: Value) -> bool {
    let segments = path.segments();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };
    let PathSegment::Field(last_name) = last else {
        return false;
    };

    let mut current = body;
    let mut iter = parents.iter().peekable();
    while let Some(segment) = iter.next() {
        let PathSegment::Field(name) = segment else {
            return false;
        };
        let mut node = current
            .entry(name.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        while let Some(PathSegment::Index(idx)) = iter.peek().copied() {
            iter.next();
            node = match node.get_mut(*idx) {
                Some(item) => item,
                None => return false,
            };
        }
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        current = match node.as_object_mut() {
            Some(map) => map,
            None => return false,
        };
    }
    current.insert(last_name.clone(), value);
    true
}

/// Drops the leaf at `path` when every level leading to it exists.
fn remove_path(body: &mut Map<String, Value>, path: &FieldPath) {
    let Some((PathSegment::Field(last_name), parents)) = path.segments().split_last() else {
        return;
    };
    let mut current = body;
    let mut iter = parents.iter().peekable();
    while let Some(segment) = iter.next() {
        let PathSegment::Field(name) = segment else {
            return;
        };
        let Some(mut node) = current.get_mut(name) else {
            return;
        };
        while let Some(PathSegment::Index(idx)) = iter.peek().copied() {
            iter.next();
            node = match node.get_mut(*idx) {
                Some(item) => item,
                None => return,
            };
        }
        current = match node.as_object_mut() {
            Some(map) => map,
            None => return,
        };
    }
    current.shift_remove(last_name);
}

/// Puts resolved relation references back into `body`.
///
/// Each source id is translated through `resolver` and written as the
/// identifier native to `target_shape`. Single relations become one value,
/// list relations an array. Ids without a mapping entry are left out and
/// returned; a relation with nothing resolved is omitted from the body so
/// the target keeps whatever it already holds there.
pub fn reinsert(
    body: &Map<String, Value>,
    relations: &[RelationEntry],
    resolver: &dyn IdResolver,
    target_shape: ApiShape,
) -> (Map<String, Value>, Vec<UnresolvedRef>) {
    let mut out = body.clone();
    let mut unresolved = Vec::new();

    for entry in relations {
        let mut keys = Vec::with_capacity(entry.refs.len());
        for source in &entry.refs {
            match resolver.resolve(entry.target.as_deref(), source) {
                Some(target) => keys.push(target.key_for(target_shape).to_json()),
                None => unresolved.push(UnresolvedRef {
                    path: entry.path.clone(),
                    target: entry.target.clone(),
                    missing: source.clone(),
                }),
            }
        }
        if keys.is_empty() {
            remove_path(&mut out, &entry.path);
            continue;
        }
        let value = match entry.cardinality {
            Cardinality::One => keys.swap_remove(0),
            Cardinality::Many => Value::Array(keys),
        };
        if !set_path(&mut out, &entry.path, value) {
            unresolved.extend(entry.refs.iter().map(|source| UnresolvedRef {
                path: entry.path.clone(),
                target: entry.target.clone(),
                missing: source.clone(),
            }));
        }
    }

    (out, unresolved)
}

/// Puts remapped media ids back into `body`.
///
/// Returns the source media ids that have no entry in `media_map`. A media
/// field with no remapped id is omitted.
pub fn reinsert_media(
    body: &mut Map<String, Value>,
    media: &[MediaEntry],
    media_map: &HashMap<u64, u64>,
) -> Vec<u64> {
    let mut missing = Vec::new();
    for entry in media {
        let mut ids = Vec::with_capacity(entry.ids.len());
        for id in &entry.ids {
            match media_map.get(id) {
                Some(target) => ids.push(Value::from(*target)),
                None => missing.push(*id),
            }
        }
        if ids.is_empty() {
            remove_path(body, &entry.path);
            continue;
        }
        let value = if entry.multiple {
            Value::Array(ids)
        } else {
            ids.swap_remove(0)
        };
        if !set_path(body, &entry.path, value) {
            missing.extend(entry.ids.iter().copied());
        }
    }
    missing
}

#[cfg(test)]
#[path = "relations_tests.rs"]
mod tests;
