//! Relation validation over an entity stream.
//!
//! A two-pass scan: the first pass records every entity id per content type,
//! the second checks each relation reference against that index. Only
//! identifiers are held in memory, never decoded records.

use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{EntityId, ExportedEntity, UnresolvedRelation};
use crate::stream::EntitySource;

#[derive(Debug, Default)]
struct TypeIds {
    numeric: HashSet<u64>,
    document: HashSet<String>,
}

impl TypeIds {
    fn contains(&self, id: &EntityId) -> bool {
        id.numeric().is_some_and(|n| self.numeric.contains(&n))
            || id.document_id().is_some_and(|d| self.document.contains(d))
    }
}

/// Ids present in a stream, grouped by content type.
#[derive(Debug, Default)]
pub struct KnownIds {
    by_type: HashMap<String, TypeIds>,
}

impl KnownIds {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an entity id.
    pub fn insert(&mut self, content_type: &str, id: &EntityId) {
        let ids = self.by_type.entry(content_type.to_string()).or_default();
        if let Some(n) = id.numeric() {
            ids.numeric.insert(n);
        }
        if let Some(d) = id.document_id() {
            ids.document.insert(d.to_string());
        }
    }

    /// True if `id` is known for `target`, or for any content type when the
    /// target is unknown.
    #[must_use]
    pub fn contains(&self, target: Option<&str>, id: &EntityId) -> bool {
        match target {
            Some(ct) => self.by_type.get(ct).is_some_and(|ids| ids.contains(id)),
            None => self.by_type.values().any(|ids| ids.contains(id)),
        }
    }

    /// Number of content types indexed.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.by_type.len()
    }
}

/// Relation references of `entity` that point outside `known`.
#[must_use]
pub fn dangling_refs(entity: &ExportedEntity, known: &KnownIds) -> Vec<UnresolvedRelation> {
    entity
        .relation_refs()
        .filter(|(entry, id)| !known.contains(entry.target.as_deref(), id))
        .map(|(entry, id)| UnresolvedRelation {
            content_type: entity.content_type.clone(),
            source_id: entity.id.clone(),
            path: entry.path.to_string(),
            target: entry.target.clone(),
            missing: id.clone(),
        })
        .collect()
}

/// Reports every relation reference to an id absent from `source`.
///
/// Only records whose content type passes `include` are indexed and checked,
/// so a filtered import validates against what it will actually create.
///
/// # Errors
///
/// Returns [`crate::Error::StreamCorrupt`] if a record cannot be decoded.
pub fn validate_relations<F>(source: &dyn EntitySource, include: F) -> Result<Vec<UnresolvedRelation>>
where
    F: Fn(&str) -> bool,
{
    let mut known = KnownIds::new();
    let mut scanned = 0usize;
    for record in source.open_entities()? {
        let entity = record?;
        if include(&entity.content_type) {
            known.insert(&entity.content_type, &entity.id);
            scanned += 1;
        }
    }
    debug!(
        "Indexed {} entities across {} content types",
        scanned,
        known.type_count()
    );

    let mut violations = Vec::new();
    for record in source.open_entities()? {
        let entity = record?;
        if include(&entity.content_type) {
            violations.extend(dangling_refs(&entity, &known));
        }
    }

    if violations.is_empty() {
        info!("Relation validation passed ({} entities)", scanned);
    } else {
        info!(
            "Relation validation found {} dangling reference(s)",
            violations.len()
        );
    }
    Ok(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ApiShape, Cardinality, ExportData, ExportMetadata, FieldPath, RelationEntry};
    use serde_json::Map;

    fn entity(ct: &str, id: u64, refs: Vec<(Option<&str>, EntityId)>) -> ExportedEntity {
        ExportedEntity {
            content_type: ct.to_string(),
            id: EntityId::Numeric(id),
            body: Map::new(),
            relations: refs
                .into_iter()
                .map(|(target, id)| RelationEntry {
                    path: FieldPath::field("ref"),
                    target: target.map(str::to_string),
                    cardinality: Cardinality::One,
                    refs: vec![id],
                })
                .collect(),
            media: Vec::new(),
        }
    }

    fn data(entities: Vec<ExportedEntity>) -> ExportData {
        ExportData {
            metadata: ExportMetadata::new(Vec::new(), String::new(), ApiShape::V5),
            entities,
            media: Vec::new(),
        }
    }

    #[test]
    fn test_reports_reference_outside_export_set() {
        let source = data(vec![
            entity("article", 1, vec![(Some("author"), EntityId::Numeric(7))]),
            entity("article", 2, vec![(Some("author"), EntityId::Numeric(3))]),
            entity("author", 3, Vec::new()),
        ]);

        let violations = validate_relations(&source, |_| true).unwrap();

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].source_id, EntityId::Numeric(1));
        assert_eq!(violations[0].missing, EntityId::Numeric(7));
        assert_eq!(violations[0].target.as_deref(), Some("author"));
    }

    #[test]
    fn test_target_type_must_match() {
        let source = data(vec![
            entity("article", 1, vec![(Some("author"), EntityId::Numeric(2))]),
            entity("tag", 2, Vec::new()),
        ]);
        assert_eq!(validate_relations(&source, |_| true).unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_target_matches_any_type() {
        let source = data(vec![
            entity("article", 1, vec![(None, EntityId::Numeric(2))]),
            entity("tag", 2, Vec::new()),
        ]);
        assert!(validate_relations(&source, |_| true).unwrap().is_empty());
    }

    #[test]
    fn test_filter_excludes_types() {
        let source = data(vec![
            entity("article", 1, vec![(Some("author"), EntityId::Numeric(3))]),
            entity("author", 3, Vec::new()),
        ]);
        let violations = validate_relations(&source, |ct| ct == "article").unwrap();
        assert_eq!(violations.len(), 1);
    }

    #[test]
    fn test_document_id_lookup() {
        let mut known = KnownIds::new();
        known.insert(
            "author",
            &EntityId::Both {
                id: 4,
                document_id: "a4".into(),
            },
        );
        assert!(known.contains(Some("author"), &EntityId::Document("a4".into())));
        assert!(!known.contains(Some("author"), &EntityId::Document("a5".into())));
    }
}
