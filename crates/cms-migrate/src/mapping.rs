//! Cross-instance identifier mapping built during import.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::model::EntityId;

/// How a mapping entry was produced in pass 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOutcome {
    /// A new target entity was created.
    Created,
    /// An existing target entity was updated (conflict policy `update`).
    Updated,
    /// An existing target entity was kept as-is (conflict policy `skip`).
    Skipped,
}

impl MappingOutcome {
    /// Whether pass 2 writes relations for this entry.
    #[must_use]
    pub fn needs_relations(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// One mapped entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingEntry {
    /// Identity on the source instance.
    pub source: EntityId,
    /// Identity on the target instance.
    pub target: EntityId,
    /// How the target identity was obtained.
    pub outcome: MappingOutcome,
}

/// Source → target identifier table for one content type.
///
/// Lookups accept either identifier kind: a relation value carrying only a
/// document id resolves the same entry as one carrying only the numeric id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<MappingEntry>", into = "Vec<MappingEntry>")]
pub struct IdMapping {
    entries: Vec<MappingEntry>,
    by_numeric: HashMap<u64, usize>,
    by_document: HashMap<String, usize>,
    by_target: HashMap<TargetKey, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TargetKey {
    Numeric(u64),
    Document(String),
}

impl IdMapping {
    /// Creates an empty mapping.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mapping entry. A later entry for the same source id wins.
    pub fn insert(&mut self, source: EntityId, target: EntityId, outcome: MappingOutcome) {
        let idx = self.entries.len();
        if let Some(id) = source.numeric() {
            self.by_numeric.insert(id, idx);
        }
        if let Some(doc) = source.document_id() {
            self.by_document.insert(doc.to_string(), idx);
        }
        if let Some(id) = target.numeric() {
            self.by_target.insert(TargetKey::Numeric(id), idx);
        }
        if let Some(doc) = target.document_id() {
            self.by_target.insert(TargetKey::Document(doc.to_string()), idx);
        }
        self.entries.push(MappingEntry {
            source,
            target,
            outcome,
        });
    }

    /// Looks up the entry for a source id.
    #[must_use]
    pub fn get(&self, source: &EntityId) -> Option<&MappingEntry> {
        let by_numeric = source
            .numeric()
            .and_then(|id| self.by_numeric.get(&id).copied());
        let idx = by_numeric.or_else(|| {
            source
                .document_id()
                .and_then(|doc| self.by_document.get(doc).copied())
        })?;
        self.entries.get(idx)
    }

    /// Target identity for a source id.
    #[must_use]
    pub fn target_of(&self, source: &EntityId) -> Option<&EntityId> {
        self.get(source).map(|entry| &entry.target)
    }

    /// Source identity for a target id (reverse lookup).
    #[must_use]
    pub fn source_of(&self, target: &EntityId) -> Option<&EntityId> {
        let by_numeric = target
            .numeric()
            .and_then(|id| self.by_target.get(&TargetKey::Numeric(id)).copied());
        let idx = by_numeric.or_else(|| {
            target.document_id().and_then(|doc| {
                self.by_target
                    .get(&TargetKey::Document(doc.to_string()))
                    .copied()
            })
        })?;
        self.entries.get(idx).map(|entry| &entry.source)
    }

    /// True if the source id is mapped.
    #[must_use]
    pub fn contains(&self, source: &EntityId) -> bool {
        self.get(source).is_some()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entries were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &MappingEntry> {
        self.entries.iter()
    }
}

impl From<Vec<MappingEntry>> for IdMapping {
    fn from(entries: Vec<MappingEntry>) -> Self {
        let mut mapping = Self::new();
        for entry in entries {
            mapping.insert(entry.source, entry.target, entry.outcome);
        }
        mapping
    }
}

impl From<IdMapping> for Vec<MappingEntry> {
    fn from(mapping: IdMapping) -> Self {
        mapping.entries
    }
}

/// Mappings for every content type touched by one import run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdMappingTable {
    types: BTreeMap<String, IdMapping>,
}

impl IdMappingTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mapping for a content type, if any entity of that type was mapped.
    #[must_use]
    pub fn for_type(&self, content_type: &str) -> Option<&IdMapping> {
        self.types.get(content_type)
    }

    /// Mutable mapping for a content type, created on first use.
    pub fn for_type_mut(&mut self, content_type: &str) -> &mut IdMapping {
        self.types.entry(content_type.to_string()).or_default()
    }

    /// Content types present in the table.
    pub fn content_types(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }

    /// Total entries across all content types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.values().map(IdMapping::len).sum()
    }

    /// True if no entries were recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolves source relation references to target identities.
pub trait IdResolver {
    /// Returns the target identity for `source`, looked up in the mapping of
    /// `target_type`. When the target type is unknown the reference resolves
    /// only if exactly one content type maps it.
    fn resolve(&self, target_type: Option<&str>, source: &EntityId) -> Option<EntityId>;
}

impl IdResolver for IdMappingTable {
    fn resolve(&self, target_type: Option<&str>, source: &EntityId) -> Option<EntityId> {
        match target_type {
            Some(ct) => self.for_type(ct)?.target_of(source).cloned(),
            None => {
                let mut hits = self.types.values().filter_map(|m| m.target_of(source));
                let first = hits.next()?;
                if hits.next().is_some() {
                    return None;
                }
                Some(first.clone())
            }
        }
    }
}

impl IdResolver for IdMapping {
    fn resolve(&self, _target_type: Option<&str>, source: &EntityId) -> Option<EntityId> {
        self.target_of(source).cloned()
    }
}
