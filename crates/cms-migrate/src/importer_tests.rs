//! Tests for the two-pass importer.

use super::*;
use crate::client::Page;
use crate::model::{Cardinality, ExportData, ExportMetadata, FieldPath, RelationEntry};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

/// In-memory target that assigns `{n}` / `doc-{n}` identities.
struct MemoryTarget {
    shape: ApiShape,
    entities: Mutex<Vec<(String, EntityId, Map<String, Value>)>>,
    updates: Mutex<Vec<(String, EntityKey, Map<String, Value>)>>,
    next_id: Mutex<u64>,
}

impl MemoryTarget {
    fn new(shape: ApiShape) -> Self {
        Self {
            shape,
            entities: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            next_id: Mutex::new(100),
        }
    }

    fn seed(&self, content_type: &str, id: EntityId, body: Value) {
        let body = body.as_object().cloned().unwrap_or_default();
        self.entities.lock().push((content_type.to_string(), id, body));
    }

    fn count(&self, content_type: &str) -> usize {
        self.entities
            .lock()
            .iter()
            .filter(|(ct, _, _)| ct == content_type)
            .count()
    }

    fn entity(&self, ct: &str, id: &EntityId) -> Option<Entity> {
        self.entities
            .lock()
            .iter()
            .find(|(c, eid, _)| c == ct && eid.matches(id))
            .map(|(_, id, body)| Entity {
                id: id.clone(),
                shape: self.shape,
                attributes: body.clone(),
            })
    }
}

fn key_to_id(key: &EntityKey) -> EntityId {
    match key {
        EntityKey::Numeric(id) => EntityId::Numeric(*id),
        EntityKey::Document(doc) => EntityId::Document(doc.clone()),
    }
}

#[async_trait]
impl CmsClient for MemoryTarget {
    fn shape(&self) -> ApiShape {
        self.shape
    }

    async fn list(&self, _: &str, _: Option<Value>, _: usize) -> Result<Page> {
        Ok(Page::default())
    }

    async fn get(&self, content_type: &str, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.entity(content_type, &key_to_id(key)))
    }

    async fn find_by_field(&self, content_type: &str, field: &str, value: &Value) -> Result<Option<Entity>> {
        let id = self
            .entities
            .lock()
            .iter()
            .find(|(ct, _, body)| ct == content_type && body.get(field) == Some(value))
            .map(|(_, id, _)| id.clone());
        Ok(id.and_then(|id| self.entity(content_type, &id)))
    }

    async fn create(&self, content_type: &str, body: Map<String, Value>) -> Result<Entity> {
        if body.get("title") == Some(&json!("reject")) {
            return Err(Error::Client("HTTP 400: title rejected".to_string()));
        }
        let id = {
            let mut next = self.next_id.lock();
            *next += 1;
            *next
        };
        let id = EntityId::Both {
            id,
            document_id: format!("doc-{id}"),
        };
        self.entities
            .lock()
            .push((content_type.to_string(), id.clone(), body.clone()));
        Ok(Entity {
            id,
            shape: self.shape,
            attributes: body,
        })
    }

    async fn update(&self, content_type: &str, key: &EntityKey, body: Map<String, Value>) -> Result<Entity> {
        self.updates
            .lock()
            .push((content_type.to_string(), key.clone(), body.clone()));
        let target = key_to_id(key);
        let mut entities = self.entities.lock();
        let Some(slot) = entities
            .iter_mut()
            .find(|(ct, id, _)| ct == content_type && id.matches(&target))
        else {
            return Err(Error::NotFound(key.to_string()));
        };
        for (k, v) in body {
            slot.2.insert(k, v);
        }
        Ok(Entity {
            id: slot.1.clone(),
            shape: self.shape,
            attributes: slot.2.clone(),
        })
    }

    async fn delete(&self, _: &str, _: &EntityKey) -> Result<()> {
        Ok(())
    }
}

fn record(ct: &str, id: EntityId, body: Value, relations: Vec<RelationEntry>) -> ExportedEntity {
    ExportedEntity {
        content_type: ct.to_string(),
        id,
        body: body.as_object().cloned().unwrap_or_default(),
        relations,
        media: Vec::new(),
    }
}

fn one(path: &str, target: &str, id: EntityId) -> RelationEntry {
    RelationEntry {
        path: path.parse().unwrap(),
        target: Some(target.to_string()),
        cardinality: Cardinality::One,
        refs: vec![id],
    }
}

fn source(entities: Vec<ExportedEntity>) -> ExportData {
    ExportData {
        metadata: ExportMetadata::new(Vec::new(), String::new(), ApiShape::V4),
        entities,
        media: Vec::new(),
    }
}

const ARTICLE: &str = "api::article.article";
const AUTHOR: &str = "api::author.author";

#[tokio::test]
async fn test_creates_then_relates_with_target_identifiers() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![
        record(
            ARTICLE,
            EntityId::Numeric(1),
            json!({"title": "a"}),
            vec![one("author", AUTHOR, EntityId::Numeric(7))],
        ),
        record(AUTHOR, EntityId::Numeric(7), json!({"name": "Ada"}), Vec::new()),
    ]);

    let result = importer.import(&data, &ImportOptions::default()).await.unwrap();

    assert_eq!(result.created, 2);
    assert!(result.is_balanced());
    assert_eq!(result.outcome(), RunOutcome::Succeeded);
    assert_eq!(result.relations_updated, 1);

    let author_target = result
        .mapping
        .for_type(AUTHOR)
        .and_then(|m| m.target_of(&EntityId::Numeric(7)))
        .cloned()
        .unwrap();
    let updates = target.updates.lock();
    assert_eq!(updates.len(), 1);
    let (_, key, body) = &updates[0];
    assert!(matches!(key, EntityKey::Document(doc) if doc.starts_with("doc-")));
    assert_eq!(body.len(), 1);
    assert_eq!(body["author"], json!(author_target.document_id().unwrap()));
}

#[tokio::test]
async fn test_nested_target_uses_numeric_ids() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V4));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![
        record(
            ARTICLE,
            EntityId::Numeric(1),
            json!({"title": "a"}),
            vec![one("author", AUTHOR, EntityId::Numeric(7))],
        ),
        record(AUTHOR, EntityId::Numeric(7), json!({"name": "Ada"}), Vec::new()),
    ]);

    let options = ImportOptions {
        batch_size: 1,
        ..ImportOptions::default()
    };
    importer.import(&data, &options).await.unwrap();

    let updates = target.updates.lock();
    assert!(matches!(updates[0].1, EntityKey::Numeric(101)));
    assert_eq!(updates[0].2["author"], json!(102));
}

#[tokio::test]
async fn test_component_relations_send_whole_component() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![
        record(
            ARTICLE,
            EntityId::Numeric(1),
            json!({"title": "a", "seo": {"metaTitle": "m"}}),
            vec![one("seo.author", AUTHOR, EntityId::Numeric(7))],
        ),
        record(AUTHOR, EntityId::Numeric(7), json!({}), Vec::new()),
    ]);

    let options = ImportOptions {
        batch_size: 1,
        ..ImportOptions::default()
    };
    importer.import(&data, &options).await.unwrap();

    let updates = target.updates.lock();
    let body = &updates[0].2;
    assert!(!body.contains_key("title"));
    assert_eq!(body["seo"]["metaTitle"], json!("m"));
    assert_eq!(body["seo"]["author"], json!("doc-102"));
}

#[tokio::test]
async fn test_conflict_fail_records_conflict() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    target.seed(ARTICLE, EntityId::Numeric(50), json!({"slug": "hello"}));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![record(
        ARTICLE,
        EntityId::Numeric(1),
        json!({"slug": "hello"}),
        Vec::new(),
    )]);
    let options = ImportOptions {
        conflict_resolution: ConflictResolution::Fail,
        natural_keys: [(ARTICLE.to_string(), "slug".to_string())].into_iter().collect(),
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();

    assert_eq!(result.failed, 1);
    assert_eq!(result.failures[0].kind, crate::error::FailureKind::ConflictDetected);
    assert_eq!(result.outcome(), RunOutcome::SucceededWithFailures(1));
    assert_eq!(target.count(ARTICLE), 1);
}

#[tokio::test]
async fn test_conflict_update_overwrites_existing() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    target.seed(
        ARTICLE,
        EntityId::Both {
            id: 50,
            document_id: "keep".into(),
        },
        json!({"slug": "hello", "title": "old"}),
    );
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![record(
        ARTICLE,
        EntityId::Numeric(1),
        json!({"slug": "hello", "title": "new"}),
        Vec::new(),
    )]);
    let options = ImportOptions {
        conflict_resolution: ConflictResolution::Update,
        natural_keys: [(ARTICLE.to_string(), "slug".to_string())].into_iter().collect(),
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();

    assert_eq!(result.updated, 1);
    assert_eq!(result.created, 0);
    let existing = target.entity(ARTICLE, &EntityId::Numeric(50)).unwrap();
    assert_eq!(existing.attributes["title"], json!("new"));
    assert!(matches!(&target.updates.lock()[0].1, EntityKey::Document(d) if d == "keep"));
}

#[tokio::test]
async fn test_lookup_precedence_is_ordered() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    target.seed(ARTICLE, EntityId::Document("src-doc".into()), json!({"slug": "other"}));
    target.seed(ARTICLE, EntityId::Numeric(60), json!({"slug": "hello"}));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![record(
        ARTICLE,
        EntityId::Both {
            id: 1,
            document_id: "src-doc".into(),
        },
        json!({"slug": "hello"}),
        Vec::new(),
    )]);
    let mut options = ImportOptions {
        natural_keys: [(ARTICLE.to_string(), "slug".to_string())].into_iter().collect(),
        conflict_lookups: vec![ConflictLookup::DocumentId, ConflictLookup::NaturalKey],
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();
    assert_eq!(
        result.mapping.for_type(ARTICLE).unwrap().target_of(&EntityId::Numeric(1)),
        Some(&EntityId::Document("src-doc".into()))
    );

    options.conflict_lookups = vec![ConflictLookup::NaturalKey, ConflictLookup::DocumentId];
    let result = importer.import(&data, &options).await.unwrap();
    assert_eq!(
        result.mapping.for_type(ARTICLE).unwrap().target_of(&EntityId::Numeric(1)),
        Some(&EntityId::Numeric(60))
    );
}

#[tokio::test]
async fn test_failed_create_is_not_related() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![
        record(
            ARTICLE,
            EntityId::Numeric(1),
            json!({"title": "reject"}),
            vec![one("author", AUTHOR, EntityId::Numeric(7))],
        ),
        record(AUTHOR, EntityId::Numeric(7), json!({}), Vec::new()),
    ]);

    let result = importer.import(&data, &ImportOptions::default()).await.unwrap();

    assert_eq!(result.created, 1);
    assert_eq!(result.failed, 1);
    assert!(result.is_balanced());
    assert!(target.updates.lock().is_empty());
}

#[tokio::test]
async fn test_dry_run_writes_nothing() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![
        record(ARTICLE, EntityId::Numeric(1), json!({}), Vec::new()),
        record(ARTICLE, EntityId::Numeric(2), json!({}), Vec::new()),
    ]);
    let options = ImportOptions {
        dry_run: true,
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();

    assert!(result.dry_run);
    assert_eq!(result.created, 2);
    assert_eq!(target.count(ARTICLE), 0);
    assert!(result.mapping.is_empty());
}

#[tokio::test]
async fn test_strict_dry_run_aborts_on_violations() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![record(
        ARTICLE,
        EntityId::Numeric(1),
        json!({}),
        vec![one("author", AUTHOR, EntityId::Numeric(7))],
    )]);
    let options = ImportOptions {
        dry_run: true,
        strict: true,
        validate_relations: true,
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();

    assert_eq!(result.relation_violations.len(), 1);
    assert!(matches!(result.outcome(), RunOutcome::Aborted(reason) if reason.contains("MIGRATE-015")));
    assert_eq!(result.total_records, 0);
}

#[tokio::test]
async fn test_content_type_filter() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let data = source(vec![
        record(ARTICLE, EntityId::Numeric(1), json!({}), Vec::new()),
        record(AUTHOR, EntityId::Numeric(2), json!({}), Vec::new()),
    ]);
    let options = ImportOptions {
        content_types: Some(vec![AUTHOR.to_string()]),
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();

    assert_eq!(result.total_records, 1);
    assert_eq!(result.filtered_out, 1);
    assert_eq!(target.count(ARTICLE), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let target = Arc::new(MemoryTarget::new(ApiShape::V5));
    let importer = Importer::new(target.clone(), None);
    let token = CancellationToken::new();
    token.cancel();
    let data = source(vec![record(ARTICLE, EntityId::Numeric(1), json!({}), Vec::new())]);
    let options = ImportOptions {
        cancellation: Some(token),
        ..ImportOptions::default()
    };

    let result = importer.import(&data, &options).await.unwrap();

    assert_eq!(result.outcome(), RunOutcome::Cancelled);
    assert_eq!(target.count(ARTICLE), 0);
}

#[tokio::test]
async fn test_import_media_requires_client() {
    let importer = Importer::new(Arc::new(MemoryTarget::new(ApiShape::V5)), None);
    let options = ImportOptions {
        import_media: true,
        ..ImportOptions::default()
    };
    let err = importer.import(&source(Vec::new()), &options).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)));
}

#[test]
fn test_outcome_classification() {
    let mut result = ImportResult::default();
    assert_eq!(result.outcome(), RunOutcome::Succeeded);
    result.relation_failures.push(EntityFailure {
        content_type: ARTICLE.to_string(),
        source_id: None,
        kind: crate::error::FailureKind::Write,
        reason: "x".to_string(),
    });
    assert_eq!(result.outcome(), RunOutcome::SucceededWithFailures(1));
    result.cancelled = true;
    assert_eq!(result.outcome(), RunOutcome::Cancelled);
    result.aborted = Some("corrupt".to_string());
    assert_eq!(result.outcome(), RunOutcome::Aborted("corrupt".to_string()));
}

#[test]
fn test_conflict_policy_serde() {
    let policy: ConflictResolution = serde_json::from_value(json!("update")).unwrap();
    assert_eq!(policy, ConflictResolution::Update);
    let lookup: ConflictLookup = serde_json::from_value(json!("document_id")).unwrap();
    assert_eq!(lookup, ConflictLookup::DocumentId);
    assert_eq!(FieldPath::field("x").root(), Some("x"));
}
