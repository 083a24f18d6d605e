//! In-memory CMS instance shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use cms_migrate::client::{
    CmsClient, Entity, MediaClient, MediaFile, Page, RawSchema, SchemaSource, UploadMetadata,
};
use cms_migrate::media::content_hash;
use cms_migrate::model::{ApiShape, EntityId, EntityKey};
use cms_migrate::{Error, Result};

/// A CMS instance held in memory.
///
/// Created entities get `{n}` / `doc-{n}` identities starting at 1000 and
/// uploads get ids starting at 500.
pub struct MockCms {
    shape: ApiShape,
    store: Mutex<BTreeMap<String, Vec<Entity>>>,
    schemas: HashMap<String, RawSchema>,
    components: HashMap<String, RawSchema>,
    files: Mutex<Vec<(MediaFile, Vec<u8>)>>,
    next_id: AtomicU64,
    next_media_id: AtomicU64,
    reject: Option<(String, Value)>,
    unlistable: Mutex<HashSet<String>>,
    /// Successful `create` calls.
    pub creates: AtomicUsize,
    /// Successful `update` calls.
    pub updates: AtomicUsize,
    /// `upload` calls.
    pub uploads: AtomicUsize,
    /// `find_by_hash` calls that found a file.
    pub hash_hits: AtomicUsize,
}

impl MockCms {
    pub fn new(shape: ApiShape) -> Self {
        Self {
            shape,
            store: Mutex::new(BTreeMap::new()),
            schemas: HashMap::new(),
            components: HashMap::new(),
            files: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1000),
            next_media_id: AtomicU64::new(500),
            reject: None,
            unlistable: Mutex::new(HashSet::new()),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
            uploads: AtomicUsize::new(0),
            hash_hits: AtomicUsize::new(0),
        }
    }

    /// Registers a content-type schema from its attribute definitions.
    pub fn with_schema(mut self, uid: &str, attributes: Value) -> Self {
        self.schemas.insert(uid.to_string(), raw_schema(uid, attributes));
        self
    }

    /// Registers a component schema.
    pub fn with_component(mut self, uid: &str, attributes: Value) -> Self {
        self.components
            .insert(uid.to_string(), raw_schema(uid, attributes));
        self
    }

    /// Makes `create` fail for bodies whose `field` equals `value`.
    pub fn rejecting(mut self, field: &str, value: Value) -> Self {
        self.reject = Some((field.to_string(), value));
        self
    }

    /// Makes `list` fail for `content_type`.
    pub fn fail_listing(&self, content_type: &str) {
        self.unlistable.lock().insert(content_type.to_string());
    }

    /// Stores an entity as if it had been created out of band.
    pub fn insert(&self, content_type: &str, id: EntityId, attributes: Value) {
        let entity = Entity {
            id,
            shape: self.shape,
            attributes: attributes.as_object().cloned().unwrap_or_default(),
        };
        self.store
            .lock()
            .entry(content_type.to_string())
            .or_default()
            .push(entity);
    }

    /// Stores a media file with a caller-chosen id.
    pub fn insert_media(&self, id: u64, name: &str, bytes: &[u8]) {
        let file = MediaFile {
            id,
            name: name.to_string(),
            mime: "image/png".to_string(),
            size: bytes.len() as u64,
            url: format!("/uploads/{name}"),
            hash: Some(content_hash(bytes)),
        };
        self.files.lock().push((file, bytes.to_vec()));
    }

    /// Entities of one content type, in insertion order.
    pub fn entities(&self, content_type: &str) -> Vec<Entity> {
        self.store
            .lock()
            .get(content_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Looks an entity up by any of its identifiers.
    pub fn entity(&self, content_type: &str, id: &EntityId) -> Option<Entity> {
        self.entities(content_type)
            .into_iter()
            .find(|entity| entity.id.matches(id))
    }

    pub fn count(&self, content_type: &str) -> usize {
        self.entities(content_type).len()
    }

    pub fn media_count(&self) -> usize {
        self.files.lock().len()
    }
}

fn raw_schema(uid: &str, attributes: Value) -> RawSchema {
    RawSchema {
        uid: uid.to_string(),
        plural_name: None,
        attributes: attributes.as_object().cloned().unwrap_or_default(),
    }
}

fn key_to_id(key: &EntityKey) -> EntityId {
    match key {
        EntityKey::Numeric(id) => EntityId::Numeric(*id),
        EntityKey::Document(doc) => EntityId::Document(doc.clone()),
    }
}

#[async_trait]
impl CmsClient for MockCms {
    fn shape(&self) -> ApiShape {
        self.shape
    }

    async fn list(&self, content_type: &str, cursor: Option<Value>, page_size: usize) -> Result<Page> {
        if self.unlistable.lock().contains(content_type) {
            return Err(Error::Client(format!("HTTP 500: listing {content_type} failed")));
        }
        let all = self.entities(content_type);
        let offset = cursor.and_then(|c| c.as_u64()).unwrap_or(0) as usize;
        let end = (offset + page_size).min(all.len());
        let entities = all.get(offset..end).map(<[Entity]>::to_vec).unwrap_or_default();
        Ok(Page {
            entities,
            next_cursor: (end < all.len()).then(|| Value::from(end as u64)),
            total: Some(all.len() as u64),
        })
    }

    async fn get(&self, content_type: &str, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.entity(content_type, &key_to_id(key)))
    }

    async fn find_by_field(&self, content_type: &str, field: &str, value: &Value) -> Result<Option<Entity>> {
        Ok(self
            .entities(content_type)
            .into_iter()
            .find(|entity| entity.attributes.get(field) == Some(value)))
    }

    async fn create(&self, content_type: &str, body: Map<String, Value>) -> Result<Entity> {
        if let Some((field, value)) = &self.reject {
            if body.get(field) == Some(value) {
                return Err(Error::Client(format!("HTTP 400: {field} rejected")));
            }
        }
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let entity = Entity {
            id: EntityId::Both {
                id: n,
                document_id: format!("doc-{n}"),
            },
            shape: self.shape,
            attributes: body,
        };
        self.store
            .lock()
            .entry(content_type.to_string())
            .or_default()
            .push(entity.clone());
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(entity)
    }

    async fn update(&self, content_type: &str, key: &EntityKey, body: Map<String, Value>) -> Result<Entity> {
        let target = key_to_id(key);
        let mut store = self.store.lock();
        let slot = store
            .get_mut(content_type)
            .and_then(|entities| entities.iter_mut().find(|e| e.id.matches(&target)))
            .ok_or_else(|| Error::NotFound(format!("{content_type} {key}")))?;
        for (field, value) in body {
            slot.attributes.insert(field, value);
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(slot.clone())
    }

    async fn delete(&self, content_type: &str, key: &EntityKey) -> Result<()> {
        let target = key_to_id(key);
        if let Some(entities) = self.store.lock().get_mut(content_type) {
            entities.retain(|e| !e.id.matches(&target));
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaSource for MockCms {
    async fn fetch_content_type(&self, uid: &str) -> Result<RawSchema> {
        self.schemas
            .get(uid)
            .cloned()
            .ok_or_else(|| Error::schema_unavailable(uid, "HTTP 404"))
    }

    async fn fetch_component(&self, uid: &str) -> Result<RawSchema> {
        self.components
            .get(uid)
            .cloned()
            .ok_or_else(|| Error::schema_unavailable(uid, "HTTP 404"))
    }
}

#[async_trait]
impl MediaClient for MockCms {
    async fn get_media(&self, id: u64) -> Result<MediaFile> {
        self.files
            .lock()
            .iter()
            .find(|(file, _)| file.id == id)
            .map(|(file, _)| file.clone())
            .ok_or_else(|| Error::NotFound(format!("media {id}")))
    }

    async fn download(&self, media: &MediaFile) -> Result<Vec<u8>> {
        self.files
            .lock()
            .iter()
            .find(|(file, _)| file.id == media.id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| Error::NotFound(format!("media {}", media.id)))
    }

    async fn upload(&self, bytes: Vec<u8>, metadata: &UploadMetadata) -> Result<MediaFile> {
        let file = MediaFile {
            id: self.next_media_id.fetch_add(1, Ordering::SeqCst),
            name: metadata.name.clone(),
            mime: metadata.mime.clone(),
            size: bytes.len() as u64,
            url: format!("/uploads/{}", metadata.name),
            hash: Some(metadata.sha256.clone()),
        };
        self.files.lock().push((file.clone(), bytes));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(file)
    }

    async fn find_by_hash(&self, sha256: &str) -> Result<Option<MediaFile>> {
        let found = self
            .files
            .lock()
            .iter()
            .find(|(file, _)| file.hash.as_deref() == Some(sha256))
            .map(|(file, _)| file.clone());
        if found.is_some() {
            self.hash_hits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(found)
    }
}
