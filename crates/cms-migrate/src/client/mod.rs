//! Collaborator contracts consumed by the migration engine.
//!
//! The engine never talks HTTP itself: it goes through [`CmsClient`] for
//! entity CRUD, [`SchemaSource`] for content-type schemas and [`MediaClient`]
//! for binary assets. [`rest::RestClient`] implements all three against a
//! Strapi-style REST API.

pub mod common;
pub mod rest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{ApiShape, EntityId, EntityKey};

/// An entity as returned by the collaborator, already normalized.
///
/// `attributes` holds the custom fields only, whatever the response shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identity on the instance that returned it.
    pub id: EntityId,
    /// Shape of the response this entity came from.
    pub shape: ApiShape,
    /// Custom attribute fields.
    pub attributes: Map<String, Value>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Entities in this page.
    pub entities: Vec<Entity>,
    /// Cursor for the next page, `None` on the last page.
    pub next_cursor: Option<Value>,
    /// Total entity count, if reported.
    pub total: Option<u64>,
}

/// Raw schema as returned by the schema endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSchema {
    /// Content type or component uid.
    pub uid: String,
    /// REST plural name (content types only).
    #[serde(default)]
    pub plural_name: Option<String>,
    /// Attribute definitions keyed by field name, in declaration order.
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// Media file metadata on a CMS instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    /// Media id.
    pub id: u64,
    /// File name.
    pub name: String,
    /// MIME type.
    #[serde(default)]
    pub mime: String,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Download URL.
    #[serde(default)]
    pub url: String,
    /// Hash stored by the instance.
    #[serde(default)]
    pub hash: Option<String>,
}

/// Metadata sent along with an upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadMetadata {
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime: String,
    /// SHA-256 content hash (hex), used for later dedup lookups.
    pub sha256: String,
    /// Alternative text.
    #[serde(default)]
    pub alternative_text: Option<String>,
}

/// Entity CRUD contract.
#[async_trait]
pub trait CmsClient: Send + Sync {
    /// Response shape of this instance.
    fn shape(&self) -> ApiShape;

    /// Identifies the instance for diagnostics.
    fn fingerprint(&self) -> String {
        format!("cms-{}", self.shape())
    }

    /// Lists one page of entities.
    ///
    /// # Arguments
    ///
    /// * `content_type` - Content type uid
    /// * `cursor` - Cursor from the previous page, `None` for the first page
    /// * `page_size` - Maximum entities per page
    async fn list(
        &self,
        content_type: &str,
        cursor: Option<Value>,
        page_size: usize,
    ) -> Result<Page>;

    /// Fetches one entity, `None` if it does not exist.
    async fn get(&self, content_type: &str, key: &EntityKey) -> Result<Option<Entity>>;

    /// Finds the first entity whose `field` equals `value`.
    async fn find_by_field(
        &self,
        content_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Entity>>;

    /// Creates an entity and returns it with its new identity.
    async fn create(&self, content_type: &str, body: Map<String, Value>) -> Result<Entity>;

    /// Updates an entity.
    async fn update(
        &self,
        content_type: &str,
        key: &EntityKey,
        body: Map<String, Value>,
    ) -> Result<Entity>;

    /// Deletes an entity.
    async fn delete(&self, content_type: &str, key: &EntityKey) -> Result<()>;
}

/// Schema lookup contract.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    /// Fetches a content-type schema.
    async fn fetch_content_type(&self, uid: &str) -> Result<RawSchema>;

    /// Fetches a component schema.
    async fn fetch_component(&self, uid: &str) -> Result<RawSchema>;
}

/// Media contract.
#[async_trait]
pub trait MediaClient: Send + Sync {
    /// Fetches media metadata by id.
    async fn get_media(&self, id: u64) -> Result<MediaFile>;

    /// Downloads the content of a media file.
    async fn download(&self, media: &MediaFile) -> Result<Vec<u8>>;

    /// Uploads a file and returns the stored media.
    async fn upload(&self, bytes: Vec<u8>, metadata: &UploadMetadata) -> Result<MediaFile>;

    /// Finds an existing media file by content hash.
    async fn find_by_hash(&self, sha256: &str) -> Result<Option<MediaFile>>;
}
