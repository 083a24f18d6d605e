//! REST adapter for Strapi-style CMS instances.
//!
//! Implements [`CmsClient`], [`SchemaSource`] and [`MediaClient`] over the
//! `/api` surface. The response shape (nested `attributes` or flattened
//! `documentId`) is detected from the first entity payload unless pinned in
//! the configuration.

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::common::{
    create_http_client, detect_shape, handle_http_error, normalize_entity, uid_to_endpoint,
    validate_url,
};
use crate::client::{
    CmsClient, Entity, MediaClient, MediaFile, Page, RawSchema, SchemaSource, UploadMetadata,
};
use crate::error::{Error, Result};
use crate::model::{ApiShape, EntityKey};
use crate::retry::{with_retry, RetryConfig};

/// Prefix stored in the media caption to make content hashes searchable.
const HASH_CAPTION_PREFIX: &str = "sha256:";

/// Connection settings for one CMS instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL (e.g., `http://localhost:1337`).
    pub url: String,
    /// API token sent as a bearer token.
    #[serde(default)]
    pub api_token: Option<String>,
    /// Response shape. Detected from the first response when unset.
    #[serde(default)]
    pub shape: Option<ApiShape>,
    /// Explicit content type uid → REST plural name overrides.
    #[serde(default)]
    pub endpoints: BTreeMap<String, String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl RestConfig {
    /// Creates a config for a base URL with defaults for everything else.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_token: None,
            shape: None,
            endpoints: BTreeMap::new(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

/// REST client for one CMS instance.
pub struct RestClient {
    config: RestConfig,
    client: Client,
    retry: RetryConfig,
    detected_shape: OnceLock<ApiShape>,
    plural_names: RwLock<HashMap<String, String>>,
}

impl RestClient {
    /// Creates a client after validating the base URL.
    pub fn new(config: RestConfig) -> Result<Self> {
        validate_url(&config.url)?;
        let retry = RetryConfig {
            max_retries: config.max_retries,
            ..RetryConfig::default()
        };
        Ok(Self {
            client: create_http_client(Duration::from_secs(config.timeout_secs)),
            retry,
            detected_shape: OnceLock::new(),
            plural_names: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn base_url(&self) -> &str {
        self.config.url.trim_end_matches('/')
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{}", self.base_url(), path.trim_start_matches('/'))
    }

    /// REST plural name for a content type uid.
    fn endpoint(&self, content_type: &str) -> String {
        if let Some(plural) = self.config.endpoints.get(content_type) {
            return plural.clone();
        }
        if let Some(plural) = self.plural_names.read().get(content_type) {
            return plural.clone();
        }
        uid_to_endpoint(content_type)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.config.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn observe_shape(&self, data: &Value) -> ApiShape {
        if let Some(shape) = self.config.shape {
            return shape;
        }
        if let Some(shape) = self.detected_shape.get() {
            return *shape;
        }
        match detect_shape(data) {
            Some(shape) => {
                debug!("Detected {} response shape at {}", shape, self.base_url());
                *self.detected_shape.get_or_init(|| shape)
            }
            None => ApiShape::default(),
        }
    }

    async fn read_response(response: Response) -> Result<Value> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            let body = response.text().await.unwrap_or_default();
            return Err(handle_http_error(status.as_u16(), &body, retry_after));
        }
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Sends a request built by `request`, retrying transient failures.
    async fn execute<F>(&self, operation: &str, request: F) -> Result<Value>
    where
        F: Fn() -> RequestBuilder,
    {
        let request = &request;
        let this = self;
        with_retry(&self.retry, operation, move || async move {
            let response = this.authorize(request()).send().await?;
            Self::read_response(response).await
        })
        .await
    }

    fn entity_from_data(&self, data: &Value) -> Result<Entity> {
        let shape = self.observe_shape(data);
        normalize_entity(data, shape)
    }

    fn media_from_json(value: &Value) -> Result<MediaFile> {
        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| Error::Serialization("media has no numeric id".to_string()))?;
        let text = |key: &str| {
            value
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        // reported in KB
        let size = value
            .get("size")
            .and_then(Value::as_f64)
            .map(|kb| (kb * 1024.0).round() as u64)
            .unwrap_or(0);
        Ok(MediaFile {
            id,
            name: text("name"),
            mime: text("mime"),
            size,
            url: text("url"),
            hash: value
                .get("hash")
                .and_then(Value::as_str)
                .map(str::to_string),
        })
    }

    fn schema_from_response(uid: &str, response: &Value) -> Result<RawSchema> {
        let data = response.get("data").unwrap_or(response);
        let schema = data.get("schema").unwrap_or(data);
        let attributes = schema
            .get("attributes")
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Error::schema_unavailable(uid, "response has no attributes"))?;
        let plural_name = schema
            .get("info")
            .and_then(|info| info.get("pluralName"))
            .or_else(|| schema.get("pluralName"))
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(RawSchema {
            uid: uid.to_string(),
            plural_name,
            attributes,
        })
    }

    fn download_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url(), url.trim_start_matches('/'))
        }
    }
}

fn filter_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl CmsClient for RestClient {
    fn shape(&self) -> ApiShape {
        self.config
            .shape
            .or_else(|| self.detected_shape.get().copied())
            .unwrap_or_default()
    }

    fn fingerprint(&self) -> String {
        format!("{} ({})", self.base_url(), self.shape())
    }

    async fn list(
        &self,
        content_type: &str,
        cursor: Option<Value>,
        page_size: usize,
    ) -> Result<Page> {
        let page = cursor.as_ref().and_then(Value::as_u64).unwrap_or(1);
        let url = self.api_url(&self.endpoint(content_type));
        let response = self
            .execute("list", || {
                self.client.get(&url).query(&[
                    ("pagination[page]", page.to_string()),
                    ("pagination[pageSize]", page_size.to_string()),
                    ("populate", "*".to_string()),
                ])
            })
            .await?;

        let data = response.get("data").cloned().unwrap_or(Value::Null);
        let items = data.as_array().cloned().unwrap_or_default();
        let entities = items
            .iter()
            .map(|item| self.entity_from_data(item))
            .collect::<Result<Vec<_>>>()?;

        let pagination = response.get("meta").and_then(|m| m.get("pagination"));
        let page_count = pagination
            .and_then(|p| p.get("pageCount"))
            .and_then(Value::as_u64);
        let total = pagination
            .and_then(|p| p.get("total"))
            .and_then(Value::as_u64);
        let has_more = match page_count {
            Some(count) => page < count,
            None => entities.len() == page_size && page_size > 0,
        };

        debug!(
            "Listed {} {} entities (page {})",
            entities.len(),
            content_type,
            page
        );

        Ok(Page {
            entities,
            next_cursor: has_more.then(|| json!(page + 1)),
            total,
        })
    }

    async fn get(&self, content_type: &str, key: &EntityKey) -> Result<Option<Entity>> {
        let url = self.api_url(&format!("{}/{}", self.endpoint(content_type), key));
        match self
            .execute("get", || self.client.get(&url).query(&[("populate", "*")]))
            .await
        {
            Ok(response) => match response.get("data") {
                Some(data) if !data.is_null() => Ok(Some(self.entity_from_data(data)?)),
                _ => Ok(None),
            },
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn find_by_field(
        &self,
        content_type: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Entity>> {
        let url = self.api_url(&self.endpoint(content_type));
        let filter_key = format!("filters[{}][$eq]", field);
        let filter = filter_value(value);
        let response = self
            .execute("find_by_field", || {
                self.client.get(&url).query(&[
                    (filter_key.as_str(), filter.as_str()),
                    ("pagination[pageSize]", "1"),
                ])
            })
            .await?;
        match response
            .get("data")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
        {
            Some(item) => Ok(Some(self.entity_from_data(item)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, content_type: &str, body: Map<String, Value>) -> Result<Entity> {
        let url = self.api_url(&self.endpoint(content_type));
        let payload = json!({ "data": body });
        let response = self
            .execute("create", || self.client.post(&url).json(&payload))
            .await?;
        let data = response
            .get("data")
            .ok_or_else(|| Error::Client("create response has no data".to_string()))?;
        self.entity_from_data(data)
    }

    async fn update(
        &self,
        content_type: &str,
        key: &EntityKey,
        body: Map<String, Value>,
    ) -> Result<Entity> {
        let url = self.api_url(&format!("{}/{}", self.endpoint(content_type), key));
        let payload = json!({ "data": body });
        let response = self
            .execute("update", || self.client.put(&url).json(&payload))
            .await?;
        let data = response
            .get("data")
            .ok_or_else(|| Error::Client("update response has no data".to_string()))?;
        self.entity_from_data(data)
    }

    async fn delete(&self, content_type: &str, key: &EntityKey) -> Result<()> {
        let url = self.api_url(&format!("{}/{}", self.endpoint(content_type), key));
        self.execute("delete", || self.client.delete(&url)).await?;
        Ok(())
    }
}

#[async_trait]
impl SchemaSource for RestClient {
    async fn fetch_content_type(&self, uid: &str) -> Result<RawSchema> {
        let url = self.api_url(&format!("content-type-builder/content-types/{}", uid));
        let response = self
            .execute("fetch_content_type", || self.client.get(&url))
            .await
            .map_err(|e| Error::schema_unavailable(uid, e))?;
        let schema = Self::schema_from_response(uid, &response)?;
        if let Some(plural) = &schema.plural_name {
            self.plural_names
                .write()
                .insert(uid.to_string(), plural.clone());
        }
        Ok(schema)
    }

    async fn fetch_component(&self, uid: &str) -> Result<RawSchema> {
        let url = self.api_url(&format!("content-type-builder/components/{}", uid));
        let response = self
            .execute("fetch_component", || self.client.get(&url))
            .await
            .map_err(|e| Error::schema_unavailable(uid, e))?;
        Self::schema_from_response(uid, &response)
    }
}

#[async_trait]
impl MediaClient for RestClient {
    async fn get_media(&self, id: u64) -> Result<MediaFile> {
        let url = self.api_url(&format!("upload/files/{}", id));
        let response = self.execute("get_media", || self.client.get(&url)).await?;
        Self::media_from_json(response.get("data").unwrap_or(&response))
    }

    async fn download(&self, media: &MediaFile) -> Result<Vec<u8>> {
        let url = self.download_url(&media.url);
        let request = &|| self.authorize(self.client.get(&url));
        let bytes = with_retry(&self.retry, "download", move || async move {
            let response = request().send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(handle_http_error(status.as_u16(), &body, None));
            }
            Ok(response.bytes().await?.to_vec())
        })
        .await?;
        debug!("Downloaded {} bytes for media {}", bytes.len(), media.id);
        Ok(bytes)
    }

    async fn upload(&self, bytes: Vec<u8>, metadata: &UploadMetadata) -> Result<MediaFile> {
        let url = self.api_url("upload");
        let file_info = json!({
            "name": metadata.name,
            "alternativeText": metadata.alternative_text,
            "caption": format!("{}{}", HASH_CAPTION_PREFIX, metadata.sha256),
        })
        .to_string();

        let mime = if metadata.mime.is_empty() {
            "application/octet-stream"
        } else {
            metadata.mime.as_str()
        };
        let (bytes, file_info, url, this) = (&bytes, &file_info, &url, self);
        let response = with_retry(&self.retry, "upload", move || async move {
            let part = reqwest::multipart::Part::bytes(bytes.clone())
                .file_name(metadata.name.clone())
                .mime_str(mime)?;
            let form = reqwest::multipart::Form::new()
                .part("files", part)
                .text("fileInfo", file_info.clone());
            let response = this
                .authorize(this.client.post(url))
                .multipart(form)
                .send()
                .await?;
            Self::read_response(response).await
        })
        .await?;

        let stored = match &response {
            Value::Array(items) => items
                .first()
                .ok_or_else(|| Error::Client("upload returned no files".to_string()))?,
            other => other,
        };
        let media = Self::media_from_json(stored)?;
        info!("Uploaded {} as media {}", metadata.name, media.id);
        Ok(media)
    }

    async fn find_by_hash(&self, sha256: &str) -> Result<Option<MediaFile>> {
        let url = self.api_url("upload/files");
        let caption = format!("{}{}", HASH_CAPTION_PREFIX, sha256);
        let response = self
            .execute("find_by_hash", || {
                self.client
                    .get(&url)
                    .query(&[("filters[caption][$eq]", caption.as_str())])
            })
            .await?;
        let items = match &response {
            Value::Array(items) => items.as_slice(),
            other => other
                .get("data")
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        };
        items.first().map(Self::media_from_json).transpose()
    }
}

#[cfg(test)]
#[path = "rest_tests.rs"]
mod tests;
