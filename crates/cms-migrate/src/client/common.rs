//! Common helpers for the REST adapter.
//!
//! HTTP client creation, URL validation, error mapping and response-shape
//! normalization. Shape detection happens here and nowhere else.

use crate::client::Entity;
use crate::error::{Error, Result};
use crate::model::{ApiShape, EntityId};
use reqwest::Client;
use serde_json::{Map, Value};
use std::time::Duration;

/// Default HTTP timeout for CMS requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Fields managed by the CMS that are never part of a writable body.
pub const SYSTEM_FIELDS: &[&str] = &[
    "id",
    "documentId",
    "createdAt",
    "updatedAt",
    "createdBy",
    "updatedBy",
];

/// Creates a configured HTTP client with timeout.
#[must_use]
pub fn create_http_client(timeout: Duration) -> Client {
    Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_else(|_| Client::new())
}

/// Validates a CMS base URL (http/https only).
pub fn validate_url(url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(Error::Config(format!(
            "Invalid URL scheme in '{}'. Allowed: http, https",
            url
        )));
    }
    if url.len() < 10 {
        return Err(Error::Config(format!("Invalid URL format: {}", url)));
    }
    Ok(())
}

/// Extracts the error message from a CMS error body (`{"error": {"message"}}`).
pub fn error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.to_string())
}

/// Maps an HTTP error response to an [`Error`].
pub fn handle_http_error(status_code: u16, body: &str, retry_after: Option<u64>) -> Error {
    let message = error_message(body);
    match status_code {
        429 => Error::RateLimit(retry_after.unwrap_or(60)),
        401 | 403 => Error::Authentication(format!("HTTP {}: {}", status_code, message)),
        404 => Error::NotFound(message),
        409 => Error::ConflictDetected {
            content_type: String::new(),
            reason: message,
        },
        _ => Error::Client(format!("HTTP {}: {}", status_code, message)),
    }
}

/// Detects the response shape from a `data` payload (object or array).
///
/// Returns `None` when the payload carries no entity to inspect.
pub fn detect_shape(data: &Value) -> Option<ApiShape> {
    let sample = match data {
        Value::Array(items) => items.first()?,
        Value::Object(_) => data,
        _ => return None,
    };
    if sample.get("attributes").is_some() {
        Some(ApiShape::V4)
    } else if sample.get("documentId").is_some() {
        Some(ApiShape::V5)
    } else {
        None
    }
}

/// Normalizes one raw entity into an [`Entity`].
pub fn normalize_entity(raw: &Value, shape: ApiShape) -> Result<Entity> {
    let map = raw
        .as_object()
        .ok_or_else(|| Error::Serialization("entity is not a JSON object".to_string()))?;
    let id = map.get("id").and_then(Value::as_u64);
    let document_id = map
        .get("documentId")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = EntityId::from_parts(id, document_id)
        .ok_or_else(|| Error::Serialization("entity has no id".to_string()))?;

    let attributes = match shape {
        ApiShape::V4 => map
            .get("attributes")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        ApiShape::V5 => map
            .iter()
            .filter(|(k, _)| k.as_str() != "id" && k.as_str() != "documentId")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    };

    Ok(Entity {
        id,
        shape,
        attributes,
    })
}

/// Removes CMS-managed fields from an attribute map.
#[must_use]
pub fn strip_system_fields(mut attributes: Map<String, Value>) -> Map<String, Value> {
    for field in SYSTEM_FIELDS {
        attributes.shift_remove(*field);
    }
    attributes
}

/// Fallback pluralization for a content type uid (`api::category.category` → `categories`).
#[must_use]
pub fn uid_to_endpoint(uid: &str) -> String {
    let Some((_, rest)) = uid.split_once("::") else {
        return uid.to_string();
    };
    let name = rest.split('.').next().unwrap_or(rest);
    if name.ends_with('y') && !["ay", "ey", "oy", "uy"].iter().any(|s| name.ends_with(s)) {
        return format!("{}ies", &name[..name.len() - 1]);
    }
    if ["s", "x", "z", "ch", "sh"].iter().any(|s| name.ends_with(s)) {
        return format!("{}es", name);
    }
    format!("{}s", name)
}
