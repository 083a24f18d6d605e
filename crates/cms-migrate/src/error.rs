//! Error types for cms-migrate.
//!
//! Entity-level and asset-level failures are collected into result objects
//! ([`crate::ImportResult`], [`crate::ExportMetadata`], [`crate::BulkResult`]);
//! only resource-acquisition failures travel through [`Result`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while migrating content.
///
/// Error codes follow the pattern `MIGRATE-XXX`.
#[derive(Error, Debug)]
pub enum Error {
    /// Schema could not be fetched for a content type or component (MIGRATE-001).
    #[error("[MIGRATE-001] Schema unavailable for '{uid}': {reason}")]
    SchemaUnavailable {
        /// Content type or component uid.
        uid: String,
        /// Underlying reason.
        reason: String,
    },

    /// A referenced id has no entry in the id mapping (MIGRATE-002).
    #[error("[MIGRATE-002] Relation '{path}' unresolved: {reason}")]
    RelationUnresolved {
        /// Relation path inside the entity body.
        path: String,
        /// Underlying reason.
        reason: String,
    },

    /// Target already holds a colliding entity (MIGRATE-003).
    #[error("[MIGRATE-003] Conflict on '{content_type}': {reason}")]
    ConflictDetected {
        /// Content type uid.
        content_type: String,
        /// Description of the collision.
        reason: String,
    },

    /// Media download, upload or hash lookup failed (MIGRATE-004).
    #[error("[MIGRATE-004] Media transfer failed for media {media_id}: {reason}")]
    MediaTransferFailed {
        /// Source media id.
        media_id: u64,
        /// Underlying reason.
        reason: String,
    },

    /// A stream record could not be decoded (MIGRATE-005).
    #[error("[MIGRATE-005] Stream corrupt at {}:{line}: {reason}", path.display())]
    StreamCorrupt {
        /// Stream file path.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// Decoder message.
        reason: String,
    },

    /// Configuration error (MIGRATE-006).
    #[error("[MIGRATE-006] Configuration error: {0}")]
    Config(String),

    /// IO error (MIGRATE-007).
    #[error("[MIGRATE-007] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error (MIGRATE-008).
    #[error("[MIGRATE-008] Serialization error: {0}")]
    Serialization(String),

    /// HTTP transport error (MIGRATE-009).
    #[error("[MIGRATE-009] HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Authentication rejected by the CMS (MIGRATE-010).
    #[error("[MIGRATE-010] Authentication failed: {0}")]
    Authentication(String),

    /// Rate limited by the CMS, retry after the given seconds (MIGRATE-011).
    #[error("[MIGRATE-011] Rate limited, retry after {0}s")]
    RateLimit(u64),

    /// Entity or endpoint not found (MIGRATE-012).
    #[error("[MIGRATE-012] Not found: {0}")]
    NotFound(String),

    /// Any other error reported by the CMS collaborator (MIGRATE-013).
    #[error("[MIGRATE-013] CMS error: {0}")]
    Client(String),

    /// Operation was cancelled before it started (MIGRATE-014).
    #[error("[MIGRATE-014] Operation cancelled")]
    Cancelled,

    /// Strict relation validation rejected the import (MIGRATE-015).
    #[error("[MIGRATE-015] Relation validation failed: {0} dangling reference(s)")]
    ValidationFailed(usize),
}

impl Error {
    /// Returns the error code (e.g., "MIGRATE-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::SchemaUnavailable { .. } => "MIGRATE-001",
            Self::RelationUnresolved { .. } => "MIGRATE-002",
            Self::ConflictDetected { .. } => "MIGRATE-003",
            Self::MediaTransferFailed { .. } => "MIGRATE-004",
            Self::StreamCorrupt { .. } => "MIGRATE-005",
            Self::Config(_) => "MIGRATE-006",
            Self::Io(_) => "MIGRATE-007",
            Self::Serialization(_) => "MIGRATE-008",
            Self::Http(_) => "MIGRATE-009",
            Self::Authentication(_) => "MIGRATE-010",
            Self::RateLimit(_) => "MIGRATE-011",
            Self::NotFound(_) => "MIGRATE-012",
            Self::Client(_) => "MIGRATE-013",
            Self::Cancelled => "MIGRATE-014",
            Self::ValidationFailed(_) => "MIGRATE-015",
        }
    }

    /// Classifies the error for per-entity failure records.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SchemaUnavailable { .. } => FailureKind::SchemaUnavailable,
            Self::RelationUnresolved { .. } => FailureKind::RelationUnresolved,
            Self::ConflictDetected { .. } => FailureKind::ConflictDetected,
            Self::MediaTransferFailed { .. } => FailureKind::MediaTransferFailed,
            Self::StreamCorrupt { .. } => FailureKind::StreamCorrupt,
            Self::Cancelled => FailureKind::Cancelled,
            _ => FailureKind::Write,
        }
    }

    /// Convenience constructor for [`Error::SchemaUnavailable`].
    pub fn schema_unavailable(uid: impl Into<String>, reason: impl ToString) -> Self {
        Self::SchemaUnavailable {
            uid: uid.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Failure category recorded in result objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Schema fetch or schema-driven extraction failed.
    SchemaUnavailable,
    /// Relation reference could not be mapped.
    RelationUnresolved,
    /// Target collision under the `fail` policy.
    ConflictDetected,
    /// Media asset could not be transferred.
    MediaTransferFailed,
    /// Stream record could not be decoded.
    StreamCorrupt,
    /// Listing a content type failed.
    Listing,
    /// Create/update/delete call failed.
    Write,
    /// Operation skipped because the run was cancelled.
    Cancelled,
}
