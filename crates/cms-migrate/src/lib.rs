// Migration tool - pedantic lints relaxed for CLI ergonomics
#![allow(clippy::pedantic)]

//! # CMS Migration Engine
//!
//! `cms-migrate` is a CLI tool and library for moving content between two
//! headless CMS instances over their REST APIs.
//!
//! Entities are exported with their relations stripped into a side table,
//! imported in a first pass that creates them without relations, then
//! re-linked in a second pass once every target id is known. This keeps
//! cyclic references (article -> author -> article) importable.
//!
//! ## Features
//!
//! | Feature | Notes |
//! |---------|-------|
//! | Schema-aware extraction | Components, dynamic zones, nested components |
//! | Heuristic extraction | Fallback when the schema endpoint is unavailable |
//! | v4 and v5 response shapes | Numeric ids and document ids |
//! | Streaming bundles | JSON-lines, bounded memory on import |
//! | Media transfer | SHA-256 dedup against the target library |
//! | Conflict policies | `skip`, `update`, `fail` |
//!
//! ## Quick Start
//!
//! ```bash
//! # Export to ./export
//! cms-migrate export --config migration.yaml
//!
//! # Preview an import
//! cms-migrate import --config migration.yaml --dry-run
//! ```
//!
//! ## Configuration Example
//!
//! ```yaml
//! source:
//!   url: http://localhost:1337
//!   api_token: ${SOURCE_TOKEN}
//!
//! target:
//!   url: http://localhost:1338
//!
//! export:
//!   content_types: [api::article.article, api::author.author]
//!   include_media: true
//!
//! import:
//!   conflict_resolution: skip
//!   natural_keys:
//!     api::article.article: slug
//! ```

#![warn(missing_docs)]

pub mod blocking;
pub mod bulk;
pub mod client;
pub mod config;
pub mod error;
pub mod exporter;
pub mod importer;
pub mod mapping;
pub mod media;
pub mod model;
pub mod relations;
pub mod retry;
pub mod schema;
pub mod stream;
pub mod validate;

pub use blocking::{BlockingBulkExecutor, BlockingExporter, BlockingImporter};
pub use bulk::{BulkExecutor, BulkOperation, BulkResult};
pub use client::rest::{RestClient, RestConfig};
pub use client::{CmsClient, MediaClient, SchemaSource};
pub use config::MigrationConfig;
pub use error::{Error, FailureKind, Result};
pub use exporter::{ExportOptions, Exporter};
pub use importer::{
    ConflictLookup, ConflictResolution, ImportOptions, ImportResult, Importer, RunOutcome,
};
pub use mapping::{IdMapping, IdMappingTable};
pub use model::{ApiShape, EntityId, ExportData, ExportMetadata, ExportedEntity};
pub use stream::{EntitySource, ExportBundle};
