//! Content export.
//!
//! Each content type is paged through [`CmsClient::list`], every entity is
//! split by the relation codec and written to a sink. Media ids discovered
//! along the way are queued once and mirrored after all types are listed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::common::strip_system_fields;
use crate::client::{CmsClient, MediaClient, SchemaSource};
use crate::error::{Error, FailureKind, Result};
use crate::media::MediaHandler;
use crate::model::{
    EntityFailure, ExportData, ExportMetadata, ExportedEntity, MediaFailure, MediaRecord,
};
use crate::relations::{extract, extract_heuristic};
use crate::schema::SchemaCache;
use crate::stream::{ExportBundle, JsonlWriter};
use crate::validate::validate_relations;

/// Stage progress callback receiving `(current, total, message)`.
pub type StageProgressCallback = Arc<dyn Fn(usize, usize, &str) + Send + Sync>;

/// Default listing page size.
pub const DEFAULT_PAGE_SIZE: usize = 100;

/// Export options.
#[derive(Clone)]
pub struct ExportOptions {
    /// Mirror referenced media.
    pub include_media: bool,
    /// Where media files are downloaded. Streaming exports default to the
    /// bundle's `media/` directory; buffered exports record metadata only
    /// when unset.
    pub media_dir: Option<PathBuf>,
    /// Extract relations from schemas instead of guessing from field values.
    pub use_schema_relations: bool,
    /// Entities requested per listing call.
    pub page_size: usize,
    /// Check relation references against the export set when done.
    pub validate_relations: bool,
    /// Progress reporting.
    pub progress_callback: Option<StageProgressCallback>,
    /// Cooperative cancellation, checked between pages, entities and media.
    pub cancellation: Option<CancellationToken>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            include_media: false,
            media_dir: None,
            use_schema_relations: true,
            page_size: DEFAULT_PAGE_SIZE,
            validate_relations: false,
            progress_callback: None,
            cancellation: None,
        }
    }
}

impl std::fmt::Debug for ExportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportOptions")
            .field("include_media", &self.include_media)
            .field("media_dir", &self.media_dir)
            .field("use_schema_relations", &self.use_schema_relations)
            .field("page_size", &self.page_size)
            .field("validate_relations", &self.validate_relations)
            .finish_non_exhaustive()
    }
}

impl ExportOptions {
    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn report(&self, current: usize, total: usize, message: &str) {
        if let Some(callback) = &self.progress_callback {
            callback(current, total, message);
        }
    }
}

/// Destination of exported records.
trait ExportSink {
    fn write_entity(&mut self, entity: ExportedEntity) -> Result<()>;
    fn write_media(&mut self, record: MediaRecord) -> Result<()>;
}

#[derive(Default)]
struct BufferSink {
    entities: Vec<ExportedEntity>,
    media: Vec<MediaRecord>,
}

impl ExportSink for BufferSink {
    fn write_entity(&mut self, entity: ExportedEntity) -> Result<()> {
        self.entities.push(entity);
        Ok(())
    }

    fn write_media(&mut self, record: MediaRecord) -> Result<()> {
        self.media.push(record);
        Ok(())
    }
}

struct BundleSink {
    entities: JsonlWriter<ExportedEntity>,
    media: JsonlWriter<MediaRecord>,
}

impl ExportSink for BundleSink {
    fn write_entity(&mut self, entity: ExportedEntity) -> Result<()> {
        self.entities.write(&entity)
    }

    fn write_media(&mut self, record: MediaRecord) -> Result<()> {
        self.media.write(&record)
    }
}

/// Exports content types from a source instance.
pub struct Exporter {
    client: Arc<dyn CmsClient>,
    schemas: SchemaCache,
    media: Option<MediaHandler>,
}

impl Exporter {
    /// Creates an exporter.
    ///
    /// `media` is required only for exports with `include_media` set.
    pub fn new(
        client: Arc<dyn CmsClient>,
        schemas: Arc<dyn SchemaSource>,
        media: Option<Arc<dyn MediaClient>>,
    ) -> Self {
        Self {
            client,
            schemas: SchemaCache::new(schemas),
            media: media.map(MediaHandler::new),
        }
    }

    /// Schema cache used by this exporter.
    #[must_use]
    pub fn schema_cache(&self) -> &SchemaCache {
        &self.schemas
    }

    /// Exports into memory.
    ///
    /// # Errors
    ///
    /// Returns an error only when media mirroring is requested without a
    /// media client. Per-entity and per-type failures are recorded in
    /// [`ExportMetadata::failures`].
    pub async fn export(&self, content_types: &[String], options: &ExportOptions) -> Result<ExportData> {
        let mut sink = BufferSink::default();
        let mut metadata = self
            .run(content_types, &mut sink, options.media_dir.as_deref(), options)
            .await?;

        let mut data = ExportData {
            metadata: ExportMetadata::new(Vec::new(), String::new(), metadata.source_shape),
            entities: sink.entities,
            media: sink.media,
        };
        if options.validate_relations && !metadata.cancelled {
            metadata.relation_violations = validate_relations(&data, |_| true)?;
        }
        data.metadata = metadata;
        Ok(data)
    }

    /// Exports into a bundle directory. `metadata.json` is written last.
    ///
    /// # Errors
    ///
    /// Returns an error if the bundle files cannot be created or written.
    pub async fn export_streaming(
        &self,
        content_types: &[String],
        bundle: &ExportBundle,
        options: &ExportOptions,
    ) -> Result<ExportMetadata> {
        let mut sink = BundleSink {
            entities: bundle.entity_writer()?,
            media: bundle.media_writer()?,
        };
        let media_dir = options
            .media_dir
            .clone()
            .unwrap_or_else(|| bundle.media_dir_path());
        let mut metadata = self
            .run(content_types, &mut sink, Some(media_dir.as_path()), options)
            .await?;
        sink.entities.finish()?;
        sink.media.finish()?;

        if options.validate_relations && !metadata.cancelled {
            metadata.relation_violations = validate_relations(bundle, |_| true)?;
        }
        bundle.write_metadata(&metadata)?;
        info!(
            "Export written to {} ({} entities, {} media)",
            bundle.root().display(),
            metadata.total_entities(),
            metadata.media_count
        );
        Ok(metadata)
    }

    async fn run<S: ExportSink>(
        &self,
        content_types: &[String],
        sink: &mut S,
        media_dir: Option<&Path>,
        options: &ExportOptions,
    ) -> Result<ExportMetadata> {
        if options.include_media && self.media.is_none() {
            return Err(Error::Config(
                "include_media requires a media client".to_string(),
            ));
        }

        let mut metadata = ExportMetadata::new(
            content_types.to_vec(),
            self.client.fingerprint(),
            self.client.shape(),
        );
        let mut media_queue: Vec<u64> = Vec::new();
        let mut media_seen: HashSet<u64> = HashSet::new();
        let total_types = content_types.len();

        info!("Exporting {} content types", total_types);

        for (idx, content_type) in content_types.iter().enumerate() {
            if options.is_cancelled() {
                metadata.cancelled = true;
                break;
            }
            options.report(idx, total_types, &format!("Exporting {content_type}"));

            let written = self
                .export_type(
                    content_type,
                    sink,
                    options,
                    &mut metadata,
                    &mut media_queue,
                    &mut media_seen,
                )
                .await?;
            metadata.entity_counts.insert(content_type.clone(), written);
            if metadata.cancelled {
                break;
            }
        }
        // the shape is known only once something was listed
        metadata.source_shape = self.client.shape();

        if options.include_media && !metadata.cancelled {
            options.report(total_types, total_types + 1, "Exporting media files");
            self.export_media_queue(&media_queue, sink, media_dir, options, &mut metadata)
                .await?;
        }

        if !metadata.cancelled {
            options.report(total_types, total_types, "Export complete");
        }
        Ok(metadata)
    }

    async fn export_type<S: ExportSink>(
        &self,
        content_type: &str,
        sink: &mut S,
        options: &ExportOptions,
        metadata: &mut ExportMetadata,
        media_queue: &mut Vec<u64>,
        media_seen: &mut HashSet<u64>,
    ) -> Result<u64> {
        let schema = if options.use_schema_relations {
            match self.schemas.get_schema(content_type).await {
                Ok(schema) => Some(schema),
                Err(e) => {
                    warn!(
                        "Schema for {} unavailable, falling back to heuristic relations: {}",
                        content_type, e
                    );
                    None
                }
            }
        } else {
            None
        };
        if schema.is_none() {
            metadata
                .heuristic_content_types
                .push(content_type.to_string());
        }

        let mut written = 0u64;
        let mut cursor = None;
        loop {
            if options.is_cancelled() {
                metadata.cancelled = true;
                break;
            }
            let page = match self
                .client
                .list(content_type, cursor.take(), options.page_size)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    warn!("Listing {} failed: {}", content_type, e);
                    metadata.failures.push(EntityFailure {
                        content_type: content_type.to_string(),
                        source_id: None,
                        kind: FailureKind::Listing,
                        reason: e.to_string(),
                    });
                    break;
                }
            };
            debug!("{}: page of {} entities", content_type, page.entities.len());

            for entity in page.entities {
                let attributes = strip_system_fields(entity.attributes);
                let extracted = match &schema {
                    Some(schema) => match extract(&attributes, schema) {
                        Ok(extracted) => extracted,
                        Err(e) => {
                            warn!("Skipping {} {}: {}", content_type, entity.id, e);
                            metadata.failures.push(EntityFailure::from_error(
                                content_type,
                                Some(entity.id),
                                &e,
                            ));
                            continue;
                        }
                    },
                    None => extract_heuristic(&attributes),
                };

                if options.include_media {
                    for id in extracted.media.iter().flat_map(|m| m.ids.iter()) {
                        if media_seen.insert(*id) {
                            media_queue.push(*id);
                        }
                    }
                }

                sink.write_entity(ExportedEntity {
                    content_type: content_type.to_string(),
                    id: entity.id,
                    body: extracted.body,
                    relations: extracted.relations,
                    media: extracted.media,
                })?;
                written += 1;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!("Exported {} entities of {}", written, content_type);
        Ok(written)
    }

    async fn export_media_queue<S: ExportSink>(
        &self,
        media_queue: &[u64],
        sink: &mut S,
        media_dir: Option<&Path>,
        options: &ExportOptions,
        metadata: &mut ExportMetadata,
    ) -> Result<()> {
        let Some(handler) = &self.media else {
            return Ok(());
        };
        if media_queue.is_empty() {
            info!("No media files to export");
            return Ok(());
        }
        info!("Found {} media files to export", media_queue.len());

        for (idx, id) in media_queue.iter().enumerate() {
            if options.is_cancelled() {
                metadata.cancelled = true;
                break;
            }
            match handler.export_media(*id, media_dir).await {
                Ok(record) => {
                    options.report(
                        idx + 1,
                        media_queue.len(),
                        &format!("Downloaded {}", record.name),
                    );
                    sink.write_media(record)?;
                    metadata.media_count += 1;
                }
                Err(e) => {
                    warn!("Failed to export media {}: {}", id, e);
                    metadata.media_failures.push(MediaFailure {
                        media_id: *id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        info!(
            "Exported {}/{} media files",
            metadata.media_count,
            media_queue.len()
        );
        Ok(())
    }
}
