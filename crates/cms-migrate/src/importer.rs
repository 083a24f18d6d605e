//! Two-pass streaming import.
//!
//! Pass 1 reads the entity stream in waves of `batch_size`, resolves
//! conflicts against the target and writes relation-free bodies, building
//! the [`IdMappingTable`]. Pass 2 reopens the stream and writes relation
//! fields back for every entity created or updated in pass 1, once the
//! mapping is complete. At most one wave of decoded records is held at once.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bulk::{BulkExecutor, BulkOperation, DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENCY};
use crate::client::{CmsClient, Entity, MediaClient};
use crate::error::{Error, Result};
use crate::exporter::StageProgressCallback;
use crate::mapping::{IdMappingTable, MappingOutcome};
use crate::media::MediaHandler;
use crate::model::{
    ApiShape, EntityFailure, EntityId, EntityKey, ExportedEntity, MediaFailure,
    UnresolvedRelation,
};
use crate::relations::{reinsert, reinsert_media};
use crate::stream::{EntitySource, RecordIter};
use crate::validate::validate_relations;

/// What to do when the target already holds a matching entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictResolution {
    /// Keep the existing entity and map the source id to it.
    #[default]
    Skip,
    /// Overwrite the existing entity with the source body.
    Update,
    /// Record a conflict failure for the entity.
    Fail,
}

/// How an existing target entity is looked up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictLookup {
    /// Match on the field configured in [`ImportOptions::natural_keys`].
    NaturalKey,
    /// Match on the source document id.
    DocumentId,
}

/// Import options.
#[derive(Clone)]
pub struct ImportOptions {
    /// Conflict policy.
    pub conflict_resolution: ConflictResolution,
    /// Lookups tried in order; the first hit wins.
    pub conflict_lookups: Vec<ConflictLookup>,
    /// Natural key field per content type.
    pub natural_keys: BTreeMap<String, String>,
    /// Only import these content types (all when `None`).
    pub content_types: Option<Vec<String>>,
    /// Report relation references to ids missing from the stream.
    pub validate_relations: bool,
    /// With `dry_run`, abort when validation finds violations.
    pub strict: bool,
    /// Resolve conflicts and count outcomes without writing.
    pub dry_run: bool,
    /// Upload the media manifest before entities.
    pub import_media: bool,
    /// Upload media even when the target already has the same content.
    pub overwrite_media: bool,
    /// Directory holding media files (defaults to the source's).
    pub media_dir: Option<PathBuf>,
    /// Skip pass 2.
    pub skip_relations: bool,
    /// Records per wave.
    pub batch_size: usize,
    /// Writes in flight within a wave.
    pub max_concurrency: usize,
    /// Cooperative cancellation, checked between records and operations.
    pub cancellation: Option<CancellationToken>,
    /// Progress reporting.
    pub progress_callback: Option<StageProgressCallback>,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            conflict_resolution: ConflictResolution::default(),
            conflict_lookups: vec![ConflictLookup::NaturalKey],
            natural_keys: BTreeMap::new(),
            content_types: None,
            validate_relations: false,
            strict: false,
            dry_run: false,
            import_media: false,
            overwrite_media: false,
            media_dir: None,
            skip_relations: false,
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            cancellation: None,
            progress_callback: None,
        }
    }
}

impl std::fmt::Debug for ImportOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImportOptions")
            .field("conflict_resolution", &self.conflict_resolution)
            .field("conflict_lookups", &self.conflict_lookups)
            .field("natural_keys", &self.natural_keys)
            .field("content_types", &self.content_types)
            .field("dry_run", &self.dry_run)
            .field("batch_size", &self.batch_size)
            .field("max_concurrency", &self.max_concurrency)
            .finish_non_exhaustive()
    }
}

impl ImportOptions {
    fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(CancellationToken::is_cancelled)
    }

    fn includes(&self, content_type: &str) -> bool {
        self.content_types
            .as_ref()
            .map_or(true, |types| types.iter().any(|t| t == content_type))
    }

    fn report(&self, current: usize, total: usize, message: &str) {
        if let Some(callback) = &self.progress_callback {
            callback(current, total, message);
        }
    }
}

/// Media counters of an import run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaStats {
    /// Files uploaded.
    pub uploaded: usize,
    /// Files matched to existing uploads by content hash.
    pub deduplicated: usize,
    /// Assets that could not be transferred.
    pub failures: Vec<MediaFailure>,
}

/// How a run ended, for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every record was imported.
    Succeeded,
    /// The run completed with this many failed entities.
    SucceededWithFailures(usize),
    /// The run stopped early on cancellation.
    Cancelled,
    /// The run stopped before completion.
    Aborted(String),
}

/// Outcome of an import run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportResult {
    /// Records read from the stream and settled in pass 1.
    pub total_records: usize,
    /// Records skipped by the content type filter.
    pub filtered_out: usize,
    /// Entities created.
    pub created: usize,
    /// Existing entities updated.
    pub updated: usize,
    /// Existing entities kept.
    pub skipped: usize,
    /// Entities that failed in pass 1.
    pub failed: usize,
    /// Source → target identifiers.
    pub mapping: IdMappingTable,
    /// Pass 1 failures.
    pub failures: Vec<EntityFailure>,
    /// Entities whose relation fields were written in pass 2.
    pub relations_updated: usize,
    /// Pass 2 write failures.
    pub relation_failures: Vec<EntityFailure>,
    /// References left out in pass 2 for lack of a mapping entry.
    pub unresolved_relations: Vec<UnresolvedRelation>,
    /// References to ids absent from the stream, from validation.
    pub relation_violations: Vec<UnresolvedRelation>,
    /// Media counters.
    pub media: MediaStats,
    /// Whether this was a dry run.
    pub dry_run: bool,
    /// Whether the run stopped early on cancellation.
    pub cancelled: bool,
    /// Reason the run stopped before completion.
    pub aborted: Option<String>,
}

impl ImportResult {
    /// Classifies the run.
    #[must_use]
    pub fn outcome(&self) -> RunOutcome {
        if let Some(reason) = &self.aborted {
            return RunOutcome::Aborted(reason.clone());
        }
        if self.cancelled {
            return RunOutcome::Cancelled;
        }
        let failures = self.failed + self.relation_failures.len();
        if failures == 0 {
            RunOutcome::Succeeded
        } else {
            RunOutcome::SucceededWithFailures(failures)
        }
    }

    /// True if pass 1 accounted for every record it settled.
    #[must_use]
    pub fn is_balanced(&self) -> bool {
        self.created + self.updated + self.skipped + self.failed == self.total_records
    }

    fn fail(&mut self, content_type: &str, source: &EntityId, error: &Error) {
        warn!("Failed to import {} {}: {}", content_type, source, error);
        self.failed += 1;
        self.total_records += 1;
        self.failures.push(EntityFailure::from_error(
            content_type,
            Some(source.clone()),
            error,
        ));
    }

    fn settle(&mut self, content_type: &str, source: EntityId, target: Option<EntityId>, outcome: MappingOutcome) {
        self.total_records += 1;
        match outcome {
            MappingOutcome::Created => self.created += 1,
            MappingOutcome::Updated => self.updated += 1,
            MappingOutcome::Skipped => self.skipped += 1,
        }
        if let Some(target) = target {
            self.mapping
                .for_type_mut(content_type)
                .insert(source, target, outcome);
        }
    }
}

/// A pass 1 write waiting for its bulk result.
struct PendingWrite {
    content_type: String,
    source: EntityId,
    outcome: MappingOutcome,
}

/// Imports an entity stream into a target instance.
pub struct Importer {
    client: Arc<dyn CmsClient>,
    media: Option<MediaHandler>,
}

impl Importer {
    /// Creates an importer.
    ///
    /// `media` is required only for imports with `import_media` set.
    pub fn new(client: Arc<dyn CmsClient>, media: Option<Arc<dyn MediaClient>>) -> Self {
        Self {
            client,
            media: media.map(MediaHandler::new),
        }
    }

    /// Runs the import.
    ///
    /// # Errors
    ///
    /// Returns an error when the stream cannot be opened or media import is
    /// requested without a media client. Entity failures, stream corruption
    /// and cancellation are reported through [`ImportResult`].
    pub async fn import(&self, source: &dyn EntitySource, options: &ImportOptions) -> Result<ImportResult> {
        let mut result = ImportResult {
            dry_run: options.dry_run,
            ..ImportResult::default()
        };
        if options.import_media && self.media.is_none() {
            return Err(Error::Config(
                "import_media requires a media client".to_string(),
            ));
        }

        if options.validate_relations {
            options.report(0, 100, "Validating relations");
            match validate_relations(source, |ct| options.includes(ct)) {
                Ok(violations) => result.relation_violations = violations,
                Err(e @ Error::StreamCorrupt { .. }) => {
                    result.aborted = Some(e.to_string());
                    return Ok(result);
                }
                Err(e) => return Err(e),
            }
            for violation in &result.relation_violations {
                warn!(
                    "{} {} references missing {} at '{}'",
                    violation.content_type, violation.source_id, violation.missing, violation.path
                );
            }
            if options.strict && options.dry_run && !result.relation_violations.is_empty() {
                let error = Error::ValidationFailed(result.relation_violations.len());
                result.aborted = Some(error.to_string());
                return Ok(result);
            }
        }

        let media_map = if options.import_media {
            options.report(20, 100, "Importing media files");
            self.import_media(source, options, &mut result).await?
        } else {
            HashMap::new()
        };

        if !result.cancelled {
            options.report(40, 100, "Importing entities");
            self.create_pass(source, options, &media_map, &mut result)
                .await?;
        }
        info!(
            "Pass 1: {} created, {} updated, {} skipped, {} failed",
            result.created, result.updated, result.skipped, result.failed
        );

        let relations_allowed = !options.skip_relations && !options.dry_run;
        if relations_allowed && !result.cancelled && result.aborted.is_none() {
            options.report(60, 100, "Importing relations");
            self.relation_pass(source, options, &media_map, &mut result)
                .await?;
        }

        if !result.cancelled && result.aborted.is_none() {
            options.report(100, 100, "Import complete");
        }
        Ok(result)
    }

    async fn import_media(
        &self,
        source: &dyn EntitySource,
        options: &ImportOptions,
        result: &mut ImportResult,
    ) -> Result<HashMap<u64, u64>> {
        let Some(handler) = &self.media else {
            return Ok(HashMap::new());
        };
        let media_dir = options.media_dir.clone().or_else(|| source.media_dir());
        if media_dir.is_none() {
            warn!("No media directory, skipping media import");
            return Ok(HashMap::new());
        }
        if options.dry_run {
            let count = source.open_media()?.count();
            info!("Dry run: {} media files would be imported", count);
            return Ok(HashMap::new());
        }

        let outcome = handler
            .import_media(
                source.open_media()?,
                media_dir.as_deref(),
                options.overwrite_media,
                options.cancellation.as_ref(),
            )
            .await;
        result.media = MediaStats {
            uploaded: outcome.uploaded,
            deduplicated: outcome.deduplicated,
            failures: outcome.failures,
        };
        result.cancelled |= outcome.cancelled;
        Ok(outcome.id_map)
    }

    fn executor(&self, options: &ImportOptions) -> BulkExecutor {
        let executor = BulkExecutor::new(Arc::clone(&self.client));
        match &options.cancellation {
            Some(token) => executor.with_cancellation(token.clone()),
            None => executor,
        }
    }

    /// Reads up to `batch_size` included records. Returns the wave and the
    /// decode error that ended the stream, if any.
    fn next_wave(
        records: &mut RecordIter<'_, ExportedEntity>,
        options: &ImportOptions,
        result: &mut ImportResult,
    ) -> (Vec<ExportedEntity>, Option<Error>) {
        let batch_size = options.batch_size.max(1);
        let mut wave = Vec::with_capacity(batch_size);
        while wave.len() < batch_size {
            match records.next() {
                Some(Ok(entity)) if options.includes(&entity.content_type) => wave.push(entity),
                Some(Ok(_)) => result.filtered_out += 1,
                Some(Err(e)) => return (wave, Some(e)),
                None => break,
            }
        }
        (wave, None)
    }

    async fn create_pass(
        &self,
        source: &dyn EntitySource,
        options: &ImportOptions,
        media_map: &HashMap<u64, u64>,
        result: &mut ImportResult,
    ) -> Result<()> {
        let shape = self.client.shape();
        let executor = self.executor(options);
        let mut records = source.open_entities()?;

        loop {
            if options.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let (wave, corrupt) = Self::next_wave(&mut records, options, result);
            if wave.is_empty() && corrupt.is_none() {
                break;
            }

            let mut operations = Vec::with_capacity(wave.len());
            let mut pending = Vec::with_capacity(wave.len());
            for entity in wave {
                if options.is_cancelled() {
                    result.cancelled = true;
                    break;
                }
                self.plan_record(entity, shape, options, media_map, result, &mut operations, &mut pending)
                    .await;
            }

            if !operations.is_empty() {
                let bulk = executor
                    .run(operations, options.batch_size, options.max_concurrency)
                    .await;
                let mut pending: Vec<Option<PendingWrite>> = pending.into_iter().map(Some).collect();
                for success in bulk.successes {
                    let Some(write) = pending.get_mut(success.index).and_then(Option::take) else {
                        continue;
                    };
                    let target = success.entity.map(|entity: Entity| entity.id);
                    result.settle(&write.content_type, write.source, target, write.outcome);
                }
                for failure in bulk.failures {
                    let Some(write) = pending.get_mut(failure.index).and_then(Option::take) else {
                        continue;
                    };
                    warn!(
                        "Failed to import {} {}: {}",
                        write.content_type, write.source, failure.error
                    );
                    result.failed += 1;
                    result.total_records += 1;
                    result.failures.push(EntityFailure {
                        content_type: write.content_type,
                        source_id: Some(write.source),
                        kind: failure.kind,
                        reason: failure.error,
                    });
                }
                result.cancelled |= bulk.cancelled;
            }
            options.report(
                result.total_records,
                0,
                &format!("Imported {} records", result.total_records),
            );

            if let Some(e) = corrupt {
                warn!("Entity stream ended early: {}", e);
                result.aborted = Some(e.to_string());
                break;
            }
            if result.cancelled {
                break;
            }
        }
        Ok(())
    }

    /// Resolves conflicts for one record and either settles it or queues a
    /// write.
    #[allow(clippy::too_many_arguments)]
    async fn plan_record(
        &self,
        entity: ExportedEntity,
        shape: ApiShape,
        options: &ImportOptions,
        media_map: &HashMap<u64, u64>,
        result: &mut ImportResult,
        operations: &mut Vec<BulkOperation>,
        pending: &mut Vec<PendingWrite>,
    ) {
        let ExportedEntity {
            content_type,
            id: source,
            mut body,
            media,
            ..
        } = entity;

        let existing = match self.find_existing(&content_type, &source, &body, options).await {
            Ok(existing) => existing,
            Err(e) => {
                result.fail(&content_type, &source, &e);
                return;
            }
        };

        if !media_map.is_empty() {
            let missing = reinsert_media(&mut body, &media, media_map);
            if !missing.is_empty() {
                debug!("{} {}: media {:?} not on target", content_type, source, missing);
            }
        }

        let (operation, outcome) = match existing {
            None => (
                BulkOperation::Create {
                    content_type: content_type.clone(),
                    body,
                },
                MappingOutcome::Created,
            ),
            Some(existing) => match options.conflict_resolution {
                ConflictResolution::Skip => {
                    debug!("{} {} exists as {}, skipping", content_type, source, existing);
                    result.settle(&content_type, source, Some(existing), MappingOutcome::Skipped);
                    return;
                }
                ConflictResolution::Fail => {
                    let error = Error::ConflictDetected {
                        content_type: content_type.clone(),
                        reason: format!("{source} already exists as {existing}"),
                    };
                    result.fail(&content_type, &source, &error);
                    return;
                }
                ConflictResolution::Update => (
                    BulkOperation::Update {
                        content_type: content_type.clone(),
                        key: existing.key_for(shape),
                        body,
                    },
                    MappingOutcome::Updated,
                ),
            },
        };

        if options.dry_run {
            result.settle(&content_type, source, None, outcome);
            return;
        }
        operations.push(operation);
        pending.push(PendingWrite {
            content_type,
            source,
            outcome,
        });
    }

    async fn find_existing(
        &self,
        content_type: &str,
        source: &EntityId,
        body: &Map<String, Value>,
        options: &ImportOptions,
    ) -> Result<Option<EntityId>> {
        for lookup in &options.conflict_lookups {
            let found = match lookup {
                ConflictLookup::NaturalKey => {
                    let Some(field) = options.natural_keys.get(content_type) else {
                        continue;
                    };
                    match body.get(field) {
                        Some(value) if !value.is_null() => {
                            self.client.find_by_field(content_type, field, value).await?
                        }
                        _ => None,
                    }
                }
                ConflictLookup::DocumentId => match source.document_id() {
                    Some(doc) => {
                        self.client
                            .get(content_type, &EntityKey::Document(doc.to_string()))
                            .await?
                    }
                    None => None,
                },
            };
            if let Some(entity) = found {
                return Ok(Some(entity.id));
            }
        }
        Ok(None)
    }

    async fn relation_pass(
        &self,
        source: &dyn EntitySource,
        options: &ImportOptions,
        media_map: &HashMap<u64, u64>,
        result: &mut ImportResult,
    ) -> Result<()> {
        let shape = self.client.shape();
        let executor = self.executor(options);
        let mut records = source.open_entities()?;
        let mut ignored = ImportResult::default();

        loop {
            if options.is_cancelled() {
                result.cancelled = true;
                break;
            }
            let (wave, corrupt) = Self::next_wave(&mut records, options, &mut ignored);
            if wave.is_empty() && corrupt.is_none() {
                break;
            }

            let mut operations = Vec::new();
            let mut owners = Vec::new();
            for entity in wave {
                if let Some((operation, owner)) = self.relation_update(entity, shape, media_map, result) {
                    operations.push(operation);
                    owners.push(owner);
                }
            }

            if !operations.is_empty() {
                let bulk = executor
                    .run(operations, options.batch_size, options.max_concurrency)
                    .await;
                result.relations_updated += bulk.succeeded;
                for failure in bulk.failures {
                    if let Some((content_type, source_id)) = owners.get(failure.index) {
                        warn!(
                            "Failed to write relations of {} {}: {}",
                            content_type, source_id, failure.error
                        );
                        result.relation_failures.push(EntityFailure {
                            content_type: content_type.clone(),
                            source_id: Some(source_id.clone()),
                            kind: failure.kind,
                            reason: failure.error,
                        });
                    }
                }
                result.cancelled |= bulk.cancelled;
            }

            if let Some(e) = corrupt {
                warn!("Entity stream ended early in relation pass: {}", e);
                result.aborted = Some(e.to_string());
                break;
            }
            if result.cancelled {
                break;
            }
        }

        info!(
            "Pass 2: {} entities related, {} unresolved references",
            result.relations_updated,
            result.unresolved_relations.len()
        );
        Ok(())
    }

    /// Builds the relation update for one record, or `None` when it has no
    /// relations or was not written in pass 1.
    fn relation_update(
        &self,
        entity: ExportedEntity,
        shape: ApiShape,
        media_map: &HashMap<u64, u64>,
        result: &mut ImportResult,
    ) -> Option<(BulkOperation, (String, EntityId))> {
        if entity.relations.is_empty() {
            return None;
        }
        let entry = result.mapping.for_type(&entity.content_type)?.get(&entity.id)?;
        if !entry.outcome.needs_relations() {
            return None;
        }
        let key = entry.target.key_for(shape);

        let mut body = entity.body;
        if !media_map.is_empty() {
            reinsert_media(&mut body, &entity.media, media_map);
        }
        let (resolved, unresolved) = reinsert(&body, &entity.relations, &result.mapping, shape);
        for miss in unresolved {
            result.unresolved_relations.push(UnresolvedRelation {
                content_type: entity.content_type.clone(),
                source_id: entity.id.clone(),
                path: miss.path.to_string(),
                target: miss.target,
                missing: miss.missing,
            });
        }

        // components are written whole, so send every root a relation lives under
        let roots: HashSet<&str> = entity
            .relations
            .iter()
            .filter_map(|entry| entry.path.root())
            .collect();
        let payload: Map<String, Value> = resolved
            .into_iter()
            .filter(|(field, _)| roots.contains(field.as_str()))
            .collect();
        if payload.is_empty() {
            return None;
        }

        Some((
            BulkOperation::Update {
                content_type: entity.content_type.clone(),
                key,
                body: payload,
            },
            (entity.content_type, entity.id),
        ))
    }
}

#[cfg(test)]
#[path = "importer_tests.rs"]
mod tests;
