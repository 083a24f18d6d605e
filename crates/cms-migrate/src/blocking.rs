//! Synchronous wrappers around the async engine.
//!
//! Each wrapper owns a private current-thread runtime and blocks on it, so
//! calls never overlap. Imports run with one write in flight at a time.
//! Do not call these from inside another tokio runtime.

use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

use crate::bulk::{BulkExecutor, BulkOperation, BulkResult};
use crate::client::{CmsClient, MediaClient, SchemaSource};
use crate::error::Result;
use crate::exporter::{ExportOptions, Exporter};
use crate::importer::{ImportOptions, ImportResult, Importer};
use crate::model::{ExportData, ExportMetadata};
use crate::stream::{EntitySource, ExportBundle};

fn runtime() -> Result<Runtime> {
    Ok(Builder::new_current_thread().enable_all().build()?)
}

/// Blocking [`Exporter`].
pub struct BlockingExporter {
    inner: Exporter,
    runtime: Runtime,
}

impl BlockingExporter {
    /// Creates a blocking exporter.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be started.
    pub fn new(
        client: Arc<dyn CmsClient>,
        schemas: Arc<dyn SchemaSource>,
        media: Option<Arc<dyn MediaClient>>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Exporter::new(client, schemas, media),
            runtime: runtime()?,
        })
    }

    /// See [`Exporter::export`].
    pub fn export(&self, content_types: &[String], options: &ExportOptions) -> Result<ExportData> {
        self.runtime
            .block_on(self.inner.export(content_types, options))
    }

    /// See [`Exporter::export_streaming`].
    pub fn export_streaming(
        &self,
        content_types: &[String],
        bundle: &ExportBundle,
        options: &ExportOptions,
    ) -> Result<ExportMetadata> {
        self.runtime
            .block_on(self.inner.export_streaming(content_types, bundle, options))
    }
}

/// Blocking [`Importer`].
pub struct BlockingImporter {
    inner: Importer,
    runtime: Runtime,
}

impl BlockingImporter {
    /// Creates a blocking importer.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be started.
    pub fn new(client: Arc<dyn CmsClient>, media: Option<Arc<dyn MediaClient>>) -> Result<Self> {
        Ok(Self {
            inner: Importer::new(client, media),
            runtime: runtime()?,
        })
    }

    /// See [`Importer::import`]. `max_concurrency` is forced to 1.
    pub fn import(&self, source: &dyn EntitySource, options: &ImportOptions) -> Result<ImportResult> {
        let options = ImportOptions {
            max_concurrency: 1,
            ..options.clone()
        };
        self.runtime.block_on(self.inner.import(source, &options))
    }
}

/// Blocking [`BulkExecutor`].
pub struct BlockingBulkExecutor {
    inner: BulkExecutor,
    runtime: Runtime,
}

impl BlockingBulkExecutor {
    /// Wraps an executor.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be started.
    pub fn new(inner: BulkExecutor) -> Result<Self> {
        Ok(Self {
            inner,
            runtime: runtime()?,
        })
    }

    /// Runs operations one at a time in waves of `batch_size`.
    pub fn run(&self, operations: Vec<BulkOperation>, batch_size: usize) -> BulkResult {
        self.runtime
            .block_on(self.inner.run(operations, batch_size, 1))
    }
}
