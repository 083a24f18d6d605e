//! Media mirroring between instances.
//!
//! On export each referenced media id is downloaded once into the bundle's
//! media directory and hashed. On import every manifest record is uploaded,
//! unless a file with the same content hash already exists on the target.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{MediaClient, UploadMetadata};
use crate::error::{Error, Result};
use crate::model::{MediaFailure, MediaRecord};

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// File name used for a media file inside the bundle.
#[must_use]
pub fn local_file_name(id: u64, name: &str) -> String {
    let safe: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{}_{}", id, safe)
}

/// Outcome of importing a media manifest.
#[derive(Debug, Clone, Default)]
pub struct MediaImportOutcome {
    /// Source media id → target media id.
    pub id_map: HashMap<u64, u64>,
    /// Files uploaded.
    pub uploaded: usize,
    /// Files matched to an existing upload by content hash.
    pub deduplicated: usize,
    /// Assets that could not be transferred.
    pub failures: Vec<MediaFailure>,
    /// Whether the run stopped early on cancellation.
    pub cancelled: bool,
}

/// Downloads and uploads media through a [`MediaClient`].
pub struct MediaHandler {
    client: Arc<dyn MediaClient>,
}

impl MediaHandler {
    /// Creates a handler over a media client.
    pub fn new(client: Arc<dyn MediaClient>) -> Self {
        Self { client }
    }

    /// Fetches metadata for `id` and, when `media_dir` is set, downloads the
    /// file into it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MediaTransferFailed`] on any lookup, download or
    /// write failure.
    pub async fn export_media(&self, id: u64, media_dir: Option<&Path>) -> Result<MediaRecord> {
        let transfer = |e: Error| Error::MediaTransferFailed {
            media_id: id,
            reason: e.to_string(),
        };
        let media = self.client.get_media(id).await.map_err(transfer)?;
        let mut record = MediaRecord {
            id: media.id,
            name: media.name.clone(),
            mime: media.mime.clone(),
            size: media.size,
            url: media.url.clone(),
            source_hash: media.hash.clone(),
            sha256: None,
            local_path: None,
        };

        let Some(dir) = media_dir else {
            return Ok(record);
        };
        let bytes = self.client.download(&media).await.map_err(transfer)?;
        let file_name = local_file_name(media.id, &media.name);
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| transfer(e.into()))?;
        tokio::fs::write(dir.join(&file_name), &bytes)
            .await
            .map_err(|e| transfer(e.into()))?;

        debug!("Downloaded media {} ({} bytes)", id, bytes.len());
        record.size = bytes.len() as u64;
        record.sha256 = Some(content_hash(&bytes));
        record.local_path = Some(file_name);
        Ok(record)
    }

    /// Uploads every manifest record found in `media_dir`.
    ///
    /// With `overwrite` unset, a record whose content hash matches a file
    /// already on the target (or one uploaded earlier in this run) reuses it.
    /// Hashes seen earlier in the run are answered from an in-run cache
    /// instead of a second `find_by_hash` call.
    pub async fn import_media<I>(
        &self,
        records: I,
        media_dir: Option<&Path>,
        overwrite: bool,
        cancellation: Option<&CancellationToken>,
    ) -> MediaImportOutcome
    where
        I: IntoIterator<Item = Result<MediaRecord>>,
    {
        let mut outcome = MediaImportOutcome::default();
        let mut by_hash: HashMap<String, u64> = HashMap::new();

        for record in records {
            if cancellation.is_some_and(CancellationToken::is_cancelled) {
                outcome.cancelled = true;
                break;
            }
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("Media manifest unreadable: {}", e);
                    outcome.failures.push(MediaFailure {
                        media_id: 0,
                        reason: e.to_string(),
                    });
                    break;
                }
            };
            match self
                .import_one(&record, media_dir, overwrite, &mut by_hash)
                .await
            {
                Ok((target, reused)) => {
                    outcome.id_map.insert(record.id, target);
                    if reused {
                        outcome.deduplicated += 1;
                    } else {
                        outcome.uploaded += 1;
                    }
                }
                Err(e) => {
                    warn!("Media {} not transferred: {}", record.id, e);
                    outcome.failures.push(MediaFailure {
                        media_id: record.id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Media import: {} uploaded, {} deduplicated, {} failed",
            outcome.uploaded,
            outcome.deduplicated,
            outcome.failures.len()
        );
        outcome
    }

    async fn import_one(
        &self,
        record: &MediaRecord,
        media_dir: Option<&Path>,
        overwrite: bool,
        by_hash: &mut HashMap<String, u64>,
    ) -> Result<(u64, bool)> {
        let transfer = |reason: String| Error::MediaTransferFailed {
            media_id: record.id,
            reason,
        };
        let (Some(dir), Some(local)) = (media_dir, record.local_path.as_deref()) else {
            return Err(transfer("no local file for media".to_string()));
        };
        let bytes = tokio::fs::read(dir.join(local))
            .await
            .map_err(|e| transfer(e.to_string()))?;
        let hash = content_hash(&bytes);
        if let Some(expected) = &record.sha256 {
            if expected != &hash {
                return Err(transfer(format!(
                    "content hash mismatch: manifest {}, file {}",
                    expected, hash
                )));
            }
        }

        if !overwrite {
            // in-run cache stands in for the target lookup
            if let Some(target) = by_hash.get(&hash) {
                return Ok((*target, true));
            }
            let existing = self
                .client
                .find_by_hash(&hash)
                .await
                .map_err(|e| transfer(e.to_string()))?;
            if let Some(existing) = existing {
                debug!("Media {} already on target as {}", record.id, existing.id);
                by_hash.insert(hash, existing.id);
                return Ok((existing.id, true));
            }
        }

        let metadata = UploadMetadata {
            name: record.name.clone(),
            mime: record.mime.clone(),
            sha256: hash.clone(),
            alternative_text: None,
        };
        let stored = self
            .client
            .upload(bytes, &metadata)
            .await
            .map_err(|e| transfer(e.to_string()))?;
        by_hash.insert(hash, stored.id);
        Ok((stored.id, false))
    }
}
