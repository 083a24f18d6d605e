//! JSON-lines streams and the on-disk export bundle.
//!
//! A bundle directory holds:
//!
//! ```text
//! entities.jsonl   one ExportedEntity per line
//! media.jsonl      one MediaRecord per line
//! metadata.json    ExportMetadata, written last
//! media/           downloaded files named {id}_{name}
//! ```

pub mod reader;
pub mod writer;

pub use reader::JsonlReader;
pub use writer::JsonlWriter;

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::{ExportData, ExportMetadata, ExportedEntity, MediaRecord};

/// Entity stream file name.
pub const ENTITIES_FILE: &str = "entities.jsonl";
/// Media manifest file name.
pub const MEDIA_FILE: &str = "media.jsonl";
/// Metadata file name.
pub const METADATA_FILE: &str = "metadata.json";
/// Downloaded media directory name.
pub const MEDIA_DIR: &str = "media";

/// Boxed record iterator returned by [`EntitySource`].
pub type RecordIter<'a, T> = Box<dyn Iterator<Item = Result<T>> + Send + 'a>;

/// Something the importer can scan more than once.
///
/// Every call to `open_*` starts a fresh forward-only pass.
pub trait EntitySource: Send + Sync {
    /// Opens a new pass over the entity records.
    fn open_entities(&self) -> Result<RecordIter<'_, ExportedEntity>>;

    /// Opens a new pass over the media manifest.
    fn open_media(&self) -> Result<RecordIter<'_, MediaRecord>>;

    /// Directory holding downloaded media files, if any.
    fn media_dir(&self) -> Option<PathBuf> {
        None
    }
}

/// Paths of an export bundle rooted at one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBundle {
    root: PathBuf,
}

impl ExportBundle {
    /// Creates a bundle handle. Nothing is touched on disk.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Bundle directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the entity stream.
    #[must_use]
    pub fn entities_path(&self) -> PathBuf {
        self.root.join(ENTITIES_FILE)
    }

    /// Path of the media manifest.
    #[must_use]
    pub fn media_manifest_path(&self) -> PathBuf {
        self.root.join(MEDIA_FILE)
    }

    /// Path of the metadata file.
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    /// Directory for downloaded media files.
    #[must_use]
    pub fn media_dir_path(&self) -> PathBuf {
        self.root.join(MEDIA_DIR)
    }

    /// Opens a writer for the entity stream.
    pub fn entity_writer(&self) -> Result<JsonlWriter<ExportedEntity>> {
        JsonlWriter::create(self.entities_path())
    }

    /// Opens a writer for the media manifest.
    pub fn media_writer(&self) -> Result<JsonlWriter<MediaRecord>> {
        JsonlWriter::create(self.media_manifest_path())
    }

    /// Opens a reader over the entity stream.
    pub fn entity_reader(&self) -> Result<JsonlReader<ExportedEntity>> {
        JsonlReader::open(self.entities_path())
    }

    /// Opens a reader over the media manifest.
    pub fn media_reader(&self) -> Result<JsonlReader<MediaRecord>> {
        JsonlReader::open(self.media_manifest_path())
    }

    /// Writes the metadata file.
    pub fn write_metadata(&self, metadata: &ExportMetadata) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        let json = serde_json::to_string_pretty(metadata)?;
        fs::write(self.metadata_path(), json)?;
        Ok(())
    }

    /// Reads the metadata file.
    pub fn read_metadata(&self) -> Result<ExportMetadata> {
        let json = fs::read_to_string(self.metadata_path())?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl EntitySource for ExportBundle {
    fn open_entities(&self) -> Result<RecordIter<'_, ExportedEntity>> {
        Ok(Box::new(self.entity_reader()?))
    }

    fn open_media(&self) -> Result<RecordIter<'_, MediaRecord>> {
        if !self.media_manifest_path().exists() {
            return Ok(Box::new(std::iter::empty()));
        }
        Ok(Box::new(self.media_reader()?))
    }

    fn media_dir(&self) -> Option<PathBuf> {
        Some(self.media_dir_path())
    }
}

impl EntitySource for ExportData {
    fn open_entities(&self) -> Result<RecordIter<'_, ExportedEntity>> {
        Ok(Box::new(self.entities.iter().cloned().map(Ok)))
    }

    fn open_media(&self) -> Result<RecordIter<'_, MediaRecord>> {
        Ok(Box::new(self.media.iter().cloned().map(Ok)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::{ApiShape, EntityId};
    use serde_json::Map;
    use std::io::Write;
    use tempfile::TempDir;

    fn entity(id: u64) -> ExportedEntity {
        let mut body = Map::new();
        body.insert("title".to_string(), serde_json::json!(format!("post {id}")));
        ExportedEntity {
            content_type: "api::article.article".to_string(),
            id: EntityId::Numeric(id),
            body,
            relations: Vec::new(),
            media: Vec::new(),
        }
    }

    #[test]
    fn test_writer_creates_directory_and_counts() {
        let dir = TempDir::new().unwrap();
        let bundle = ExportBundle::new(dir.path().join("nested/export"));

        let mut writer = bundle.entity_writer().unwrap();
        for id in 1..=3 {
            writer.write(&entity(id)).unwrap();
        }
        assert_eq!(writer.finish().unwrap(), 3);

        let content = fs::read_to_string(bundle.entities_path()).unwrap();
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_reopen_yields_same_sequence() {
        let dir = TempDir::new().unwrap();
        let bundle = ExportBundle::new(dir.path());
        let mut writer = bundle.entity_writer().unwrap();
        for id in 1..=5 {
            writer.write(&entity(id)).unwrap();
        }
        drop(writer);

        let first: Vec<_> = bundle
            .open_entities()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        let second: Vec<_> = bundle
            .open_entities()
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(first.len(), 5);
        assert_eq!(first, second);
    }

    #[test]
    fn test_corrupt_line_ends_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(ENTITIES_FILE);
        let mut writer = JsonlWriter::create(&path).unwrap();
        writer.write(&entity(1)).unwrap();
        writer.finish().unwrap();
        let mut file = fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{{not json").unwrap();
        writeln!(file, "{}", serde_json::to_string(&entity(2)).unwrap()).unwrap();
        drop(file);

        let mut reader = JsonlReader::<ExportedEntity>::open(&path).unwrap();
        assert!(reader.next().unwrap().is_ok());
        match reader.next() {
            Some(Err(Error::StreamCorrupt { line, .. })) => assert_eq!(line, 3),
            other => panic!("expected corrupt record, got {:?}", other.map(|r| r.is_ok())),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_missing_media_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        let bundle = ExportBundle::new(dir.path());
        assert_eq!(bundle.open_media().unwrap().count(), 0);
    }

    #[test]
    fn test_metadata_roundtrip() {
        let dir = TempDir::new().unwrap();
        let bundle = ExportBundle::new(dir.path().join("out"));
        let mut meta = ExportMetadata::new(
            vec!["api::article.article".to_string()],
            "http://localhost:1337 (v4)".to_string(),
            ApiShape::V4,
        );
        meta.entity_counts.insert("api::article.article".to_string(), 2);
        bundle.write_metadata(&meta).unwrap();
        assert_eq!(bundle.read_metadata().unwrap(), meta);
    }

    #[test]
    fn test_export_data_is_a_source() {
        let data = ExportData {
            metadata: ExportMetadata::new(Vec::new(), String::new(), ApiShape::V5),
            entities: vec![entity(1), entity(2)],
            media: Vec::new(),
        };
        assert_eq!(data.open_entities().unwrap().count(), 2);
        assert_eq!(data.open_entities().unwrap().count(), 2);
        assert!(data.media_dir().is_none());
    }
}
