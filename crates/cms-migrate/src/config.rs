//! Configuration types for cms-migrate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::bulk::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_CONCURRENCY};
use crate::client::common::validate_url;
use crate::client::rest::RestConfig;
use crate::error::{Error, Result};
use crate::exporter::{ExportOptions, DEFAULT_PAGE_SIZE};
use crate::importer::{ConflictLookup, ConflictResolution, ImportOptions};

/// Main migration configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Instance content is exported from.
    #[serde(default)]
    pub source: Option<RestConfig>,
    /// Instance content is imported into.
    #[serde(default)]
    pub target: Option<RestConfig>,
    /// Export settings.
    #[serde(default)]
    pub export: ExportSection,
    /// Import settings.
    #[serde(default)]
    pub import: ImportSection,
}

/// Export settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportSection {
    /// Content type uids to export.
    #[serde(default)]
    pub content_types: Vec<String>,
    /// Bundle directory.
    #[serde(default = "default_bundle_dir")]
    pub output: PathBuf,
    /// Download referenced media.
    #[serde(default)]
    pub include_media: bool,
    /// Use schemas for relation extraction.
    #[serde(default = "default_true")]
    pub use_schema_relations: bool,
    /// Listing page size.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Check references against the exported set.
    #[serde(default)]
    pub validate_relations: bool,
}

impl Default for ExportSection {
    fn default() -> Self {
        Self {
            content_types: Vec::new(),
            output: default_bundle_dir(),
            include_media: false,
            use_schema_relations: true,
            page_size: default_page_size(),
            validate_relations: false,
        }
    }
}

impl ExportSection {
    /// Engine options for this section.
    #[must_use]
    pub fn to_options(&self) -> ExportOptions {
        ExportOptions {
            include_media: self.include_media,
            use_schema_relations: self.use_schema_relations,
            page_size: self.page_size,
            validate_relations: self.validate_relations,
            ..ExportOptions::default()
        }
    }
}

/// Import settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSection {
    /// Bundle directory.
    #[serde(default = "default_bundle_dir")]
    pub input: PathBuf,
    /// Conflict policy.
    #[serde(default)]
    pub conflict_resolution: ConflictResolution,
    /// Conflict lookups, first hit wins.
    #[serde(default = "default_lookups")]
    pub conflict_lookups: Vec<ConflictLookup>,
    /// Natural key field per content type.
    #[serde(default)]
    pub natural_keys: BTreeMap<String, String>,
    /// Only import these content types.
    #[serde(default)]
    pub content_types: Option<Vec<String>>,
    /// Validate references before writing.
    #[serde(default)]
    pub validate_relations: bool,
    /// Treat violations as fatal in dry runs.
    #[serde(default)]
    pub strict: bool,
    /// Don't write to the target.
    #[serde(default)]
    pub dry_run: bool,
    /// Upload the media manifest.
    #[serde(default)]
    pub import_media: bool,
    /// Disable content-hash dedup.
    #[serde(default)]
    pub overwrite_media: bool,
    /// Skip relation resolution.
    #[serde(default)]
    pub skip_relations: bool,
    /// Records per wave.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Writes in flight per wave.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for ImportSection {
    fn default() -> Self {
        Self {
            input: default_bundle_dir(),
            conflict_resolution: ConflictResolution::default(),
            conflict_lookups: default_lookups(),
            natural_keys: BTreeMap::new(),
            content_types: None,
            validate_relations: false,
            strict: false,
            dry_run: false,
            import_media: false,
            overwrite_media: false,
            skip_relations: false,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl ImportSection {
    /// Engine options for this section.
    #[must_use]
    pub fn to_options(&self) -> ImportOptions {
        ImportOptions {
            conflict_resolution: self.conflict_resolution,
            conflict_lookups: self.conflict_lookups.clone(),
            natural_keys: self.natural_keys.clone(),
            content_types: self.content_types.clone(),
            validate_relations: self.validate_relations,
            strict: self.strict,
            dry_run: self.dry_run,
            import_media: self.import_media,
            overwrite_media: self.overwrite_media,
            skip_relations: self.skip_relations,
            batch_size: self.batch_size,
            max_concurrency: self.max_concurrency,
            ..ImportOptions::default()
        }
    }
}

fn default_bundle_dir() -> PathBuf {
    PathBuf::from("./export")
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}

fn default_lookups() -> Vec<ConflictLookup> {
    vec![ConflictLookup::NaturalKey]
}

fn validate_connection(name: &str, connection: &RestConfig) -> Result<()> {
    validate_url(&connection.url)?;
    if connection.timeout_secs == 0 {
        return Err(Error::Config(format!(
            "{name}.timeout_secs must be greater than 0"
        )));
    }
    Ok(())
}

impl MigrationConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.source.is_none() && self.target.is_none() {
            return Err(Error::Config(
                "at least one of source or target must be configured".to_string(),
            ));
        }
        if let Some(source) = &self.source {
            validate_connection("source", source)?;
        }
        if let Some(target) = &self.target {
            validate_connection("target", target)?;
        }
        if self.export.page_size == 0 {
            return Err(Error::Config(
                "export.page_size must be greater than 0".to_string(),
            ));
        }
        if self.import.batch_size == 0 || self.import.max_concurrency == 0 {
            return Err(Error::Config(
                "import.batch_size and import.max_concurrency must be greater than 0".to_string(),
            ));
        }
        for (content_type, field) in &self.import.natural_keys {
            if field.is_empty() {
                return Err(Error::Config(format!(
                    "import.natural_keys.{content_type} cannot be empty"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let import = ImportSection::default();
        assert_eq!(import.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(import.conflict_resolution, ConflictResolution::Skip);
        assert_eq!(import.conflict_lookups, vec![ConflictLookup::NaturalKey]);
        assert!(ExportSection::default().use_schema_relations);
    }

    #[test]
    fn test_config_requires_a_connection() {
        assert!(MigrationConfig::default().validate().is_err());
    }

    #[test]
    fn test_config_rejects_bad_url() {
        let config = MigrationConfig {
            source: Some(RestConfig::new("localhost:1337")),
            ..MigrationConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_yaml_parse() {
        let yaml = r#"
source:
  url: http://localhost:1337
  api_token: abc
  shape: v4
target:
  url: http://localhost:1338
  endpoints:
    api::category.category: categories
export:
  content_types: [api::article.article, api::author.author]
  include_media: true
import:
  conflict_resolution: update
  conflict_lookups: [document_id, natural_key]
  natural_keys:
    api::article.article: slug
  batch_size: 25
"#;
        let config: MigrationConfig = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        let source = config.source.as_ref().unwrap();
        assert_eq!(source.shape, Some(crate::model::ApiShape::V4));
        assert_eq!(config.export.content_types.len(), 2);
        assert_eq!(config.export.page_size, DEFAULT_PAGE_SIZE);

        let options = config.import.to_options();
        assert_eq!(options.conflict_resolution, ConflictResolution::Update);
        assert_eq!(options.conflict_lookups[0], ConflictLookup::DocumentId);
        assert_eq!(options.batch_size, 25);
        assert_eq!(options.natural_keys["api::article.article"], "slug");
    }
}
