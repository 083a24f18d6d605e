//! CMS Migration CLI
//!
//! Exports content from one headless CMS instance into a bundle and imports
//! a bundle into another.

// CLI tool - relax pedantic lints for ergonomics
#![allow(clippy::pedantic)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use cms_migrate::exporter::StageProgressCallback;
use cms_migrate::validate::validate_relations;
use cms_migrate::{
    ExportBundle, Exporter, ImportResult, Importer, MigrationConfig, RestClient, RunOutcome,
};

#[derive(Parser)]
#[command(name = "cms-migrate")]
#[command(version)]
#[command(about = "Move content between headless CMS instances", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Export content types from the source instance into a bundle
    Export {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Bundle directory override
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
    },

    /// Import a bundle into the target instance
    Import {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Bundle directory override
        #[arg(short, long, value_name = "DIR")]
        input: Option<PathBuf>,

        /// Resolve conflicts and count outcomes without writing
        #[arg(long)]
        dry_run: bool,

        /// Batch size override
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Validate configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },

    /// Check a bundle for relations pointing outside of it
    Check {
        /// Bundle directory
        #[arg(value_name = "DIR")]
        bundle: PathBuf,
    },

    /// Generate example configuration
    Init {
        /// Output file path
        #[arg(short, long, default_value = "migration.yaml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Export { config, output } => run_export(&config, output).await,
        Commands::Import {
            config,
            input,
            dry_run,
            batch_size,
        } => run_import(&config, input, dry_run, batch_size).await,
        Commands::Validate { config } => {
            validate_config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check { bundle } => check_bundle(&bundle),
        Commands::Init { output } => {
            generate_config(&output)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_config(config_path: &Path) -> anyhow::Result<MigrationConfig> {
    info!("Loading configuration from {:?}", config_path);
    let config = MigrationConfig::from_file(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    config.validate()?;
    Ok(config)
}

/// Cancels the token on Ctrl-C so runs stop between records.
fn cancel_on_interrupt() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight writes");
            child.cancel();
        }
    });
    token
}

async fn run_export(config_path: &Path, output: Option<PathBuf>) -> anyhow::Result<ExitCode> {
    let config = load_config(config_path)?;
    let source = config
        .source
        .clone()
        .context("export requires a `source` section")?;
    if config.export.content_types.is_empty() {
        anyhow::bail!("export.content_types is empty");
    }

    let client = Arc::new(RestClient::new(source)?);
    let media = config
        .export
        .include_media
        .then(|| client.clone() as Arc<dyn cms_migrate::MediaClient>);
    let exporter = Exporter::new(client.clone(), client, media);

    let bundle = ExportBundle::new(output.unwrap_or_else(|| config.export.output.clone()));
    let progress = create_progress_bar();
    let mut options = config.export.to_options();
    options.progress_callback = Some(progress_callback(&progress));
    options.cancellation = Some(cancel_on_interrupt());

    info!("Exporting into {:?}", bundle.root());
    let metadata = exporter
        .export_streaming(&config.export.content_types, &bundle, &options)
        .await?;
    progress.finish_and_clear();

    println!("\n✅ Export finished");
    for (content_type, count) in &metadata.entity_counts {
        println!("   {content_type}: {count}");
    }
    println!("   Media:      {}", metadata.media_count);
    println!("   Failures:   {}", metadata.failures.len() + metadata.media_failures.len());
    if !metadata.heuristic_content_types.is_empty() {
        println!(
            "   Heuristic relations: {}",
            metadata.heuristic_content_types.join(", ")
        );
    }
    if !metadata.relation_violations.is_empty() {
        println!(
            "   ⚠ {} relation(s) point outside the export",
            metadata.relation_violations.len()
        );
    }

    Ok(if metadata.cancelled {
        ExitCode::from(130)
    } else if metadata.is_complete_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(2)
    })
}

async fn run_import(
    config_path: &Path,
    input: Option<PathBuf>,
    dry_run: bool,
    batch_size: Option<usize>,
) -> anyhow::Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if dry_run {
        config.import.dry_run = true;
    }
    if let Some(bs) = batch_size {
        anyhow::ensure!(bs > 0, "--batch-size must be greater than 0");
        config.import.batch_size = bs;
    }
    let target = config
        .target
        .clone()
        .context("import requires a `target` section")?;

    let client = Arc::new(RestClient::new(target)?);
    let media = config
        .import
        .import_media
        .then(|| client.clone() as Arc<dyn cms_migrate::MediaClient>);
    let importer = Importer::new(client, media);

    let bundle = ExportBundle::new(input.unwrap_or_else(|| config.import.input.clone()));
    let progress = create_progress_bar();
    let mut options = config.import.to_options();
    options.progress_callback = Some(progress_callback(&progress));
    options.cancellation = Some(cancel_on_interrupt());

    info!("Importing from {:?}", bundle.root());
    let result = importer.import(&bundle, &options).await?;
    progress.finish_and_clear();

    print_import_summary(&result);

    Ok(match result.outcome() {
        RunOutcome::Succeeded => ExitCode::SUCCESS,
        RunOutcome::SucceededWithFailures(_) => ExitCode::from(2),
        RunOutcome::Cancelled => ExitCode::from(130),
        RunOutcome::Aborted(reason) => {
            eprintln!("❌ Import aborted: {reason}");
            ExitCode::FAILURE
        }
    })
}

fn print_import_summary(result: &ImportResult) {
    let title = if result.dry_run {
        "Dry run finished"
    } else {
        "Import finished"
    };
    println!("\n✅ {title}");
    println!("   Records:   {}", result.total_records);
    println!("   Created:   {}", result.created);
    println!("   Updated:   {}", result.updated);
    println!("   Skipped:   {}", result.skipped);
    println!("   Failed:    {}", result.failed);
    println!("   Relations: {} updated, {} failed", result.relations_updated, result.relation_failures.len());
    if result.media.uploaded + result.media.deduplicated > 0 {
        println!(
            "   Media:     {} uploaded, {} reused",
            result.media.uploaded, result.media.deduplicated
        );
    }
    if !result.unresolved_relations.is_empty() {
        println!(
            "   ⚠ {} relation reference(s) could not be resolved",
            result.unresolved_relations.len()
        );
    }
    for failure in result.failures.iter().take(10) {
        println!("   - {} {:?}: {}", failure.content_type, failure.source_id, failure.reason);
    }
}

fn validate_config(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    println!("✅ Configuration is valid!");
    if let Some(source) = &config.source {
        println!("   Source: {}", source.url);
    }
    if let Some(target) = &config.target {
        println!("   Target: {}", target.url);
    }
    println!("   Content types: {}", config.export.content_types.len());

    Ok(())
}

fn check_bundle(path: &Path) -> anyhow::Result<ExitCode> {
    let bundle = ExportBundle::new(path);
    let violations = validate_relations(&bundle, |_| true)?;
    if violations.is_empty() {
        println!("✅ All relations resolve inside the bundle");
        return Ok(ExitCode::SUCCESS);
    }
    println!("⚠ {} dangling relation(s):", violations.len());
    for violation in &violations {
        println!(
            "   {} {} .{} -> {}",
            violation.content_type, violation.source_id, violation.path, violation.missing
        );
    }
    Ok(ExitCode::from(2))
}

fn generate_config(output: &Path) -> anyhow::Result<()> {
    std::fs::write(output, CONFIG_TEMPLATE)?;
    println!("✅ Generated configuration: {:?}", output);
    println!(
        "   Edit the file and run: cms-migrate export --config {:?}",
        output
    );
    Ok(())
}

fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

fn progress_callback(pb: &ProgressBar) -> StageProgressCallback {
    let pb = pb.clone();
    Arc::new(move |current, total, message| {
        pb.set_length(total as u64);
        pb.set_position(current as u64);
        pb.set_message(message.to_string());
    })
}

const CONFIG_TEMPLATE: &str = r#"# cms-migrate configuration

source:
  url: http://localhost:1337
  api_token: your-source-token
  # shape: v4          # detected from the first response when unset
  # endpoints:
  #   api::category.category: categories

target:
  url: http://localhost:1338
  api_token: your-target-token

export:
  output: ./export
  content_types:
    - api::article.article
    - api::author.author
  include_media: true
  use_schema_relations: true
  page_size: 100
  validate_relations: true

import:
  input: ./export
  conflict_resolution: skip   # skip | update | fail
  conflict_lookups: [natural_key]
  natural_keys:
    api::article.article: slug
  import_media: true
  batch_size: 10
  max_concurrency: 5
"#;
