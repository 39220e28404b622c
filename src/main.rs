//! # metaloader CLI
//!
//! Registers Metabolomics Workbench files, parses mwTab exports and loads
//! the resulting entities into SQLite.
//!
//! ## Usage
//!
//! ```bash
//! metaloader --config ./config/metaloader.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `metaloader init` | Create the SQLite database and schema |
//! | `metaloader import create\|finalize\|show` | Manage import batches |
//! | `metaloader ingest-file <PATH>` | Register one file |
//! | `metaloader ingest-dir <DIR>` | Register every matching file under a directory |
//! | `metaloader parse file-id\|path\|import` | Parse mwTab files and upsert entities |
//! | `metaloader export` | Dump measurements as long-format JSON |
//! | `metaloader stats` | Row counts and file status overview |
//!
//! Logs go to stderr; summaries go to stdout.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use metaloader::config::{self, Config};
use metaloader::error::Warning;
use metaloader::models::ImportStatus;
use metaloader::pipeline::{self, ParseOutcome};
use metaloader::progress::ProgressMode;
use metaloader::upsert::{UpsertOptions, UpsertReport};
use metaloader::{export, imports, logging, migrate, stats};

/// metaloader: content-addressed ingestion and idempotent loading of
/// Metabolomics Workbench mwTab files.
#[derive(Parser)]
#[command(
    name = "metaloader",
    about = "Register, parse and load Metabolomics Workbench files into SQLite",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/metaloader.toml`. A missing file means defaults.
    #[arg(
        long,
        global = true,
        env = "METALOADER_CONFIG",
        default_value = "./config/metaloader.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Manage import batches.
    Import {
        #[command(subcommand)]
        action: ImportAction,
    },

    /// Register a single file.
    ///
    /// Identical content already in the registry is reported as a duplicate
    /// and not stored again.
    IngestFile {
        path: PathBuf,

        /// Attach the file to an existing running import. Without it a
        /// one-file import is created and finalized.
        #[arg(long)]
        import_id: Option<String>,
    },

    /// Register every matching file under a directory as one import.
    IngestDir {
        dir: PathBuf,

        /// Free-text notes stored on the import.
        #[arg(long)]
        notes: Option<String>,

        /// Stop after this many files (in sorted path order).
        #[arg(long)]
        max_files: Option<usize>,

        /// Count and classify files without writing anything.
        #[arg(long)]
        dry_run: bool,

        /// Progress on stderr: `off`, `human` or `json`. Defaults to human
        /// on a TTY.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Parse mwTab files and upsert their entities.
    Parse {
        #[command(subcommand)]
        target: ParseTarget,
    },

    /// Export measurements as long-format JSON.
    Export {
        /// Output file. Defaults to stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Only this study.
        #[arg(long)]
        study: Option<String>,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Subcommand)]
enum ImportAction {
    /// Create a running import and print its id.
    Create {
        #[arg(long)]
        root: Option<PathBuf>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Mark a running import `success` or `failed`.
    Finalize {
        id: String,
        #[arg(long, default_value = "success")]
        status: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Print an import and its files.
    Show { id: String },
}

#[derive(Subcommand)]
enum ParseTarget {
    /// Parse a registered file by id.
    FileId {
        id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse a file on disk without registering it.
    Path {
        path: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Parse every pending file of an import.
    Import {
        id: String,
        #[arg(long)]
        dry_run: bool,
        /// Stop at the first failing file.
        #[arg(long)]
        fail_fast: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let cfg = config::load_or_default(&cli.config)?;
    logging::init_logging(&cfg.logging)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { action } => run_import(&cfg, action).await?,
        Commands::IngestFile { path, import_id } => {
            let pool = migrate::open(&cfg).await?;
            let result = pipeline::ingest_file(&pool, &cfg, &path, import_id.as_deref()).await;
            pool.close().await;
            let reg = result?;
            println!("ingest-file {}", path.display());
            println!("  file id:       {}", reg.file.id);
            println!("  import id:     {}", reg.file.import_id);
            println!("  sha256:        {}", reg.file.sha256);
            println!("  size:          {}", reg.file.size_bytes);
            println!("  detected type: {}", reg.file.detected_type);
            println!("  new:           {}", reg.is_new);
            println!("ok");
        }
        Commands::IngestDir {
            dir,
            notes,
            max_files,
            dry_run,
            progress,
        } => {
            let mode = match progress.as_deref() {
                None => ProgressMode::default_for_tty(),
                Some(value) => match ProgressMode::parse(value) {
                    Some(mode) => mode,
                    None => bail!("Unknown progress mode '{}'. Use off, human or json.", value),
                },
            };
            let reporter = mode.reporter();
            let pool = migrate::open(&cfg).await?;
            let outcome = pipeline::ingest_directory(
                &pool,
                &cfg,
                &dir,
                notes.as_deref(),
                max_files,
                dry_run,
                reporter.as_ref(),
            )
            .await;
            pool.close().await;
            let outcome = outcome?;

            if dry_run {
                println!("ingest-dir {} (dry-run)", dir.display());
            } else {
                println!("ingest-dir {}", dir.display());
            }
            if let Some(id) = &outcome.import_id {
                println!("  import id:  {}", id);
            }
            println!("  found:      {}", outcome.found);
            println!("  new:        {}", outcome.new);
            println!("  duplicate:  {}", outcome.duplicate);
            println!("  skipped:    {}", outcome.skipped);
            println!("  errors:     {}", outcome.errors);
            for (kind, n) in &outcome.by_type {
                println!("    {:<20} {}", kind, n);
            }
            for (path, error) in &outcome.failures {
                eprintln!("error: {}: {}", path.display(), error);
            }
            println!("ok");
        }
        Commands::Parse { target } => run_parse(&cfg, target).await?,
        Commands::Export { output, study } => {
            export::run_export(&cfg, output.as_deref(), study.as_deref()).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}

async fn run_import(cfg: &Config, action: ImportAction) -> anyhow::Result<()> {
    let pool = migrate::open(cfg).await?;
    match action {
        ImportAction::Create { root, notes } => {
            let root = root
                .map(|r| std::fs::canonicalize(&r).with_context(|| format!("{}", r.display())))
                .transpose()?
                .map(|r| r.to_string_lossy().to_string());
            let import = imports::create_import(&pool, root.as_deref(), notes.as_deref()).await?;
            println!("{}", import.id);
        }
        ImportAction::Finalize { id, status, notes } => {
            let status: ImportStatus = status.parse()?;
            let import = imports::finalize_import(&pool, &id, status, notes.as_deref()).await?;
            println!("import {} {}", import.id, import.status);
        }
        ImportAction::Show { id } => {
            let import = imports::get_import(&pool, &id)
                .await?
                .with_context(|| format!("import not found: {}", id))?;
            let files = metaloader::registry::list_import_files(&pool, &id, None).await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "import": import,
                "files": files,
            }))?);
        }
    }
    pool.close().await;
    Ok(())
}

async fn run_parse(cfg: &Config, target: ParseTarget) -> anyhow::Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let pool = migrate::open(cfg).await?;
    let base = UpsertOptions::from_config(&cfg.upsert).with_cancel(cancel);

    match target {
        ParseTarget::FileId { id, dry_run } => {
            let result = pipeline::parse_file(&pool, &id, &base.dry_run(dry_run)).await;
            print_warnings(pipeline::warnings_of(&result));
            let outcome = result?;
            print_outcome(&format!("file {}", id), &outcome);
        }
        ParseTarget::Path { path, dry_run } => {
            let result = pipeline::parse_path(&pool, &path, &base.dry_run(dry_run)).await;
            print_warnings(pipeline::warnings_of(&result));
            let outcome = result?;
            print_outcome(&path_label(&path), &outcome);
        }
        ParseTarget::Import {
            id,
            dry_run,
            fail_fast,
        } => {
            let reporter = ProgressMode::default_for_tty().reporter();
            let result = pipeline::parse_import(
                &pool,
                &id,
                &base.dry_run(dry_run),
                fail_fast,
                reporter.as_ref(),
            )
            .await;
            let summary = match result {
                Ok(summary) => summary,
                Err(e) => {
                    print_warnings(&e.warnings);
                    return Err(e.into());
                }
            };
            print_warnings(&summary.report.warnings);
            for (file_id, e) in &summary.failures {
                eprintln!("error: file {}: {}", file_id, e);
            }
            println!("parse import {}{}", id, if dry_run { " (dry-run)" } else { "" });
            println!("  parsed:   {}", summary.parsed);
            println!("  skipped:  {}", summary.skipped);
            println!("  failed:   {}", summary.failed);
            print_report(&summary.report);
        }
    }

    pool.close().await;
    Ok(())
}

fn path_label(path: &Path) -> String {
    format!("path {}", path.display())
}

fn print_warnings(warnings: &[Warning]) {
    for w in warnings {
        eprintln!("warning: {}", w);
    }
}

fn print_outcome(label: &str, outcome: &ParseOutcome) {
    let suffix = if outcome.report.dry_run { " (dry-run)" } else { "" };
    println!("parse {}{}", label, suffix);
    println!("  study:    {}", outcome.study_id);
    println!(
        "  analysis: {}",
        outcome.analysis_id.as_deref().unwrap_or("-")
    );
    print_report(&outcome.report);
}

fn print_report(report: &UpsertReport) {
    println!(
        "  {:<16} {:>10} {:>8} {:>8}",
        "KIND", "PROCESSED", "CREATED", "UPDATED"
    );
    for (kind, counts) in report.kinds() {
        println!(
            "  {:<16} {:>10} {:>8} {:>8}",
            kind, counts.processed, counts.created, counts.updated
        );
    }
    println!("  warnings: {}", report.warnings.len());
    println!("ok");
}
