//! Per-file orchestration: register → read → parse → normalize → upsert.
//!
//! Each entry point runs one file (or one batch of files) through the
//! stages in order. A failure is reported as a [`PipelineError`] naming the
//! stage and carrying the warnings gathered before it. Warnings alone never
//! fail a run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Context;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::config::Config;
use crate::detect;
use crate::error::{Error, PipelineError, Stage, Warning};
use crate::hashing;
use crate::imports;
use crate::models::{DetectedType, FileRecord, ImportStatus, ParseStatus};
use crate::mwtab;
use crate::normalize;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::registry::{self, Registration};
use crate::scan;
use crate::upsert::{self, UpsertOptions, UpsertReport};

type StageResult<T> = std::result::Result<T, PipelineError>;

fn fail(stage: Stage, source: Error) -> PipelineError {
    PipelineError::new(stage, source, Vec::new())
}

/// Register one file.
///
/// Without `import_id`, a single-file import rooted at the file's directory
/// is created and finalized around the registration.
pub async fn ingest_file(
    pool: &SqlitePool,
    config: &Config,
    path: &Path,
    import_id: Option<&str>,
) -> StageResult<Registration> {
    let head_bytes = config.ingest.head_bytes;
    if let Some(import_id) = import_id {
        return registry::ingest(pool, import_id, path, head_bytes)
            .await
            .map_err(|e| fail(Stage::Register, e));
    }

    let root = std::fs::canonicalize(path)
        .map_err(|e| fail(Stage::Register, Error::io(path, e)))?
        .parent()
        .map(|p| p.to_string_lossy().to_string());
    let import = imports::create_import(pool, root.as_deref(), Some("single file"))
        .await
        .map_err(|e| fail(Stage::Register, e))?;

    let result = registry::ingest(pool, &import.id, path, head_bytes).await;
    let (status, notes) = match &result {
        Ok(reg) if reg.is_new => (ImportStatus::Success, "1 new, 0 duplicate, 0 errors"),
        Ok(_) => (ImportStatus::Success, "0 new, 1 duplicate, 0 errors"),
        Err(_) => (ImportStatus::Failed, "0 new, 0 duplicate, 1 errors"),
    };
    imports::finalize_import(pool, &import.id, status, Some(notes))
        .await
        .map_err(|e| fail(Stage::Register, e))?;

    result.map_err(|e| fail(Stage::Register, e))
}

/// Counts from [`ingest_directory`].
#[derive(Debug, Clone, Default)]
pub struct DirectoryIngest {
    /// None for dry runs.
    pub import_id: Option<String>,
    pub found: usize,
    pub new: usize,
    pub duplicate: usize,
    pub skipped: usize,
    pub errors: usize,
    /// Detected type of every newly registered file.
    pub by_type: BTreeMap<DetectedType, usize>,
    pub failures: Vec<(PathBuf, String)>,
    pub dry_run: bool,
}

impl DirectoryIngest {
    pub fn summary(&self) -> String {
        format!(
            "{} new, {} duplicate, {} errors",
            self.new, self.duplicate, self.errors
        )
    }
}

/// Register every matching file under `dir` as one import.
///
/// The import ends `failed` only when every attempted file errored. A dry
/// run creates nothing: it fingerprints and classifies files and looks up
/// which are already registered.
pub async fn ingest_directory(
    pool: &SqlitePool,
    config: &Config,
    dir: &Path,
    notes: Option<&str>,
    max_files: Option<usize>,
    dry_run: bool,
    progress: &dyn ProgressReporter,
) -> anyhow::Result<DirectoryIngest> {
    let root = std::fs::canonicalize(dir)
        .with_context(|| format!("Failed to resolve directory: {}", dir.display()))?;

    progress.report(ProgressEvent::Discovering {
        root: root.display().to_string(),
    });
    let scanned = scan::scan_directory(&root, &config.ingest)?;
    let mut files = scanned.files;
    if let Some(limit) = max_files {
        files.truncate(limit);
    }

    let mut outcome = DirectoryIngest {
        found: files.len(),
        skipped: scanned.skipped.len(),
        dry_run,
        ..DirectoryIngest::default()
    };
    let total = files.len() as u64;

    if dry_run {
        let mut seen = HashSet::new();
        for (i, file) in files.iter().enumerate() {
            match hashing::fingerprint_file(&file.path) {
                Ok(fp) => {
                    let known = registry::find_by_fingerprint(pool, &fp).await?.is_some();
                    if known || !seen.insert(fp) {
                        outcome.duplicate += 1;
                    } else {
                        outcome.new += 1;
                        let kind = detect::detect_path(&file.path, config.ingest.head_bytes);
                        *outcome.by_type.entry(kind).or_insert(0) += 1;
                    }
                }
                Err(e) => {
                    outcome.errors += 1;
                    outcome.failures.push((file.path.clone(), e.to_string()));
                }
            }
            progress.report(ProgressEvent::Ingesting {
                n: i as u64 + 1,
                total,
            });
        }
        info!(root = %root.display(), summary = %outcome.summary(), "dry-run directory ingest");
        return Ok(outcome);
    }

    let root_str = root.to_string_lossy().to_string();
    let import = imports::create_import(pool, Some(&root_str), notes).await?;
    outcome.import_id = Some(import.id.clone());

    for (i, file) in files.iter().enumerate() {
        match registry::ingest(pool, &import.id, &file.path, config.ingest.head_bytes).await {
            Ok(reg) if reg.is_new => {
                outcome.new += 1;
                *outcome.by_type.entry(reg.file.detected_type).or_insert(0) += 1;
            }
            Ok(_) => outcome.duplicate += 1,
            Err(e) => {
                warn!(path = %file.path.display(), error = %e, "failed to register file");
                outcome.errors += 1;
                outcome.failures.push((file.path.clone(), e.to_string()));
            }
        }
        progress.report(ProgressEvent::Ingesting {
            n: i as u64 + 1,
            total,
        });
    }

    let attempted = outcome.new + outcome.duplicate + outcome.errors;
    let status = if attempted > 0 && outcome.errors == attempted {
        ImportStatus::Failed
    } else {
        ImportStatus::Success
    };
    let final_notes = match notes {
        Some(n) => format!("{}; {}", n, outcome.summary()),
        None => outcome.summary(),
    };
    imports::finalize_import(pool, &import.id, status, Some(&final_notes)).await?;

    info!(
        import_id = %import.id,
        status = %status,
        summary = %outcome.summary(),
        "directory ingest finished"
    );
    Ok(outcome)
}

/// Result of running one mwTab document through parse, normalize, upsert.
#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub file_id: Option<String>,
    pub study_id: String,
    pub analysis_id: Option<String>,
    pub report: UpsertReport,
}

/// Parse a registered file and upsert its entities.
///
/// Records `success` or `failed` on the file unless this is a dry run. A
/// cancelled run leaves the file `pending`.
pub async fn parse_file(
    pool: &SqlitePool,
    file_id: &str,
    options: &UpsertOptions,
) -> StageResult<ParseOutcome> {
    let file = registry::get_file(pool, file_id)
        .await
        .map_err(|e| fail(Stage::Read, e))?
        .ok_or_else(|| fail(Stage::Read, Error::not_found("file", file_id)))?;

    if file.detected_type != DetectedType::Mwtab {
        return Err(fail(
            Stage::Read,
            Error::InvalidInput(format!(
                "file {} is {}, only mwtab files can be parsed",
                file.id, file.detected_type
            )),
        ));
    }

    let result = parse_registered(pool, &file, options).await;

    if !options.dry_run {
        let status = match &result {
            Ok(_) => Some((ParseStatus::Success, None)),
            Err(e) if matches!(e.source, Error::Cancelled) => None,
            Err(e) => Some((ParseStatus::Failed, Some(e.to_string()))),
        };
        if let Some((status, error)) = status {
            registry::set_parse_status(pool, &file.id, status, error.as_deref())
                .await
                .map_err(|e| fail(Stage::Upsert, e))?;
        }
    }
    result
}

async fn parse_registered(
    pool: &SqlitePool,
    file: &FileRecord,
    options: &UpsertOptions,
) -> StageResult<ParseOutcome> {
    let text = read_text(Path::new(&file.path_abs))?;
    run_document(pool, &text, Some(&file.id), options).await
}

/// Parse a file that is not in the registry. Its Analysis has no file
/// reference.
pub async fn parse_path(
    pool: &SqlitePool,
    path: &Path,
    options: &UpsertOptions,
) -> StageResult<ParseOutcome> {
    let text = read_text(path)?;
    run_document(pool, &text, None, options).await
}

fn read_text(path: &Path) -> StageResult<String> {
    let bytes = std::fs::read(path).map_err(|e| fail(Stage::Read, Error::io(path, e)))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

async fn run_document(
    pool: &SqlitePool,
    text: &str,
    file_id: Option<&str>,
    options: &UpsertOptions,
) -> StageResult<ParseOutcome> {
    let parsed = mwtab::parse(text).map_err(|e| fail(Stage::Parse, e.into()))?;
    let mut warnings = parsed.warnings;
    let doc = parsed.document;

    let normalized = match normalize::normalize(&doc, file_id) {
        Ok(n) => n,
        Err(e) => return Err(PipelineError::new(Stage::Normalize, e, warnings)),
    };
    warnings.extend(normalized.warnings);

    for w in &warnings {
        warn!(study_id = %doc.study_id, "{}", w);
    }

    let report = match upsert::upsert(pool, &normalized.batch, warnings.clone(), options).await {
        Ok(report) => report,
        Err(e) => return Err(PipelineError::new(Stage::Upsert, e, warnings)),
    };

    Ok(ParseOutcome {
        file_id: file_id.map(str::to_string),
        study_id: doc.study_id,
        analysis_id: doc.analysis_id,
        report,
    })
}

/// Totals from [`parse_import`].
#[derive(Debug, Default)]
pub struct ImportParse {
    pub parsed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub report: UpsertReport,
    pub failures: Vec<(String, PipelineError)>,
}

/// Parse every pending file of an import in registration order.
///
/// Pending files that are not mwTab are marked `skipped`. With `fail_fast`
/// the first failing file ends the run; otherwise failures are collected.
/// Cancellation always ends the run.
pub async fn parse_import(
    pool: &SqlitePool,
    import_id: &str,
    options: &UpsertOptions,
    fail_fast: bool,
    progress: &dyn ProgressReporter,
) -> StageResult<ImportParse> {
    imports::get_import(pool, import_id)
        .await
        .map_err(|e| fail(Stage::Read, e))?
        .ok_or_else(|| fail(Stage::Read, Error::not_found("import", import_id)))?;

    let files = registry::list_import_files(pool, import_id, Some(ParseStatus::Pending))
        .await
        .map_err(|e| fail(Stage::Read, e))?;

    let mut summary = ImportParse {
        report: UpsertReport {
            dry_run: options.dry_run,
            ..UpsertReport::default()
        },
        ..ImportParse::default()
    };
    let total = files.len() as u64;

    for (i, file) in files.iter().enumerate() {
        if file.detected_type != DetectedType::Mwtab {
            if !options.dry_run {
                registry::set_parse_status(pool, &file.id, ParseStatus::Skipped, None)
                    .await
                    .map_err(|e| fail(Stage::Read, e))?;
            }
            summary.skipped += 1;
        } else {
            match parse_file(pool, &file.id, options).await {
                Ok(outcome) => {
                    summary.parsed += 1;
                    summary.report.absorb(outcome.report);
                }
                Err(e) if fail_fast || matches!(e.source, Error::Cancelled) => return Err(e),
                Err(e) => {
                    warn!(file_id = %file.id, stage = %e.stage, error = %e.source, "parse failed");
                    summary.failed += 1;
                    summary.failures.push((file.id.clone(), e));
                }
            }
        }
        progress.report(ProgressEvent::Parsing {
            n: i as u64 + 1,
            total,
        });
    }

    info!(
        import_id = %import_id,
        parsed = summary.parsed,
        skipped = summary.skipped,
        failed = summary.failed,
        "import parse finished"
    );
    Ok(summary)
}

/// Warnings of a pipeline result, successful or not.
pub fn warnings_of(result: &StageResult<ParseOutcome>) -> &[Warning] {
    match result {
        Ok(outcome) => &outcome.report.warnings,
        Err(e) => &e.warnings,
    }
}
