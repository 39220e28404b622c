//! File registry: the deduplication authority.
//!
//! A file is identified by its [`Fingerprint`]. The `UNIQUE(sha256,
//! size_bytes)` constraint on `files` is what enforces at-most-once storage;
//! the lookup before insert is only a fast path. When two writers race on
//! the same new content, the loser's insert violates the constraint and it
//! falls back to returning the winner's row.

use std::path::Path;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};
use uuid::Uuid;

use crate::detect::{self, extension_of};
use crate::error::{Error, Result};
use crate::hashing::{self, Fingerprint};
use crate::imports;
use crate::models::{FileRecord, ParseStatus};

const FILE_COLUMNS: &str = "id, import_id, path_abs, path_rel, filename, ext, size_bytes, \
     sha256, detected_type, parse_status, parse_error, created_at";

/// Outcome of [`ingest`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub file: FileRecord,
    /// False when identical content was already registered.
    pub is_new: bool,
}

/// Register the file at `path` under `import_id`.
///
/// Identical content already known to the registry, from any import or
/// path, returns the existing record untouched with `is_new == false`.
pub async fn ingest(
    pool: &SqlitePool,
    import_id: &str,
    path: &Path,
    head_bytes: usize,
) -> Result<Registration> {
    let import = imports::get_import(pool, import_id)
        .await?
        .ok_or_else(|| Error::not_found("import", import_id))?;

    let path_abs = std::fs::canonicalize(path).map_err(|e| Error::io(path, e))?;
    let fingerprint = hashing::fingerprint_file(&path_abs)?;

    if let Some(existing) = find_by_fingerprint(pool, &fingerprint).await? {
        info!(
            file_id = %existing.id,
            path = %path_abs.display(),
            "file content already registered"
        );
        return Ok(Registration {
            file: existing,
            is_new: false,
        });
    }

    let filename = path_abs
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let path_rel = import.root_path.as_deref().and_then(|root| {
        path_abs
            .strip_prefix(root)
            .ok()
            .map(|rel| rel.to_string_lossy().to_string())
    });

    let record = FileRecord {
        id: Uuid::new_v4().to_string(),
        import_id: import.id.clone(),
        path_abs: path_abs.to_string_lossy().to_string(),
        path_rel,
        ext: extension_of(&filename.to_lowercase()).to_string(),
        filename,
        size_bytes: fingerprint.size_bytes as i64,
        sha256: fingerprint.sha256.clone(),
        detected_type: detect::detect_path(&path_abs, head_bytes),
        parse_status: ParseStatus::Pending,
        parse_error: None,
        created_at: chrono::Utc::now().timestamp(),
    };

    match insert_file(pool, &record).await {
        Ok(()) => {
            info!(
                file_id = %record.id,
                detected_type = %record.detected_type,
                sha256 = %record.sha256,
                "registered new file"
            );
            Ok(Registration {
                file: record,
                is_new: true,
            })
        }
        Err(e) if e.is_unique_violation() => {
            debug!(sha256 = %fingerprint.sha256, "lost registration race, returning existing file");
            let existing = find_by_fingerprint(pool, &fingerprint)
                .await?
                .ok_or(e)?;
            Ok(Registration {
                file: existing,
                is_new: false,
            })
        }
        Err(e) => Err(e),
    }
}

async fn insert_file(pool: &SqlitePool, record: &FileRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO files (id, import_id, path_abs, path_rel, filename, ext, size_bytes,
                           sha256, detected_type, parse_status, parse_error, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.import_id)
    .bind(&record.path_abs)
    .bind(&record.path_rel)
    .bind(&record.filename)
    .bind(&record.ext)
    .bind(record.size_bytes)
    .bind(&record.sha256)
    .bind(record.detected_type.as_str())
    .bind(record.parse_status.as_str())
    .bind(&record.parse_error)
    .bind(record.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn find_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &Fingerprint,
) -> Result<Option<FileRecord>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM files WHERE sha256 = ? AND size_bytes = ?",
        FILE_COLUMNS
    ))
    .bind(&fingerprint.sha256)
    .bind(fingerprint.size_bytes as i64)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(file_from_row).transpose()
}

pub async fn get_file(pool: &SqlitePool, id: &str) -> Result<Option<FileRecord>> {
    let row = sqlx::query(&format!("SELECT {} FROM files WHERE id = ?", FILE_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(file_from_row).transpose()
}

/// Files of an import in registration order, optionally filtered by status.
pub async fn list_import_files(
    pool: &SqlitePool,
    import_id: &str,
    parse_status: Option<ParseStatus>,
) -> Result<Vec<FileRecord>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM files WHERE import_id = ? AND (? IS NULL OR parse_status = ?) \
         ORDER BY created_at, path_abs",
        FILE_COLUMNS
    ))
    .bind(import_id)
    .bind(parse_status.map(|s| s.as_str()))
    .bind(parse_status.map(|s| s.as_str()))
    .fetch_all(pool)
    .await?;

    rows.iter().map(file_from_row).collect()
}

pub async fn set_parse_status(
    pool: &SqlitePool,
    id: &str,
    status: ParseStatus,
    error: Option<&str>,
) -> Result<()> {
    let result = sqlx::query("UPDATE files SET parse_status = ?, parse_error = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(error)
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found("file", id));
    }
    Ok(())
}

fn file_from_row(row: &SqliteRow) -> Result<FileRecord> {
    let detected_type: String = row.get("detected_type");
    let parse_status: String = row.get("parse_status");
    Ok(FileRecord {
        id: row.get("id"),
        import_id: row.get("import_id"),
        path_abs: row.get("path_abs"),
        path_rel: row.get("path_rel"),
        filename: row.get("filename"),
        ext: row.get("ext"),
        size_bytes: row.get("size_bytes"),
        sha256: row.get("sha256"),
        detected_type: detected_type.parse()?,
        parse_status: parse_status.parse()?,
        parse_error: row.get("parse_error"),
        created_at: row.get("created_at"),
    })
}
