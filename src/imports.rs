//! Import batch records: creation, lookup and one-time finalization.

use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Import, ImportStatus};

pub async fn create_import(
    pool: &SqlitePool,
    root_path: Option<&str>,
    notes: Option<&str>,
) -> Result<Import> {
    let import = Import {
        id: Uuid::new_v4().to_string(),
        created_at: chrono::Utc::now().timestamp(),
        root_path: root_path.map(str::to_string),
        status: ImportStatus::Running,
        notes: notes.map(str::to_string),
    };

    sqlx::query(
        "INSERT INTO imports (id, created_at, root_path, status, notes) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(&import.id)
    .bind(import.created_at)
    .bind(&import.root_path)
    .bind(import.status.as_str())
    .bind(&import.notes)
    .execute(pool)
    .await?;

    info!(import_id = %import.id, root = ?import.root_path, "created import");
    Ok(import)
}

pub async fn get_import(pool: &SqlitePool, id: &str) -> Result<Option<Import>> {
    let row = sqlx::query(
        "SELECT id, created_at, root_path, status, notes FROM imports WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(|row| {
        let status: String = row.get("status");
        Ok(Import {
            id: row.get("id"),
            created_at: row.get("created_at"),
            root_path: row.get("root_path"),
            status: status.parse()?,
            notes: row.get("notes"),
        })
    })
    .transpose()
}

/// Move a running import to `success` or `failed`. Happens exactly once.
pub async fn finalize_import(
    pool: &SqlitePool,
    id: &str,
    status: ImportStatus,
    notes: Option<&str>,
) -> Result<Import> {
    if status == ImportStatus::Running {
        return Err(Error::InvalidInput(
            "an import can only be finalized as success or failed".to_string(),
        ));
    }

    let result = sqlx::query(
        "UPDATE imports SET status = ?, notes = COALESCE(?, notes) WHERE id = ? AND status = 'running'",
    )
    .bind(status.as_str())
    .bind(notes)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return match get_import(pool, id).await? {
            None => Err(Error::not_found("import", id)),
            Some(existing) => Err(Error::InvalidInput(format!(
                "import {} is already finalized ({})",
                id, existing.status
            ))),
        };
    }

    info!(import_id = %id, status = %status, "finalized import");
    get_import(pool, id)
        .await?
        .ok_or_else(|| Error::not_found("import", id))
}
