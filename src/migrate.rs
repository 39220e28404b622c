use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = open(config).await?;
    pool.close().await;
    Ok(())
}

/// Connect and make sure the schema exists. Every command goes through here.
pub async fn open(config: &Config) -> Result<SqlitePool> {
    let pool = db::connect(config)
        .await
        .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
    apply(&pool).await?;
    Ok(pool)
}

/// Create every table and index. Safe to run repeatedly.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // Create imports table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS imports (
            id TEXT PRIMARY KEY,
            created_at INTEGER NOT NULL,
            root_path TEXT,
            status TEXT NOT NULL DEFAULT 'running'
                CHECK (status IN ('running', 'success', 'failed')),
            notes TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create files table; (sha256, size_bytes) is the global dedup key
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id TEXT PRIMARY KEY,
            import_id TEXT NOT NULL,
            path_abs TEXT NOT NULL,
            path_rel TEXT,
            filename TEXT NOT NULL,
            ext TEXT NOT NULL,
            size_bytes INTEGER NOT NULL,
            sha256 TEXT NOT NULL,
            detected_type TEXT NOT NULL,
            parse_status TEXT NOT NULL DEFAULT 'pending'
                CHECK (parse_status IN ('pending', 'success', 'failed', 'skipped')),
            parse_error TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(sha256, size_bytes),
            FOREIGN KEY (import_id) REFERENCES imports(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS studies (
            id TEXT PRIMARY KEY,
            study_id TEXT NOT NULL UNIQUE,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analyses (
            id TEXT PRIMARY KEY,
            study_id TEXT NOT NULL,
            analysis_id TEXT NOT NULL,
            file_id TEXT,
            created_at INTEGER NOT NULL,
            UNIQUE(study_id, analysis_id),
            FOREIGN KEY (study_id) REFERENCES studies(study_id),
            FOREIGN KEY (file_id) REFERENCES files(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS samples (
            id TEXT PRIMARY KEY,
            sample_uid TEXT NOT NULL UNIQUE,
            study_id TEXT NOT NULL,
            sample_label TEXT NOT NULL,
            subject TEXT,
            factors_raw TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (study_id) REFERENCES studies(study_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sample_factors (
            id TEXT PRIMARY KEY,
            sample_uid TEXT NOT NULL,
            factor_key TEXT NOT NULL,
            factor_value TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(sample_uid, factor_key),
            FOREIGN KEY (sample_uid) REFERENCES samples(sample_uid) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS features (
            id TEXT PRIMARY KEY,
            feature_uid TEXT NOT NULL UNIQUE,
            analysis_id TEXT NOT NULL,
            feature_type TEXT NOT NULL,
            name_raw TEXT NOT NULL,
            refmet_name TEXT,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS measurements (
            id TEXT PRIMARY KEY,
            sample_uid TEXT NOT NULL,
            feature_uid TEXT NOT NULL,
            value REAL,
            unit TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(sample_uid, feature_uid),
            FOREIGN KEY (sample_uid) REFERENCES samples(sample_uid),
            FOREIGN KEY (feature_uid) REFERENCES features(feature_uid)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_import_id ON files(import_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_files_sha256 ON files(sha256)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_samples_study_id ON samples(study_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_measurements_feature_uid ON measurements(feature_uid)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
