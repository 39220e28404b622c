//! Export measurements as a flat long-format table.
//!
//! One JSON object per measurement, joined with its sample and feature,
//! ordered by sample then feature. Downstream tools (Parquet writers,
//! notebooks) consume this directly.

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::config::Config;
use crate::migrate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub study_id: String,
    pub analysis_id: String,
    pub sample_uid: String,
    pub sample_label: String,
    pub feature_uid: String,
    pub feature_type: String,
    pub feature_name: String,
    pub refmet_name: Option<String>,
    pub value: Option<f64>,
    pub unit: Option<String>,
}

/// Long-format rows, optionally restricted to one study.
pub async fn fetch_rows(pool: &SqlitePool, study: Option<&str>) -> Result<Vec<ExportRow>> {
    let rows = sqlx::query(
        r#"
        SELECT s.study_id, f.analysis_id, m.sample_uid, s.sample_label,
               m.feature_uid, f.feature_type, f.name_raw, f.refmet_name,
               m.value, m.unit
        FROM measurements m
        JOIN samples s ON s.sample_uid = m.sample_uid
        JOIN features f ON f.feature_uid = m.feature_uid
        WHERE (? IS NULL OR s.study_id = ?)
        ORDER BY m.sample_uid, m.feature_uid
        "#,
    )
    .bind(study)
    .bind(study)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|row| ExportRow {
            study_id: row.get("study_id"),
            analysis_id: row.get("analysis_id"),
            sample_uid: row.get("sample_uid"),
            sample_label: row.get("sample_label"),
            feature_uid: row.get("feature_uid"),
            feature_type: row.get("feature_type"),
            feature_name: row.get("name_raw"),
            refmet_name: row.get("refmet_name"),
            value: row.get("value"),
            unit: row.get("unit"),
        })
        .collect())
}

/// Export measurements as JSON.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>, study: Option<&str>) -> Result<()> {
    let pool = migrate::open(config).await?;
    let rows = fetch_rows(&pool, study).await?;
    let json = serde_json::to_string_pretty(&rows)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &json)?;
            eprintln!("Exported {} measurements to {}", rows.len(), path.display());
        }
        None => {
            println!("{}", json);
        }
    }

    pool.close().await;
    Ok(())
}
