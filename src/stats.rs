//! Database statistics overview.
//!
//! Row counts per table plus the file registry broken down by detected type
//! and parse status. Used by `metaloader stats` to check that ingestion and
//! parsing did what was expected.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::migrate;

const TABLES: &[&str] = &[
    "imports",
    "files",
    "studies",
    "analyses",
    "samples",
    "sample_factors",
    "features",
    "measurements",
];

#[derive(Debug, Clone, Default)]
pub struct DbStats {
    /// `(table, rows)` in schema order.
    pub tables: Vec<(&'static str, i64)>,
    /// `(detected_type, parse_status, files)`.
    pub files: Vec<(String, String, i64)>,
    pub missing_values: i64,
}

impl DbStats {
    pub fn count(&self, table: &str) -> Option<i64> {
        self.tables.iter().find(|(t, _)| *t == table).map(|(_, n)| *n)
    }
}

pub async fn collect(pool: &SqlitePool) -> Result<DbStats> {
    let mut tables = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        // Table names come from the constant list above.
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(pool)
            .await?;
        tables.push((*table, count));
    }

    let file_rows = sqlx::query(
        r#"
        SELECT detected_type, parse_status, COUNT(*) AS n
        FROM files
        GROUP BY detected_type, parse_status
        ORDER BY detected_type, parse_status
        "#,
    )
    .fetch_all(pool)
    .await?;

    let files = file_rows
        .iter()
        .map(|row| (row.get("detected_type"), row.get("parse_status"), row.get("n")))
        .collect();

    let missing_values: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM measurements WHERE value IS NULL")
            .fetch_one(pool)
            .await?;

    Ok(DbStats {
        tables,
        files,
        missing_values,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = migrate::open(config).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("metaloader: database stats");
    println!("==========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    for (table, count) in &stats.tables {
        println!("  {:<16} {:>10}", table, count);
    }
    println!("  {:<16} {:>10}", "(null values)", stats.missing_values);

    if !stats.files.is_empty() {
        println!();
        println!("  Files by type:");
        println!("  {:<20} {:<10} {:>8}", "TYPE", "STATUS", "FILES");
        println!("  {}", "-".repeat(40));
        for (kind, status, n) in &stats.files {
            println!("  {:<20} {:<10} {:>8}", kind, status, n);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
