use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::upsert::MAX_BATCH_SIZE;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub upsert: UpsertConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/metaloader.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Files larger than this are skipped during directory ingestion.
    #[serde(default)]
    pub max_file_bytes: Option<u64>,
    /// Read-ahead handed to the type detector.
    #[serde(default = "default_head_bytes")]
    pub head_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: None,
            head_bytes: default_head_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    [
        "txt", "htm", "html", "csv", "tsv", "xlsx", "xlsm", "zip", "pdf",
    ]
    .iter()
    .map(|ext| format!("**/*.{}", ext))
    .collect()
}

fn default_head_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpsertConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for UpsertConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    fn validate(&self) -> Result<()> {
        if self.upsert.batch_size == 0 {
            anyhow::bail!("upsert.batch_size must be > 0");
        }
        if self.upsert.batch_size > MAX_BATCH_SIZE {
            anyhow::bail!("upsert.batch_size must be <= {}", MAX_BATCH_SIZE);
        }
        if self.ingest.head_bytes == 0 {
            anyhow::bail!("ingest.head_bytes must be > 0");
        }
        if self.ingest.include_globs.is_empty() {
            anyhow::bail!("ingest.include_globs must list at least one pattern");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

/// Load the config file if it exists, otherwise fall back to defaults.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.upsert.batch_size, 1000);
        assert_eq!(config.ingest.head_bytes, 64 * 1024);
        assert!(config
            .ingest
            .include_globs
            .contains(&"**/*.txt".to_string()));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn rejects_zero_batch_size() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("metaloader.toml");
        std::fs::write(&path, "[upsert]\nbatch_size = 0\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn missing_file_falls_back() {
        let config = load_or_default(Path::new("/nonexistent/metaloader.toml")).unwrap();
        assert_eq!(config.db.path, PathBuf::from("./data/metaloader.sqlite"));
    }
}
