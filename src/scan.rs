//! Recursive directory discovery for batch ingestion.
//!
//! Walks a root directory, keeps regular files matching the include globs
//! and not the exclude globs (both matched against the root-relative path,
//! case-insensitively), and drops files over the size cap. Output is sorted
//! so batches are reproducible.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::IngestConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub path: PathBuf,
    pub relative: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TooLarge { size_bytes: u64, limit: u64 },
    Unreadable(String),
}

#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub files: Vec<ScannedFile>,
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

pub fn scan_directory(root: &Path, config: &IngestConfig) -> Result<ScanOutcome> {
    if !root.is_dir() {
        bail!("Ingest root is not a directory: {}", root.display());
    }

    let include_set = build_globset(&config.include_globs)?;

    let mut default_excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
    default_excludes.extend(config.exclude_globs.clone());
    let exclude_set = build_globset(&default_excludes)?;

    let mut outcome = ScanOutcome::default();

    let walker = WalkDir::new(root).follow_links(config.follow_symlinks);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                warn!(path = %path.display(), error = %e, "skipping unreadable entry");
                outcome.skipped.push((path, SkipReason::Unreadable(e.to_string())));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if exclude_set.is_match(&rel_str) {
            continue;
        }
        if !include_set.is_match(&rel_str) {
            continue;
        }

        let size_bytes = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                outcome
                    .skipped
                    .push((path.to_path_buf(), SkipReason::Unreadable(e.to_string())));
                continue;
            }
        };

        if let Some(limit) = config.max_file_bytes {
            if size_bytes > limit {
                debug!(path = %path.display(), size_bytes, limit, "file over size cap");
                outcome
                    .skipped
                    .push((path.to_path_buf(), SkipReason::TooLarge { size_bytes, limit }));
                continue;
            }
        }

        outcome.files.push(ScannedFile {
            path: path.to_path_buf(),
            relative: rel_str,
            size_bytes,
        });
    }

    // Sort for deterministic ordering
    outcome.files.sort_by(|a, b| a.relative.cmp(&b.relative));

    Ok(outcome)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(GlobBuilder::new(pattern).case_insensitive(true).build()?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let tmp = tempfile::TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("ST000315/raw")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("ST000315/AN000501.txt"), "#METABOLOMICS WORKBENCH\n").unwrap();
        fs::write(root.join("ST000315/table.HTML"), "<html></html>").unwrap();
        fs::write(root.join("ST000315/raw/big.txt"), vec![b'x'; 4096]).unwrap();
        fs::write(root.join("ST000315/notes.md"), "ignored").unwrap();
        fs::write(root.join(".git/config"), "ignored").unwrap();
        fs::write(root.join("a.csv"), "x,y\n").unwrap();
        tmp
    }

    #[test]
    fn filters_and_sorts() {
        let tmp = tree();
        let outcome = scan_directory(tmp.path(), &IngestConfig::default()).unwrap();
        let found: Vec<_> = outcome.files.iter().map(|f| f.relative.as_str()).collect();
        assert_eq!(
            found,
            vec![
                "ST000315/AN000501.txt",
                "ST000315/raw/big.txt",
                "ST000315/table.HTML",
                "a.csv"
            ]
        );
        assert!(outcome.skipped.is_empty());
    }

    #[test]
    fn size_cap_and_excludes() {
        let tmp = tree();
        let config = IngestConfig {
            max_file_bytes: Some(1024),
            exclude_globs: vec!["**/*.csv".to_string()],
            ..IngestConfig::default()
        };
        let outcome = scan_directory(tmp.path(), &config).unwrap();
        assert_eq!(outcome.files.len(), 2);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(
            outcome.skipped[0].1,
            SkipReason::TooLarge {
                size_bytes: 4096,
                limit: 1024
            }
        );
    }

    #[test]
    fn missing_root_is_an_error() {
        assert!(scan_directory(Path::new("/nonexistent/root"), &IngestConfig::default()).is_err());
    }
}
