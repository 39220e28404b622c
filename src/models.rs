//! Core data models used throughout metaloader.
//!
//! Registry records ([`Import`], [`FileRecord`]) mirror their SQLite rows.
//! The entity rows at the bottom are produced only by
//! [`normalize`](crate::normalize) and consumed by [`upsert`](crate::upsert).

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// Lifecycle of an import batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Running,
    Success,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Running => "running",
            ImportStatus::Success => "success",
            ImportStatus::Failed => "failed",
        }
    }
}

impl FromStr for ImportStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ImportStatus::Running),
            "success" => Ok(ImportStatus::Success),
            "failed" => Ok(ImportStatus::Failed),
            other => Err(Error::InvalidInput(format!(
                "unknown import status '{}'; expected running, success or failed",
                other
            ))),
        }
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format tag assigned by the type detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedType {
    Mwtab,
    MetaboTableHtml,
    ResultsTxt,
    NmrBinnedXlsx,
    Unknown,
}

impl DetectedType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectedType::Mwtab => "mwtab",
            DetectedType::MetaboTableHtml => "metabo_table_html",
            DetectedType::ResultsTxt => "results_txt",
            DetectedType::NmrBinnedXlsx => "nmr_binned_xlsx",
            DetectedType::Unknown => "unknown",
        }
    }
}

impl FromStr for DetectedType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mwtab" => Ok(DetectedType::Mwtab),
            "metabo_table_html" => Ok(DetectedType::MetaboTableHtml),
            "results_txt" => Ok(DetectedType::ResultsTxt),
            "nmr_binned_xlsx" => Ok(DetectedType::NmrBinnedXlsx),
            "unknown" => Ok(DetectedType::Unknown),
            other => Err(Error::InvalidInput(format!("unknown detected type '{}'", other))),
        }
    }
}

impl fmt::Display for DetectedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseStatus {
    Pending,
    Success,
    Failed,
    Skipped,
}

impl ParseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseStatus::Pending => "pending",
            ParseStatus::Success => "success",
            ParseStatus::Failed => "failed",
            ParseStatus::Skipped => "skipped",
        }
    }
}

impl FromStr for ParseStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParseStatus::Pending),
            "success" => Ok(ParseStatus::Success),
            "failed" => Ok(ParseStatus::Failed),
            "skipped" => Ok(ParseStatus::Skipped),
            other => Err(Error::InvalidInput(format!("unknown parse status '{}'", other))),
        }
    }
}

/// An import batch as stored in SQLite.
#[derive(Debug, Clone, Serialize)]
pub struct Import {
    pub id: String,
    pub created_at: i64,
    pub root_path: Option<String>,
    pub status: ImportStatus,
    pub notes: Option<String>,
}

/// A registered physical file, unique by `(sha256, size_bytes)`.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: String,
    pub import_id: String,
    pub path_abs: String,
    pub path_rel: Option<String>,
    pub filename: String,
    pub ext: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub detected_type: DetectedType,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub created_at: i64,
}

/// Normalised study row, keyed by `study_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyRow {
    pub study_id: String,
}

/// Normalised analysis row, keyed by `(study_id, analysis_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRow {
    pub study_id: String,
    pub analysis_id: String,
    pub file_id: Option<String>,
}

/// Normalised sample row, keyed by `sample_uid`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    pub sample_uid: String,
    pub study_id: String,
    pub sample_label: String,
    pub subject: Option<String>,
    /// Unparsed factor text, preserved verbatim.
    pub factors_raw: Option<String>,
}

/// Normalised sample factor row, keyed by `(sample_uid, factor_key)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleFactorRow {
    pub sample_uid: String,
    pub factor_key: String,
    pub factor_value: String,
}

/// Normalised feature row, keyed by `feature_uid`.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub feature_uid: String,
    pub analysis_id: String,
    pub feature_type: String,
    pub name_raw: String,
    pub refmet_name: Option<String>,
}

/// Normalised measurement row, keyed by `(sample_uid, feature_uid)`.
///
/// `value == None` is a reading the source marked missing.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementRow {
    pub sample_uid: String,
    pub feature_uid: String,
    pub value: Option<f64>,
    pub unit: Option<String>,
}
