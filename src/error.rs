//! Error kinds shared by the ingestion, parsing and upsert layers.
//!
//! Recoverable anomalies are never errors: they travel as [`Warning`]s
//! inside successful results. Only the kinds below abort an operation.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("mwTab parse failure: {0}")]
    Parse(#[from] ParseFailure),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(entity: &'static str, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True when the underlying database error is a uniqueness violation.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Error::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

/// Structurally fatal mwTab conditions. No partial document is returned
/// alongside these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseFailure {
    #[error("missing '#METABOLOMICS WORKBENCH' header marker")]
    MissingHeader,

    #[error("no STUDY_ID found")]
    MissingStudyId,
}

/// A non-fatal diagnostic: a line number (1-based, when known) and a reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Warning {
    pub line: Option<usize>,
    pub message: String,
}

impl Warning {
    pub fn at(line: usize, message: impl Into<String>) -> Self {
        Self {
            line: Some(line),
            message: message.into(),
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self {
            line: None,
            message: message.into(),
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Stage of the per-file pipeline, used to report where an invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Register,
    Read,
    Parse,
    Normalize,
    Upsert,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Register => "register",
            Stage::Read => "read",
            Stage::Parse => "parse",
            Stage::Normalize => "normalize",
            Stage::Upsert => "upsert",
        };
        f.write_str(name)
    }
}

/// Failure of one pipeline invocation, with the warnings gathered up to it.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: Error,
    pub warnings: Vec<Warning>,
}

impl PipelineError {
    pub fn new(stage: Stage, source: Error, warnings: Vec<Warning>) -> Self {
        Self {
            stage,
            source,
            warnings,
        }
    }
}
