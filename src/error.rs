//! Error types for duckport
//!
//! This module defines the error hierarchy for an export run:
//! - Configuration document errors
//! - Query execution errors raised by the embedded engine
//! - Type bridge errors (no logical mapping, failed coercion)
//! - Backend selection and schema errors
//! - Output file errors
//! - Timeouts and cancellation
//!
//! Every variant of [`ExportError`] maps to a distinct process exit code so
//! scripts can tell failures apart without parsing messages.

use crate::config::OutputFormat;
use crate::export::Stage;
use crate::types::{IntWidth, LogicalType};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for an export operation
#[derive(Error, Debug)]
pub enum ExportError {
    /// Bad configuration document or option
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine rejected the query
    #[error("Query execution error: {0}")]
    Query(#[from] QueryExecutionError),

    /// A column has no logical mapping or could not be coerced
    #[error("Unsupported type: {0}")]
    UnsupportedType(#[from] UnsupportedTypeError),

    /// No backend qualifies for the result
    #[error("No backend available: {0}")]
    NoBackendAvailable(#[from] NoBackendAvailableError),

    /// The selected backend rejected the coerced schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaMismatchError),

    /// Filesystem failure while producing the output
    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    /// The operation exceeded its time bound
    #[error("Timeout: {0}")]
    Timeout(#[from] TimeoutError),

    /// The operation was abandoned on request
    #[error("Export cancelled during {stage}")]
    Cancelled { stage: Stage },

    /// A finished job was stepped again
    #[error("Export job is already {state}")]
    Finished { state: &'static str },
}

impl ExportError {
    /// Process exit code for this error kind
    pub fn exit_code(&self) -> u8 {
        match self {
            ExportError::Config(_) => 2,
            ExportError::Query(_) => 3,
            ExportError::UnsupportedType(_) => 4,
            ExportError::NoBackendAvailable(_) => 5,
            ExportError::SchemaMismatch(_) => 6,
            ExportError::Write(_) => 7,
            ExportError::Timeout(_) => 8,
            ExportError::Cancelled { .. } => 130,
            ExportError::Finished { .. } => 1,
        }
    }

    /// Short name of the error kind, used in summaries
    pub fn kind(&self) -> &'static str {
        match self {
            ExportError::Config(_) => "ConfigError",
            ExportError::Query(_) => "QueryExecutionError",
            ExportError::UnsupportedType(_) => "UnsupportedTypeError",
            ExportError::NoBackendAvailable(_) => "NoBackendAvailableError",
            ExportError::SchemaMismatch(_) => "SchemaMismatchError",
            ExportError::Write(_) => "WriteError",
            ExportError::Timeout(_) => "TimeoutError",
            ExportError::Cancelled { .. } => "Cancelled",
            ExportError::Finished { .. } => "Finished",
        }
    }
}

/// Configuration document errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The document is not valid YAML
    #[error("Failed to parse configuration document: {reason}")]
    Parse { reason: String },

    /// The document root is not a mapping
    #[error("Configuration document must be a mapping of keys to values")]
    NotAMapping,

    /// A required key is absent or empty
    #[error("Missing required key '{key}'")]
    MissingKey { key: String },

    /// A value failed validation
    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    /// A type override names a column the query does not produce
    #[error("Type override for unknown column '{column}'")]
    UnknownColumn { column: String },

    /// The configuration file could not be read
    #[error("Failed to read configuration '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn missing(key: &str) -> Self {
        ConfigError::MissingKey {
            key: key.to_string(),
        }
    }
}

/// Errors raised while running the query in the engine
#[derive(Error, Debug)]
pub enum QueryExecutionError {
    /// Failed to open the database
    #[error("Failed to open database '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: duckdb::Error,
    },

    /// A setup statement failed
    #[error("Setup statement failed ({statement}): {source}")]
    Setup {
        statement: String,
        #[source]
        source: duckdb::Error,
    },

    /// The engine rejected the query text or a referenced object is missing
    #[error("{context}: {source}")]
    Engine {
        context: &'static str,
        #[source]
        source: duckdb::Error,
    },

    /// A value could not be read from a result row
    #[error("Failed to read column '{column}' at row {row}: {source}")]
    Value {
        column: String,
        row: usize,
        #[source]
        source: duckdb::Error,
    },

    /// Two result columns share a name
    #[error("Query produces duplicate column name '{name}'")]
    DuplicateColumn { name: String },

    /// Result columns disagree on length
    #[error("Column '{column}' has {actual} values, expected {expected}")]
    RaggedColumns {
        column: String,
        expected: usize,
        actual: usize,
    },

    /// The query worker went away without reporting
    #[error("Query worker terminated unexpectedly")]
    WorkerLost,

    /// The caller stopped waiting before the query finished
    #[error("Query abandoned before it finished")]
    Abandoned,
}

impl QueryExecutionError {
    pub(crate) fn engine(context: &'static str) -> impl FnOnce(duckdb::Error) -> Self {
        move |source| QueryExecutionError::Engine { context, source }
    }
}

/// Type bridge errors
#[derive(Error, Debug)]
pub enum UnsupportedTypeError {
    /// The native type has no logical mapping
    #[error("native type {native} has no logical mapping: {reason}")]
    NoMapping { native: String, reason: &'static str },

    /// A column value could not be coerced to the requested logical type
    #[error("cannot coerce column '{column}' from {from} to {to}: {reason}")]
    Cast {
        column: String,
        from: LogicalType,
        to: LogicalType,
        reason: String,
    },

    /// Coerced columns disagree with their schema
    #[error("coerced columns do not form a valid batch: {reason}")]
    Batch { reason: String },

    /// Context wrapper naming the offending column
    #[error("column '{column}': {source}")]
    InColumn {
        column: String,
        #[source]
        source: Box<UnsupportedTypeError>,
    },
}

impl UnsupportedTypeError {
    pub(crate) fn in_column(self, column: &str) -> Self {
        UnsupportedTypeError::InColumn {
            column: column.to_string(),
            source: Box::new(self),
        }
    }
}

/// One backend that selection considered and rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub backend: String,
    pub reason: String,
}

/// Backend selection failed
#[derive(Error, Debug, Clone)]
#[error("no backend can write {format} for this result ({})", describe_rejections(.rejected))]
pub struct NoBackendAvailableError {
    pub format: OutputFormat,
    pub rejected: Vec<Rejection>,
}

fn describe_rejections(rejected: &[Rejection]) -> String {
    if rejected.is_empty() {
        return "no candidates".to_string();
    }
    rejected
        .iter()
        .map(|r| format!("{}: {}", r.backend, r.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

/// The selected backend cannot represent the coerced schema
#[derive(Error, Debug)]
pub enum SchemaMismatchError {
    /// No stored integer width is wide enough for the column
    #[error("backend '{backend}' stores no integer width >= {width} for column '{column}'")]
    IntegerWidth {
        backend: String,
        column: String,
        width: IntWidth,
    },

    /// The serializer refused the schema while writing
    #[error("backend '{backend}' rejected the schema for {format}: {reason}")]
    Rejected {
        backend: String,
        format: OutputFormat,
        reason: String,
    },
}

/// Output file errors
#[derive(Error, Debug)]
pub enum WriteError {
    /// Could not create the output directory or temporary file
    #[error("Cannot create output in '{dir}': {source}")]
    Create {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure while writing
    #[error("I/O error writing '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Could not move the finished file into place
    #[error("Failed to move output into place at '{path}': {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Backend-specific failure with no better classification
    #[error("backend '{backend}' failed writing '{path}': {reason}")]
    Backend {
        backend: String,
        path: PathBuf,
        reason: String,
    },
}

/// Operation exceeded its caller-supplied bound
#[derive(Error, Debug, Clone)]
#[error("{stage} exceeded the {}s limit", .limit.as_secs_f64())]
pub struct TimeoutError {
    pub stage: Stage,
    pub limit: Duration,
}

/// Result type alias for export operations
pub type Result<T> = std::result::Result<T, ExportError>;
