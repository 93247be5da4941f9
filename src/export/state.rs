//! Export job states

use crate::config::OutputFormat;
use crate::engine::QueryResult;
use crate::export::{OutputHandle, Stage};
use crate::types::{ColumnSchema, TypedResult};
use std::path::PathBuf;
use std::time::Duration;

/// Where an [`ExportJob`](crate::export::ExportJob) stands.
///
/// Each non-terminal state owns the data the next transition consumes.
#[derive(Debug)]
pub enum ExportState {
    Idle,
    QueryExecuted(QueryResult),
    TypeCoerced(TypedResult),
    Written {
        output: OutputHandle,
        backend: &'static str,
        rows: u64,
        schema: ColumnSchema,
    },
    Done(ExportStats),
    Failed { stage: Stage, message: String },
}

impl ExportState {
    pub fn name(&self) -> &'static str {
        match self {
            ExportState::Idle => "idle",
            ExportState::QueryExecuted(_) => "query-executed",
            ExportState::TypeCoerced(_) => "type-coerced",
            ExportState::Written { .. } => "written",
            ExportState::Done(_) => "done",
            ExportState::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExportState::Done(_) | ExportState::Failed { .. })
    }

    /// Stage the next transition performs; `None` once terminal
    pub fn next_stage(&self) -> Option<Stage> {
        match self {
            ExportState::Idle => Some(Stage::Query),
            ExportState::QueryExecuted(_) => Some(Stage::Coerce),
            ExportState::TypeCoerced(_) => Some(Stage::Write),
            ExportState::Written { .. } => Some(Stage::Finalize),
            ExportState::Done(_) | ExportState::Failed { .. } => None,
        }
    }
}

/// Outcome of a finished export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportStats {
    pub output_path: PathBuf,
    pub format: OutputFormat,
    pub backend: &'static str,
    pub rows: u64,
    /// Size of the output file
    pub bytes: u64,
    pub columns: usize,
    pub elapsed: Duration,
    pub manifest: Option<PathBuf>,
}
