//! Manifest sidecar
//!
//! `<output>.manifest.json` describes a finished export: format, backend,
//! row count and the column schema.

use crate::config::OutputFormat;
use crate::error::WriteError;
use crate::export::OutputHandle;
use crate::types::{ColumnSchema, ColumnSummary};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const MANIFEST_SUFFIX: &str = ".manifest.json";

/// Contents of a manifest sidecar
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub format: String,
    pub backend: String,
    pub rows: u64,
    pub columns: Vec<ColumnSummary>,
}

impl Manifest {
    pub fn new(format: OutputFormat, backend: &str, rows: u64, schema: &ColumnSchema) -> Self {
        Self {
            format: format.name().to_string(),
            backend: backend.to_string(),
            rows,
            columns: schema.summaries(),
        }
    }
}

/// Sidecar path for an output file
pub fn manifest_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(MANIFEST_SUFFIX);
    output.with_file_name(name)
}

/// Write the manifest next to `output` into a temporary file.
///
/// Nothing is visible until the returned handle is committed.
pub fn stage_manifest(output: &Path, manifest: &Manifest) -> Result<OutputHandle, WriteError> {
    let path = manifest_path(output);
    if path.is_dir() {
        return Err(WriteError::Persist {
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "a directory is in the way",
            ),
            path,
        });
    }
    let mut handle = OutputHandle::acquire(&path)?;
    let temp = handle.path().to_path_buf();

    let mut writer = BufWriter::new(handle.file_mut());
    serde_json::to_writer_pretty(&mut writer, manifest)
        .map_err(std::io::Error::from)
        .and_then(|()| writer.write_all(b"\n"))
        .and_then(|()| writer.flush())
        .map_err(|source| WriteError::Io {
            path: temp,
            source,
        })?;
    drop(writer);

    Ok(handle)
}

/// Write the manifest next to `output`, returning its path
pub fn write_manifest(output: &Path, manifest: &Manifest) -> Result<PathBuf, WriteError> {
    let handle = stage_manifest(output, manifest)?;
    let path = handle.target().to_path_buf();
    handle.commit()?;
    Ok(path)
}
