//! Export backends
//!
//! A backend serializes a [`TypedResult`] into one of the output formats.
//! What each backend can write is described by a [`BackendCapability`];
//! the [`BackendRegistry`] probes every compiled-in backend once at
//! startup and keeps the resulting table for [`select`].
//!
//! # Module Structure
//!
//! - `arrow`: the primary backend, built on the arrow/parquet writers
//! - `duckdb`: DuckDB's own `COPY ... TO` writers (feature `duckdb-copy`)
//! - `select`: backend selection over the capability table

pub mod arrow;
pub mod duckdb;
mod select;

pub use self::arrow::ArrowBackend;
pub use self::duckdb::DuckDbBackend;
pub use select::{candidate_order, select};

use crate::config::{CsvOptions, ExportConfig, OutputFormat};
use crate::deadline::Deadline;
use crate::error::{ExportError, SchemaMismatchError, TimeoutError, WriteError};
use crate::export::{OutputHandle, Stage};
use crate::types::{fit_to_backend, IntWidth, KindSet, TypedResult};
use ::arrow::error::ArrowError;
use ::parquet::errors::ParquetError;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

/// Formats one backend can write and the logical kinds it accepts in each
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSupport {
    pub format: OutputFormat,
    pub kinds: KindSet,
}

/// Static description of one backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCapability {
    pub name: &'static str,
    /// Tried first when no preference is configured
    pub primary: bool,
    pub formats: Vec<FormatSupport>,
    /// Integer widths stored without conversion, narrowest first
    pub integer_widths: Vec<IntWidth>,
    pub available: bool,
    /// Why the backend is unavailable
    pub note: Option<String>,
}

impl BackendCapability {
    /// Logical kinds accepted for `format`, if the format is supported
    pub fn kinds_for(&self, format: OutputFormat) -> Option<KindSet> {
        self.formats
            .iter()
            .find(|f| f.format == format)
            .map(|f| f.kinds)
    }

    /// Narrowest stored width at least as wide as `width`
    pub fn stored_width(&self, width: IntWidth) -> Option<IntWidth> {
        self.integer_widths.iter().copied().filter(|w| *w >= width).min()
    }
}

/// Options shared by every backend
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    pub format: OutputFormat,
    /// Rows per batch (and parquet row group)
    pub batch_size: usize,
    pub compression_level: i32,
    pub csv: CsvOptions,
}

impl WriteOptions {
    pub fn from_config(config: &ExportConfig) -> Self {
        Self {
            format: config.format,
            batch_size: config.batch_size,
            compression_level: config.compression_level,
            csv: config.csv,
        }
    }
}

/// Progress callback type: rows written so far, total rows
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Deadline, cancellation and progress reporting for one write
pub struct WriteControl<'a> {
    deadline: &'a Deadline,
    cancel: &'a AtomicBool,
    progress: Option<&'a (dyn Fn(u64, u64) + Send + Sync)>,
    total_rows: u64,
}

impl<'a> WriteControl<'a> {
    pub fn new(
        deadline: &'a Deadline,
        cancel: &'a AtomicBool,
        progress: Option<&'a (dyn Fn(u64, u64) + Send + Sync)>,
        total_rows: u64,
    ) -> Self {
        Self {
            deadline,
            cancel,
            progress,
            total_rows,
        }
    }

    /// Report progress and stop if cancelled or out of time
    pub fn checkpoint(&self, rows_written: u64) -> Result<(), ExportError> {
        self.check()?;
        self.report(rows_written);
        Ok(())
    }

    /// Stop if cancelled or out of time
    pub fn check(&self) -> Result<(), ExportError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ExportError::Cancelled {
                stage: Stage::Write,
            });
        }
        if self.deadline.expired() {
            return Err(TimeoutError {
                stage: Stage::Write,
                limit: self.deadline.limit().unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }

    /// Report progress without checking limits
    pub fn report(&self, rows_written: u64) {
        if let Some(cb) = self.progress {
            cb(rows_written, self.total_rows);
        }
    }
}

/// A serialization engine
pub trait Backend: Send + Sync {
    /// Stable name used in configuration
    fn name(&self) -> &'static str;

    /// Describe what this backend can write right now
    fn probe(&self) -> BackendCapability;

    /// Write `data` into `output`, returning the number of rows written
    fn write(
        &self,
        data: &TypedResult,
        output: &mut OutputHandle,
        options: &WriteOptions,
        control: &WriteControl<'_>,
    ) -> Result<u64, ExportError>;
}

/// Compiled-in backends and their probed capabilities
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
    capabilities: Vec<BackendCapability>,
}

impl BackendRegistry {
    /// Probe every compiled-in backend
    pub fn probe() -> Self {
        Self::with_backends(vec![Box::new(ArrowBackend), Box::new(DuckDbBackend::new())])
    }

    /// Build a registry from explicit backends, probing each once
    pub fn with_backends(backends: Vec<Box<dyn Backend>>) -> Self {
        let capabilities: Vec<BackendCapability> = backends.iter().map(|b| b.probe()).collect();
        for cap in &capabilities {
            debug!(
                backend = cap.name,
                available = cap.available,
                note = cap.note.as_deref().unwrap_or(""),
                "Probed backend"
            );
        }
        Self {
            backends,
            capabilities,
        }
    }

    pub fn capabilities(&self) -> &[BackendCapability] {
        &self.capabilities
    }

    pub fn get(&self, name: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|b| b.name() == name)
            .map(|b| b.as_ref())
    }
}

/// Select a backend for `typed` and widen its integers to the stored widths.
///
/// Returns the chosen backend's name with the fitted result.
pub fn fit_and_select(
    config: &ExportConfig,
    registry: &BackendRegistry,
    typed: TypedResult,
) -> Result<(&'static str, TypedResult), ExportError> {
    let capability = select(config, registry.capabilities(), typed.schema())?;
    debug!(backend = capability.name, format = %config.format, "Selected backend");
    let fitted = fit_to_backend(typed, capability, config.format)?;
    Ok((capability.name, fitted))
}

/// Map an arrow writer error onto the export error kinds
pub(crate) fn classify_arrow_error(
    err: ArrowError,
    backend: &str,
    format: OutputFormat,
    path: &Path,
) -> ExportError {
    match err {
        ArrowError::IoError(_, source) => WriteError::Io {
            path: path.to_path_buf(),
            source,
        }
        .into(),
        ArrowError::ExternalError(source) => match source.downcast::<std::io::Error>() {
            Ok(io) => WriteError::Io {
                path: path.to_path_buf(),
                source: *io,
            }
            .into(),
            Err(other) => WriteError::Backend {
                backend: backend.to_string(),
                path: path.to_path_buf(),
                reason: other.to_string(),
            }
            .into(),
        },
        ArrowError::SchemaError(reason)
        | ArrowError::NotYetImplemented(reason)
        | ArrowError::InvalidArgumentError(reason)
        | ArrowError::CastError(reason) => SchemaMismatchError::Rejected {
            backend: backend.to_string(),
            format,
            reason,
        }
        .into(),
        other => WriteError::Backend {
            backend: backend.to_string(),
            path: path.to_path_buf(),
            reason: other.to_string(),
        }
        .into(),
    }
}

/// Map a parquet writer error onto the export error kinds
pub(crate) fn classify_parquet_error(
    err: ParquetError,
    backend: &str,
    path: &Path,
) -> ExportError {
    match err {
        ParquetError::External(source) => match source.downcast::<std::io::Error>() {
            Ok(io) => WriteError::Io {
                path: path.to_path_buf(),
                source: *io,
            }
            .into(),
            Err(other) => WriteError::Backend {
                backend: backend.to_string(),
                path: path.to_path_buf(),
                reason: other.to_string(),
            }
            .into(),
        },
        ParquetError::NYI(reason) | ParquetError::ArrowError(reason) => {
            SchemaMismatchError::Rejected {
                backend: backend.to_string(),
                format: OutputFormat::Parquet,
                reason,
            }
            .into()
        }
        other => WriteError::Backend {
            backend: backend.to_string(),
            path: path.to_path_buf(),
            reason: other.to_string(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogicalKind;
    use std::time::Duration;

    #[test]
    fn test_stored_width_picks_narrowest_fit() {
        let cap = BackendCapability {
            name: "t",
            primary: false,
            formats: vec![],
            integer_widths: vec![IntWidth::W64, IntWidth::W128],
            available: true,
            note: None,
        };
        assert_eq!(cap.stored_width(IntWidth::W8), Some(IntWidth::W64));
        assert_eq!(cap.stored_width(IntWidth::W64), Some(IntWidth::W64));
        assert_eq!(cap.stored_width(IntWidth::W128), Some(IntWidth::W128));
    }

    #[test]
    fn test_probe_lists_arrow_as_primary() {
        let registry = BackendRegistry::probe();
        let arrow = &registry.capabilities()[0];
        assert_eq!(arrow.name, "arrow");
        assert!(arrow.primary);
        assert!(arrow.available);
        assert!(arrow
            .kinds_for(OutputFormat::Parquet)
            .unwrap()
            .contains(LogicalKind::Binary));
        assert!(!arrow
            .kinds_for(OutputFormat::Csv)
            .unwrap()
            .contains(LogicalKind::Binary));
        assert!(registry.get("duckdb").is_some());
        assert!(registry.get("fastwriter").is_none());
    }

    #[test]
    fn test_checkpoint_reports_progress() {
        use std::sync::atomic::AtomicU64;
        let seen = AtomicU64::new(0);
        let cb = |done: u64, _total: u64| seen.store(done, Ordering::SeqCst);
        let deadline = Deadline::unbounded();
        let cancel = AtomicBool::new(false);
        let control = WriteControl::new(&deadline, &cancel, Some(&cb), 10);

        control.checkpoint(4).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4);

        cancel.store(true, Ordering::SeqCst);
        assert!(matches!(
            control.checkpoint(5),
            Err(ExportError::Cancelled { stage: Stage::Write })
        ));
    }

    #[test]
    fn test_checkpoint_times_out() {
        let deadline = Deadline::start(Some(Duration::ZERO));
        let cancel = AtomicBool::new(false);
        let control = WriteControl::new(&deadline, &cancel, None, 0);
        assert!(matches!(control.checkpoint(0), Err(ExportError::Timeout(_))));
    }

    #[test]
    fn test_io_errors_classified_as_write() {
        let err = classify_arrow_error(
            ArrowError::IoError(
                "disk full".into(),
                std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
            ),
            "arrow",
            OutputFormat::Csv,
            Path::new("/tmp/out.csv"),
        );
        assert!(matches!(err, ExportError::Write(WriteError::Io { .. })));

        let err = classify_arrow_error(
            ArrowError::InvalidArgumentError("binary not supported".into()),
            "arrow",
            OutputFormat::Csv,
            Path::new("/tmp/out.csv"),
        );
        assert!(matches!(err, ExportError::SchemaMismatch(_)));
    }
}
