//! DuckDB backend
//!
//! Loads the coerced rows into a staging table on a private in-memory
//! connection and lets DuckDB's own `COPY ... TO` writers produce the
//! file. Nested values are not supported: DuckDB would write them back as
//! plain strings. Integers are staged as BIGINT or HUGEINT only.

use crate::backend::{Backend, BackendCapability, FormatSupport, WriteControl, WriteOptions};
use crate::config::OutputFormat;
use crate::error::{ExportError, SchemaMismatchError, WriteError};
use crate::export::OutputHandle;
use crate::types::bridge::quote_ident;
use crate::types::{IntWidth, KindSet, LogicalKind, LogicalType, TypedResult};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{Decimal128Type, Float64Type, Int64Type, TimestampMicrosecondType};
use crossbeam_channel::{bounded, RecvTimeoutError};
use duckdb::types::Value;
use duckdb::{params_from_iter, Connection};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const NAME: &str = "duckdb";

const STAGING_TABLE: &str = "duckport_staging";

/// How often a running COPY re-checks the deadline and shutdown flag
const COPY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Backend writing through DuckDB's `COPY ... TO`
#[derive(Debug, Default, Clone, Copy)]
pub struct DuckDbBackend {
    _private: (),
}

impl DuckDbBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for DuckDbBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn probe(&self) -> BackendCapability {
        let mut capability = BackendCapability {
            name: NAME,
            primary: false,
            formats: Vec::new(),
            integer_widths: vec![IntWidth::W64, IntWidth::W128],
            available: false,
            note: None,
        };

        if !cfg!(feature = "duckdb-copy") {
            capability.note = Some("built without the duckdb-copy feature".to_string());
            return capability;
        }

        match loaded_extensions() {
            Ok(loaded) => {
                let kinds = KindSet::ALL.without(LogicalKind::Nested);
                capability.formats.push(FormatSupport {
                    format: OutputFormat::Csv,
                    kinds,
                });
                if loaded.iter().any(|e| e == "parquet") {
                    capability.formats.push(FormatSupport {
                        format: OutputFormat::Parquet,
                        kinds,
                    });
                }
                if loaded.iter().any(|e| e == "json") {
                    capability.formats.push(FormatSupport {
                        format: OutputFormat::JsonLines,
                        kinds,
                    });
                }
                capability.available = true;
            }
            Err(e) => {
                warn!("DuckDB backend probe failed: {}", e);
                capability.note = Some(format!("probe failed: {}", e));
            }
        }
        capability
    }

    fn write(
        &self,
        data: &TypedResult,
        output: &mut OutputHandle,
        options: &WriteOptions,
        control: &WriteControl<'_>,
    ) -> Result<u64, ExportError> {
        let path = output.path().to_path_buf();
        let rejected = |reason: String| SchemaMismatchError::Rejected {
            backend: NAME.to_string(),
            format: options.format,
            reason,
        };
        let failed = |context: &str, e: duckdb::Error| WriteError::Backend {
            backend: NAME.to_string(),
            path: path.clone(),
            reason: format!("{}: {}", context, e),
        };

        let columns = data.schema().columns();
        let mut staging_columns = Vec::with_capacity(columns.len());
        let mut export_exprs = Vec::with_capacity(columns.len());
        for spec in columns {
            let sql_type = staging_type(spec.logical).ok_or_else(|| {
                rejected(format!(
                    "column '{}' has unsupported type {}",
                    spec.name, spec.logical
                ))
            })?;
            let col = quote_ident(&spec.name);
            staging_columns.push(format!("{} {}", col, sql_type));
            export_exprs.push(match spec.logical {
                LogicalType::Timestamp => {
                    format!("CAST(make_timestamp({}) AS TIMESTAMPTZ) AS {}", col, col)
                }
                _ => col,
            });
        }

        let conn = Connection::open_in_memory().map_err(|e| failed("cannot open connection", e))?;
        // Single-threaded writers keep the file layout stable between runs
        conn.execute_batch("SET threads TO 1")
            .map_err(|e| failed("cannot configure connection", e))?;
        if let Err(e) = conn.execute_batch("SET TimeZone = 'UTC'") {
            debug!("TimeZone not settable, DuckDB defaults to UTC: {}", e);
        }

        conn.execute_batch(&format!(
            "CREATE TABLE {} ({})",
            STAGING_TABLE,
            staging_columns.join(", ")
        ))
        .map_err(|e| rejected(format!("cannot create staging table: {}", e)))?;

        let written = stage_rows(&conn, data, options, control)
            .map_err(|e| e.unwrap_or_else(|e| rejected(format!("cannot stage rows: {}", e)).into()))?;

        let copy = format!(
            "COPY (SELECT {} FROM {}) TO '{}' ({})",
            export_exprs.join(", "),
            STAGING_TABLE,
            copy_target(&path),
            copy_options(options)
        );
        debug!(sql = %copy, "Running COPY");
        run_copy(conn, copy, &path, control)?.map_err(|e| failed("COPY failed", e))?;

        control.report(written);
        Ok(written)
    }
}

/// Staging column type for a logical type; `None` when not writable
fn staging_type(logical: LogicalType) -> Option<&'static str> {
    match logical {
        LogicalType::Integer(IntWidth::W64) => Some("BIGINT"),
        LogicalType::Integer(IntWidth::W128) => Some("HUGEINT"),
        LogicalType::Integer(_) => None,
        LogicalType::Float => Some("DOUBLE"),
        LogicalType::String => Some("VARCHAR"),
        LogicalType::Boolean => Some("BOOLEAN"),
        LogicalType::Timestamp => Some("BIGINT"),
        LogicalType::Binary => Some("BLOB"),
        LogicalType::Nested => None,
    }
}

fn copy_options(options: &WriteOptions) -> String {
    match options.format {
        OutputFormat::Parquet => format!(
            "FORMAT PARQUET, COMPRESSION ZSTD, COMPRESSION_LEVEL {}, ROW_GROUP_SIZE {}",
            options.compression_level, options.batch_size
        ),
        OutputFormat::Csv => format!(
            "FORMAT CSV, HEADER {}, DELIMITER '{}'",
            options.csv.header,
            options.csv.delimiter.to_string().replace('\'', "''")
        ),
        OutputFormat::JsonLines => "FORMAT JSON".to_string(),
    }
}

/// Insert every row into the staging table.
///
/// The outer error is a stop requested by `control`; the inner one an
/// engine failure.
fn stage_rows(
    conn: &Connection,
    data: &TypedResult,
    options: &WriteOptions,
    control: &WriteControl<'_>,
) -> Result<u64, Result<ExportError, duckdb::Error>> {
    let columns = data.schema().columns();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let insert = format!("INSERT INTO {} VALUES ({})", STAGING_TABLE, placeholders);

    conn.execute_batch("BEGIN TRANSACTION").map_err(Err)?;
    let mut stmt = conn.prepare(&insert).map_err(Err)?;

    let mut written: u64 = 0;
    for batch in data.chunks(options.batch_size) {
        control.checkpoint(written).map_err(Ok)?;
        for row in 0..batch.num_rows() {
            let values = batch
                .columns()
                .iter()
                .zip(columns)
                .map(|(array, spec)| cell(array, spec.logical, row));
            stmt.execute(params_from_iter(values)).map_err(Err)?;
        }
        written += batch.num_rows() as u64;
    }
    drop(stmt);
    conn.execute_batch("COMMIT").map_err(Err)?;
    Ok(written)
}

/// One value of a canonical column as a DuckDB parameter
fn cell(array: &ArrayRef, logical: LogicalType, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match logical {
        LogicalType::Integer(IntWidth::W128) => {
            // Bound as text; the HUGEINT column casts it on insert
            Value::Text(array.as_primitive::<Decimal128Type>().value(row).to_string())
        }
        LogicalType::Integer(_) => Value::BigInt(array.as_primitive::<Int64Type>().value(row)),
        LogicalType::Float => Value::Double(array.as_primitive::<Float64Type>().value(row)),
        LogicalType::String | LogicalType::Nested => {
            Value::Text(array.as_string::<i32>().value(row).to_string())
        }
        LogicalType::Boolean => Value::Boolean(array.as_boolean().value(row)),
        LogicalType::Timestamp => {
            Value::BigInt(array.as_primitive::<TimestampMicrosecondType>().value(row))
        }
        LogicalType::Binary => Value::Blob(array.as_binary::<i32>().value(row).to_vec()),
    }
}

/// Run `COPY` on its own thread, interrupting it when `control` says stop.
///
/// The outer error is the stop; the inner one the engine's own outcome.
fn run_copy(
    conn: Connection,
    copy: String,
    path: &Path,
    control: &WriteControl<'_>,
) -> Result<Result<(), duckdb::Error>, ExportError> {
    let interrupt = conn.interrupt_handle();
    let (tx, rx) = bounded(1);

    thread::scope(|s| {
        s.spawn(move || {
            // The receiver may have given up already
            let _ = tx.send(conn.execute_batch(&copy));
        });

        loop {
            match rx.recv_timeout(COPY_POLL_INTERVAL) {
                Ok(outcome) => return Ok(outcome),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WriteError::Backend {
                        backend: NAME.to_string(),
                        path: path.to_path_buf(),
                        reason: "COPY worker terminated unexpectedly".to_string(),
                    }
                    .into())
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(stop) = control.check() {
                        warn!("Interrupting COPY");
                        interrupt.interrupt();
                        return Err(stop);
                    }
                }
            }
        }
    })
}

/// Extensions loaded in a fresh in-memory database
fn loaded_extensions() -> Result<Vec<String>, duckdb::Error> {
    let conn = Connection::open_in_memory()?;
    let mut stmt = conn.prepare(
        "SELECT extension_name FROM duckdb_extensions() \
         WHERE loaded AND extension_name IN ('parquet', 'json')",
    )?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Path quoted for a `COPY ... TO` literal
fn copy_target(path: &Path) -> String {
    path.to_string_lossy().replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CsvOptions;
    use crate::deadline::Deadline;
    use crate::types::{ColumnSchema, ColumnSpec, NativeType};
    use arrow::array::{Int64Array, StringArray, TimestampMicrosecondArray};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use std::fs::{self, File};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn spec(name: &str, logical: LogicalType) -> ColumnSpec {
        ColumnSpec {
            name: name.into(),
            logical,
            native: NativeType::Varchar,
            timezone: None,
        }
    }

    fn sample() -> TypedResult {
        let schema = ColumnSchema::new(vec![
            spec("id", LogicalType::Integer(IntWidth::W64)),
            spec("name", LogicalType::String),
            spec("at", LogicalType::Timestamp),
        ])
        .unwrap();
        TypedResult::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
                Arc::new(
                    TimestampMicrosecondArray::from(vec![Some(0), Some(1_000_000)])
                        .with_timezone("UTC"),
                ),
            ],
        )
        .unwrap()
    }

    fn write(data: &TypedResult, format: OutputFormat, target: &Path) -> Result<u64, ExportError> {
        let deadline = Deadline::unbounded();
        let cancel = AtomicBool::new(false);
        let control = WriteControl::new(&deadline, &cancel, None, data.num_rows() as u64);
        let options = WriteOptions {
            format,
            batch_size: 1,
            compression_level: 3,
            csv: CsvOptions::default(),
        };
        let mut handle = OutputHandle::acquire(target).unwrap();
        let rows = DuckDbBackend::new().write(data, &mut handle, &options, &control)?;
        handle.commit().unwrap();
        Ok(rows)
    }

    #[test]
    fn test_probe_available_with_feature() {
        let cap = DuckDbBackend::new().probe();
        assert_eq!(cap.available, cfg!(feature = "duckdb-copy"));
        assert!(!cap.primary);
        if cap.available {
            assert!(cap.kinds_for(OutputFormat::Csv).is_some());
            assert!(!cap
                .kinds_for(OutputFormat::Csv)
                .unwrap()
                .contains(LogicalKind::Nested));
        }
    }

    #[test]
    fn test_writes_csv() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.csv");
        assert_eq!(write(&sample(), OutputFormat::Csv, &target).unwrap(), 2);

        let text = fs::read_to_string(&target).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("id,name,at"));
        assert!(lines.next().unwrap().starts_with("1,a,1970-01-01 00:00:00"));
    }

    #[test]
    fn test_writes_parquet() {
        if DuckDbBackend::new()
            .probe()
            .kinds_for(OutputFormat::Parquet)
            .is_none()
        {
            return;
        }
        let dir = tempdir().unwrap();
        let target = dir.path().join("out.parquet");
        write(&sample(), OutputFormat::Parquet, &target).unwrap();

        let reader = ParquetRecordBatchReaderBuilder::try_new(File::open(&target).unwrap())
            .unwrap()
            .build()
            .unwrap();
        let total: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_copy_stops_at_deadline() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("slow.csv");
        let conn = Connection::open_in_memory().unwrap();
        let copy = format!(
            "COPY (SELECT sum(a.range * b.range) AS s FROM range(200000) a, range(200000) b) \
             TO '{}' (FORMAT CSV)",
            copy_target(&target)
        );
        let deadline = Deadline::start(Some(Duration::from_millis(100)));
        let cancel = AtomicBool::new(false);
        let control = WriteControl::new(&deadline, &cancel, None, 0);

        let err = run_copy(conn, copy, &target, &control).unwrap_err();
        assert!(matches!(err, ExportError::Timeout(_)));
    }

    #[test]
    fn test_rejects_nested_columns() {
        let schema = ColumnSchema::new(vec![spec("doc", LogicalType::Nested)]).unwrap();
        let data =
            TypedResult::try_new(schema, vec![Arc::new(StringArray::from(vec!["{}"]))]).unwrap();
        let dir = tempdir().unwrap();
        let err = write(&data, OutputFormat::Csv, &dir.path().join("out.csv")).unwrap_err();
        assert!(matches!(err, ExportError::SchemaMismatch(_)));
    }
}
