//! Arrow backend
//!
//! The primary backend. Parquet goes through `ArrowWriter` with ZSTD
//! compression and chunk statistics; CSV and JSON Lines use the arrow
//! text writers. All three write batches of `batch_size` rows and check
//! the deadline between batches.

use crate::backend::{
    classify_arrow_error, classify_parquet_error, Backend, BackendCapability, FormatSupport,
    WriteControl, WriteOptions,
};
use crate::config::OutputFormat;
use crate::error::{ConfigError, ExportError, WriteError};
use crate::export::OutputHandle;
use crate::types::{IntWidth, KindSet, LogicalKind, TypedResult, META_COLUMNS};
use arrow::csv::WriterBuilder as CsvWriterBuilder;
use arrow::json::writer::LineDelimited;
use arrow::json::WriterBuilder as JsonWriterBuilder;
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::file::metadata::KeyValue;
use parquet::file::properties::{EnabledStatistics, WriterProperties};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::debug;

const NAME: &str = "arrow";

/// Backend built on the arrow and parquet writers
#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowBackend;

impl Backend for ArrowBackend {
    fn name(&self) -> &'static str {
        NAME
    }

    fn probe(&self) -> BackendCapability {
        let text_kinds = KindSet::ALL.without(LogicalKind::Binary);
        BackendCapability {
            name: NAME,
            primary: true,
            formats: vec![
                FormatSupport {
                    format: OutputFormat::Parquet,
                    kinds: KindSet::ALL,
                },
                FormatSupport {
                    format: OutputFormat::Csv,
                    kinds: text_kinds,
                },
                FormatSupport {
                    format: OutputFormat::JsonLines,
                    kinds: text_kinds,
                },
            ],
            integer_widths: IntWidth::ALL.to_vec(),
            available: true,
            note: None,
        }
    }

    fn write(
        &self,
        data: &TypedResult,
        output: &mut OutputHandle,
        options: &WriteOptions,
        control: &WriteControl<'_>,
    ) -> Result<u64, ExportError> {
        debug!(
            format = %options.format,
            rows = data.num_rows(),
            path = %output.path().display(),
            "Writing with arrow backend"
        );
        match options.format {
            OutputFormat::Parquet => write_parquet(data, output, options, control),
            OutputFormat::Csv => write_csv(data, output, options, control),
            OutputFormat::JsonLines => write_jsonl(data, output, options, control),
        }
    }
}

/// Build Parquet writer properties with ZSTD compression and column statistics.
fn writer_properties(
    data: &TypedResult,
    options: &WriteOptions,
    path: &Path,
) -> Result<WriterProperties, ExportError> {
    let zstd_level = ZstdLevel::try_new(options.compression_level).map_err(|e| {
        ConfigError::invalid(
            "compression_level",
            format!("invalid ZSTD level {}: {}", options.compression_level, e),
        )
    })?;

    let columns = serde_json::to_string(&data.schema().summaries()).map_err(|e| {
        WriteError::Backend {
            backend: NAME.to_string(),
            path: path.to_path_buf(),
            reason: format!("cannot encode column metadata: {}", e),
        }
    })?;

    Ok(WriterProperties::builder()
        .set_compression(Compression::ZSTD(zstd_level))
        .set_statistics_enabled(EnabledStatistics::Chunk)
        .set_max_row_group_size(options.batch_size)
        .set_key_value_metadata(Some(vec![KeyValue::new(META_COLUMNS.to_string(), columns)]))
        .build())
}

fn write_parquet(
    data: &TypedResult,
    output: &mut OutputHandle,
    options: &WriteOptions,
    control: &WriteControl<'_>,
) -> Result<u64, ExportError> {
    let path = output.path().to_path_buf();
    let props = writer_properties(data, options, &path)?;
    let schema = data.schema().storage_schema();

    let mut writer = ArrowWriter::try_new(output.file_mut(), schema.clone(), Some(props))
        .map_err(|e| classify_parquet_error(e, NAME, &path))?;

    let mut written: u64 = 0;
    for chunk in data.chunks(options.batch_size) {
        control.checkpoint(written)?;
        let batch = RecordBatch::try_new(schema.clone(), chunk.columns().to_vec())
            .map_err(|e| classify_arrow_error(e, NAME, OutputFormat::Parquet, &path))?;
        writer
            .write(&batch)
            .map_err(|e| classify_parquet_error(e, NAME, &path))?;
        written += batch.num_rows() as u64;
    }

    writer
        .close()
        .map_err(|e| classify_parquet_error(e, NAME, &path))?;
    control.report(written);
    Ok(written)
}

fn write_csv(
    data: &TypedResult,
    output: &mut OutputHandle,
    options: &WriteOptions,
    control: &WriteControl<'_>,
) -> Result<u64, ExportError> {
    let path = output.path().to_path_buf();
    let mut writer = CsvWriterBuilder::new()
        .with_header(options.csv.header)
        .with_delimiter(options.csv.delimiter_byte())
        .build(BufWriter::new(output.file_mut()));

    let mut written: u64 = 0;
    for batch in data.chunks(options.batch_size) {
        control.checkpoint(written)?;
        writer
            .write(&batch)
            .map_err(|e| classify_arrow_error(e, NAME, OutputFormat::Csv, &path))?;
        written += batch.num_rows() as u64;
    }

    writer
        .into_inner()
        .flush()
        .map_err(|source| WriteError::Io {
            path: path.clone(),
            source,
        })?;
    control.report(written);
    Ok(written)
}

fn write_jsonl(
    data: &TypedResult,
    output: &mut OutputHandle,
    options: &WriteOptions,
    control: &WriteControl<'_>,
) -> Result<u64, ExportError> {
    let path = output.path().to_path_buf();
    let mut writer = JsonWriterBuilder::new()
        .with_explicit_nulls(true)
        .build::<_, LineDelimited>(BufWriter::new(output.file_mut()));

    let mut written: u64 = 0;
    for batch in data.chunks(options.batch_size) {
        control.checkpoint(written)?;
        writer
            .write(&batch)
            .map_err(|e| classify_arrow_error(e, NAME, OutputFormat::JsonLines, &path))?;
        written += batch.num_rows() as u64;
    }
    writer
        .finish()
        .map_err(|e| classify_arrow_error(e, NAME, OutputFormat::JsonLines, &path))?;

    writer
        .into_inner()
        .flush()
        .map_err(|source| WriteError::Io {
            path: path.clone(),
            source,
        })?;
    control.report(written);
    Ok(written)
}
