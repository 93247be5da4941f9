//! Configuration types for duckport
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The YAML export document and its validation
//! - Validated runtime settings for the `run` command

use crate::error::ConfigError;
use crate::types::LogicalType;
use clap::Parser;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Rows per written batch (and parquet row group) unless configured
pub const DEFAULT_BATCH_SIZE: usize = 65_536;

/// Batch size limits
const MIN_BATCH_SIZE: usize = 1;
const MAX_BATCH_SIZE: usize = 1_048_576;

/// ZSTD level limits
const MIN_COMPRESSION_LEVEL: i32 = 1;
const MAX_COMPRESSION_LEVEL: i32 = 22;
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Maximum concurrent exports
const MAX_JOBS: usize = 256;

/// Keys the export document understands
const KNOWN_KEYS: &[&str] = &[
    "source",
    "output_path",
    "format",
    "backend_preference",
    "type_overrides",
    "database",
    "setup",
    "timeout_secs",
    "batch_size",
    "compression_level",
    "csv",
    "write_manifest",
];

/// A source naming a table rather than holding a query
static TABLE_NAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    // Matches: table, schema.table or catalog.schema.table
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*){0,2}$")
        .expect("Invalid table name regex")
});

/// Export query results from DuckDB to Parquet, CSV or JSON Lines
#[derive(Parser, Debug, Clone)]
#[command(
    name = "duckport",
    version,
    about = "Export DuckDB query results to Parquet, CSV or JSON Lines",
    long_about = "Runs a query (or reads a table) in an embedded DuckDB database, maps every\n\
                  column onto a small set of logical types and writes the result through the\n\
                  first backend that can represent it.\n\n\
                  Each export is described by a YAML document. Output files are written to a\n\
                  temporary file next to the target and moved into place only when complete.",
    after_help = "EXAMPLES:\n    \
        duckport run export.yaml\n    \
        duckport run export.yaml -o out/trips.csv --format csv\n    \
        duckport run daily/*.yaml -j 4 --timeout 600\n    \
        duckport run export.yaml --backend duckdb --backend arrow\n    \
        duckport check export.yaml      # Show schema and chosen backend\n    \
        duckport backends               # Show the capability table"
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Subcommands
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Run one or more exports
    Run {
        /// Export documents (YAML)
        #[arg(value_name = "CONFIG", required = true, num_args = 1..)]
        configs: Vec<PathBuf>,

        /// Output file (only with a single CONFIG)
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Output format (parquet, csv, jsonl)
        #[arg(long, value_name = "FORMAT")]
        format: Option<OutputFormat>,

        /// Backend to try, in order (can be repeated)
        #[arg(long = "backend", value_name = "NAME", action = clap::ArgAction::Append)]
        backends: Vec<String>,

        /// Time limit per export in seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,

        /// Number of exports to run at once
        #[arg(short = 'j', long, default_value_t = default_jobs(), value_name = "NUM")]
        jobs: usize,
    },

    /// Run the query and type mapping, and show the backend that would write
    Check {
        /// Export document (YAML)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Show backends and what they can write
    Backends,
}

fn default_jobs() -> usize {
    num_cpus::get()
}

/// Output file format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Parquet,
    Csv,
    JsonLines,
}

impl OutputFormat {
    pub const ALL: [OutputFormat; 3] = [
        OutputFormat::Parquet,
        OutputFormat::Csv,
        OutputFormat::JsonLines,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Parquet => "parquet",
            OutputFormat::Csv => "csv",
            OutputFormat::JsonLines => "jsonl",
        }
    }

    /// Infer the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "parquet" | "pq" => Some(OutputFormat::Parquet),
            "csv" => Some(OutputFormat::Csv),
            "jsonl" | "ndjson" | "json" => Some(OutputFormat::JsonLines),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "parquet" => Ok(OutputFormat::Parquet),
            "csv" => Ok(OutputFormat::Csv),
            "jsonl" | "json" | "ndjson" => Ok(OutputFormat::JsonLines),
            other => Err(format!(
                "unknown format '{}' (expected parquet, csv or jsonl)",
                other
            )),
        }
    }
}

/// Where the exported rows come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    /// A query to run as-is
    Query(String),
    /// A table (optionally schema-qualified) to read in full
    Table(String),
}

impl Source {
    /// Classify a `source` value: bare identifiers are tables
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        if TABLE_NAME_REGEX.is_match(text) {
            Source::Table(text.to_string())
        } else {
            Source::Query(text.to_string())
        }
    }

    /// Query text producing the exported rows
    pub fn to_sql(&self) -> String {
        match self {
            Source::Query(sql) => sql.clone(),
            Source::Table(name) => {
                let quoted: Vec<String> = name
                    .split('.')
                    .map(crate::types::bridge::quote_ident)
                    .collect();
                format!("SELECT * FROM {}", quoted.join("."))
            }
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Query(sql) => {
                let flat = sql.split_whitespace().collect::<Vec<_>>().join(" ");
                if flat.chars().count() > 60 {
                    let short: String = flat.chars().take(57).collect();
                    write!(f, "{}...", short)
                } else {
                    f.write_str(&flat)
                }
            }
            Source::Table(name) => write!(f, "table {}", name),
        }
    }
}

/// CSV dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CsvOptions {
    pub delimiter: char,
    pub header: bool,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            header: true,
        }
    }
}

impl CsvOptions {
    /// Delimiter as a single byte
    pub fn delimiter_byte(&self) -> u8 {
        // Validated as ASCII at load time
        self.delimiter as u8
    }
}

/// Validated, immutable export description
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Rows to export
    pub source: Source,

    /// Final output file
    pub output_path: PathBuf,

    /// Output format
    pub format: OutputFormat,

    /// Backends to try, in order; empty means primary first
    pub backend_preference: Vec<String>,

    /// Per-column logical type overrides
    pub type_overrides: BTreeMap<String, LogicalType>,

    /// DuckDB database file; in-memory when `None`
    pub database: Option<PathBuf>,

    /// Statements run before the query
    pub setup: Vec<String>,

    /// Time limit for the whole export
    pub timeout: Option<Duration>,

    /// Rows per written batch
    pub batch_size: usize,

    /// Parquet ZSTD level
    pub compression_level: i32,

    /// CSV dialect
    pub csv: CsvOptions,

    /// Write `<output>.manifest.json` next to the output
    pub write_manifest: bool,

    /// Format came from the output extension rather than the document
    format_inferred: bool,
}

/// A parsed document plus the keys it carried that nothing reads
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ExportConfig,
    pub unknown_keys: Vec<String>,
}

/// Parse and validate an export document
pub fn load(document: &str) -> Result<LoadedConfig, ConfigError> {
    let root: Value = serde_yaml::from_str(document).map_err(|e| ConfigError::Parse {
        reason: e.to_string(),
    })?;
    let mut map = match root {
        Value::Mapping(map) => map,
        _ => return Err(ConfigError::NotAMapping),
    };

    let source = take_required_string(&mut map, "source")?;
    let output_path = PathBuf::from(take_required_string(&mut map, "output_path")?);

    let (format, format_inferred) = match take::<String>(&mut map, "format")? {
        Some(name) => (
            name.parse::<OutputFormat>()
                .map_err(|reason| ConfigError::invalid("format", reason))?,
            false,
        ),
        None => (
            OutputFormat::from_path(&output_path).ok_or_else(|| ConfigError::missing("format"))?,
            true,
        ),
    };

    let backend_preference = match map.remove("backend_preference") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(name)) => vec![name],
        Some(value) => decode::<Vec<String>>("backend_preference", value)?,
    };
    let backend_preference = backend_preference
        .into_iter()
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut type_overrides = BTreeMap::new();
    for (column, type_name) in take::<BTreeMap<String, String>>(&mut map, "type_overrides")?
        .unwrap_or_default()
    {
        let logical = type_name
            .parse::<LogicalType>()
            .map_err(|reason| ConfigError::invalid(&format!("type_overrides.{}", column), reason))?;
        type_overrides.insert(column, logical);
    }

    let database = take::<PathBuf>(&mut map, "database")?;
    let setup = match map.remove("setup") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::String(statement)) => vec![statement],
        Some(value) => decode::<Vec<String>>("setup", value)?,
    };

    let timeout = match take::<u64>(&mut map, "timeout_secs")? {
        Some(0) => return Err(ConfigError::invalid("timeout_secs", "must be at least 1")),
        Some(secs) => Some(Duration::from_secs(secs)),
        None => None,
    };

    let batch_size = take::<usize>(&mut map, "batch_size")?.unwrap_or(DEFAULT_BATCH_SIZE);
    if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&batch_size) {
        return Err(ConfigError::invalid(
            "batch_size",
            format!(
                "{} is outside {}..={}",
                batch_size, MIN_BATCH_SIZE, MAX_BATCH_SIZE
            ),
        ));
    }

    let compression_level =
        take::<i32>(&mut map, "compression_level")?.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
    if !(MIN_COMPRESSION_LEVEL..=MAX_COMPRESSION_LEVEL).contains(&compression_level) {
        return Err(ConfigError::invalid(
            "compression_level",
            format!(
                "{} is outside {}..={}",
                compression_level, MIN_COMPRESSION_LEVEL, MAX_COMPRESSION_LEVEL
            ),
        ));
    }

    let csv = take::<CsvOptions>(&mut map, "csv")?.unwrap_or_default();
    if !csv.delimiter.is_ascii() || matches!(csv.delimiter, '\n' | '\r' | '"') {
        return Err(ConfigError::invalid(
            "csv.delimiter",
            format!("'{}' cannot be used as a delimiter", csv.delimiter.escape_default()),
        ));
    }

    let write_manifest = take::<bool>(&mut map, "write_manifest")?.unwrap_or(false);

    let unknown_keys = map
        .keys()
        .map(|key| match key {
            Value::String(s) => s.clone(),
            other => serde_yaml::to_string(other)
                .map(|s| s.trim().to_string())
                .unwrap_or_else(|_| "<non-string key>".to_string()),
        })
        .filter(|key| !KNOWN_KEYS.contains(&key.as_str()))
        .collect();

    Ok(LoadedConfig {
        config: ExportConfig {
            source: Source::parse(&source),
            output_path,
            format,
            backend_preference,
            type_overrides,
            database,
            setup,
            timeout,
            batch_size,
            compression_level,
            csv,
            write_manifest,
            format_inferred,
        },
        unknown_keys,
    })
}

/// Read and parse an export document from disk
pub fn load_file(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let document = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    load(&document)
}

/// Remove `key` and decode it, treating an explicit null as absent
fn take<T: DeserializeOwned>(map: &mut Mapping, key: &str) -> Result<Option<T>, ConfigError> {
    match map.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => decode(key, value).map(Some),
    }
}

fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, ConfigError> {
    serde_yaml::from_value(value).map_err(|e| ConfigError::invalid(key, e.to_string()))
}

fn take_required_string(map: &mut Mapping, key: &str) -> Result<String, ConfigError> {
    match take::<String>(map, key)? {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::missing(key)),
    }
}

/// Command-line values that replace document values
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub output_path: Option<PathBuf>,
    pub format: Option<OutputFormat>,
    pub backend_preference: Vec<String>,
    pub timeout: Option<Duration>,
}

impl ExportConfig {
    /// Apply command-line overrides, producing a new config
    pub fn with_overrides(&self, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut config = self.clone();
        if let Some(path) = &overrides.output_path {
            config.output_path = path.clone();
            if config.format_inferred && overrides.format.is_none() {
                config.format = OutputFormat::from_path(path)
                    .ok_or_else(|| ConfigError::missing("format"))?;
            }
        }
        if let Some(format) = overrides.format {
            config.format = format;
            config.format_inferred = false;
        }
        if !overrides.backend_preference.is_empty() {
            config.backend_preference = overrides
                .backend_preference
                .iter()
                .map(|name| name.trim().to_ascii_lowercase())
                .collect();
        }
        if overrides.timeout.is_some() {
            config.timeout = overrides.timeout;
        }
        Ok(config)
    }
}

/// Validated settings for the `run` command
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Export documents to run
    pub configs: Vec<PathBuf>,

    /// Values replacing document values
    pub overrides: Overrides,

    /// Exports run at once
    pub parallelism: usize,

    /// Show progress indicator
    pub show_progress: bool,

    /// Verbose logging
    pub verbose: bool,
}

impl RunSettings {
    /// Create and validate settings from CLI arguments
    pub fn from_args(args: CliArgs) -> Result<Self, ConfigError> {
        let Command::Run {
            configs,
            output,
            format,
            backends,
            timeout,
            jobs,
        } = args.command
        else {
            return Err(ConfigError::invalid("command", "expected 'run'"));
        };

        if configs.is_empty() {
            return Err(ConfigError::missing("CONFIG"));
        }

        // One output path cannot serve several documents
        if output.is_some() && configs.len() > 1 {
            return Err(ConfigError::invalid(
                "--output",
                "can only be used with a single CONFIG",
            ));
        }

        if jobs == 0 || jobs > MAX_JOBS {
            return Err(ConfigError::invalid(
                "--jobs",
                format!("{} is outside 1..={}", jobs, MAX_JOBS),
            ));
        }

        let timeout = match timeout {
            Some(0) => return Err(ConfigError::invalid("--timeout", "must be at least 1")),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(Self {
            configs,
            overrides: Overrides {
                output_path: output,
                format,
                backend_preference: backends,
                timeout,
            },
            parallelism: jobs,
            show_progress: !args.quiet,
            verbose: args.verbose,
        })
    }
}
