//! duckport - Multi-Backend Tabular Export Engine
//!
//! Runs a SQL query (or reads a table) in an embedded DuckDB database and
//! writes the result to Parquet, CSV or JSON Lines through one of several
//! serialization backends.
//!
//! # Features
//!
//! - **Canonical Types**: every engine type maps to one logical type
//!   (integer of a fixed width, float, string, boolean, UTC timestamp,
//!   binary, nested JSON) before any backend sees it.
//!
//! - **Capability-Driven Backends**: backends are probed once into a
//!   capability table; selection is a pure function over that table.
//!
//! - **Atomic Output**: files are written to a temporary path and renamed
//!   into place, so a failed export leaves nothing behind.
//!
//! - **Bounded Runs**: per-export timeouts interrupt running queries, and
//!   Ctrl-C stops every export between batches.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  YAML config    │──▶ config::load ──▶ ExportConfig
//! └─────────────────┘                         │
//!                                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         ExportJob                               │
//! │                                                                 │
//! │  Idle ──▶ QueryExecuted ──▶ TypeCoerced ──▶ Written ──▶ Done    │
//! │    │            │                │             │                │
//! │    ▼            ▼                ▼             ▼                │
//! │ ┌────────┐ ┌──────────┐ ┌────────────────┐ ┌──────────────┐     │
//! │ │Session │ │ coerce   │ │ select + fit   │ │ OutputHandle │     │
//! │ │(DuckDB)│ │ (bridge) │ │ Backend::write │ │ commit       │     │
//! │ └────────┘ └──────────┘ └────────────────┘ └──────────────┘     │
//! └─────────────────────────────────────────────────────────────────┘
//!                                             │
//!                                             ▼
//!                              out.parquet / out.csv / out.jsonl
//! ```
//!
//! # Example
//!
//! ```bash
//! # Export one query
//! duckport run trips.yaml
//!
//! # Several configs on 4 threads, forcing the DuckDB writer
//! duckport run a.yaml b.yaml -j 4 --backend duckdb
//!
//! # Show the schema and backend without writing
//! duckport check trips.yaml
//! ```

pub mod backend;
pub mod config;
pub mod deadline;
pub mod engine;
pub mod error;
pub mod export;
pub mod progress;
pub mod types;

pub use backend::{BackendCapability, BackendRegistry};
pub use config::{load, load_file, ExportConfig, OutputFormat};
pub use engine::{Session, SessionPool};
pub use error::{ExportError, Result};
pub use export::{run_exports, ExportJob, ExportState, ExportStats, Stage};
pub use types::{ColumnSchema, LogicalType, NativeType, TypedResult};
