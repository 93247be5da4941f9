//! Type system shared by the engine, the bridge and the backends
//!
//! - [`native`]: DuckDB type names as reported by the engine
//! - [`logical`]: the canonical logical types every backend understands
//! - [`schema`]: column schemas and the coerced result
//! - [`bridge`]: mapping and coercion between the two

pub mod bridge;
pub mod logical;
pub mod native;
pub mod schema;

pub use bridge::{coerce, fit_to_backend, to_logical_type, transport_expr, Transport};
pub use logical::{IntWidth, KindSet, LogicalKind, LogicalType};
pub use native::{NativeType, TimestampPrecision};
pub use schema::{ColumnSchema, ColumnSpec, ColumnSummary, TypedResult, META_COLUMNS};
