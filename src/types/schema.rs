//! Column schema and the coerced result handed to backends

use crate::error::QueryExecutionError;
use crate::types::logical::{
    IntWidth, KindSet, LogicalType, EXTENSION_NAME_KEY, JSON_EXTENSION_NAME, META_LOGICAL_TYPE,
    META_NATIVE_TYPE, META_TIMEZONE,
};
use crate::types::native::NativeType;
use arrow::array::ArrayRef;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// File-level metadata key holding the column summaries as JSON
pub const META_COLUMNS: &str = "duckport.columns";

/// One column of a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub logical: LogicalType,
    pub native: NativeType,
    /// Source time zone of a timestamp column, kept apart from the values
    pub timezone: Option<String>,
}

impl ColumnSpec {
    /// Arrow field carrying this column's metadata
    pub fn arrow_field(&self) -> Field {
        let mut metadata = HashMap::new();
        metadata.insert(META_LOGICAL_TYPE.to_string(), self.logical.to_string());
        metadata.insert(META_NATIVE_TYPE.to_string(), self.native.to_string());
        if let Some(tz) = &self.timezone {
            metadata.insert(META_TIMEZONE.to_string(), tz.clone());
        }
        if self.logical == LogicalType::Nested {
            metadata.insert(
                EXTENSION_NAME_KEY.to_string(),
                JSON_EXTENSION_NAME.to_string(),
            );
        }
        Field::new(&self.name, self.logical.arrow_type(), true).with_metadata(metadata)
    }

    /// Arrow field carrying only the extension tag.
    ///
    /// Used where field metadata is serialized in hash order and output
    /// must be byte-stable.
    pub fn storage_field(&self) -> Field {
        let field = Field::new(&self.name, self.logical.arrow_type(), true);
        if self.logical == LogicalType::Nested {
            field.with_metadata(HashMap::from([(
                EXTENSION_NAME_KEY.to_string(),
                JSON_EXTENSION_NAME.to_string(),
            )]))
        } else {
            field
        }
    }

    pub fn summary(&self) -> ColumnSummary {
        ColumnSummary {
            name: self.name.clone(),
            logical_type: self.logical.to_string(),
            native_type: self.native.to_string(),
            timezone: self.timezone.clone(),
        }
    }
}

/// Serializable description of one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub logical_type: String,
    pub native_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Ordered, name-unique column list
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnSchema {
    columns: Vec<ColumnSpec>,
}

impl ColumnSchema {
    /// Build a schema, rejecting duplicate names
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self, QueryExecutionError> {
        let mut seen = HashSet::with_capacity(columns.len());
        for col in &columns {
            if !seen.insert(col.name.as_str()) {
                return Err(QueryExecutionError::DuplicateColumn {
                    name: col.name.clone(),
                });
            }
        }
        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Logical kinds a backend must support to write this schema
    pub fn required_kinds(&self) -> KindSet {
        self.columns
            .iter()
            .fold(KindSet::EMPTY, |set, c| set.with(c.logical.kind()))
    }

    /// Widest integer column width, if any
    pub fn widest_integer(&self) -> Option<IntWidth> {
        self.columns
            .iter()
            .filter_map(|c| c.logical.int_width())
            .max()
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(ColumnSpec::arrow_field)
                .collect::<Vec<_>>(),
        ))
    }

    /// Schema with byte-stable field metadata, see [`ColumnSpec::storage_field`]
    pub fn storage_schema(&self) -> SchemaRef {
        Arc::new(Schema::new(
            self.columns
                .iter()
                .map(ColumnSpec::storage_field)
                .collect::<Vec<_>>(),
        ))
    }

    pub fn summaries(&self) -> Vec<ColumnSummary> {
        self.columns.iter().map(ColumnSpec::summary).collect()
    }
}

/// Result coerced to canonical logical types
#[derive(Debug, Clone)]
pub struct TypedResult {
    schema: ColumnSchema,
    batch: RecordBatch,
}

impl TypedResult {
    /// Pair a schema with its arrays; lengths and types must agree
    pub fn try_new(schema: ColumnSchema, arrays: Vec<ArrayRef>) -> Result<Self, ArrowError> {
        let batch = if arrays.is_empty() {
            RecordBatch::new_empty(schema.arrow_schema())
        } else {
            RecordBatch::try_new(schema.arrow_schema(), arrays)?
        };
        Ok(Self { schema, batch })
    }

    pub fn schema(&self) -> &ColumnSchema {
        &self.schema
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    /// Zero-copy batches of at most `batch_size` rows.
    ///
    /// Always yields at least one batch so writers emit headers and
    /// footers for empty results.
    pub fn chunks(&self, batch_size: usize) -> Vec<RecordBatch> {
        let total = self.batch.num_rows();
        let size = batch_size.max(1);
        if total == 0 {
            return vec![self.batch.clone()];
        }
        (0..total)
            .step_by(size)
            .map(|offset| self.batch.slice(offset, size.min(total - offset)))
            .collect()
    }
}
