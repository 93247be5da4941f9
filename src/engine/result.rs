//! Materialized query results
//!
//! Rows come out of DuckDB one at a time; each column is accumulated in an
//! Arrow builder chosen by its [`Transport`] and frozen into an array once
//! the result set is exhausted.

use crate::error::QueryExecutionError;
use crate::types::{NativeType, Transport};
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Decimal128Builder, Float64Builder, Int16Builder,
    Int32Builder, Int64Builder, Int8Builder, StringBuilder,
};
use std::collections::HashSet;
use std::sync::Arc;

/// One column of a query result, in transport form
#[derive(Debug, Clone)]
pub struct ResultColumn {
    pub name: String,
    pub native: NativeType,
    /// Session time zone for zone-aware timestamp columns
    pub timezone: Option<String>,
    pub values: ArrayRef,
}

/// Fully materialized output of one query
#[derive(Debug, Clone)]
pub struct QueryResult {
    columns: Vec<ResultColumn>,
    num_rows: usize,
}

impl QueryResult {
    /// Build a result, checking names are unique and columns equally long
    pub fn try_new(
        columns: Vec<ResultColumn>,
        num_rows: usize,
    ) -> Result<Self, QueryExecutionError> {
        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(QueryExecutionError::DuplicateColumn {
                    name: column.name.clone(),
                });
            }
            if column.values.len() != num_rows {
                return Err(QueryExecutionError::RaggedColumns {
                    column: column.name.clone(),
                    expected: num_rows,
                    actual: column.values.len(),
                });
            }
        }
        Ok(Self { columns, num_rows })
    }

    pub fn columns(&self) -> &[ResultColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&ResultColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn into_columns(self) -> Vec<ResultColumn> {
        self.columns
    }
}

/// Arrow builder for one transport column
pub(crate) enum ColumnBuilder {
    Boolean(BooleanBuilder),
    Int8(Int8Builder),
    Int16(Int16Builder),
    Int32(Int32Builder),
    Int64(Int64Builder),
    Int128(Decimal128Builder),
    Float64(Float64Builder),
    Utf8(StringBuilder),
    Binary(BinaryBuilder),
}

impl ColumnBuilder {
    pub(crate) fn new(transport: Transport, capacity: usize) -> Self {
        match transport {
            Transport::Boolean => ColumnBuilder::Boolean(BooleanBuilder::with_capacity(capacity)),
            Transport::Int8 => ColumnBuilder::Int8(Int8Builder::with_capacity(capacity)),
            Transport::Int16 => ColumnBuilder::Int16(Int16Builder::with_capacity(capacity)),
            Transport::Int32 => ColumnBuilder::Int32(Int32Builder::with_capacity(capacity)),
            Transport::Int64 | Transport::EpochMicros => {
                ColumnBuilder::Int64(Int64Builder::with_capacity(capacity))
            }
            Transport::Int128 => ColumnBuilder::Int128(
                Decimal128Builder::with_capacity(capacity)
                    .with_data_type(Transport::Int128.arrow_type()),
            ),
            Transport::Float64 => ColumnBuilder::Float64(Float64Builder::with_capacity(capacity)),
            Transport::Text | Transport::Json | Transport::Opaque => {
                ColumnBuilder::Utf8(StringBuilder::with_capacity(capacity, capacity * 16))
            }
            Transport::Binary => {
                ColumnBuilder::Binary(BinaryBuilder::with_capacity(capacity, capacity * 16))
            }
        }
    }

    /// Append the value at `idx` of `row`
    pub(crate) fn append(&mut self, row: &duckdb::Row<'_>, idx: usize) -> duckdb::Result<()> {
        match self {
            ColumnBuilder::Boolean(b) => b.append_option(row.get::<_, Option<bool>>(idx)?),
            ColumnBuilder::Int8(b) => b.append_option(row.get::<_, Option<i8>>(idx)?),
            ColumnBuilder::Int16(b) => b.append_option(row.get::<_, Option<i16>>(idx)?),
            ColumnBuilder::Int32(b) => b.append_option(row.get::<_, Option<i32>>(idx)?),
            ColumnBuilder::Int64(b) => b.append_option(row.get::<_, Option<i64>>(idx)?),
            ColumnBuilder::Int128(b) => b.append_option(row.get::<_, Option<i128>>(idx)?),
            ColumnBuilder::Float64(b) => b.append_option(row.get::<_, Option<f64>>(idx)?),
            ColumnBuilder::Utf8(b) => b.append_option(row.get::<_, Option<String>>(idx)?),
            ColumnBuilder::Binary(b) => b.append_option(row.get::<_, Option<Vec<u8>>>(idx)?),
        }
        Ok(())
    }

    pub(crate) fn finish(self) -> ArrayRef {
        match self {
            ColumnBuilder::Boolean(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int8(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int16(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int32(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Int128(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Float64(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Utf8(mut b) => Arc::new(b.finish()),
            ColumnBuilder::Binary(mut b) => Arc::new(b.finish()),
        }
    }
}
