//! Type bridge between engine columns and canonical logical types
//!
//! Every column is fetched from the engine in a *transport form*: a SQL
//! projection that turns the native value into something an Arrow builder
//! can hold without losing information (epoch microseconds for
//! timestamps, JSON text for nested values, a wider signed integer for
//! unsigned ones). [`coerce`] then turns the transport arrays into the
//! canonical representation of each [`LogicalType`] and applies the
//! configured overrides.

use crate::backend::BackendCapability;
use crate::config::OutputFormat;
use crate::engine::QueryResult;
use crate::error::{ConfigError, ExportError, SchemaMismatchError, UnsupportedTypeError};
use crate::types::logical::{IntWidth, LogicalType, CANONICAL_TIMEZONE};
use crate::types::native::{NativeType, TimestampPrecision};
use crate::types::schema::{ColumnSchema, ColumnSpec, TypedResult};
use arrow::array::{Array, ArrayRef, AsArray};
use arrow::compute::{can_cast_types, cast_with_options, CastOptions};
use arrow::datatypes::{DataType, Decimal128Type, Int64Type, TimestampMicrosecondType};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Shape a column takes on its way out of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Boolean,
    Int8,
    Int16,
    Int32,
    Int64,
    Int128,
    Float64,
    Text,
    /// JSON document text
    Json,
    Binary,
    /// Microseconds since the Unix epoch
    EpochMicros,
    /// Rendered as text only so the query succeeds; rejected at coercion
    Opaque,
}

impl Transport {
    /// Transport form used for a native type
    pub fn of(native: &NativeType) -> Transport {
        match native {
            NativeType::Boolean => Transport::Boolean,
            NativeType::TinyInt => Transport::Int8,
            NativeType::SmallInt | NativeType::UTinyInt => Transport::Int16,
            NativeType::Integer | NativeType::USmallInt => Transport::Int32,
            NativeType::BigInt | NativeType::UInteger => Transport::Int64,
            NativeType::HugeInt | NativeType::UBigInt => Transport::Int128,
            NativeType::Float | NativeType::Double => Transport::Float64,
            NativeType::Decimal { precision, scale } => match (precision, scale) {
                (p, 0) if *p <= 18 => Transport::Int64,
                (_, 0) => Transport::Int128,
                _ => Transport::Float64,
            },
            NativeType::Varchar
            | NativeType::Uuid
            | NativeType::Bit
            | NativeType::Interval
            | NativeType::Enum
            | NativeType::Time
            | NativeType::TimeTz
            | NativeType::Null => Transport::Text,
            NativeType::Blob => Transport::Binary,
            NativeType::Date | NativeType::Timestamp(_) | NativeType::TimestampTz => {
                Transport::EpochMicros
            }
            NativeType::Json
            | NativeType::List(_)
            | NativeType::Array(..)
            | NativeType::Struct(_)
            | NativeType::Map(..)
            | NativeType::Union(_) => Transport::Json,
            NativeType::UHugeInt | NativeType::Other(_) => Transport::Opaque,
        }
    }

    /// Arrow type of the arrays the engine builds for this transport
    pub fn arrow_type(self) -> DataType {
        match self {
            Transport::Boolean => DataType::Boolean,
            Transport::Int8 => DataType::Int8,
            Transport::Int16 => DataType::Int16,
            Transport::Int32 => DataType::Int32,
            Transport::Int64 | Transport::EpochMicros => DataType::Int64,
            Transport::Int128 => DataType::Decimal128(38, 0),
            Transport::Float64 => DataType::Float64,
            Transport::Text | Transport::Json | Transport::Opaque => DataType::Utf8,
            Transport::Binary => DataType::Binary,
        }
    }
}

/// Map a native type onto its canonical logical type.
///
/// Total over the native universe: every type either maps or is rejected
/// with the reason it has no representation.
pub fn to_logical_type(native: &NativeType) -> Result<LogicalType, UnsupportedTypeError> {
    let logical = match native {
        NativeType::UHugeInt => {
            return Err(UnsupportedTypeError::NoMapping {
                native: native.to_string(),
                reason: "unsigned 128-bit values do not fit any signed integer width",
            })
        }
        NativeType::Other(_) => {
            return Err(UnsupportedTypeError::NoMapping {
                native: native.to_string(),
                reason: "unrecognized engine type",
            })
        }
        NativeType::Boolean => LogicalType::Boolean,
        NativeType::Float | NativeType::Double => LogicalType::Float,
        NativeType::Blob => LogicalType::Binary,
        NativeType::Date | NativeType::Timestamp(_) | NativeType::TimestampTz => {
            LogicalType::Timestamp
        }
        other => match Transport::of(other) {
            Transport::Int8 => LogicalType::Integer(IntWidth::W8),
            Transport::Int16 => LogicalType::Integer(IntWidth::W16),
            Transport::Int32 => LogicalType::Integer(IntWidth::W32),
            Transport::Int64 => LogicalType::Integer(IntWidth::W64),
            Transport::Int128 => LogicalType::Integer(IntWidth::W128),
            Transport::Float64 => LogicalType::Float,
            Transport::Json => LogicalType::Nested,
            _ => LogicalType::String,
        },
    };
    Ok(logical)
}

/// Quote an identifier for use in generated SQL
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// SQL expression fetching `column` in its transport form
pub fn transport_expr(column: &str, native: &NativeType) -> String {
    let col = quote_ident(column);
    match (native, Transport::of(native)) {
        (NativeType::TimestampTz, _) => format!("epoch_us({})", col),
        (NativeType::Timestamp(TimestampPrecision::Micros), _) => format!("epoch_us({})", col),
        (_, Transport::EpochMicros) => format!("epoch_us(CAST({} AS TIMESTAMP))", col),
        (NativeType::Json, _) => format!("CAST({} AS VARCHAR)", col),
        (_, Transport::Json) => format!("CAST(to_json({}) AS VARCHAR)", col),
        (NativeType::Varchar | NativeType::Blob | NativeType::Boolean, _) => col,
        (_, Transport::Text | Transport::Opaque) => format!("CAST({} AS VARCHAR)", col),
        (_, Transport::Int8) => format!("CAST({} AS TINYINT)", col),
        (_, Transport::Int16) => format!("CAST({} AS SMALLINT)", col),
        (_, Transport::Int32) => format!("CAST({} AS INTEGER)", col),
        (_, Transport::Int64) => format!("CAST({} AS BIGINT)", col),
        (_, Transport::Int128) => format!("CAST({} AS HUGEINT)", col),
        (_, Transport::Float64) => format!("CAST({} AS DOUBLE)", col),
        (_, Transport::Boolean | Transport::Binary) => col,
    }
}

/// Coerce a query result into canonical logical types.
///
/// Overrides are applied after the default mapping and must name result
/// columns.
pub fn coerce(
    result: QueryResult,
    overrides: &BTreeMap<String, LogicalType>,
) -> Result<TypedResult, ExportError> {
    for column in overrides.keys() {
        if result.column(column).is_none() {
            return Err(ConfigError::UnknownColumn {
                column: column.clone(),
            }
            .into());
        }
    }

    let mut specs = Vec::with_capacity(result.num_columns());
    let mut arrays = Vec::with_capacity(result.num_columns());

    for column in result.into_columns() {
        let logical =
            to_logical_type(&column.native).map_err(|e| e.in_column(&column.name))?;
        let mut values = canonical_array(&column.name, column.values, logical)?;
        let mut spec = ColumnSpec {
            name: column.name,
            logical,
            native: column.native,
            timezone: column.timezone,
        };

        if let Some(&target) = overrides.get(&spec.name) {
            if target != logical {
                debug!(column = %spec.name, from = %logical, to = %target, "Applying type override");
                values = cast_column(&spec.name, &values, logical, target)?;
                spec.logical = target;
                if target != LogicalType::Timestamp {
                    spec.timezone = None;
                }
            }
        }

        specs.push(spec);
        arrays.push(values);
    }

    let schema = ColumnSchema::new(specs)?;
    TypedResult::try_new(schema, arrays).map_err(|e| {
        UnsupportedTypeError::Batch {
            reason: e.to_string(),
        }
        .into()
    })
}

/// Widen integer columns to widths the backend stores natively.
///
/// Each column moves to the narrowest stored width that is at least as
/// wide as its own; values are never narrowed.
pub fn fit_to_backend(
    typed: TypedResult,
    capability: &BackendCapability,
    format: OutputFormat,
) -> Result<TypedResult, SchemaMismatchError> {
    let needs_widening = typed
        .schema()
        .columns()
        .iter()
        .filter_map(|c| c.logical.int_width())
        .any(|w| !capability.integer_widths.contains(&w));
    if !needs_widening {
        return Ok(typed);
    }

    let mut specs = Vec::with_capacity(typed.schema().len());
    let mut arrays = Vec::with_capacity(typed.schema().len());
    for (spec, values) in typed.schema().columns().iter().zip(typed.batch().columns()) {
        let mut spec = spec.clone();
        let mut values = Arc::clone(values);
        if let Some(width) = spec.logical.int_width() {
            let stored = capability.stored_width(width).ok_or_else(|| {
                SchemaMismatchError::IntegerWidth {
                    backend: capability.name.to_string(),
                    column: spec.name.clone(),
                    width,
                }
            })?;
            if stored != width {
                let target = LogicalType::Integer(stored);
                values = cast_column(&spec.name, &values, spec.logical, target).map_err(|e| {
                    SchemaMismatchError::Rejected {
                        backend: capability.name.to_string(),
                        format,
                        reason: e.to_string(),
                    }
                })?;
                debug!(column = %spec.name, from = %width, to = %stored, "Widened integer column");
                spec.logical = target;
            }
        }
        specs.push(spec);
        arrays.push(values);
    }

    let schema = ColumnSchema::new(specs).map_err(|e| SchemaMismatchError::Rejected {
        backend: capability.name.to_string(),
        format,
        reason: e.to_string(),
    })?;
    TypedResult::try_new(schema, arrays).map_err(|e| SchemaMismatchError::Rejected {
        backend: capability.name.to_string(),
        format,
        reason: e.to_string(),
    })
}

/// Turn a transport array into the canonical array for `logical`
fn canonical_array(
    column: &str,
    values: ArrayRef,
    logical: LogicalType,
) -> Result<ArrayRef, UnsupportedTypeError> {
    let target = logical.arrow_type();
    if values.data_type() == &target {
        check_precision(column, &values, logical, logical)?;
        return Ok(values);
    }
    if logical == LogicalType::Timestamp {
        if let Some(micros) = values.as_primitive_opt::<Int64Type>() {
            let ts = micros
                .reinterpret_cast::<TimestampMicrosecondType>()
                .with_timezone(CANONICAL_TIMEZONE);
            return Ok(Arc::new(ts));
        }
    }
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    cast_with_options(&values, &target, &options).map_err(|e| UnsupportedTypeError::Cast {
        column: column.to_string(),
        from: logical,
        to: logical,
        reason: format!("transport array of type {}: {}", values.data_type(), e),
    })
}

/// Cast a canonical column to another logical type
fn cast_column(
    column: &str,
    values: &ArrayRef,
    from: LogicalType,
    to: LogicalType,
) -> Result<ArrayRef, UnsupportedTypeError> {
    let cast_error = |reason: String| UnsupportedTypeError::Cast {
        column: column.to_string(),
        from,
        to,
        reason,
    };

    let target = to.arrow_type();
    if !can_cast_types(values.data_type(), &target) {
        return Err(cast_error(format!(
            "no conversion from {} to {}",
            values.data_type(),
            target
        )));
    }
    let options = CastOptions {
        safe: false,
        ..Default::default()
    };
    let cast = cast_with_options(values, &target, &options).map_err(|e| cast_error(e.to_string()))?;
    check_precision(column, &cast, from, to)?;

    if to == LogicalType::Nested {
        for (row, text) in cast.as_string::<i32>().iter().enumerate() {
            if let Some(text) = text {
                if let Err(e) = serde_json::from_str::<serde_json::Value>(text) {
                    return Err(cast_error(format!("row {} is not valid JSON: {}", row, e)));
                }
            }
        }
    }
    Ok(cast)
}

/// 128-bit integers live in a `Decimal128(38, 0)`; reject values with 39 digits
fn check_precision(
    column: &str,
    values: &ArrayRef,
    from: LogicalType,
    to: LogicalType,
) -> Result<(), UnsupportedTypeError> {
    let Some(decimals) = values.as_primitive_opt::<Decimal128Type>() else {
        return Ok(());
    };
    decimals
        .validate_decimal_precision(decimals.precision())
        .map_err(|e| UnsupportedTypeError::Cast {
            column: column.to_string(),
            from,
            to,
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCapability, FormatSupport};
    use crate::engine::ResultColumn;
    use crate::types::logical::KindSet;
    use arrow::array::{
        BooleanArray, Decimal128Array, Int16Array, Int32Array, Int64Array, StringArray,
        TimestampMicrosecondArray,
    };

    fn column(name: &str, native: NativeType, values: ArrayRef) -> ResultColumn {
        ResultColumn {
            name: name.to_string(),
            native,
            timezone: None,
            values,
        }
    }

    fn capability(widths: Vec<IntWidth>) -> BackendCapability {
        BackendCapability {
            name: "narrow",
            primary: false,
            formats: vec![FormatSupport {
                format: OutputFormat::Parquet,
                kinds: KindSet::ALL,
            }],
            integer_widths: widths,
            available: true,
            note: None,
        }
    }

    #[test]
    fn test_integer_mapping_widens_unsigned() {
        assert_eq!(
            to_logical_type(&NativeType::TinyInt).unwrap(),
            LogicalType::Integer(IntWidth::W8)
        );
        assert_eq!(
            to_logical_type(&NativeType::UTinyInt).unwrap(),
            LogicalType::Integer(IntWidth::W16)
        );
        assert_eq!(
            to_logical_type(&NativeType::UInteger).unwrap(),
            LogicalType::Integer(IntWidth::W64)
        );
        assert_eq!(
            to_logical_type(&NativeType::UBigInt).unwrap(),
            LogicalType::Integer(IntWidth::W128)
        );
        assert!(to_logical_type(&NativeType::UHugeInt).is_err());
    }

    #[test]
    fn test_decimal_mapping() {
        let dec = |precision, scale| NativeType::Decimal { precision, scale };
        assert_eq!(
            to_logical_type(&dec(18, 0)).unwrap(),
            LogicalType::Integer(IntWidth::W64)
        );
        assert_eq!(
            to_logical_type(&dec(30, 0)).unwrap(),
            LogicalType::Integer(IntWidth::W128)
        );
        assert_eq!(to_logical_type(&dec(10, 2)).unwrap(), LogicalType::Float);
    }

    #[test]
    fn test_mapping_covers_named_types() {
        let cases = [
            (NativeType::Varchar, LogicalType::String),
            (NativeType::Uuid, LogicalType::String),
            (NativeType::Interval, LogicalType::String),
            (NativeType::Enum, LogicalType::String),
            (NativeType::Null, LogicalType::String),
            (NativeType::Boolean, LogicalType::Boolean),
            (NativeType::Double, LogicalType::Float),
            (NativeType::Blob, LogicalType::Binary),
            (NativeType::Date, LogicalType::Timestamp),
            (NativeType::TimestampTz, LogicalType::Timestamp),
            (
                NativeType::Timestamp(TimestampPrecision::Nanos),
                LogicalType::Timestamp,
            ),
            (NativeType::Json, LogicalType::Nested),
            (
                NativeType::List(Box::new(NativeType::Integer)),
                LogicalType::Nested,
            ),
            (
                NativeType::Map(Box::new(NativeType::Varchar), Box::new(NativeType::Integer)),
                LogicalType::Nested,
            ),
        ];
        for (native, expected) in cases {
            assert_eq!(to_logical_type(&native).unwrap(), expected, "{}", native);
        }
    }

    #[test]
    fn test_unknown_native_is_unsupported() {
        let err = to_logical_type(&NativeType::Other("GEOMETRY".into())).unwrap_err();
        assert!(err.to_string().contains("GEOMETRY"));
    }

    #[test]
    fn test_transport_expressions() {
        assert_eq!(
            transport_expr("ts", &NativeType::TimestampTz),
            "epoch_us(\"ts\")"
        );
        assert_eq!(
            transport_expr("d", &NativeType::Date),
            "epoch_us(CAST(\"d\" AS TIMESTAMP))"
        );
        assert_eq!(
            transport_expr("tags", &NativeType::List(Box::new(NativeType::Varchar))),
            "CAST(to_json(\"tags\") AS VARCHAR)"
        );
        assert_eq!(
            transport_expr("n", &NativeType::UBigInt),
            "CAST(\"n\" AS HUGEINT)"
        );
        assert_eq!(transport_expr("we\"ird", &NativeType::Varchar), "\"we\"\"ird\"");
    }

    #[test]
    fn test_coerce_timestamps_to_utc_micros() {
        let mut ts = column(
            "ts",
            NativeType::TimestampTz,
            Arc::new(Int64Array::from(vec![Some(1_700_000_000_000_000), None])),
        );
        ts.timezone = Some("America/New_York".into());
        let result = QueryResult::try_new(vec![ts], 2).unwrap();

        let typed = coerce(result, &BTreeMap::new()).unwrap();
        let spec = &typed.schema().columns()[0];
        assert_eq!(spec.logical, LogicalType::Timestamp);
        assert_eq!(spec.timezone.as_deref(), Some("America/New_York"));

        let values = typed.batch().column(0);
        let ts = values
            .as_any()
            .downcast_ref::<TimestampMicrosecondArray>()
            .unwrap();
        assert_eq!(ts.value(0), 1_700_000_000_000_000);
        assert!(ts.is_null(1));
        assert_eq!(ts.timezone(), Some("UTC"));
    }

    #[test]
    fn test_override_casts_column() {
        let result = QueryResult::try_new(
            vec![
                column("id", NativeType::Integer, Arc::new(Int32Array::from(vec![1, 2]))),
                column(
                    "flag",
                    NativeType::Boolean,
                    Arc::new(BooleanArray::from(vec![true, false])),
                ),
            ],
            2,
        )
        .unwrap();
        let overrides = BTreeMap::from([("id".to_string(), LogicalType::String)]);

        let typed = coerce(result, &overrides).unwrap();
        assert_eq!(typed.schema().columns()[0].logical, LogicalType::String);
        let ids = typed.batch().column(0).as_string::<i32>();
        assert_eq!(ids.value(1), "2");
    }

    #[test]
    fn test_failing_override_is_unsupported_type() {
        let result = QueryResult::try_new(
            vec![column(
                "code",
                NativeType::Varchar,
                Arc::new(StringArray::from(vec!["12", "abc"])),
            )],
            2,
        )
        .unwrap();
        let overrides = BTreeMap::from([(
            "code".to_string(),
            LogicalType::Integer(IntWidth::W32),
        )]);

        let err = coerce(result, &overrides).unwrap_err();
        assert!(matches!(
            err,
            ExportError::UnsupportedType(UnsupportedTypeError::Cast { ref column, .. })
                if column == "code"
        ));
    }

    #[test]
    fn test_override_to_nested_requires_json() {
        let result = QueryResult::try_new(
            vec![column(
                "doc",
                NativeType::Varchar,
                Arc::new(StringArray::from(vec![Some("{\"a\": 1}"), None, Some("nope")])),
            )],
            3,
        )
        .unwrap();
        let overrides = BTreeMap::from([("doc".to_string(), LogicalType::Nested)]);

        let err = coerce(result, &overrides).unwrap_err();
        assert!(err.to_string().contains("row 2"));
    }

    #[test]
    fn test_override_unknown_column() {
        let result = QueryResult::try_new(
            vec![column("x", NativeType::Integer, Arc::new(Int32Array::from(vec![1])))],
            1,
        )
        .unwrap();
        let overrides = BTreeMap::from([("y".to_string(), LogicalType::String)]);

        let err = coerce(result, &overrides).unwrap_err();
        assert!(matches!(
            err,
            ExportError::Config(ConfigError::UnknownColumn { ref column }) if column == "y"
        ));
    }

    #[test]
    fn test_unsupported_column_named_in_error() {
        let result = QueryResult::try_new(
            vec![column(
                "big",
                NativeType::UHugeInt,
                Arc::new(StringArray::from(vec!["1"])),
            )],
            1,
        )
        .unwrap();
        let err = coerce(result, &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedType(_)));
        assert!(err.to_string().contains("'big'"));
    }

    #[test]
    fn test_fit_widens_to_stored_width() {
        let result = QueryResult::try_new(
            vec![column(
                "n",
                NativeType::SmallInt,
                Arc::new(Int16Array::from(vec![Some(7), None])),
            )],
            2,
        )
        .unwrap();
        let typed = coerce(result, &BTreeMap::new()).unwrap();

        let fitted = fit_to_backend(
            typed,
            &capability(vec![IntWidth::W64, IntWidth::W128]),
            OutputFormat::Parquet,
        )
        .unwrap();
        assert_eq!(
            fitted.schema().columns()[0].logical,
            LogicalType::Integer(IntWidth::W64)
        );
        let values = fitted.batch().column(0).as_primitive::<Int64Type>();
        assert_eq!(values.value(0), 7);
        assert!(values.is_null(1));
    }

    #[test]
    fn test_fit_keeps_supported_widths() {
        let result = QueryResult::try_new(
            vec![column("n", NativeType::Integer, Arc::new(Int32Array::from(vec![1])))],
            1,
        )
        .unwrap();
        let typed = coerce(result, &BTreeMap::new()).unwrap();
        let fitted =
            fit_to_backend(typed, &capability(IntWidth::ALL.to_vec()), OutputFormat::Parquet)
                .unwrap();
        assert_eq!(
            fitted.schema().columns()[0].logical,
            LogicalType::Integer(IntWidth::W32)
        );
    }

    #[test]
    fn test_hugeint_beyond_38_digits_is_rejected() {
        let values = Decimal128Array::from(vec![1_i128, i128::MAX])
            .with_precision_and_scale(38, 0)
            .unwrap();
        let result = QueryResult::try_new(
            vec![column("h", NativeType::HugeInt, Arc::new(values))],
            2,
        )
        .unwrap();

        let err = coerce(result, &BTreeMap::new()).unwrap_err();
        assert!(matches!(
            err,
            ExportError::UnsupportedType(UnsupportedTypeError::Cast { ref column, .. })
                if column == "h"
        ));
        assert_eq!(err.exit_code(), 4);
    }

    #[test]
    fn test_fit_fails_without_wide_enough_width() {
        let values = Decimal128Array::from(vec![1_i128])
            .with_precision_and_scale(38, 0)
            .unwrap();
        let result = QueryResult::try_new(
            vec![column("huge", NativeType::HugeInt, Arc::new(values))],
            1,
        )
        .unwrap();
        let typed = coerce(result, &BTreeMap::new()).unwrap();

        let err = fit_to_backend(typed, &capability(vec![IntWidth::W64]), OutputFormat::Parquet)
            .unwrap_err();
        assert!(matches!(
            err,
            SchemaMismatchError::IntegerWidth { ref column, width: IntWidth::W128, .. }
                if column == "huge"
        ));
    }
}
