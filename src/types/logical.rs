//! Canonical logical types shared by every export backend

use arrow::datatypes::{DataType, TimeUnit};
use std::fmt;
use std::str::FromStr;

/// Field metadata key holding the logical type name
pub const META_LOGICAL_TYPE: &str = "duckport.logical_type";
/// Field metadata key holding the engine's native type name
pub const META_NATIVE_TYPE: &str = "duckport.native_type";
/// Field metadata key holding the source time zone of a timestamp column
pub const META_TIMEZONE: &str = "duckport.timezone";
/// Arrow extension metadata marking nested values carried as JSON text
pub const EXTENSION_NAME_KEY: &str = "ARROW:extension:name";
pub const JSON_EXTENSION_NAME: &str = "arrow.json";

/// Time zone all exported timestamps are normalized to
pub const CANONICAL_TIMEZONE: &str = "UTC";

/// Signed integer storage width
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
    W128,
}

impl IntWidth {
    pub const ALL: [IntWidth; 5] = [
        IntWidth::W8,
        IntWidth::W16,
        IntWidth::W32,
        IntWidth::W64,
        IntWidth::W128,
    ];

    pub fn bits(self) -> u32 {
        match self {
            IntWidth::W8 => 8,
            IntWidth::W16 => 16,
            IntWidth::W32 => 32,
            IntWidth::W64 => 64,
            IntWidth::W128 => 128,
        }
    }

    /// Next wider width, if any
    pub fn wider(self) -> Option<IntWidth> {
        match self {
            IntWidth::W8 => Some(IntWidth::W16),
            IntWidth::W16 => Some(IntWidth::W32),
            IntWidth::W32 => Some(IntWidth::W64),
            IntWidth::W64 => Some(IntWidth::W128),
            IntWidth::W128 => None,
        }
    }

    fn from_bits(bits: u32) -> Option<IntWidth> {
        IntWidth::ALL.into_iter().find(|w| w.bits() == bits)
    }
}

impl fmt::Display for IntWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "int{}", self.bits())
    }
}

/// Logical type tag without width details
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogicalKind {
    Integer,
    Float,
    String,
    Boolean,
    Timestamp,
    Binary,
    Nested,
}

impl LogicalKind {
    pub const ALL: [LogicalKind; 7] = [
        LogicalKind::Integer,
        LogicalKind::Float,
        LogicalKind::String,
        LogicalKind::Boolean,
        LogicalKind::Timestamp,
        LogicalKind::Binary,
        LogicalKind::Nested,
    ];

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    pub fn name(self) -> &'static str {
        match self {
            LogicalKind::Integer => "integer",
            LogicalKind::Float => "float",
            LogicalKind::String => "string",
            LogicalKind::Boolean => "boolean",
            LogicalKind::Timestamp => "timestamp",
            LogicalKind::Binary => "binary",
            LogicalKind::Nested => "nested",
        }
    }
}

impl fmt::Display for LogicalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Small set of logical kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KindSet(u8);

impl KindSet {
    pub const EMPTY: KindSet = KindSet(0);
    pub const ALL: KindSet = KindSet(0b0111_1111);

    pub fn of(kinds: &[LogicalKind]) -> Self {
        kinds.iter().fold(KindSet::EMPTY, |set, &k| set.with(k))
    }

    pub fn with(self, kind: LogicalKind) -> Self {
        KindSet(self.0 | kind.bit())
    }

    pub fn without(self, kind: LogicalKind) -> Self {
        KindSet(self.0 & !kind.bit())
    }

    pub fn contains(self, kind: LogicalKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn is_superset_of(self, other: KindSet) -> bool {
        other.0 & !self.0 == 0
    }

    /// Kinds in `other` that this set lacks
    pub fn missing(self, other: KindSet) -> Vec<LogicalKind> {
        other.iter().filter(|k| !self.contains(*k)).collect()
    }

    pub fn iter(self) -> impl Iterator<Item = LogicalKind> {
        LogicalKind::ALL.into_iter().filter(move |k| self.contains(*k))
    }
}

impl fmt::Display for KindSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(LogicalKind::name).collect();
        f.write_str(&names.join(", "))
    }
}

/// Canonical, backend-independent column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Integer(IntWidth),
    Float,
    String,
    Boolean,
    /// Microseconds since the Unix epoch, UTC
    Timestamp,
    Binary,
    /// Lists, structs, maps and unions, carried as JSON text
    Nested,
}

impl LogicalType {
    pub fn kind(self) -> LogicalKind {
        match self {
            LogicalType::Integer(_) => LogicalKind::Integer,
            LogicalType::Float => LogicalKind::Float,
            LogicalType::String => LogicalKind::String,
            LogicalType::Boolean => LogicalKind::Boolean,
            LogicalType::Timestamp => LogicalKind::Timestamp,
            LogicalType::Binary => LogicalKind::Binary,
            LogicalType::Nested => LogicalKind::Nested,
        }
    }

    /// Arrow representation of values of this type
    pub fn arrow_type(self) -> DataType {
        match self {
            LogicalType::Integer(IntWidth::W8) => DataType::Int8,
            LogicalType::Integer(IntWidth::W16) => DataType::Int16,
            LogicalType::Integer(IntWidth::W32) => DataType::Int32,
            LogicalType::Integer(IntWidth::W64) => DataType::Int64,
            LogicalType::Integer(IntWidth::W128) => DataType::Decimal128(38, 0),
            LogicalType::Float => DataType::Float64,
            LogicalType::String | LogicalType::Nested => DataType::Utf8,
            LogicalType::Boolean => DataType::Boolean,
            LogicalType::Timestamp => {
                DataType::Timestamp(TimeUnit::Microsecond, Some(CANONICAL_TIMEZONE.into()))
            }
            LogicalType::Binary => DataType::Binary,
        }
    }

    pub fn int_width(self) -> Option<IntWidth> {
        match self {
            LogicalType::Integer(w) => Some(w),
            _ => None,
        }
    }
}

impl fmt::Display for LogicalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalType::Integer(w) => write!(f, "{}", w),
            other => f.write_str(other.kind().name()),
        }
    }
}

impl FromStr for LogicalType {
    type Err = String;

    /// Parse a logical type name as written in configuration.
    ///
    /// Integer widths are given in bits (`int8` is one byte), unlike
    /// DuckDB's own `INT8` alias.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let ty = match name.as_str() {
            "integer" | "int" | "bigint" => LogicalType::Integer(IntWidth::W64),
            "float" | "double" | "float64" => LogicalType::Float,
            "string" | "varchar" | "text" | "utf8" => LogicalType::String,
            "boolean" | "bool" => LogicalType::Boolean,
            "timestamp" | "datetime" => LogicalType::Timestamp,
            "binary" | "blob" | "bytes" => LogicalType::Binary,
            "nested" | "json" => LogicalType::Nested,
            other => {
                let width = other
                    .strip_prefix("int")
                    .and_then(|bits| bits.parse::<u32>().ok())
                    .and_then(IntWidth::from_bits);
                match width {
                    Some(w) => LogicalType::Integer(w),
                    None => {
                        return Err(format!(
                            "unknown logical type '{}' (expected integer, int8..int128, float, \
                             string, boolean, timestamp, binary or nested)",
                            s.trim()
                        ))
                    }
                }
            }
        };
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_set_superset() {
        let all = KindSet::ALL;
        let no_binary = all.without(LogicalKind::Binary);
        let needed = KindSet::of(&[LogicalKind::Integer, LogicalKind::Binary]);

        assert!(all.is_superset_of(needed));
        assert!(!no_binary.is_superset_of(needed));
        assert_eq!(no_binary.missing(needed), vec![LogicalKind::Binary]);
        assert!(no_binary.is_superset_of(KindSet::EMPTY));
    }

    #[test]
    fn test_kind_set_display() {
        let set = KindSet::of(&[LogicalKind::Nested, LogicalKind::Integer]);
        assert_eq!(set.to_string(), "integer, nested");
    }

    #[test]
    fn test_parse_logical_names() {
        assert_eq!(
            "integer".parse::<LogicalType>(),
            Ok(LogicalType::Integer(IntWidth::W64))
        );
        assert_eq!(
            "int8".parse::<LogicalType>(),
            Ok(LogicalType::Integer(IntWidth::W8))
        );
        assert_eq!(
            "INT128".parse::<LogicalType>(),
            Ok(LogicalType::Integer(IntWidth::W128))
        );
        assert_eq!("json".parse::<LogicalType>(), Ok(LogicalType::Nested));
        assert_eq!(" String ".parse::<LogicalType>(), Ok(LogicalType::String));
        assert!("int12".parse::<LogicalType>().is_err());
        assert!("decimal".parse::<LogicalType>().is_err());
    }

    #[test]
    fn test_display_matches_parse() {
        for ty in [
            LogicalType::Integer(IntWidth::W16),
            LogicalType::Float,
            LogicalType::String,
            LogicalType::Boolean,
            LogicalType::Timestamp,
            LogicalType::Binary,
            LogicalType::Nested,
        ] {
            assert_eq!(ty.to_string().parse::<LogicalType>(), Ok(ty));
        }
    }

    #[test]
    fn test_arrow_types() {
        assert_eq!(
            LogicalType::Integer(IntWidth::W128).arrow_type(),
            DataType::Decimal128(38, 0)
        );
        assert_eq!(LogicalType::Nested.arrow_type(), DataType::Utf8);
        assert_eq!(
            LogicalType::Timestamp.arrow_type(),
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
        );
    }

    #[test]
    fn test_width_ordering() {
        assert!(IntWidth::W8 < IntWidth::W128);
        assert_eq!(IntWidth::W32.wider(), Some(IntWidth::W64));
        assert_eq!(IntWidth::W128.wider(), None);
    }
}
