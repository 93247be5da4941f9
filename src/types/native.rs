//! DuckDB native type names
//!
//! The engine reports column types as strings (`DESCRIBE` output). This
//! module parses them into [`NativeType`]. Parsing never fails: names the
//! parser does not recognize are kept verbatim in [`NativeType::Other`] and
//! left for the type bridge to reject.

use std::fmt;

/// Storage precision of a naive timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimestampPrecision {
    Seconds,
    Millis,
    Micros,
    Nanos,
}

/// A parsed DuckDB column type
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NativeType {
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    HugeInt,
    UTinyInt,
    USmallInt,
    UInteger,
    UBigInt,
    UHugeInt,
    Float,
    Double,
    Decimal { precision: u8, scale: u8 },
    Varchar,
    Blob,
    Uuid,
    Bit,
    Interval,
    Json,
    /// Type of an untyped `NULL` literal
    Null,
    Date,
    Time,
    TimeTz,
    Timestamp(TimestampPrecision),
    TimestampTz,
    Enum,
    List(Box<NativeType>),
    Array(Box<NativeType>, usize),
    Struct(Vec<(String, NativeType)>),
    Map(Box<NativeType>, Box<NativeType>),
    Union(Vec<(String, NativeType)>),
    /// Unrecognized name, kept as reported
    Other(String),
}

/// DuckDB's default DECIMAL width when none is given
const DEFAULT_DECIMAL: (u8, u8) = (18, 3);

impl NativeType {
    /// Parse a DuckDB type name as printed by `DESCRIBE`
    pub fn parse(name: &str) -> NativeType {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return NativeType::Other(String::new());
        }

        // Array suffixes bind loosest, so peel them off from the right
        if let Some((inner, suffix)) = split_array_suffix(trimmed) {
            let element = Box::new(NativeType::parse(inner));
            return match suffix {
                None => NativeType::List(element),
                Some(size) => NativeType::Array(element, size),
            };
        }

        let (head, args) = match trimmed.find('(') {
            Some(open) if trimmed.ends_with(')') => {
                (trimmed[..open].trim(), Some(&trimmed[open + 1..trimmed.len() - 1]))
            }
            _ => (trimmed, None),
        };
        let upper = head.to_ascii_uppercase();
        // Collapse inner whitespace so "TIMESTAMP  WITH TIME ZONE" still matches
        let upper = upper.split_whitespace().collect::<Vec<_>>().join(" ");

        match (upper.as_str(), args) {
            ("BOOLEAN" | "BOOL" | "LOGICAL", None) => NativeType::Boolean,
            ("TINYINT" | "INT1", None) => NativeType::TinyInt,
            ("SMALLINT" | "INT2" | "SHORT", None) => NativeType::SmallInt,
            ("INTEGER" | "INT" | "INT4" | "SIGNED", None) => NativeType::Integer,
            ("BIGINT" | "INT8" | "LONG", None) => NativeType::BigInt,
            ("HUGEINT" | "INT128", None) => NativeType::HugeInt,
            ("UTINYINT" | "UINT8", None) => NativeType::UTinyInt,
            ("USMALLINT" | "UINT16", None) => NativeType::USmallInt,
            ("UINTEGER" | "UINT32", None) => NativeType::UInteger,
            ("UBIGINT" | "UINT64", None) => NativeType::UBigInt,
            ("UHUGEINT" | "UINT128", None) => NativeType::UHugeInt,
            ("FLOAT" | "FLOAT4" | "REAL", None) => NativeType::Float,
            ("DOUBLE" | "FLOAT8", None) => NativeType::Double,
            ("DECIMAL" | "NUMERIC", args) => parse_decimal(args)
                .unwrap_or_else(|| NativeType::Other(trimmed.to_string())),
            ("VARCHAR" | "CHAR" | "BPCHAR" | "TEXT" | "STRING", _) => NativeType::Varchar,
            ("BLOB" | "BYTEA" | "BINARY" | "VARBINARY", None) => NativeType::Blob,
            ("UUID", None) => NativeType::Uuid,
            ("BIT" | "BITSTRING", None) => NativeType::Bit,
            ("INTERVAL", None) => NativeType::Interval,
            ("JSON", None) => NativeType::Json,
            ("NULL", None) => NativeType::Null,
            ("DATE", None) => NativeType::Date,
            ("TIME", None) => NativeType::Time,
            ("TIME WITH TIME ZONE" | "TIMETZ", None) => NativeType::TimeTz,
            ("TIMESTAMP" | "DATETIME" | "TIMESTAMP_US", None) => {
                NativeType::Timestamp(TimestampPrecision::Micros)
            }
            ("TIMESTAMP_S", None) => NativeType::Timestamp(TimestampPrecision::Seconds),
            ("TIMESTAMP_MS", None) => NativeType::Timestamp(TimestampPrecision::Millis),
            ("TIMESTAMP_NS", None) => NativeType::Timestamp(TimestampPrecision::Nanos),
            ("TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ", None) => NativeType::TimestampTz,
            ("ENUM", Some(_)) => NativeType::Enum,
            ("STRUCT" | "ROW", Some(body)) => parse_fields(body)
                .map(NativeType::Struct)
                .unwrap_or_else(|| NativeType::Other(trimmed.to_string())),
            ("UNION", Some(body)) => parse_fields(body)
                .map(NativeType::Union)
                .unwrap_or_else(|| NativeType::Other(trimmed.to_string())),
            ("MAP", Some(body)) => {
                let parts = split_top_level(body);
                if parts.len() == 2 {
                    NativeType::Map(
                        Box::new(NativeType::parse(parts[0])),
                        Box::new(NativeType::parse(parts[1])),
                    )
                } else {
                    NativeType::Other(trimmed.to_string())
                }
            }
            _ => NativeType::Other(trimmed.to_string()),
        }
    }

    /// Whether the type holds nested values
    pub fn is_nested(&self) -> bool {
        matches!(
            self,
            NativeType::List(_)
                | NativeType::Array(..)
                | NativeType::Struct(_)
                | NativeType::Map(..)
                | NativeType::Union(_)
                | NativeType::Json
        )
    }
}

impl fmt::Display for NativeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeType::Boolean => f.write_str("BOOLEAN"),
            NativeType::TinyInt => f.write_str("TINYINT"),
            NativeType::SmallInt => f.write_str("SMALLINT"),
            NativeType::Integer => f.write_str("INTEGER"),
            NativeType::BigInt => f.write_str("BIGINT"),
            NativeType::HugeInt => f.write_str("HUGEINT"),
            NativeType::UTinyInt => f.write_str("UTINYINT"),
            NativeType::USmallInt => f.write_str("USMALLINT"),
            NativeType::UInteger => f.write_str("UINTEGER"),
            NativeType::UBigInt => f.write_str("UBIGINT"),
            NativeType::UHugeInt => f.write_str("UHUGEINT"),
            NativeType::Float => f.write_str("FLOAT"),
            NativeType::Double => f.write_str("DOUBLE"),
            NativeType::Decimal { precision, scale } => {
                write!(f, "DECIMAL({},{})", precision, scale)
            }
            NativeType::Varchar => f.write_str("VARCHAR"),
            NativeType::Blob => f.write_str("BLOB"),
            NativeType::Uuid => f.write_str("UUID"),
            NativeType::Bit => f.write_str("BIT"),
            NativeType::Interval => f.write_str("INTERVAL"),
            NativeType::Json => f.write_str("JSON"),
            NativeType::Null => f.write_str("NULL"),
            NativeType::Date => f.write_str("DATE"),
            NativeType::Time => f.write_str("TIME"),
            NativeType::TimeTz => f.write_str("TIME WITH TIME ZONE"),
            NativeType::Timestamp(TimestampPrecision::Micros) => f.write_str("TIMESTAMP"),
            NativeType::Timestamp(TimestampPrecision::Seconds) => f.write_str("TIMESTAMP_S"),
            NativeType::Timestamp(TimestampPrecision::Millis) => f.write_str("TIMESTAMP_MS"),
            NativeType::Timestamp(TimestampPrecision::Nanos) => f.write_str("TIMESTAMP_NS"),
            NativeType::TimestampTz => f.write_str("TIMESTAMP WITH TIME ZONE"),
            NativeType::Enum => f.write_str("ENUM"),
            NativeType::List(inner) => write!(f, "{}[]", inner),
            NativeType::Array(inner, size) => write!(f, "{}[{}]", inner, size),
            NativeType::Struct(fields) => write!(f, "STRUCT({})", join_fields(fields)),
            NativeType::Map(k, v) => write!(f, "MAP({}, {})", k, v),
            NativeType::Union(fields) => write!(f, "UNION({})", join_fields(fields)),
            NativeType::Other(name) => f.write_str(name),
        }
    }
}

fn join_fields(fields: &[(String, NativeType)]) -> String {
    fields
        .iter()
        .map(|(name, ty)| format!("{} {}", name, ty))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Split a trailing `[]` or `[N]` suffix at nesting depth zero.
///
/// Returns the element type text and `Some(N)` for fixed-size arrays.
fn split_array_suffix(s: &str) -> Option<(&str, Option<usize>)> {
    if !s.ends_with(']') {
        return None;
    }
    let open = s.rfind('[')?;
    // Brackets inside parentheses or quotes belong to a nested type
    if depth_at(s, open) != 0 {
        return None;
    }
    let inner = s[..open].trim_end();
    if inner.is_empty() {
        return None;
    }
    let size_text = s[open + 1..s.len() - 1].trim();
    if size_text.is_empty() {
        Some((inner, None))
    } else {
        size_text.parse::<usize>().ok().map(|n| (inner, Some(n)))
    }
}

/// Parenthesis depth (outside quotes) at byte offset `pos`
fn depth_at(s: &str, pos: usize) -> i32 {
    let mut depth = 0;
    let mut quote: Option<char> = None;
    for (i, c) in s.char_indices() {
        if i >= pos {
            break;
        }
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => depth -= 1,
            _ => {}
        }
    }
    if quote.is_some() {
        // Unbalanced quote: treat as nested so nothing gets split
        return 1;
    }
    depth
}

/// Split on commas that are not inside parentheses, brackets or quotes
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '(' | '[') => depth += 1,
            (None, ')' | ']') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = s[start..].trim();
    if !last.is_empty() || !parts.is_empty() {
        parts.push(last);
    }
    parts
}

fn parse_decimal(args: Option<&str>) -> Option<NativeType> {
    let (precision, scale) = match args {
        None => DEFAULT_DECIMAL,
        Some(body) => {
            let parts = split_top_level(body);
            match parts.as_slice() {
                [p] => (p.parse().ok()?, 0),
                [p, s] => (p.parse().ok()?, s.parse().ok()?),
                _ => return None,
            }
        }
    };
    if precision == 0 || precision > 38 || scale > precision {
        return None;
    }
    Some(NativeType::Decimal { precision, scale })
}

/// Parse `name TYPE, "quoted name" TYPE, ...` member lists
fn parse_fields(body: &str) -> Option<Vec<(String, NativeType)>> {
    split_top_level(body)
        .into_iter()
        .map(|member| {
            let (name, rest) = if let Some(stripped) = member.strip_prefix('"') {
                let mut name = String::new();
                let mut chars = stripped.char_indices().peekable();
                let mut end = None;
                while let Some((i, c)) = chars.next() {
                    if c == '"' {
                        if matches!(chars.peek(), Some((_, '"'))) {
                            name.push('"');
                            chars.next();
                            continue;
                        }
                        end = Some(i + 1);
                        break;
                    }
                    name.push(c);
                }
                (name, &stripped[end?..])
            } else {
                let split = member.find(char::is_whitespace)?;
                (member[..split].to_string(), &member[split..])
            };
            let ty = rest.trim();
            if ty.is_empty() {
                return None;
            }
            Some((name, NativeType::parse(ty)))
        })
        .collect()
}
