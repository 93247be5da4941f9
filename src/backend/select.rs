//! Backend selection
//!
//! Pure function over the probed capability table: no I/O, no retries,
//! and no fallback beyond the configured candidates.

use crate::backend::BackendCapability;
use crate::config::ExportConfig;
use crate::error::{NoBackendAvailableError, Rejection};
use crate::types::ColumnSchema;

/// Candidate backend names in the order they are tried.
///
/// The configured preference when present; otherwise the primary backend
/// followed by the rest in table order.
pub fn candidate_order(config: &ExportConfig, capabilities: &[BackendCapability]) -> Vec<String> {
    if !config.backend_preference.is_empty() {
        return config.backend_preference.clone();
    }
    let primary = capabilities.iter().filter(|c| c.primary);
    let others = capabilities.iter().filter(|c| !c.primary);
    primary.chain(others).map(|c| c.name.to_string()).collect()
}

/// Pick the first candidate able to write `schema` in the configured format
pub fn select<'a>(
    config: &ExportConfig,
    capabilities: &'a [BackendCapability],
    schema: &ColumnSchema,
) -> Result<&'a BackendCapability, NoBackendAvailableError> {
    let required = schema.required_kinds();
    let widest = schema.widest_integer();
    let mut rejected = Vec::new();

    for name in candidate_order(config, capabilities) {
        let reason = match capabilities.iter().find(|c| c.name == name) {
            None => "unknown backend".to_string(),
            Some(cap) if !cap.available => match &cap.note {
                Some(note) => format!("not available ({})", note),
                None => "not available".to_string(),
            },
            Some(cap) => match cap.kinds_for(config.format) {
                None => format!("does not write {}", config.format),
                Some(kinds) if !kinds.is_superset_of(required) => {
                    let missing = kinds
                        .missing(required)
                        .iter()
                        .map(|k| k.name())
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("cannot write {} columns as {}", missing, config.format)
                }
                Some(_) => match widest {
                    Some(width) if cap.stored_width(width).is_none() => {
                        format!("stores no integer width >= {}", width)
                    }
                    _ => return Ok(cap),
                },
            },
        };
        rejected.push(Rejection {
            backend: name,
            reason,
        });
    }

    Err(NoBackendAvailableError {
        format: config.format,
        rejected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FormatSupport;
    use crate::config::{load, OutputFormat};
    use crate::types::{ColumnSpec, IntWidth, KindSet, LogicalKind, LogicalType, NativeType};

    fn table() -> Vec<BackendCapability> {
        vec![
            BackendCapability {
                name: "arrow",
                primary: true,
                formats: vec![
                    FormatSupport {
                        format: OutputFormat::Parquet,
                        kinds: KindSet::ALL,
                    },
                    FormatSupport {
                        format: OutputFormat::Csv,
                        kinds: KindSet::ALL.without(LogicalKind::Binary),
                    },
                ],
                integer_widths: IntWidth::ALL.to_vec(),
                available: true,
                note: None,
            },
            BackendCapability {
                name: "duckdb",
                primary: false,
                formats: vec![FormatSupport {
                    format: OutputFormat::Parquet,
                    kinds: KindSet::ALL.without(LogicalKind::Nested),
                }],
                integer_widths: vec![IntWidth::W64],
                available: true,
                note: None,
            },
            BackendCapability {
                name: "offline",
                primary: false,
                formats: vec![FormatSupport {
                    format: OutputFormat::Parquet,
                    kinds: KindSet::ALL,
                }],
                integer_widths: IntWidth::ALL.to_vec(),
                available: false,
                note: Some("feature disabled".into()),
            },
        ]
    }

    fn config(extra: &str) -> ExportConfig {
        load(&format!("source: t\noutput_path: out.parquet\n{}", extra))
            .unwrap()
            .config
    }

    fn schema(types: &[LogicalType]) -> ColumnSchema {
        ColumnSchema::new(
            types
                .iter()
                .enumerate()
                .map(|(i, ty)| ColumnSpec {
                    name: format!("c{}", i),
                    logical: *ty,
                    native: NativeType::Varchar,
                    timezone: None,
                })
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_primary_first_without_preference() {
        let caps = table();
        let chosen = select(&config(""), &caps, &schema(&[LogicalType::String])).unwrap();
        assert_eq!(chosen.name, "arrow");
    }

    #[test]
    fn test_preference_order_honored() {
        let caps = table();
        let cfg = config("backend_preference: [duckdb, arrow]");
        let chosen = select(&cfg, &caps, &schema(&[LogicalType::Float])).unwrap();
        assert_eq!(chosen.name, "duckdb");
    }

    #[test]
    fn test_skips_backend_lacking_kind() {
        let caps = table();
        let cfg = config("backend_preference: [duckdb, arrow]");
        let chosen = select(&cfg, &caps, &schema(&[LogicalType::Nested])).unwrap();
        assert_eq!(chosen.name, "arrow");
    }

    #[test]
    fn test_skips_backend_lacking_integer_width() {
        let caps = table();
        let cfg = config("backend_preference: [duckdb, arrow]");
        let chosen = select(
            &cfg,
            &caps,
            &schema(&[LogicalType::Integer(IntWidth::W128)]),
        )
        .unwrap();
        assert_eq!(chosen.name, "arrow");
    }

    #[test]
    fn test_unavailable_only_candidate_fails() {
        let caps = table();
        let cfg = config("backend_preference: [offline]");
        let err = select(&cfg, &caps, &schema(&[LogicalType::String])).unwrap_err();
        assert_eq!(err.rejected.len(), 1);
        assert_eq!(err.rejected[0].backend, "offline");
        assert!(err.rejected[0].reason.contains("feature disabled"));
    }

    #[test]
    fn test_every_rejection_reported() {
        let caps = table();
        let cfg = config("format: csv\nbackend_preference: [fastwriter, duckdb, arrow]");
        let err = select(&cfg, &caps, &schema(&[LogicalType::Binary])).unwrap_err();

        let reasons: Vec<(&str, &str)> = err
            .rejected
            .iter()
            .map(|r| (r.backend.as_str(), r.reason.as_str()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("fastwriter", "unknown backend"),
                ("duckdb", "does not write csv"),
                ("arrow", "cannot write binary columns as csv"),
            ]
        );
    }

    #[test]
    fn test_default_order() {
        let caps = table();
        assert_eq!(
            candidate_order(&config(""), &caps),
            vec!["arrow", "duckdb", "offline"]
        );
    }
}
