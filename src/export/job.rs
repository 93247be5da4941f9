//! Export job state machine

use crate::backend::{
    fit_and_select, BackendRegistry, ProgressCallback, WriteControl, WriteOptions,
};
use crate::config::{ExportConfig, OutputFormat};
use crate::deadline::Deadline;
use crate::engine::{QueryRequest, Session};
use crate::error::{ExportError, NoBackendAvailableError, Rejection, Result, TimeoutError};
use crate::export::manifest::{stage_manifest, Manifest};
use crate::export::{ExportState, ExportStats, OutputHandle, Stage};
use crate::types::{coerce, ColumnSchema};
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What `check` reports: the schema as it would be written and the backend
#[derive(Debug, Clone)]
pub struct ExportPlan {
    pub schema: ColumnSchema,
    pub backend: &'static str,
    pub format: OutputFormat,
    pub rows: usize,
}

/// One configured export, driven through [`ExportState`]
pub struct ExportJob {
    config: ExportConfig,
    session: Arc<Session>,
    registry: Arc<BackendRegistry>,
    cancel: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
    deadline: Deadline,
    state: ExportState,
}

impl ExportJob {
    pub fn new(
        config: ExportConfig,
        session: Arc<Session>,
        registry: Arc<BackendRegistry>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            session,
            registry,
            cancel,
            progress: None,
            deadline: Deadline::unbounded(),
            state: ExportState::Idle,
        }
    }

    /// Report `(rows_written, total_rows)` while writing
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn config(&self) -> &ExportConfig {
        &self.config
    }

    pub fn state(&self) -> &ExportState {
        &self.state
    }

    /// Perform one transition.
    ///
    /// A failed transition moves the job to `Failed` and returns the error;
    /// a job already `Done` or `Failed` refuses to step.
    pub fn step(&mut self) -> Result<()> {
        let Some(stage) = self.state.next_stage() else {
            return Err(ExportError::Finished {
                state: self.state.name(),
            });
        };

        let from = self.state.name();
        let current = std::mem::replace(&mut self.state, ExportState::Idle);
        match self.advance(current) {
            Ok(next) => {
                info!(
                    output = %self.config.output_path.display(),
                    "Export {} -> {}",
                    from,
                    next.name()
                );
                self.state = next;
                Ok(())
            }
            Err(e) => {
                warn!(
                    output = %self.config.output_path.display(),
                    stage = %stage,
                    "Export failed: {}",
                    e
                );
                self.state = ExportState::Failed {
                    stage,
                    message: e.to_string(),
                };
                Err(e)
            }
        }
    }

    /// Step until the job is `Done`
    pub fn run(&mut self) -> Result<ExportStats> {
        loop {
            self.step()?;
            if let ExportState::Done(stats) = &self.state {
                return Ok(stats.clone());
            }
        }
    }

    /// Query, coerce and select a backend without writing anything
    pub fn plan(mut self) -> Result<ExportPlan> {
        while matches!(
            self.state,
            ExportState::Idle | ExportState::QueryExecuted(_)
        ) {
            self.step()?;
        }
        let ExportState::TypeCoerced(typed) = std::mem::replace(&mut self.state, ExportState::Idle)
        else {
            return Err(ExportError::Finished {
                state: self.state.name(),
            });
        };

        let rows = typed.num_rows();
        let (backend, fitted) = fit_and_select(&self.config, &self.registry, typed)?;
        Ok(ExportPlan {
            schema: fitted.schema().clone(),
            backend,
            format: self.config.format,
            rows,
        })
    }

    fn advance(&mut self, state: ExportState) -> Result<ExportState> {
        match state {
            ExportState::Idle => {
                self.deadline = Deadline::start(self.config.timeout);
                let request = QueryRequest {
                    setup: self.config.setup.clone(),
                    sql: self.config.source.to_sql(),
                };
                debug!(database = %self.session.label(), source = %self.config.source, "Running query");
                let result = self.session.execute(request, &self.deadline, &self.cancel)?;
                debug!(
                    rows = result.num_rows(),
                    columns = result.num_columns(),
                    "Query materialized"
                );
                Ok(ExportState::QueryExecuted(result))
            }

            ExportState::QueryExecuted(result) => {
                self.interrupted(Stage::Coerce)?;
                let typed = coerce(result, &self.config.type_overrides)?;
                Ok(ExportState::TypeCoerced(typed))
            }

            ExportState::TypeCoerced(typed) => {
                self.interrupted(Stage::Write)?;
                let (backend_name, fitted) = fit_and_select(&self.config, &self.registry, typed)?;
                let backend = self.registry.get(backend_name).ok_or_else(|| {
                    NoBackendAvailableError {
                        format: self.config.format,
                        rejected: vec![Rejection {
                            backend: backend_name.to_string(),
                            reason: "not registered".to_string(),
                        }],
                    }
                })?;
                info!(
                    backend = backend_name,
                    format = %self.config.format,
                    rows = fitted.num_rows(),
                    "Writing output"
                );

                let mut output = OutputHandle::acquire(&self.config.output_path)?;
                let control = WriteControl::new(
                    &self.deadline,
                    &self.cancel,
                    self.progress.as_deref(),
                    fitted.num_rows() as u64,
                );
                let rows = backend.write(
                    &fitted,
                    &mut output,
                    &WriteOptions::from_config(&self.config),
                    &control,
                )?;
                Ok(ExportState::Written {
                    output,
                    backend: backend_name,
                    rows,
                    schema: fitted.schema().clone(),
                })
            }

            ExportState::Written {
                output,
                backend,
                rows,
                schema,
            } => {
                self.interrupted(Stage::Finalize)?;
                let output_path = output.target().to_path_buf();
                let staged = if self.config.write_manifest {
                    let manifest = Manifest::new(self.config.format, backend, rows, &schema);
                    Some(stage_manifest(&output_path, &manifest)?)
                } else {
                    None
                };

                let bytes = output.commit()?;
                let manifest = match staged {
                    Some(handle) => {
                        let path = handle.target().to_path_buf();
                        if let Err(e) = handle.commit() {
                            // Output and manifest land together or not at all
                            if let Err(rm) = fs::remove_file(&output_path) {
                                warn!(
                                    output = %output_path.display(),
                                    "Failed to remove output after manifest error: {}",
                                    rm
                                );
                            }
                            return Err(e.into());
                        }
                        Some(path)
                    }
                    None => None,
                };
                Ok(ExportState::Done(ExportStats {
                    output_path,
                    format: self.config.format,
                    backend,
                    rows,
                    bytes,
                    columns: schema.len(),
                    elapsed: self.deadline.elapsed(),
                    manifest,
                }))
            }

            terminal @ (ExportState::Done(_) | ExportState::Failed { .. }) => {
                Err(ExportError::Finished {
                    state: terminal.name(),
                })
            }
        }
    }

    /// Fail when shutdown was requested or the deadline passed
    fn interrupted(&self, stage: Stage) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(ExportError::Cancelled { stage });
        }
        if self.deadline.expired() {
            return Err(TimeoutError {
                stage,
                limit: self.deadline.limit().unwrap_or_default(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load;
    use crate::error::ConfigError;
    use std::fs;
    use std::path::Path;
    use tempfile::tempdir;

    fn job(document: &str) -> ExportJob {
        let config = load(document).unwrap().config;
        ExportJob::new(
            config,
            Arc::new(Session::open(None).unwrap()),
            Arc::new(BackendRegistry::probe()),
            Arc::new(AtomicBool::new(false)),
        )
    }

    fn document(source: &str, output: &Path, extra: &str) -> String {
        format!(
            "source: \"{}\"\noutput_path: {}\n{}",
            source,
            output.display(),
            extra
        )
    }

    #[test]
    fn test_steps_through_every_state() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.csv");
        let mut job = job(&document(
            "SELECT 1 AS x, 'a' AS y UNION ALL SELECT 2, 'b' ORDER BY x",
            &output,
            "",
        ));

        let mut seen = vec![job.state().name()];
        while !job.state().is_terminal() {
            job.step().unwrap();
            seen.push(job.state().name());
        }
        assert_eq!(
            seen,
            vec!["idle", "query-executed", "type-coerced", "written", "done"]
        );
        assert_eq!(fs::read_to_string(&output).unwrap(), "x,y\n1,a\n2,b\n");

        let err = job.step().unwrap_err();
        assert!(matches!(err, ExportError::Finished { state: "done" }));
    }

    #[test]
    fn test_run_reports_stats() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.parquet");
        let stats = job(&document("SELECT * FROM range(10) t(n)", &output, ""))
            .run()
            .unwrap();

        assert_eq!(stats.rows, 10);
        assert_eq!(stats.columns, 1);
        assert_eq!(stats.backend, "arrow");
        assert_eq!(stats.format, OutputFormat::Parquet);
        assert_eq!(stats.bytes, fs::metadata(&output).unwrap().len());
        assert!(stats.manifest.is_none());
    }

    #[test]
    fn test_unknown_override_fails_in_coerce() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.csv");
        let mut job = job(&document(
            "SELECT 1 AS x",
            &output,
            "type_overrides: { missing: string }",
        ));

        let err = job.run().unwrap_err();
        assert!(matches!(
            err,
            ExportError::Config(ConfigError::UnknownColumn { .. })
        ));
        assert!(matches!(
            job.state(),
            ExportState::Failed {
                stage: Stage::Coerce,
                ..
            }
        ));
        assert!(!output.exists());
    }

    #[test]
    fn test_cancelled_before_query() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.csv");
        let mut job = job(&document("SELECT 1 AS x", &output, ""));
        job.cancel.store(true, Ordering::SeqCst);

        let err = job.run().unwrap_err();
        assert!(matches!(
            err,
            ExportError::Cancelled {
                stage: Stage::Query
            }
        ));
        assert_eq!(err.exit_code(), 130);
        assert!(!output.exists());
    }

    #[test]
    fn test_manifest_written_when_enabled() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.jsonl");
        let stats = job(&document("SELECT 42 AS answer", &output, "write_manifest: true"))
            .run()
            .unwrap();

        let manifest = stats.manifest.unwrap();
        assert_eq!(manifest, dir.path().join("out.jsonl.manifest.json"));
        let text = fs::read_to_string(manifest).unwrap();
        assert!(text.contains("\"answer\""));
        assert!(text.contains("\"jsonl\""));
    }

    #[test]
    fn test_manifest_failure_leaves_no_output() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.csv");
        fs::create_dir(dir.path().join("out.csv.manifest.json")).unwrap();
        let mut job = job(&document("SELECT 1 AS x", &output, "write_manifest: true"));

        let err = job.run().unwrap_err();
        assert_eq!(err.exit_code(), 7);
        assert!(matches!(
            job.state(),
            ExportState::Failed {
                stage: Stage::Finalize,
                ..
            }
        ));
        assert!(!output.exists());
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["out.csv.manifest.json".to_string()]);
    }

    #[test]
    fn test_plan_writes_nothing() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out.csv");
        let plan = job(&document(
            "SELECT 1::INTEGER AS a, 'x' AS b",
            &output,
            "backend_preference: [duckdb, arrow]",
        ))
        .plan()
        .unwrap();

        assert_eq!(plan.rows, 1);
        assert_eq!(plan.schema.len(), 2);
        assert_eq!(plan.format, OutputFormat::Csv);
        if cfg!(feature = "duckdb-copy") {
            assert_eq!(plan.backend, "duckdb");
        } else {
            assert_eq!(plan.backend, "arrow");
        }
        assert!(!output.exists());
    }
}
