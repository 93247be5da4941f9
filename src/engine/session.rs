//! Shared DuckDB session
//!
//! A [`Session`] owns one DuckDB connection behind a mutex. Queries run on
//! a worker thread so the caller can give up on them: when the deadline
//! passes or shutdown is requested the running statement is interrupted
//! through the connection's interrupt handle, or dropped before it starts
//! if it was still waiting for the connection.
//!
//! An abandoned worker keeps the connection locked until its statement
//! stops, so the next query on the same session waits for it. Only
//! file-backed sessions are shared between exports; every in-memory export
//! gets a database of its own.

use crate::deadline::Deadline;
use crate::engine::result::{ColumnBuilder, QueryResult, ResultColumn};
use crate::error::{ExportError, QueryExecutionError, TimeoutError};
use crate::export::Stage;
use crate::types::bridge::quote_ident;
use crate::types::{transport_expr, NativeType, Transport};
use crossbeam_channel::{bounded, RecvTimeoutError};
use duckdb::{Connection, InterruptHandle};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// How often a waiting caller re-checks the deadline and shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Initial builder capacity per column
const INITIAL_CAPACITY: usize = 1024;

/// Rows fetched between checks for an abandoned query
const ROWS_PER_CHECK: usize = 4096;

/// Label used for in-memory databases in messages
const IN_MEMORY: &str = ":memory:";

/// One query to run against a session
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// Statements run before the query, outside its transaction
    pub setup: Vec<String>,
    /// Query text producing the exported rows
    pub sql: String,
}

/// Progress of a query handed to the worker thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Waiting,
    Running,
    Done,
    Abandoned,
}

/// What the worker checks between phases to learn it should stop
struct Watch<'a> {
    state: &'a Mutex<RunState>,
    deadline: Deadline,
}

impl Watch<'_> {
    fn abandoned(&self) -> Result<(), QueryExecutionError> {
        if *self.state.lock() == RunState::Abandoned || self.deadline.expired() {
            return Err(QueryExecutionError::Abandoned);
        }
        Ok(())
    }
}

/// A DuckDB connection shared by the exports of one database
pub struct Session {
    label: String,
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
}

impl Session {
    /// Open a session on a database file, or in memory when `None`
    pub fn open(database: Option<&Path>) -> Result<Self, QueryExecutionError> {
        let label = database
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| IN_MEMORY.to_string());
        let conn = match database {
            Some(path) => Connection::open(path),
            None => Connection::open_in_memory(),
        }
        .map_err(|source| QueryExecutionError::Open {
            path: label.clone(),
            source,
        })?;

        debug!(database = %label, "Opened DuckDB session");
        let interrupt = conn.interrupt_handle();
        Ok(Self {
            label,
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run setup statements and the query, returning the materialized result.
    ///
    /// Fails with a timeout once `deadline` passes and with
    /// [`ExportError::Cancelled`] once `cancel` is set.
    pub fn execute(
        &self,
        request: QueryRequest,
        deadline: &Deadline,
        cancel: &AtomicBool,
    ) -> Result<QueryResult, ExportError> {
        if cancel.load(Ordering::SeqCst) {
            return Err(ExportError::Cancelled {
                stage: Stage::Query,
            });
        }

        let state = Arc::new(Mutex::new(RunState::Waiting));
        let (tx, rx) = bounded(1);
        let conn = Arc::clone(&self.conn);
        let worker_state = Arc::clone(&state);
        let worker_deadline = *deadline;

        thread::Builder::new()
            .name("duckport-query".into())
            .spawn(move || {
                let guard = conn.lock();
                {
                    let mut st = worker_state.lock();
                    if *st == RunState::Abandoned {
                        return;
                    }
                    *st = RunState::Running;
                }
                let watch = Watch {
                    state: &worker_state,
                    deadline: worker_deadline,
                };
                let outcome = run_query(&guard, &request, &watch);
                {
                    let mut st = worker_state.lock();
                    if *st == RunState::Abandoned {
                        // An interrupt sent after the last statement finished
                        // would otherwise hit the next query on this session
                        drain_interrupt(&guard);
                        return;
                    }
                    *st = RunState::Done;
                }
                // The receiver may have given up already
                let _ = tx.send(outcome);
            })
            .map_err(|_| QueryExecutionError::WorkerLost)?;

        loop {
            let wait = deadline
                .remaining()
                .map_or(POLL_INTERVAL, |left| left.min(POLL_INTERVAL));
            match rx.recv_timeout(wait) {
                Ok(Err(QueryExecutionError::Abandoned)) => {
                    // The worker saw the deadline pass before this loop did
                    return Err(TimeoutError {
                        stage: Stage::Query,
                        limit: deadline.limit().unwrap_or_default(),
                    }
                    .into());
                }
                Ok(outcome) => return outcome.map_err(ExportError::from),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(QueryExecutionError::WorkerLost.into())
                }
                Err(RecvTimeoutError::Timeout) => {
                    if cancel.load(Ordering::SeqCst) {
                        self.abandon(&state);
                        return Err(ExportError::Cancelled {
                            stage: Stage::Query,
                        });
                    }
                    if deadline.expired() {
                        self.abandon(&state);
                        return Err(TimeoutError {
                            stage: Stage::Query,
                            limit: deadline.limit().unwrap_or_default(),
                        }
                        .into());
                    }
                }
            }
        }
    }

    /// Stop a query the caller no longer waits for
    fn abandon(&self, state: &Mutex<RunState>) {
        let mut st = state.lock();
        match *st {
            RunState::Waiting => {
                debug!(database = %self.label, "Dropping query before it started");
            }
            RunState::Running => {
                warn!(database = %self.label, "Interrupting running query");
                self.interrupt.interrupt();
            }
            RunState::Done | RunState::Abandoned => {}
        }
        *st = RunState::Abandoned;
    }
}

/// Sessions shared per database file
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<Option<PathBuf>, Arc<Session>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for `database`, opening it on first use.
    ///
    /// `None` always opens a fresh in-memory database that is not pooled.
    pub fn get(&self, database: Option<&Path>) -> Result<Arc<Session>, QueryExecutionError> {
        let Some(path) = database else {
            return Session::open(None).map(Arc::new);
        };
        let key = Some(path.to_path_buf());
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get(&key) {
            return Ok(Arc::clone(session));
        }
        let session = Arc::new(Session::open(database)?);
        sessions.insert(key, Arc::clone(&session));
        Ok(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Worker body: setup, then describe and fetch inside one transaction
fn run_query(
    conn: &Connection,
    request: &QueryRequest,
    watch: &Watch<'_>,
) -> Result<QueryResult, QueryExecutionError> {
    for statement in &request.setup {
        watch.abandoned()?;
        debug!(statement = %statement, "Running setup statement");
        conn.execute_batch(statement)
            .map_err(|source| QueryExecutionError::Setup {
                statement: statement.clone(),
                source,
            })?;
    }

    conn.execute_batch("BEGIN TRANSACTION")
        .map_err(QueryExecutionError::engine("Failed to begin transaction"))?;
    let outcome = fetch(conn, &request.sql, watch);
    match &outcome {
        Ok(_) => conn
            .execute_batch("COMMIT")
            .map_err(QueryExecutionError::engine("Failed to commit transaction"))?,
        Err(_) => {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                warn!("Rollback after failed query also failed: {}", e);
            }
        }
    }
    outcome
}

fn fetch(
    conn: &Connection,
    sql: &str,
    watch: &Watch<'_>,
) -> Result<QueryResult, QueryExecutionError> {
    let sql = sql.trim().trim_end_matches(';').trim_end();
    let described = describe(conn, sql)?;
    watch.abandoned()?;

    let timezone = if described
        .iter()
        .any(|(_, native)| *native == NativeType::TimestampTz)
    {
        Some(session_timezone(conn))
    } else {
        None
    };

    let projection = described
        .iter()
        .map(|(name, native)| format!("{} AS {}", transport_expr(name, native), quote_ident(name)))
        .collect::<Vec<_>>()
        .join(", ");
    // The source sits on its own lines so a trailing line comment ends there
    let select = format!("SELECT {}\nFROM (\n{}\n) AS duckport_source", projection, sql);
    debug!(sql = %select, "Fetching query result");

    let mut builders: Vec<ColumnBuilder> = described
        .iter()
        .map(|(_, native)| ColumnBuilder::new(Transport::of(native), INITIAL_CAPACITY))
        .collect();

    let mut stmt = conn
        .prepare(&select)
        .map_err(QueryExecutionError::engine("Failed to prepare query"))?;
    let mut rows = stmt
        .query([])
        .map_err(QueryExecutionError::engine("Query failed"))?;

    let mut num_rows = 0usize;
    while let Some(row) = rows
        .next()
        .map_err(QueryExecutionError::engine("Failed to fetch row"))?
    {
        if num_rows % ROWS_PER_CHECK == 0 {
            watch.abandoned()?;
        }
        for (idx, builder) in builders.iter_mut().enumerate() {
            builder
                .append(row, idx)
                .map_err(|source| QueryExecutionError::Value {
                    column: described[idx].0.clone(),
                    row: num_rows,
                    source,
                })?;
        }
        num_rows += 1;
    }

    let columns = described
        .into_iter()
        .zip(builders)
        .map(|((name, native), builder)| ResultColumn {
            timezone: if native == NativeType::TimestampTz {
                timezone.clone()
            } else {
                None
            },
            values: builder.finish(),
            name,
            native,
        })
        .collect();

    QueryResult::try_new(columns, num_rows)
}

/// Column names and native types of a query, in order
fn describe(
    conn: &Connection,
    sql: &str,
) -> Result<Vec<(String, NativeType)>, QueryExecutionError> {
    let mut stmt = conn
        .prepare(&format!("DESCRIBE {}\n", sql))
        .map_err(QueryExecutionError::engine("Failed to describe query"))?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let type_name: String = row.get(1)?;
            Ok((name, type_name))
        })
        .map_err(QueryExecutionError::engine("Failed to describe query"))?;

    let mut columns = Vec::new();
    let mut seen = HashSet::new();
    for row in rows {
        let (name, type_name) =
            row.map_err(QueryExecutionError::engine("Failed to describe query"))?;
        if !seen.insert(name.clone()) {
            return Err(QueryExecutionError::DuplicateColumn { name });
        }
        // An untyped NULL literal is reported as "NULL" in quotes
        let native = NativeType::parse(type_name.trim_matches('"'));
        columns.push((name, native));
    }
    Ok(columns)
}

/// Consume an interrupt that arrived after the worker's last statement
fn drain_interrupt(conn: &Connection) {
    if let Err(e) = conn.execute_batch("SELECT 1") {
        debug!("Drained pending interrupt: {}", e);
    }
}

fn session_timezone(conn: &Connection) -> String {
    conn.query_row("SELECT current_setting('TimeZone')", [], |row| {
        row.get::<_, String>(0)
    })
    .unwrap_or_else(|e| {
        debug!("TimeZone setting unavailable, assuming UTC: {}", e);
        crate::types::logical::CANONICAL_TIMEZONE.to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, AsArray};
    use arrow::datatypes::{Int32Type, Int64Type};

    fn request(sql: &str) -> QueryRequest {
        QueryRequest {
            setup: Vec::new(),
            sql: sql.to_string(),
        }
    }

    fn run(session: &Session, req: QueryRequest) -> Result<QueryResult, ExportError> {
        session.execute(req, &Deadline::unbounded(), &AtomicBool::new(false))
    }

    #[test]
    fn test_select_literal() {
        let session = Session::open(None).unwrap();
        let result = run(&session, request("SELECT 1 AS x")).unwrap();

        assert_eq!(result.num_rows(), 1);
        assert_eq!(result.num_columns(), 1);
        let col = &result.columns()[0];
        assert_eq!(col.name, "x");
        assert_eq!(col.native, NativeType::Integer);
        assert_eq!(col.values.as_primitive::<Int32Type>().value(0), 1);
    }

    #[test]
    fn test_setup_statements_run_first() {
        let session = Session::open(None).unwrap();
        let req = QueryRequest {
            setup: vec![
                "CREATE TABLE t (id INTEGER, name VARCHAR)".to_string(),
                "INSERT INTO t VALUES (1, 'a'), (2, NULL), (3, 'c')".to_string(),
            ],
            sql: "SELECT * FROM t ORDER BY id;".to_string(),
        };
        let result = run(&session, req).unwrap();

        assert_eq!(result.num_rows(), 3);
        let names = result.column("name").unwrap().values.as_string::<i32>();
        assert_eq!(names.value(0), "a");
        assert!(names.is_null(1));
    }

    #[test]
    fn test_transport_forms() {
        let session = Session::open(None).unwrap();
        let result = run(
            &session,
            request(
                "SELECT TIMESTAMP '1970-01-01 00:00:01' AS ts, \
                 [1, 2] AS xs, \
                 42::UTINYINT AS small, \
                 12.50::DECIMAL(10,2) AS price",
            ),
        )
        .unwrap();

        let ts = result.column("ts").unwrap();
        assert_eq!(ts.values.as_primitive::<Int64Type>().value(0), 1_000_000);

        let xs = result.column("xs").unwrap();
        assert!(matches!(xs.native, NativeType::List(_)));
        assert_eq!(xs.values.as_string::<i32>().value(0), "[1,2]");

        let small = result.column("small").unwrap();
        assert_eq!(small.native, NativeType::UTinyInt);
        assert_eq!(small.values.data_type(), &Transport::Int16.arrow_type());
    }

    #[test]
    fn test_syntax_error_is_query_error() {
        let session = Session::open(None).unwrap();
        let err = run(&session, request("SELEC 1")).unwrap_err();
        assert!(matches!(err, ExportError::Query(_)));
    }

    #[test]
    fn test_missing_table_is_query_error() {
        let session = Session::open(None).unwrap();
        let err = run(&session, request("SELECT * FROM no_such_table")).unwrap_err();
        assert!(matches!(err, ExportError::Query(_)));
        assert!(err.to_string().contains("no_such_table"));
    }

    #[test]
    fn test_duplicate_column_names() {
        let session = Session::open(None).unwrap();
        let err = run(&session, request("SELECT 1 AS x, 2 AS x")).unwrap_err();
        assert!(matches!(
            err,
            ExportError::Query(QueryExecutionError::DuplicateColumn { .. })
        ));
    }

    #[test]
    fn test_long_query_times_out() {
        let session = Session::open(None).unwrap();
        let deadline = Deadline::start(Some(Duration::from_millis(200)));
        let err = session
            .execute(
                request("SELECT sum(a.range * b.range) AS s FROM range(200000) a, range(200000) b"),
                &deadline,
                &AtomicBool::new(false),
            )
            .unwrap_err();
        assert!(matches!(err, ExportError::Timeout(_)));

        // The session stays usable after the interrupt
        let result = run(&session, request("SELECT 2 AS y")).unwrap();
        assert_eq!(result.num_rows(), 1);
    }

    #[test]
    fn test_cancelled_before_start() {
        let session = Session::open(None).unwrap();
        let err = session
            .execute(
                request("SELECT 1"),
                &Deadline::unbounded(),
                &AtomicBool::new(true),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ExportError::Cancelled {
                stage: Stage::Query
            }
        ));
    }

    #[test]
    fn test_pool_shares_file_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.duckdb");
        let pool = SessionPool::new();
        let a = pool.get(Some(&path)).unwrap();
        let b = pool.get(Some(&path)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_pool_isolates_in_memory_sessions() {
        let pool = SessionPool::new();
        let a = pool.get(None).unwrap();
        let b = pool.get(None).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(pool.is_empty());

        let create = |session: &Session| {
            run(
                session,
                QueryRequest {
                    setup: vec!["CREATE TABLE t AS SELECT 1 AS v".to_string()],
                    sql: "SELECT v FROM t".to_string(),
                },
            )
        };
        assert_eq!(create(&a).unwrap().num_rows(), 1);
        assert_eq!(create(&b).unwrap().num_rows(), 1);
    }

    #[test]
    fn test_trailing_line_comment() {
        let session = Session::open(None).unwrap();
        let result = run(&session, request("SELECT 1 AS x -- the answer\n")).unwrap();
        assert_eq!(result.num_rows(), 1);
        assert_eq!(result.columns()[0].name, "x");
    }

    #[test]
    fn test_abandoned_worker_stops_between_phases() {
        let state = Mutex::new(RunState::Abandoned);
        let watch = Watch {
            state: &state,
            deadline: Deadline::unbounded(),
        };
        let conn = Connection::open_in_memory().unwrap();
        let err = run_query(&conn, &request("SELECT 1 AS x"), &watch).unwrap_err();
        assert!(matches!(err, QueryExecutionError::Abandoned));

        // No transaction is left open behind
        conn.execute_batch("BEGIN TRANSACTION; COMMIT").unwrap();
    }

    #[test]
    fn test_session_usable_after_drained_interrupt() {
        let session = Session::open(None).unwrap();
        session.interrupt.interrupt();
        drain_interrupt(&session.conn.lock());
        let result = run(&session, request("SELECT 3 AS z")).unwrap();
        assert_eq!(result.num_rows(), 1);
    }
}
