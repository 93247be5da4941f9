//! Embedded analytical engine
//!
//! Wraps DuckDB: sessions shared per database, query execution under a
//! deadline, and materialization of result rows into Arrow arrays.

mod result;
mod session;

pub use result::{QueryResult, ResultColumn};
pub use session::{QueryRequest, Session, SessionPool};
