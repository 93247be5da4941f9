//! Running several exports at once
//!
//! Jobs go through a crossbeam channel to a fixed set of scoped worker
//! threads. Results come back in the order the jobs were given.

use crate::error::{ExportError, QueryExecutionError};
use crate::export::{ExportJob, ExportStats};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::thread;
use tracing::{debug, error};

/// Run `jobs` on up to `parallelism` threads
pub fn run_exports(
    jobs: Vec<ExportJob>,
    parallelism: usize,
) -> Vec<Result<ExportStats, ExportError>> {
    let total = jobs.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = parallelism.clamp(1, total);
    debug!(jobs = total, workers, "Running exports");

    let (tx, rx) = unbounded::<(usize, ExportJob)>();
    for entry in jobs.into_iter().enumerate() {
        // The receiver is alive until the scope below ends
        let _ = tx.send(entry);
    }
    drop(tx);

    let results: Mutex<Vec<Option<Result<ExportStats, ExportError>>>> =
        Mutex::new((0..total).map(|_| None).collect());

    thread::scope(|scope| {
        for id in 0..workers {
            let rx = rx.clone();
            let results = &results;
            let spawned = thread::Builder::new()
                .name(format!("duckport-export-{}", id))
                .spawn_scoped(scope, move || {
                    while let Ok((index, mut job)) = rx.recv() {
                        let outcome = job.run();
                        results.lock()[index] = Some(outcome);
                    }
                });
            if let Err(e) = spawned {
                error!("Failed to spawn export worker {}: {}", id, e);
            }
        }
    });

    results
        .into_inner()
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(QueryExecutionError::WorkerLost.into())))
        .collect()
}
