//! Export engine
//!
//! An [`ExportJob`] drives one configured export through an explicit
//! state machine:
//!
//! ```text
//! Idle ──query──▶ QueryExecuted ──coerce──▶ TypeCoerced ──write──▶ Written ──finalize──▶ Done
//!   │                   │                        │                    │
//!   └───────────────────┴──────────┬─────────────┴────────────────────┘
//!                                  ▼
//!                               Failed
//! ```
//!
//! Output is produced through an [`OutputHandle`]: a temporary file next
//! to the target that only becomes visible at `output_path` once the job
//! reaches `Done`.

mod batch;
mod job;
mod manifest;
mod output;
mod state;

pub use batch::run_exports;
pub use job::{ExportJob, ExportPlan};
pub use manifest::{manifest_path, stage_manifest, write_manifest, Manifest};
pub use output::OutputHandle;
pub use state::{ExportState, ExportStats};

use std::fmt;

/// The work one transition performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Setup statements and the query
    Query,
    /// Mapping and type overrides
    Coerce,
    /// Backend selection and serialization
    Write,
    /// Moving the output into place
    Finalize,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Stage::Query => "query",
            Stage::Coerce => "coerce",
            Stage::Write => "write",
            Stage::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
