//! Scheduler core: task queue processors, their workers and the engine that
//! owns them.
//!
//! ## Architecture
//!
//! ```text
//! BackupEngine
//!   ├── TaskQueueProcessor<Backup>  ── polling thread ──► TaskWorker / TaskCleanWorker threads
//!   └── TaskQueueProcessor<Restore> ── polling thread ──► TaskWorker / TaskCleanWorker threads
//! ```
//!
//! Every claim goes through the store's `find_and_modify`, so any number of
//! engines may poll the same collections.

mod backup_engine;
mod executor;
mod processor;
mod slots;
mod worker;

pub use backup_engine::{
    local_host_name, BackupEngine, EngineControl, EngineStatus, StopOutcome, WorkerCounts, STATUS_RUNNING,
    STATUS_STOPPED, STATUS_STOPPING,
};
pub use executor::{CommandExecutor, TaskExecutor, UnconfiguredExecutor};
pub use processor::{claim_sort, EngineContext, ProcessorConfig, TaskQueueProcessor, MAX_FAIL_DUE_TIME};
pub use slots::{SlotGuard, WorkerSlots};

use vaultline_core::DomainError;

use crate::retention::RetentionPolicyError;
use crate::store::StoreError;

/// Log message used for failures that carry no user-facing description.
pub const UNEXPECTED_ERROR_MESSAGE: &str = "Unexpected error. Please contact admin";

/// Engine, processor and control-plane errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("{processor} recovery failed: {source}")]
    Recovery {
        processor: &'static str,
        #[source]
        source: StoreError,
    },

    #[error("io error: {0}")]
    Io(String),

    #[error("failed to spawn thread '{name}': {reason}")]
    Spawn { name: String, reason: String },

    /// The control port refused the connection.
    #[error("engine is not running (command port {0})")]
    NotRunning(u16),

    /// The engine answered a control command with an error.
    #[error("{0}")]
    Command(String),
}

/// User-facing message for a task failure.
///
/// Errors whose cause chain contains a domain, engine or retention error are
/// shown as-is; anything else gets [`UNEXPECTED_ERROR_MESSAGE`].
pub fn failure_message(err: &anyhow::Error) -> String {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<DomainError>() {
            return e.to_string();
        }
        if let Some(e) = cause.downcast_ref::<EngineError>() {
            return e.to_string();
        }
        if let Some(e) = cause.downcast_ref::<RetentionPolicyError>() {
            return e.to_string();
        }
    }
    UNEXPECTED_ERROR_MESSAGE.to_string()
}

/// Full error chain followed by the captured backtrace.
pub fn failure_details(err: &anyhow::Error) -> String {
    format!("{err:#}. Stack Trace: {}", err.backtrace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn domain_errors_keep_their_message() {
        let err = anyhow::Error::new(DomainError::task("dump exited with status 2")).context("running backup");
        assert_eq!(failure_message(&err), "dump exited with status 2");
    }

    #[test]
    fn unknown_errors_get_the_admin_message() {
        let err: anyhow::Result<()> = Err(std::io::Error::other("disk full")).context("writing archive");
        let err = err.unwrap_err();
        assert_eq!(failure_message(&err), UNEXPECTED_ERROR_MESSAGE);

        let details = failure_details(&err);
        assert!(details.starts_with("writing archive: disk full. Stack Trace: "));
    }
}
