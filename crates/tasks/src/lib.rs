//! Backup task domain model.
//!
//! Task lifecycle, backups, restores, plans and audit reports, implemented
//! purely as deterministic domain logic (no IO, no storage, no threads).

pub mod audit;
pub mod backup;
pub mod plan;
pub mod record;
pub mod restore;
pub mod state;

pub use audit::{AuditReport, AuditType, PlanAuditEntry, PlanAuditReport};
pub use backup::{Backup, EndpointDocument, TargetReference};
pub use plan::{BackupPlan, RetentionPolicyDocument, Schedule};
pub use record::{Tags, Task, TaskKind, TaskRecord};
pub use restore::Restore;
pub use state::{EVENT_STATE_CHANGE, EventType, LogEntry, TaskState};
