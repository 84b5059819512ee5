//! Read-only audit snapshots built from plans and their backups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vaultline_core::{AuditId, PlanId, TaskId};

use crate::state::{LogEntry, TaskState};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditType {
    PlanAudit,
    SinglePlanAudit,
}

/// Outcome of one natural occurrence of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAuditEntry {
    pub plan_occurrence: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<TaskId>,
    /// `None` when no backup was ever scheduled for the occurrence.
    pub state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<LogEntry>,
}

impl PlanAuditEntry {
    pub fn never_scheduled(plan_occurrence: DateTime<Utc>) -> Self {
        Self {
            plan_occurrence,
            backup_id: None,
            state: None,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> bool {
        self.state == Some(TaskState::Succeeded)
    }

    pub fn failed(&self) -> bool {
        !self.succeeded()
    }

    pub fn warned(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn state_label(&self) -> &'static str {
        self.state.map_or("NEVER SCHEDULED", |s| s.as_str())
    }
}

/// Audit of a single plan for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanAuditReport {
    pub plan: PlanId,
    pub audit_type: AuditType,
    pub audit_date: DateTime<Utc>,
    pub total_audits: usize,
    pub total_success: usize,
    pub total_failures: usize,
    pub total_warnings: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_audits: Vec<PlanAuditEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warned_audits: Vec<PlanAuditEntry>,
}

impl PlanAuditReport {
    /// Summarise `entries`. Warned audits only keep entries that succeeded;
    /// failures are already reported as failures.
    pub fn from_entries(plan: PlanId, audit_date: DateTime<Utc>, entries: Vec<PlanAuditEntry>) -> Self {
        let total_audits = entries.len();
        let total_warnings = entries.iter().filter(|e| e.warned()).count();
        let (failed_audits, rest): (Vec<_>, Vec<_>) = entries.into_iter().partition(|e| e.failed());
        let warned_audits: Vec<_> = rest.into_iter().filter(|e| e.warned()).collect();
        let total_failures = failed_audits.len();

        Self {
            plan,
            audit_type: AuditType::SinglePlanAudit,
            audit_date,
            total_audits,
            total_success: total_audits - total_failures,
            total_failures,
            total_warnings,
            failed_audits,
            warned_audits,
        }
    }

    pub fn has_failures(&self) -> bool {
        self.total_failures > 0
    }

    pub fn has_warnings(&self) -> bool {
        self.total_warnings > 0
    }
}

/// Audit across all plans for one day. Appended to the audit collection and
/// never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditReport {
    #[serde(rename = "_id")]
    pub id: AuditId,
    pub audit_type: AuditType,
    pub audit_date: DateTime<Utc>,
    pub total_audits: usize,
    pub total_success: usize,
    pub total_failures: usize,
    pub total_warnings: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_audits: Vec<PlanAuditReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warned_audits: Vec<PlanAuditEntry>,
}

impl AuditReport {
    pub fn from_plan_reports(audit_date: DateTime<Utc>, reports: Vec<PlanAuditReport>) -> Self {
        let total_audits = reports.len();
        let total_warnings = reports.iter().filter(|r| r.has_warnings()).count();
        let mut failed_audits = Vec::new();
        let mut warned_audits = Vec::new();
        for report in reports {
            if report.has_failures() {
                failed_audits.push(report);
            } else {
                warned_audits.extend(report.warned_audits);
            }
        }
        let total_failures = failed_audits.len();

        Self {
            id: AuditId::new(),
            audit_type: AuditType::PlanAudit,
            audit_date,
            total_audits,
            total_success: total_audits - total_failures,
            total_failures,
            total_warnings,
            failed_audits,
            warned_audits,
        }
    }
}

impl core::fmt::Display for AuditReport {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "Audit {:?} for {}: {} audited, {} succeeded, {} failed, {} warned",
            self.audit_type,
            self.audit_date.format("%Y-%m-%d"),
            self.total_audits,
            self.total_success,
            self.total_failures,
            self.total_warnings
        )?;
        for plan_report in &self.failed_audits {
            writeln!(
                f,
                "  plan {}: {} of {} occurrences failed",
                plan_report.plan, plan_report.total_failures, plan_report.total_audits
            )?;
            for entry in &plan_report.failed_audits {
                writeln!(
                    f,
                    "    {} {}",
                    entry.plan_occurrence.to_rfc3339(),
                    entry.state_label()
                )?;
            }
        }
        Ok(())
    }
}
