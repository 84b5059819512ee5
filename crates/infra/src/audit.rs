//! Daily audits of plan execution.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use tracing::{debug, info};

use vaultline_tasks::{AuditReport, Backup, BackupPlan, PlanAuditEntry, PlanAuditReport, Task};

use crate::notification::NotificationHandler;
use crate::store::{date_value, Collection, Filter, SortKey, StoreError};

pub trait Auditor: Send + Sync {
    /// Audit the day starting at `audit_date`.
    fn daily_audit_report(&self, audit_date: DateTime<Utc>) -> Result<AuditReport, StoreError>;
}

/// Checks that every natural occurrence of every plan produced a successful
/// backup.
pub struct PlanAuditor {
    plans: Arc<dyn Collection<BackupPlan>>,
    backups: Arc<dyn Collection<Backup>>,
}

impl PlanAuditor {
    pub fn new(plans: Arc<dyn Collection<BackupPlan>>, backups: Arc<dyn Collection<Backup>>) -> Self {
        Self { plans, backups }
    }

    fn audit_plan(&self, plan: &BackupPlan, audit_date: DateTime<Utc>) -> Result<PlanAuditReport, StoreError> {
        let mut entries = Vec::new();
        for occurrence in plan.natural_occurrences_as_of(audit_date) {
            let filter = Filter::and([
                Filter::eq("plan._id", plan.id),
                Filter::eq("planOccurrence", date_value(occurrence)),
            ]);
            let entry = match self.backups.find_one(&filter, &[SortKey::desc("createdDate")])? {
                Some(backup) => PlanAuditEntry {
                    plan_occurrence: occurrence,
                    backup_id: Some(backup.id()),
                    state: Some(backup.record().state),
                    errors: backup.record().errors().into_iter().cloned().collect(),
                    warnings: backup.record().warnings().into_iter().cloned().collect(),
                },
                None => PlanAuditEntry::never_scheduled(occurrence),
            };
            entries.push(entry);
        }
        Ok(PlanAuditReport::from_entries(plan.id, audit_date, entries))
    }
}

/// A plan created after the audit day whose first occurrence is past it has
/// nothing to audit yet.
fn created_after_audit_window(plan: &BackupPlan, audit_date: DateTime<Utc>) -> bool {
    plan.created_date > audit_date
        && plan
            .next_occurrence
            .is_some_and(|next| next > audit_date + Duration::days(1))
}

impl Auditor for PlanAuditor {
    fn daily_audit_report(&self, audit_date: DateTime<Utc>) -> Result<AuditReport, StoreError> {
        info!(audit_date = %audit_date, "running plan audit");
        let plans = self
            .plans
            .find(&Filter::All, &[SortKey::asc("createdDate")], None)?;

        let mut reports = Vec::with_capacity(plans.len());
        for plan in &plans {
            if created_after_audit_window(plan, audit_date) {
                debug!(plan_id = %plan.id, "plan created after audit window, skipping");
                continue;
            }
            reports.push(self.audit_plan(plan, audit_date)?);
        }
        Ok(AuditReport::from_plan_reports(audit_date, reports))
    }
}

/// Runs every registered auditor, stores the reports and mails them out.
pub struct GlobalAuditor {
    auditors: Vec<Box<dyn Auditor>>,
    reports: Arc<dyn Collection<AuditReport>>,
    notifier: Arc<dyn NotificationHandler>,
}

impl GlobalAuditor {
    pub fn new(reports: Arc<dyn Collection<AuditReport>>, notifier: Arc<dyn NotificationHandler>) -> Self {
        Self {
            auditors: Vec::new(),
            reports,
            notifier,
        }
    }

    pub fn register_auditor(&mut self, auditor: Box<dyn Auditor>) {
        self.auditors.push(auditor);
    }

    pub fn with_auditor(mut self, auditor: Box<dyn Auditor>) -> Self {
        self.register_auditor(auditor);
        self
    }

    pub fn generate_daily_audit_reports(&self, audit_date: DateTime<Utc>) -> Result<Vec<AuditReport>, StoreError> {
        let mut reports = Vec::with_capacity(self.auditors.len());
        for auditor in &self.auditors {
            let report = auditor.daily_audit_report(audit_date)?;
            self.reports.insert(&report)?;
            reports.push(report);
        }

        let body = reports
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n\n\n");
        self.notifier.send_notification(
            &format!("Backup Audit Reports for {}", audit_date.format("%Y-%m-%d")),
            &body,
        );
        Ok(reports)
    }

    /// Audit yesterday, from UTC midnight.
    pub fn generate_yesterday_audit_reports(&self) -> Result<Vec<AuditReport>, StoreError> {
        self.generate_daily_audit_reports(yesterday_midnight(Utc::now()))
    }
}

fn yesterday_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    (now - Duration::days(1)).date_naive().and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;
    use std::sync::Mutex;

    use chrono::TimeZone;
    use vaultline_tasks::{EndpointDocument, EventType, LogEntry, Schedule, TaskKind, TaskRecord, TaskState};

    use crate::store::InMemoryCollection;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<(String, String)>>);

    impl NotificationHandler for Outbox {
        fn notify_on_task_failure(&self, _: TaskKind, _: &TaskRecord, _: &anyhow::Error, _: &str) {}

        fn send_notification(&self, subject: &str, message: &str) {
            self.0.lock().unwrap().push((subject.into(), message.into()));
        }

        fn send_error_notification(&self, _: &str, _: &str, _: &(dyn StdError + 'static)) {}
    }

    fn day() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    /// Every six hours from midnight; created well before the audit day.
    fn plan() -> BackupPlan {
        BackupPlan::new(Schedule::new(day(), 6 * 3600).unwrap())
            .with_created_date(day() - Duration::days(30))
            .with_next_occurrence(day() + Duration::days(1))
    }

    fn backup(plan: &BackupPlan, occurrence: DateTime<Utc>, state: TaskState) -> Backup {
        let mut record = TaskRecord::new().with_created_date(occurrence);
        record.state = state;
        Backup::new(EndpointDocument::new("DbSource"), EndpointDocument::new("FileTarget"))
            .with_task(record)
            .for_plan(plan.clone(), occurrence)
    }

    fn fixture() -> (Arc<InMemoryCollection<BackupPlan>>, Arc<InMemoryCollection<Backup>>, BackupPlan) {
        let plans = Arc::new(InMemoryCollection::<BackupPlan>::new("plans"));
        let backups = Arc::new(InMemoryCollection::<Backup>::new("backups"));
        let plan = plan();
        plans.insert(&plan).unwrap();
        (plans, backups, plan)
    }

    #[test]
    fn missing_and_failed_occurrences_are_failures() {
        let (plans, backups, plan) = fixture();
        let hours = |h| day() + Duration::hours(h);
        backups.insert(&backup(&plan, hours(0), TaskState::Succeeded)).unwrap();
        backups.insert(&backup(&plan, hours(6), TaskState::Failed)).unwrap();
        let mut warned = backup(&plan, hours(12), TaskState::Succeeded);
        warned
            .task
            .logs
            .push(LogEntry::new(TaskState::InProgress, EventType::Warning, hours(12)).with_message("slow source"));
        backups.insert(&warned).unwrap();
        // 18:00 never scheduled.

        let report = PlanAuditor::new(plans, backups).daily_audit_report(day()).unwrap();
        assert_eq!(report.total_audits, 1);
        assert_eq!(report.total_failures, 1);
        let plan_report = &report.failed_audits[0];
        assert_eq!(plan_report.total_audits, 4);
        assert_eq!(plan_report.total_failures, 2);
        assert_eq!(plan_report.total_success, 2);
        assert_eq!(plan_report.total_warnings, 1);
        let labels: Vec<_> = plan_report.failed_audits.iter().map(|e| e.state_label()).collect();
        assert_eq!(labels, ["FAILED", "NEVER SCHEDULED"]);
    }

    #[test]
    fn plans_created_after_the_audit_day_are_skipped() {
        let (plans, backups, _) = fixture();
        let fresh = BackupPlan::new(Schedule::new(day(), 6 * 3600).unwrap())
            .with_created_date(day() + Duration::hours(30))
            .with_next_occurrence(day() + Duration::days(2));
        plans.insert(&fresh).unwrap();

        let report = PlanAuditor::new(plans, backups).daily_audit_report(day()).unwrap();
        assert_eq!(report.total_audits, 1, "only the older plan is audited");
    }

    #[test]
    fn global_auditor_stores_and_sends_reports() {
        let (plans, backups, plan) = fixture();
        for h in [0, 6, 12, 18] {
            backups
                .insert(&backup(&plan, day() + Duration::hours(h), TaskState::Succeeded))
                .unwrap();
        }
        let stored = Arc::new(InMemoryCollection::<AuditReport>::new("audits"));
        let outbox = Arc::new(Outbox::default());
        let global = GlobalAuditor::new(stored.clone(), outbox.clone())
            .with_auditor(Box::new(PlanAuditor::new(plans, backups)));

        let reports = global.generate_daily_audit_reports(day()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].total_failures, 0);
        assert_eq!(stored.len(), 1);

        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Backup Audit Reports for 2024-05-01");
    }

    #[test]
    fn yesterday_is_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 13, 45, 12).unwrap();
        assert_eq!(yesterday_midnight(now), day());
    }
}
