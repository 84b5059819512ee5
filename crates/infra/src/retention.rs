//! Backup retention: which finished backups of a plan have outlived their
//! plan's policies, and expiring them.

use std::error::Error as StdError;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{error, info};

use vaultline_tasks::{Backup, BackupPlan, RetentionPolicyDocument, Task, TaskState};

use crate::store::{date_value, Collection, Filter, SortKey, StoreError, Update};

/// A retention policy failed to expire a backup.
#[derive(Debug, thiserror::Error)]
#[error("{message}{cause}")]
pub struct RetentionPolicyError {
    pub message: String,
    #[source]
    pub cause: Box<dyn StdError + Send + Sync + 'static>,
    /// Full cause chain and trace.
    pub details: String,
}

impl RetentionPolicyError {
    fn new(message: String, cause: anyhow::Error) -> Self {
        let details = format!("{cause:#}. Stack Trace: {}", cause.backtrace());
        Self {
            message,
            cause: cause.into(),
            details,
        }
    }
}

/// Marks a backup as expired and disposes of its artifact.
pub trait BackupExpirer: Send + Sync {
    fn expire_backup(&self, backup: &Backup, now: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Sets `targetReference.expiredDate`. Artifact deletion is left to whoever
/// owns the target storage.
pub struct MarkExpiredExpirer {
    backups: Arc<dyn Collection<Backup>>,
}

impl MarkExpiredExpirer {
    pub fn new(backups: Arc<dyn Collection<Backup>>) -> Self {
        Self { backups }
    }
}

impl BackupExpirer for MarkExpiredExpirer {
    fn expire_backup(&self, backup: &Backup, now: DateTime<Utc>) -> anyhow::Result<()> {
        let id = backup.id().to_string();
        let update = Update::new().set("targetReference.expiredDate", date_value(now));
        if !self.backups.update_one(&id, &update)? {
            return Err(StoreError::NotFound(id).into());
        }
        info!(backup_id = %backup.id(), "backup expired");
        Ok(())
    }
}

pub trait RetentionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Successful, not yet expired backups of `plan` that this policy no
    /// longer retains.
    fn get_expired_backups(&self, plan: &BackupPlan) -> Result<Vec<Backup>, StoreError>;

    /// Expire everything [`get_expired_backups`](Self::get_expired_backups)
    /// returns. Stops at the first backup that cannot be expired.
    fn apply_policy(&self, plan: &BackupPlan, expirer: &dyn BackupExpirer) -> Result<usize, RetentionPolicyError> {
        let expired = self.get_expired_backups(plan).map_err(|e| {
            RetentionPolicyError::new(
                format!("Error while finding expired backups for plan {}. ", plan.id),
                e.into(),
            )
        })?;

        info!(policy = self.name(), plan_id = %plan.id, count = expired.len(), "applying retention policy");
        let now = Utc::now();
        for backup in &expired {
            if let Err(cause) = expirer.expire_backup(backup, now) {
                error!(
                    policy = self.name(),
                    plan_id = %plan.id,
                    backup_id = %backup.id(),
                    error = %format!("{cause:#}"),
                    "error while expiring backup"
                );
                return Err(RetentionPolicyError::new(
                    format!("Error while applying retention policy on backup {}. ", backup.id()),
                    cause,
                ));
            }
        }
        Ok(expired.len())
    }
}

fn candidates(plan: &BackupPlan) -> Filter {
    Filter::and([
        Filter::eq("plan._id", plan.id),
        Filter::eq("state", TaskState::Succeeded),
        Filter::exists("targetReference", true),
        Filter::is_null("targetReference.expiredDate"),
    ])
}

/// Keeps the newest `retain_count` backups.
pub struct RetainLastNPolicy {
    retain_count: usize,
    backups: Arc<dyn Collection<Backup>>,
}

impl RetainLastNPolicy {
    pub fn new(retain_count: usize, backups: Arc<dyn Collection<Backup>>) -> Self {
        Self { retain_count, backups }
    }
}

impl RetentionPolicy for RetainLastNPolicy {
    fn name(&self) -> &'static str {
        "RetainLastNPolicy"
    }

    fn get_expired_backups(&self, plan: &BackupPlan) -> Result<Vec<Backup>, StoreError> {
        let newest_first = self
            .backups
            .find(&candidates(plan), &[SortKey::desc("createdDate")], None)?;
        Ok(newest_first.into_iter().skip(self.retain_count).collect())
    }
}

/// Keeps backups started within the last `max_time`.
pub struct RetainMaxTimePolicy {
    /// `None` when the window is wider than any representable duration.
    max_time: Option<TimeDelta>,
    backups: Arc<dyn Collection<Backup>>,
}

impl RetainMaxTimePolicy {
    pub fn new(max_time_secs: u64, backups: Arc<dyn Collection<Backup>>) -> Self {
        Self {
            max_time: i64::try_from(max_time_secs).ok().and_then(TimeDelta::try_seconds),
            backups,
        }
    }

    /// Backups started before this instant are expired. `None` means nothing
    /// is old enough.
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        now.checked_sub_signed(self.max_time?)
    }
}

impl RetentionPolicy for RetainMaxTimePolicy {
    fn name(&self) -> &'static str {
        "RetainMaxTimePolicy"
    }

    fn get_expired_backups(&self, plan: &BackupPlan) -> Result<Vec<Backup>, StoreError> {
        let Some(cutoff) = self.cutoff(Utc::now()) else {
            return Ok(Vec::new());
        };
        let filter = Filter::and([candidates(plan), Filter::lt("startDate", date_value(cutoff))]);
        self.backups.find(&filter, &[SortKey::asc("createdDate")], None)
    }
}

/// Executable policy for a stored policy document.
pub fn policy_from_document(
    document: &RetentionPolicyDocument,
    backups: Arc<dyn Collection<Backup>>,
) -> Box<dyn RetentionPolicy> {
    match *document {
        RetentionPolicyDocument::RetainLastN { retain_count } => Box::new(RetainLastNPolicy::new(retain_count, backups)),
        RetentionPolicyDocument::RetainMaxTime { max_time } => Box::new(RetainMaxTimePolicy::new(max_time, backups)),
    }
}

/// Apply every policy attached to `plan`, in order. Returns the number of
/// backups expired.
pub fn apply_retention_policies(
    plan: &BackupPlan,
    backups: &Arc<dyn Collection<Backup>>,
    expirer: &dyn BackupExpirer,
) -> Result<usize, RetentionPolicyError> {
    let mut total = 0;
    for document in &plan.retention_policies {
        total += policy_from_document(document, backups.clone()).apply_policy(plan, expirer)?;
    }
    Ok(total)
}
