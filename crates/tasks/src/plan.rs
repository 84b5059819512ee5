//! Backup plans: a recurring schedule plus the retention policies applied to
//! the backups it produces.

use chrono::{DateTime, Duration, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use vaultline_core::{DomainError, DomainResult, PlanId};

/// Fixed-frequency schedule anchored at `offset`.
///
/// Natural occurrences are `offset + k * frequency` for every integer `k`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub offset: DateTime<Utc>,
    pub frequency_in_seconds: u64,
}

impl Schedule {
    pub fn new(offset: DateTime<Utc>, frequency_in_seconds: u64) -> DomainResult<Self> {
        let schedule = Self {
            offset,
            frequency_in_seconds,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.frequency_in_seconds == 0 {
            return Err(DomainError::validation("schedule frequency must be positive"));
        }
        if self.frequency_ms().is_none() {
            return Err(DomainError::validation(format!(
                "schedule frequency of {}s is out of range",
                self.frequency_in_seconds
            )));
        }
        Ok(())
    }

    fn frequency_ms(&self) -> Option<i64> {
        i64::try_from(self.frequency_in_seconds)
            .ok()?
            .checked_mul(1000)
            .filter(|ms| *ms > 0)
    }

    /// `None` once `offset + k * frequency` leaves the representable range.
    fn occurrence(&self, k: i64) -> Option<DateTime<Utc>> {
        let ms = k.checked_mul(self.frequency_ms()?)?;
        self.offset.checked_add_signed(TimeDelta::try_milliseconds(ms)?)
    }

    /// Index of the first occurrence at or after `at`.
    fn first_index_at_or_after(&self, at: DateTime<Utc>) -> Option<i64> {
        let delta = (at - self.offset).num_milliseconds();
        let freq = self.frequency_ms()?;
        delta
            .div_euclid(freq)
            .checked_add(i64::from(delta.rem_euclid(freq) != 0))
    }

    /// Occurrences in `[start, end)`, in order.
    pub fn occurrences_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        if end <= start {
            return out;
        }
        let Some(mut k) = self.first_index_at_or_after(start) else {
            return out;
        };
        while let Some(at) = self.occurrence(k) {
            if at >= end {
                break;
            }
            out.push(at);
            match k.checked_add(1) {
                Some(next) => k = next,
                None => break,
            }
        }
        out
    }

    /// First occurrence strictly after `after`, if it is representable.
    pub fn next_occurrence_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let k = self.first_index_at_or_after(after)?;
        let at = self.occurrence(k)?;
        if at == after { self.occurrence(k.checked_add(1)?) } else { Some(at) }
    }

    /// Latest occurrence at or before `at`.
    pub fn last_occurrence_at_or_before(&self, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let delta = (at - self.offset).num_milliseconds();
        self.occurrence(delta.div_euclid(self.frequency_ms()?))
    }
}

/// Stored form of a retention policy attached to a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type")]
pub enum RetentionPolicyDocument {
    /// Keep the newest `retain_count` successful backups.
    #[serde(rename = "RetainLastNPolicy", rename_all = "camelCase")]
    RetainLastN { retain_count: usize },
    /// Keep backups started within the last `max_time` seconds.
    #[serde(rename = "RetainMaxTimePolicy", rename_all = "camelCase")]
    RetainMaxTime { max_time: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupPlan {
    #[serde(rename = "_id")]
    pub id: PlanId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub schedule: Schedule,
    #[serde(default)]
    pub next_occurrence: Option<DateTime<Utc>>,
    pub created_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub retention_policies: Vec<RetentionPolicyDocument>,
}

impl BackupPlan {
    pub fn new(schedule: Schedule) -> Self {
        let now = Utc::now();
        let next_occurrence = schedule.next_occurrence_after(now);
        Self {
            id: PlanId::new(),
            description: None,
            schedule,
            next_occurrence,
            created_date: now,
            retention_policies: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_next_occurrence(mut self, next: DateTime<Utc>) -> Self {
        self.next_occurrence = Some(next);
        self
    }

    pub fn with_created_date(mut self, created_date: DateTime<Utc>) -> Self {
        self.created_date = created_date;
        self
    }

    pub fn with_retention_policy(mut self, policy: RetentionPolicyDocument) -> Self {
        self.retention_policies.push(policy);
        self
    }

    /// Occurrences the plan should have produced during the day starting at
    /// `audit_date`.
    pub fn natural_occurrences_as_of(&self, audit_date: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let end = audit_date
            .checked_add_signed(Duration::days(1))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.schedule.occurrences_between(audit_date, end)
    }

    pub fn next_natural_occurrence(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_occurrence_after(after)
    }

    /// Whether the plan has already moved on to a later occurrence.
    pub fn is_next_occurrence_due(&self, now: DateTime<Utc>) -> bool {
        self.next_occurrence.is_some_and(|next| next <= now)
    }
}
