//! Notification delivery seam.
//!
//! The engine reports unrecoverable task failures and its own loop errors
//! through a [`NotificationHandler`]; delivery (mail, chat, paging) lives
//! behind the trait.

use std::error::Error as StdError;

use tracing::{error, info, warn};

use vaultline_tasks::{TaskKind, TaskRecord};

pub trait NotificationHandler: Send + Sync {
    /// A task failed and will not be retried.
    fn notify_on_task_failure(&self, kind: TaskKind, task: &TaskRecord, error: &anyhow::Error, trace: &str);

    fn send_notification(&self, subject: &str, message: &str);

    fn send_error_notification(&self, subject: &str, message: &str, error: &(dyn StdError + 'static));
}

/// Writes notifications to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingNotificationHandler;

impl NotificationHandler for LoggingNotificationHandler {
    fn notify_on_task_failure(&self, kind: TaskKind, task: &TaskRecord, error: &anyhow::Error, trace: &str) {
        warn!(
            kind = %kind,
            task_id = %task.id,
            try_count = task.try_count,
            error = %format!("{error:#}"),
            trace = %trace,
            "task failed permanently"
        );
    }

    fn send_notification(&self, subject: &str, message: &str) {
        info!(subject = %subject, message = %message, "notification");
    }

    fn send_error_notification(&self, subject: &str, message: &str, err: &(dyn StdError + 'static)) {
        error!(subject = %subject, message = %message, error = %err, "error notification");
    }
}
