use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use chrono::Utc;
use tracing::{error, info, warn};

use vaultline_tasks::Task;

use super::processor::TaskQueueProcessor;
use super::slots::SlotGuard;
use crate::store::{Document, TaskCollection, TaskUpdate};

/// Fields written when an attempt starts.
const ATTEMPT_PROPERTIES: [&str; 5] = ["tryCount", "startDate", "endDate", "workspace", "queueLatencyInMinutes"];

/// Runs one claimed task to completion on its own thread.
pub(crate) struct TaskWorker<T: Task + Document> {
    id: u64,
    task: T,
    processor: Arc<TaskQueueProcessor<T>>,
    slot: SlotGuard,
}

impl<T: Task + Document> TaskWorker<T> {
    pub(crate) fn new(id: u64, task: T, processor: Arc<TaskQueueProcessor<T>>, slot: SlotGuard) -> Self {
        Self {
            id,
            task,
            processor,
            slot,
        }
    }

    pub(crate) fn run(self) {
        let Self {
            id,
            mut task,
            processor,
            slot,
        } = self;

        match attempt(&mut task, &processor) {
            Ok(()) => match processor.worker_success(&mut task, slot) {
                Ok(()) => info!(worker_id = id, task_id = %task.id(), "task completed successfully"),
                Err(err) => error!(worker_id = id, task_id = %task.id(), error = %err, "failed to record task success"),
            },
            Err(err) => {
                error!(
                    worker_id = id,
                    task_id = %task.id(),
                    try_count = task.record().try_count,
                    error = %format!("{err:#}"),
                    "task failed"
                );
                if let Err(e) = processor.worker_fail(&mut task, &err, slot) {
                    error!(worker_id = id, task_id = %task.id(), error = %e, "failed to record task failure");
                }
            }
        }
    }
}

fn attempt<T: Task + Document>(task: &mut T, processor: &TaskQueueProcessor<T>) -> anyhow::Result<()> {
    let now = Utc::now();
    let due = task.due_instant();
    let workspace = processor.workspace_for(task.id());
    task.record_mut()
        .begin_attempt(now, due, workspace.display().to_string());
    info!(
        task_id = %task.id(),
        try_count = task.record().try_count,
        queue_latency_minutes = task.record().queue_latency_in_minutes,
        "starting attempt"
    );

    fs::create_dir_all(&workspace).with_context(|| format!("creating workspace {}", workspace.display()))?;
    processor
        .collection()
        .update_task(task, TaskUpdate::properties(ATTEMPT_PROPERTIES))?;

    guarded(|| processor.executor().execute(task))?;
    guarded(|| processor.executor().cleanup(task))
}

/// Cleans up after a failed task that is past due, then marks it `CANCELED`.
pub(crate) struct TaskCleanWorker<T: Task + Document> {
    id: u64,
    task: T,
    processor: Arc<TaskQueueProcessor<T>>,
    slot: SlotGuard,
}

impl<T: Task + Document> TaskCleanWorker<T> {
    pub(crate) fn new(id: u64, task: T, processor: Arc<TaskQueueProcessor<T>>, slot: SlotGuard) -> Self {
        Self {
            id,
            task,
            processor,
            slot,
        }
    }

    pub(crate) fn run(self) {
        let Self {
            id,
            mut task,
            processor,
            slot,
        } = self;

        info!(worker_id = id, task_id = %task.id(), "cleaning up past due task");
        if let Err(err) = guarded(|| processor.executor().cleanup(&task)) {
            warn!(worker_id = id, task_id = %task.id(), error = %format!("{err:#}"), "cleanup failed");
        }
        if let Err(err) = processor.cleaner_finished(&mut task, slot) {
            error!(worker_id = id, task_id = %task.id(), error = %err, "failed to record cancellation");
        }
    }
}

/// Run `body`, turning a panic into an error.
fn guarded<F>(body: F) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(payload) => Err(anyhow!("task panicked: {}", panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}
