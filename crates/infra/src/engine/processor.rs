//! The polling loop that claims tasks of one type and dispatches them to
//! worker threads.

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use vaultline_core::{EngineGuid, TaskId};
use vaultline_tasks::{EventType, LogEntry, Tags, Task, TaskState, EVENT_STATE_CHANGE};

use super::executor::TaskExecutor;
use super::slots::{SlotGuard, WorkerSlots};
use super::worker::{TaskCleanWorker, TaskWorker};
use super::{failure_details, failure_message, EngineError};
use crate::notification::NotificationHandler;
use crate::store::{date_value, Collection, Document, Filter, SortKey, StoreError, TaskCollection, TaskUpdate, Update};

/// How long a plan-less, non-reschedulable failed task is kept before the
/// cleanup path cancels it.
pub const MAX_FAIL_DUE_TIME: Duration = Duration::from_secs(2 * 60 * 60);

/// Every this many ticks the claim sort switches to oldest-first and one
/// past-due failed task is cleaned up.
const SWEEP_EVERY: u64 = 5;

const RECOVERY_MESSAGE: &str = "Engine crashed while task was in progress. Failing...";
const PAST_DUE_MESSAGE: &str = "Task failed and is past due. Cancelling...";
const SUCCESS_MESSAGE: &str = "Task completed successfully!";
const UNSTARTED_MESSAGE: &str = "Could not start a worker for the task. Failing...";

/// Identity and collaborators shared by all processors of one engine.
pub struct EngineContext {
    pub guid: EngineGuid,
    /// Resolved tags; empty means the engine only claims untagged tasks.
    pub tags: Tags,
    pub temp_dir: PathBuf,
    pub notifier: Arc<dyn NotificationHandler>,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub max_workers: usize,
    pub sleep_interval: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            sleep_interval: Duration::from_secs(10),
        }
    }
}

impl ProcessorConfig {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_sleep_interval(mut self, interval: Duration) -> Self {
        self.sleep_interval = interval;
        self
    }
}

/// Sort used when claiming on `tick`: oldest first on every fifth tick,
/// lowest priority value otherwise.
pub fn claim_sort(tick: u64) -> Vec<SortKey> {
    if tick % SWEEP_EVERY == 0 {
        vec![SortKey::asc("createdDate")]
    } else {
        vec![SortKey::asc("priority")]
    }
}

/// Claims and runs tasks of type `T` from one collection.
pub struct TaskQueueProcessor<T: Task + Document> {
    name: &'static str,
    collection: Arc<dyn Collection<T>>,
    executor: Arc<dyn TaskExecutor<T>>,
    context: Arc<EngineContext>,
    config: ProcessorConfig,
    slots: Arc<WorkerSlots>,
    stopped: AtomicBool,
    wake: (Mutex<()>, Condvar),
    tick_count: AtomicU64,
    next_worker_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Task + Document> TaskQueueProcessor<T> {
    pub fn new(
        collection: Arc<dyn Collection<T>>,
        executor: Arc<dyn TaskExecutor<T>>,
        context: Arc<EngineContext>,
        config: ProcessorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: T::KIND.processor_name(),
            collection,
            executor,
            context,
            slots: WorkerSlots::new(config.max_workers),
            config,
            stopped: AtomicBool::new(false),
            wake: (Mutex::new(()), Condvar::new()),
            tick_count: AtomicU64::new(0),
            next_worker_id: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn collection(&self) -> &dyn Collection<T> {
        self.collection.as_ref()
    }

    pub(crate) fn executor(&self) -> &dyn TaskExecutor<T> {
        self.executor.as_ref()
    }

    /// Workers currently holding a slot.
    pub fn worker_count(&self) -> usize {
        self.slots.in_flight()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Ask the polling loop to exit after the current tick. Running workers
    /// are not interrupted.
    pub fn request_stop(&self) {
        let _guard = self.wake.0.lock().unwrap_or_else(PoisonError::into_inner);
        self.stopped.store(true, Ordering::SeqCst);
        self.wake.1.notify_all();
    }

    pub(crate) fn workspace_for(&self, task_id: TaskId) -> PathBuf {
        self.context.temp_dir.join(task_id.to_string())
    }

    /// Fail every task left `IN_PROGRESS` under this engine's guid.
    ///
    /// Run before the loop starts; any store error here is fatal.
    pub fn recover(&self) -> Result<usize, EngineError> {
        info!(processor = self.name, engine = %self.context.guid, "running recovery");
        let recovery_error = |source: StoreError| EngineError::Recovery {
            processor: self.name,
            source,
        };

        let filter = Filter::and([
            Filter::eq("state", TaskState::InProgress),
            Filter::eq("engineGuid", self.context.guid.clone()),
        ]);
        let crashed = self.collection.find(&filter, &[], None).map_err(recovery_error)?;

        let mut total = 0;
        for mut task in crashed {
            info!(processor = self.name, task_id = %task.id(), "recovery: failing task");
            let record = task.record_mut();
            record.transition(TaskState::Failed)?;
            record.reschedulable = true;
            record.end_date = Some(Utc::now());
            self.collection
                .update_task(
                    &mut task,
                    TaskUpdate::properties(["state", "reschedulable", "endDate"])
                        .with_event_name(EVENT_STATE_CHANGE)
                        .with_message(RECOVERY_MESSAGE),
                )
                .map_err(recovery_error)?;
            total += 1;
        }

        info!(processor = self.name, total_crashed = total, "recovery complete");
        Ok(total)
    }

    /// Spawn the polling loop on its own thread.
    pub fn start(self: &Arc<Self>) -> Result<JoinHandle<()>, EngineError> {
        let name = format!("{}-processor", self.name.to_lowercase());
        let processor = self.clone();
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || processor.run_loop())
            .map_err(|e| EngineError::Spawn {
                name,
                reason: e.to_string(),
            })
    }

    /// Tick until stopped. Errors from a tick are logged and reported; they
    /// never end the loop.
    pub fn run_loop(self: &Arc<Self>) {
        info!(processor = self.name, engine = %self.context.guid, "processor started");
        while !self.is_stopped() {
            if let Err(err) = self.tick() {
                error!(
                    processor = self.name,
                    tick = self.tick_count(),
                    error = %err,
                    "caught an error in processor loop"
                );
                self.notify_error(&err);
            }
            self.sleep_between_ticks();
        }
        info!(processor = self.name, "exited main loop");
    }

    fn sleep_between_ticks(&self) {
        let guard = self.wake.0.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .wake
            .1
            .wait_timeout_while(guard, self.config.sleep_interval, |_| !self.is_stopped());
    }

    fn notify_error(&self, err: &EngineError) {
        let message = format!(
            "BackupEngine '{}' Error!. Cause: {}. \n\nStack Trace:\n{}",
            self.context.guid,
            err,
            Backtrace::capture()
        );
        self.context
            .notifier
            .send_error_notification("BackupEngine Error", &message, err as &(dyn StdError + 'static));
    }

    /// One scheduling step: claim and start a task if a slot is free, and on
    /// every fifth tick clean up one past-due failed task.
    pub fn tick(self: &Arc<Self>) -> Result<(), EngineError> {
        let tick = self.tick_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.reap_finished_workers();

        if let Some(slot) = self.slots.try_acquire() {
            if let Some(task) = self.read_next_task(tick)? {
                self.start_worker(task, slot)?;
            }
        }

        if tick % SWEEP_EVERY == 0 {
            if let Some(slot) = self.slots.try_acquire() {
                if let Some(task) = self.read_next_failed_past_due_task()? {
                    self.start_cleaner(task, slot)?;
                }
            }
        }
        Ok(())
    }

    /// Atomically claim the next `SCHEDULED` task this engine may run.
    pub fn read_next_task(&self, tick: u64) -> Result<Option<T>, StoreError> {
        let log = serde_json::to_value(LogEntry::state_change(TaskState::InProgress, None))?;
        let update = Update::new()
            .set("state", TaskState::InProgress)
            .set("engineGuid", self.context.guid.clone())
            .push("logs", log);
        self.collection
            .find_and_modify(&self.scheduled_tasks_filter(), &claim_sort(tick), &update)
    }

    /// Atomically claim one failed task of this engine that is past due and
    /// mark it `CANCELED`.
    pub fn read_next_failed_past_due_task(&self) -> Result<Option<T>, StoreError> {
        let now = Utc::now();
        let max_fail_due = chrono::Duration::seconds(MAX_FAIL_DUE_TIME.as_secs() as i64);
        let filter = Filter::and([
            Filter::eq("state", TaskState::Failed),
            Filter::eq("engineGuid", self.context.guid.clone()),
            Filter::or([
                Filter::lte("plan.nextOccurrence", date_value(now)),
                Filter::and([
                    Filter::exists("plan", false),
                    Filter::eq("reschedulable", false),
                    Filter::lte("endDate", date_value(now - max_fail_due)),
                ]),
            ]),
        ]);
        let log = serde_json::to_value(LogEntry::state_change(
            TaskState::Canceled,
            Some(PAST_DUE_MESSAGE.to_string()),
        ))?;
        let update = Update::new().set("state", TaskState::Canceled).push("logs", log);
        self.collection.find_and_modify(&filter, &[], &update)
    }

    /// Tagged engines claim tasks matching any of their tags; untagged
    /// engines claim only untagged tasks.
    fn scheduled_tasks_filter(&self) -> Filter {
        let tags = if self.context.tags.is_empty() {
            Filter::or([
                Filter::exists("tags", false),
                Filter::eq("tags", Value::Object(Default::default())),
                Filter::is_null("tags"),
            ])
        } else {
            Filter::or(
                self.context
                    .tags
                    .iter()
                    .map(|(name, value)| Filter::eq(format!("tags.{name}"), value.clone())),
            )
        };
        Filter::and([Filter::eq("state", TaskState::Scheduled), tags])
    }

    fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn start_worker(self: &Arc<Self>, task: T, slot: SlotGuard) -> Result<(), EngineError> {
        let worker_id = self.next_worker_id();
        info!(processor = self.name, task_id = %task.id(), worker_id, "starting task worker");
        let claimed = task.clone();
        let worker = TaskWorker::new(worker_id, task, self.clone(), slot);
        let spawned = self.spawn_worker(format!("{}-worker-{worker_id}", self.name.to_lowercase()), move || {
            worker.run()
        });
        if let Err(err) = &spawned {
            self.abandon_claim(claimed, err);
        }
        spawned
    }

    /// Fail a claimed task no worker could be started for, the same way
    /// recovery fails a crashed one.
    pub(crate) fn abandon_claim(&self, mut task: T, cause: &EngineError) {
        warn!(processor = self.name, task_id = %task.id(), error = %cause, "failing task that never started");
        let record = task.record_mut();
        if let Err(err) = record.transition(TaskState::Failed) {
            error!(processor = self.name, task_id = %task.id(), error = %err, "cannot fail unstarted task");
            return;
        }
        record.reschedulable = true;
        record.end_date = Some(Utc::now());
        let persisted = self.collection.update_task(
            &mut task,
            TaskUpdate::properties(["state", "reschedulable", "endDate"])
                .with_event_type(EventType::Error)
                .with_event_name(EVENT_STATE_CHANGE)
                .with_message(UNSTARTED_MESSAGE)
                .with_details(cause.to_string()),
        );
        if let Err(err) = persisted {
            error!(processor = self.name, task_id = %task.id(), error = %err, "failed to record unstarted task");
        }
    }

    fn start_cleaner(self: &Arc<Self>, task: T, slot: SlotGuard) -> Result<(), EngineError> {
        let worker_id = self.next_worker_id();
        info!(processor = self.name, task_id = %task.id(), worker_id, "starting cleaner worker");
        let worker = TaskCleanWorker::new(worker_id, task, self.clone(), slot);
        self.spawn_worker(format!("{}-cleaner-{worker_id}", self.name.to_lowercase()), move || {
            worker.run()
        })
    }

    fn spawn_worker<F>(&self, name: String, body: F) -> Result<(), EngineError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(body)
            .map_err(|e| EngineError::Spawn {
                name,
                reason: e.to_string(),
            })?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    fn reap_finished_workers(&self) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !h.is_finished());
    }

    /// Block until every worker thread started so far has exited.
    pub fn join_workers(&self) {
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
            if handles.is_empty() {
                return;
            }
            debug!(processor = self.name, count = handles.len(), "joining workers");
            for handle in handles {
                if handle.join().is_err() {
                    warn!(processor = self.name, "worker thread panicked");
                }
            }
        }
    }

    /// Record a successful run and move the task to `SUCCEEDED`.
    pub fn worker_success(&self, task: &mut T, slot: SlotGuard) -> Result<(), EngineError> {
        self.collection
            .update_task(task, TaskUpdate::all().with_message(SUCCESS_MESSAGE))?;
        self.worker_finished(task, TaskState::Succeeded, slot)
    }

    /// Record a failed run and move the task to `FAILED`. Tasks that will not
    /// be retried are reported to the notification handler.
    pub fn worker_fail(&self, task: &mut T, err: &anyhow::Error, slot: SlotGuard) -> Result<(), EngineError> {
        let details = failure_details(err);
        let recorded = self.collection.update_task(
            task,
            TaskUpdate::all()
                .with_event_type(EventType::Error)
                .with_message(failure_message(err))
                .with_details(details.clone()),
        );
        let finished = self.worker_finished(task, TaskState::Failed, slot);

        // Reported even when the store rejected the writes above.
        if !task.record().reschedulable {
            self.context
                .notifier
                .notify_on_task_failure(T::KIND, task.record(), err, &details);
        }
        recorded?;
        finished
    }

    pub fn cleaner_finished(&self, task: &mut T, slot: SlotGuard) -> Result<(), EngineError> {
        self.worker_finished(task, TaskState::Canceled, slot)
    }

    /// Persist the final state and release the worker's slot.
    pub fn worker_finished(&self, task: &mut T, state: TaskState, slot: SlotGuard) -> Result<(), EngineError> {
        let record = task.record_mut();
        record.transition(state)?;
        record.end_date = Some(Utc::now());
        let persisted = self.collection.update_task(
            task,
            TaskUpdate::properties(["state", "endDate"]).with_event_name(EVENT_STATE_CHANGE),
        );
        drop(slot);
        persisted?;
        Ok(())
    }
}
