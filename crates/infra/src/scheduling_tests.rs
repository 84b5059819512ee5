//! End-to-end scheduling tests: processors, workers and the in-memory store
//! working together.
//!
//! Verifies:
//! - a task is claimed by exactly one of several racing engines
//! - claim order alternates between priority and age
//! - crash recovery only touches the recovering engine's tasks
//! - tag partitioning between tagged and untagged engines
//! - retries keep the first queue latency
//! - past-due failed tasks are cancelled even when cleanup fails
//! - nothing is claimed while every worker slot is taken
//! - failures are reported only for tasks that will not be retried

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration as StdDuration;

    use anyhow::anyhow;
    use chrono::{DateTime, Duration, Utc};
    use serde_json::json;

    use vaultline_core::{DomainError, EngineGuid, TaskId};
    use vaultline_tasks::{Backup, BackupPlan, EndpointDocument, Schedule, Tags, Task, TaskKind, TaskRecord, TaskState};

    use crate::engine::{EngineContext, EngineError, ProcessorConfig, TaskExecutor, TaskQueueProcessor};
    use crate::notification::NotificationHandler;
    use crate::store::{Collection, Filter, InMemoryCollection, SortKey, StoreError, Update};

    /// Fails the first `failures` executions; optionally fails every cleanup.
    #[derive(Default)]
    struct ScriptedExecutor {
        failures: AtomicUsize,
        fail_cleanup: bool,
        executions: AtomicUsize,
        cleanups: AtomicUsize,
    }

    impl<T: Task> TaskExecutor<T> for ScriptedExecutor {
        fn execute(&self, _task: &mut T) -> anyhow::Result<()> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(DomainError::task("source unreachable").into());
            }
            Ok(())
        }

        fn cleanup(&self, _task: &T) -> anyhow::Result<()> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.fail_cleanup {
                return Err(anyhow!("cleanup exploded"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        task_failures: Mutex<Vec<TaskId>>,
        errors: Mutex<Vec<String>>,
    }

    impl NotificationHandler for RecordingNotifier {
        fn notify_on_task_failure(&self, _kind: TaskKind, task: &TaskRecord, _error: &anyhow::Error, _trace: &str) {
            self.task_failures.lock().unwrap().push(task.id);
        }

        fn send_notification(&self, _subject: &str, _message: &str) {}

        fn send_error_notification(&self, subject: &str, message: &str, _error: &(dyn StdError + 'static)) {
            self.errors.lock().unwrap().push(format!("{subject}: {message}"));
        }
    }

    struct Harness {
        store: Arc<InMemoryCollection<Backup>>,
        executor: Arc<ScriptedExecutor>,
        notifier: Arc<RecordingNotifier>,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn new(executor: ScriptedExecutor) -> Self {
            Self {
                store: Arc::new(InMemoryCollection::<Backup>::new("backups")),
                executor: Arc::new(executor),
                notifier: Arc::new(RecordingNotifier::default()),
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn processor(&self, engine: &str, tags: Tags) -> Arc<TaskQueueProcessor<Backup>> {
            processor_over(
                self.store.clone(),
                self.executor.clone(),
                self.notifier.clone(),
                engine,
                tags,
                self.dir.path(),
            )
        }

        fn insert(&self, backup: &Backup) {
            self.store.insert(backup).unwrap();
        }

        fn reload(&self, id: TaskId) -> Backup {
            self.store
                .find_one(&Filter::eq("_id", id), &[])
                .unwrap()
                .unwrap()
        }
    }

    fn processor_over(
        store: Arc<dyn Collection<Backup>>,
        executor: Arc<dyn TaskExecutor<Backup>>,
        notifier: Arc<dyn NotificationHandler>,
        engine: &str,
        tags: Tags,
        temp_dir: &Path,
    ) -> Arc<TaskQueueProcessor<Backup>> {
        processor_with_workers(store, executor, notifier, engine, tags, temp_dir, 4)
    }

    fn processor_with_workers(
        store: Arc<dyn Collection<Backup>>,
        executor: Arc<dyn TaskExecutor<Backup>>,
        notifier: Arc<dyn NotificationHandler>,
        engine: &str,
        tags: Tags,
        temp_dir: &Path,
        max_workers: usize,
    ) -> Arc<TaskQueueProcessor<Backup>> {
        let context = Arc::new(EngineContext {
            guid: guid(engine),
            tags,
            temp_dir: temp_dir.to_path_buf(),
            notifier,
        });
        let config = ProcessorConfig::default()
            .with_max_workers(max_workers)
            .with_sleep_interval(StdDuration::from_millis(10));
        TaskQueueProcessor::new(store, executor, context, config)
    }

    fn guid(engine: &str) -> EngineGuid {
        EngineGuid::new("test-host", engine)
    }

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), json!(v))).collect()
    }

    fn backup(record: TaskRecord) -> Backup {
        Backup::new(EndpointDocument::new("DbSource"), EndpointDocument::new("FileTarget")).with_task(record)
    }

    fn failed_backup(engine: &str, ended: DateTime<Utc>, reschedulable: bool) -> Backup {
        let mut record = TaskRecord::new().with_reschedulable(reschedulable);
        record.state = TaskState::Failed;
        record.engine_guid = Some(guid(engine));
        record.end_date = Some(ended);
        backup(record)
    }

    #[test]
    fn racing_engines_claim_a_task_once() {
        let h = Harness::new(ScriptedExecutor::default());
        let task = backup(TaskRecord::new());
        h.insert(&task);

        let barrier = Arc::new(Barrier::new(2));
        let claims: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|engine| {
                let processor = h.processor(engine, Tags::new());
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    processor.read_next_task(1).unwrap().map(|b| (engine, b))
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| t.join().unwrap())
            .collect();

        let winners: Vec<_> = claims.into_iter().flatten().collect();
        assert_eq!(winners.len(), 1);
        let (engine, claimed) = &winners[0];
        assert_eq!(claimed.task.state, TaskState::InProgress);

        let stored = h.reload(task.id());
        assert_eq!(stored.task.engine_guid, Some(guid(engine)));
        assert_eq!(stored.task.logs.len(), 1);
        assert_eq!(stored.task.logs[0].state, TaskState::InProgress);
    }

    #[test]
    fn every_fifth_tick_claims_the_oldest_task() {
        let h = Harness::new(ScriptedExecutor::default());
        let base = Utc::now() - Duration::hours(1);
        // Newer tasks have lower priority values, so priority order and age
        // order disagree.
        let ids: Vec<_> = (0..10)
            .map(|i| {
                let task = backup(
                    TaskRecord::new()
                        .with_created_date(base + Duration::minutes(i))
                        .with_priority(10 - i as i32),
                );
                h.insert(&task);
                task.id()
            })
            .collect();

        let processor = h.processor("a", Tags::new());
        let claimed: Vec<_> = (1..=10)
            .map(|tick| processor.read_next_task(tick).unwrap().unwrap().id())
            .collect();

        let expected: Vec<_> = [9, 8, 7, 6, 0, 5, 4, 3, 2, 1].iter().map(|&i| ids[i]).collect();
        assert_eq!(claimed, expected);
        assert!(processor.read_next_task(11).unwrap().is_none());
    }

    #[test]
    fn recovery_fails_only_this_engines_tasks() {
        let h = Harness::new(ScriptedExecutor::default());
        let mut mine = TaskRecord::new();
        mine.state = TaskState::InProgress;
        mine.engine_guid = Some(guid("a"));
        let mine = backup(mine);
        let mut theirs = TaskRecord::new();
        theirs.state = TaskState::InProgress;
        theirs.engine_guid = Some(guid("b"));
        let theirs = backup(theirs);
        let scheduled = backup(TaskRecord::new());
        for task in [&mine, &theirs, &scheduled] {
            h.insert(task);
        }

        let processor = h.processor("a", Tags::new());
        assert_eq!(processor.recover().unwrap(), 1);

        let recovered = h.reload(mine.id());
        assert_eq!(recovered.task.state, TaskState::Failed);
        assert!(recovered.task.reschedulable);
        assert!(recovered.task.end_date.is_some());
        let entry = recovered.task.logs.last().unwrap();
        assert_eq!(entry.message.as_deref(), Some("Engine crashed while task was in progress. Failing..."));

        assert_eq!(h.reload(theirs.id()), theirs);
        assert_eq!(h.reload(scheduled.id()), scheduled);

        // Nothing left to recover.
        assert_eq!(processor.recover().unwrap(), 0);
        assert_eq!(h.reload(mine.id()).task.logs.len(), 1);
    }

    #[test]
    fn tags_partition_the_queue() {
        let h = Harness::new(ScriptedExecutor::default());
        let eu = backup(TaskRecord::new().with_tag("region", "eu"));
        let untagged = backup(TaskRecord::new());
        let mut empty_tags = TaskRecord::new();
        empty_tags.tags = Some(Tags::new());
        let empty_tags = backup(empty_tags);
        for task in [&eu, &untagged, &empty_tags] {
            h.insert(task);
        }

        let us_engine = h.processor("us", tags(&[("region", "us")]));
        assert!(us_engine.read_next_task(1).unwrap().is_none());

        let eu_engine = h.processor("eu", tags(&[("region", "eu"), ("tier", "gold")]));
        assert_eq!(eu_engine.read_next_task(1).unwrap().map(|b| b.id()), Some(eu.id()));
        assert!(eu_engine.read_next_task(2).unwrap().is_none());

        let plain = h.processor("plain", Tags::new());
        let mut claimed: Vec<_> = (1..=2)
            .filter_map(|t| plain.read_next_task(t).unwrap())
            .map(|b| b.id())
            .collect();
        claimed.sort();
        let mut expected = vec![untagged.id(), empty_tags.id()];
        expected.sort();
        assert_eq!(claimed, expected);

        h.insert(&backup(TaskRecord::new().with_tag("region", "us")));
        assert!(plain.read_next_task(3).unwrap().is_none());
    }

    #[test]
    fn retry_keeps_the_first_queue_latency() {
        let h = Harness::new(ScriptedExecutor {
            failures: AtomicUsize::new(1),
            ..ScriptedExecutor::default()
        });
        let task = backup(TaskRecord::new().with_created_date(Utc::now() - Duration::minutes(30)));
        h.insert(&task);
        let processor = h.processor("a", Tags::new());

        processor.tick().unwrap();
        processor.join_workers();
        let failed = h.reload(task.id());
        assert_eq!(failed.task.state, TaskState::Failed);
        assert_eq!(failed.task.try_count, 1);
        assert_eq!(failed.task.errors().len(), 1);
        assert_eq!(failed.task.errors()[0].message.as_deref(), Some("source unreachable"));
        assert_eq!(*h.notifier.task_failures.lock().unwrap(), vec![task.id()]);
        let latency = failed.task.queue_latency_in_minutes.unwrap();
        assert!((29.0..31.0).contains(&latency), "latency {latency}");

        // Rescheduled by its owner.
        h.store
            .update_one(&task.id().to_string(), &Update::new().set("state", TaskState::Scheduled))
            .unwrap();
        processor.tick().unwrap();
        processor.join_workers();

        let retried = h.reload(task.id());
        assert_eq!(retried.task.state, TaskState::Succeeded);
        assert_eq!(retried.task.try_count, 2);
        assert_eq!(retried.task.queue_latency_in_minutes, Some(latency));
        assert!(
            retried
                .task
                .logs
                .iter()
                .any(|e| e.message.as_deref() == Some("Task completed successfully!"))
        );
        assert_eq!(h.executor.executions.load(Ordering::SeqCst), 2);
        assert_eq!(h.executor.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(processor.worker_count(), 0);
    }

    #[test]
    fn past_due_task_is_cancelled_when_cleanup_fails() {
        let h = Harness::new(ScriptedExecutor {
            fail_cleanup: true,
            ..ScriptedExecutor::default()
        });
        let task = failed_backup("a", Utc::now() - Duration::hours(3), false);
        h.insert(&task);
        let processor = h.processor("a", Tags::new());

        for _ in 0..4 {
            processor.tick().unwrap();
        }
        assert_eq!(h.reload(task.id()).task.state, TaskState::Failed);

        processor.tick().unwrap();
        processor.join_workers();

        let cancelled = h.reload(task.id());
        assert_eq!(cancelled.task.state, TaskState::Canceled);
        assert!(cancelled.task.end_date.unwrap() > Utc::now() - Duration::minutes(1));
        assert!(
            cancelled
                .task
                .logs
                .iter()
                .any(|e| e.message.as_deref() == Some("Task failed and is past due. Cancelling..."))
        );
        assert_eq!(h.executor.cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(processor.worker_count(), 0);
    }

    #[test]
    fn past_due_eligibility() {
        let h = Harness::new(ScriptedExecutor::default());
        let now = Utc::now();
        let recent = failed_backup("a", now - Duration::hours(1), false);
        let retrying = failed_backup("a", now - Duration::hours(5), true);
        let other_engine = failed_backup("b", now - Duration::hours(5), false);
        let plan = BackupPlan::new(Schedule::new(now - Duration::days(1), 3600).unwrap())
            .with_next_occurrence(now - Duration::minutes(5));
        let mut plan_moved_on = failed_backup("a", now - Duration::minutes(10), true);
        plan_moved_on.plan = Some(plan);
        for task in [&recent, &retrying, &other_engine, &plan_moved_on] {
            h.insert(task);
        }

        let processor = h.processor("a", Tags::new());
        let cancelled = processor.read_next_failed_past_due_task().unwrap().unwrap();
        assert_eq!(cancelled.id(), plan_moved_on.id());
        assert_eq!(cancelled.task.state, TaskState::Canceled);
        assert!(processor.read_next_failed_past_due_task().unwrap().is_none());

        let still_failed = h
            .store
            .count(&Filter::eq("state", TaskState::Failed))
            .unwrap();
        assert_eq!(still_failed, 3);
    }

    #[test]
    fn reschedulable_failure_is_not_reported() {
        let h = Harness::new(ScriptedExecutor {
            failures: AtomicUsize::new(1),
            ..ScriptedExecutor::default()
        });
        let task = backup(TaskRecord::new().with_reschedulable(true));
        h.insert(&task);
        let processor = h.processor("a", Tags::new());

        processor.tick().unwrap();
        processor.join_workers();

        let failed = h.reload(task.id());
        assert_eq!(failed.task.state, TaskState::Failed);
        assert!(failed.task.reschedulable);
        assert!(h.notifier.task_failures.lock().unwrap().is_empty());
    }

    /// Holds every execution until the test lets it go.
    struct GatedExecutor {
        started: Barrier,
        release: Barrier,
    }

    impl GatedExecutor {
        fn new() -> Self {
            Self {
                started: Barrier::new(2),
                release: Barrier::new(2),
            }
        }

        /// Wait for a worker to enter `execute`, then let it finish.
        fn run_one(&self) {
            self.started.wait();
            self.release.wait();
        }
    }

    impl<T: Task> TaskExecutor<T> for GatedExecutor {
        fn execute(&self, _task: &mut T) -> anyhow::Result<()> {
            self.started.wait();
            self.release.wait();
            Ok(())
        }

        fn cleanup(&self, _task: &T) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn full_slots_claim_nothing() {
        let h = Harness::new(ScriptedExecutor::default());
        let gate = Arc::new(GatedExecutor::new());
        let first = backup(TaskRecord::new().with_priority(0));
        let second = backup(TaskRecord::new().with_priority(1));
        h.insert(&first);
        h.insert(&second);
        let processor = processor_with_workers(
            h.store.clone(),
            gate.clone(),
            h.notifier.clone(),
            "a",
            Tags::new(),
            h.dir.path(),
            1,
        );

        processor.tick().unwrap();
        gate.started.wait();
        assert_eq!(processor.worker_count(), 1);

        processor.tick().unwrap();
        assert_eq!(h.reload(second.id()).task.state, TaskState::Scheduled);
        assert_eq!(h.store.count(&Filter::eq("state", TaskState::InProgress)).unwrap(), 1);

        gate.release.wait();
        processor.join_workers();
        assert_eq!(processor.worker_count(), 0);
        assert_eq!(h.reload(first.id()).task.state, TaskState::Succeeded);

        processor.tick().unwrap();
        gate.run_one();
        processor.join_workers();
        assert_eq!(h.reload(second.id()).task.state, TaskState::Succeeded);
    }

    #[test]
    fn claimed_task_without_a_worker_is_failed() {
        let h = Harness::new(ScriptedExecutor::default());
        let task = backup(TaskRecord::new());
        h.insert(&task);
        let processor = h.processor("a", Tags::new());

        let claimed = processor.read_next_task(1).unwrap().unwrap();
        let cause = EngineError::Spawn {
            name: "backup-worker-1".into(),
            reason: "Resource temporarily unavailable".into(),
        };
        processor.abandon_claim(claimed, &cause);

        let failed = h.reload(task.id());
        assert_eq!(failed.task.state, TaskState::Failed);
        assert!(failed.task.reschedulable);
        assert!(failed.task.end_date.is_some());
        let entry = failed.task.logs.last().unwrap();
        assert_eq!(entry.message.as_deref(), Some("Could not start a worker for the task. Failing..."));
        assert!(h.notifier.task_failures.lock().unwrap().is_empty());
    }

    /// A store that is always down.
    struct UnreachableStore;

    impl Collection<Backup> for UnreachableStore {
        fn name(&self) -> &str {
            "backups"
        }

        fn insert(&self, _doc: &Backup) -> Result<(), StoreError> {
            Err(StoreError::Storage("connection refused".into()))
        }

        fn save(&self, _doc: &Backup) -> Result<(), StoreError> {
            Err(StoreError::Storage("connection refused".into()))
        }

        fn find(&self, _: &Filter, _: &[SortKey], _: Option<usize>) -> Result<Vec<Backup>, StoreError> {
            Err(StoreError::Storage("connection refused".into()))
        }

        fn find_and_modify(&self, _: &Filter, _: &[SortKey], _: &Update) -> Result<Option<Backup>, StoreError> {
            Err(StoreError::Storage("connection refused".into()))
        }

        fn update_one(&self, _: &str, _: &Update) -> Result<bool, StoreError> {
            Err(StoreError::Storage("connection refused".into()))
        }

        fn count(&self, _: &Filter) -> Result<usize, StoreError> {
            Err(StoreError::Storage("connection refused".into()))
        }
    }

    #[test]
    fn store_outage_fails_recovery_but_not_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = processor_over(
            Arc::new(UnreachableStore),
            Arc::new(ScriptedExecutor::default()),
            notifier.clone(),
            "a",
            Tags::new(),
            dir.path(),
        );

        assert!(matches!(processor.recover(), Err(EngineError::Recovery { .. })));

        let handle = processor.start().unwrap();
        thread::sleep(StdDuration::from_millis(100));
        processor.request_stop();
        handle.join().unwrap();

        assert!(processor.tick_count() >= 2, "loop kept ticking after errors");
        let errors = notifier.errors.lock().unwrap();
        assert!(!errors.is_empty());
        assert!(errors[0].starts_with("BackupEngine Error: BackupEngine 'test-host-a' Error!. Cause: "));
    }

    /// Serves reads and claims but rejects every write to an existing task.
    struct FrozenStore(Arc<InMemoryCollection<Backup>>);

    impl Collection<Backup> for FrozenStore {
        fn name(&self) -> &str {
            self.0.name()
        }

        fn insert(&self, doc: &Backup) -> Result<(), StoreError> {
            self.0.insert(doc)
        }

        fn save(&self, _doc: &Backup) -> Result<(), StoreError> {
            Err(StoreError::Storage("read-only replica".into()))
        }

        fn find(&self, filter: &Filter, sort: &[SortKey], limit: Option<usize>) -> Result<Vec<Backup>, StoreError> {
            self.0.find(filter, sort, limit)
        }

        fn find_and_modify(&self, filter: &Filter, sort: &[SortKey], update: &Update) -> Result<Option<Backup>, StoreError> {
            self.0.find_and_modify(filter, sort, update)
        }

        fn update_one(&self, _: &str, _: &Update) -> Result<bool, StoreError> {
            Err(StoreError::Storage("read-only replica".into()))
        }

        fn count(&self, filter: &Filter) -> Result<usize, StoreError> {
            self.0.count(filter)
        }
    }

    #[test]
    fn final_failure_is_reported_when_it_cannot_be_persisted() {
        let h = Harness::new(ScriptedExecutor::default());
        let task = backup(TaskRecord::new().with_reschedulable(false));
        h.insert(&task);
        let processor = processor_over(
            Arc::new(FrozenStore(h.store.clone())),
            h.executor.clone(),
            h.notifier.clone(),
            "a",
            Tags::new(),
            h.dir.path(),
        );

        processor.tick().unwrap();
        processor.join_workers();

        assert_eq!(*h.notifier.task_failures.lock().unwrap(), vec![task.id()]);
        assert_eq!(h.reload(task.id()).task.state, TaskState::InProgress);
        assert_eq!(processor.worker_count(), 0);
    }
}
