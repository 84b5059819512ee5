use std::fs;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use vaultline_core::EngineGuid;
use vaultline_tasks::{Backup, Restore};

use super::executor::{CommandExecutor, TaskExecutor, UnconfiguredExecutor};
use super::processor::{EngineContext, ProcessorConfig, TaskQueueProcessor};
use super::EngineError;
use crate::config::EngineConfig;
use crate::notification::NotificationHandler;
use crate::store::Collection;

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPING: &str = "stopping";
/// Reported by the client when no engine answers on the command port.
pub const STATUS_STOPPED: &str = "stopped";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounts {
    pub backups: usize,
    pub restores: usize,
}

impl WorkerCounts {
    pub fn total(&self) -> usize {
        self.backups + self.restores
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<WorkerCounts>,
}

impl EngineStatus {
    pub fn stopped() -> Self {
        Self {
            status: STATUS_STOPPED.to_string(),
            workers: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    /// Processors stopped polling; this many workers are still running.
    Draining(usize),
}

impl StopOutcome {
    pub fn message(&self) -> String {
        match self {
            Self::Stopped => "Engine stopped successfully".to_string(),
            Self::Draining(n) => format!(
                "Stop command received. Engine has {n} workers running and will stop when all workers finish"
            ),
        }
    }
}

/// What the control server may ask of a running engine.
pub trait EngineControl: Send + Sync {
    fn request_stop(&self) -> Result<StopOutcome, EngineError>;

    fn status(&self) -> Result<EngineStatus, EngineError>;
}

/// One engine instance: a backup processor and a restore processor sharing
/// an identity.
pub struct BackupEngine {
    context: Arc<EngineContext>,
    backups: Arc<TaskQueueProcessor<Backup>>,
    restores: Arc<TaskQueueProcessor<Restore>>,
}

impl BackupEngine {
    pub fn new(
        context: Arc<EngineContext>,
        backups: Arc<TaskQueueProcessor<Backup>>,
        restores: Arc<TaskQueueProcessor<Restore>>,
    ) -> Self {
        Self {
            context,
            backups,
            restores,
        }
    }

    /// Wire an engine from configuration. Task types without a configured
    /// command get an executor that fails every task.
    pub fn from_config(
        config: &EngineConfig,
        backups: Arc<dyn Collection<Backup>>,
        restores: Arc<dyn Collection<Restore>>,
        notifier: Arc<dyn NotificationHandler>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let host = local_host_name();
        let context = Arc::new(EngineContext {
            guid: EngineGuid::new(&host, &config.id),
            tags: config.resolved_tags(&host),
            temp_dir: config.temp_dir_path(),
            notifier,
        });
        let processor_config = ProcessorConfig::default()
            .with_max_workers(config.max_workers)
            .with_sleep_interval(config.sleep_interval());

        let backup_executor: Arc<dyn TaskExecutor<Backup>> = match &config.backup_command {
            Some(line) => Arc::new(CommandExecutor::parse(line)?),
            None => Arc::new(UnconfiguredExecutor),
        };
        let restore_executor: Arc<dyn TaskExecutor<Restore>> = match &config.restore_command {
            Some(line) => Arc::new(CommandExecutor::parse(line)?),
            None => Arc::new(UnconfiguredExecutor),
        };

        Ok(Self::new(
            context.clone(),
            TaskQueueProcessor::new(backups, backup_executor, context.clone(), processor_config.clone()),
            TaskQueueProcessor::new(restores, restore_executor, context, processor_config),
        ))
    }

    pub fn guid(&self) -> &EngineGuid {
        &self.context.guid
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn backups(&self) -> &Arc<TaskQueueProcessor<Backup>> {
        &self.backups
    }

    pub fn restores(&self) -> &Arc<TaskQueueProcessor<Restore>> {
        &self.restores
    }

    pub fn worker_counts(&self) -> WorkerCounts {
        WorkerCounts {
            backups: self.backups.worker_count(),
            restores: self.restores.worker_count(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.backups.is_stopped() || self.restores.is_stopped()
    }

    /// Log the engine identity, make sure the temp dir exists and fail any
    /// task a previous run of this engine left `IN_PROGRESS`.
    ///
    /// Must succeed before the control server or the processors start.
    pub fn prepare(&self) -> Result<(), EngineError> {
        info!(engine = %self.context.guid, "starting up");
        info!(engine = %self.context.guid, pid = std::process::id(), "process id");
        info!(engine = %self.context.guid, temp_dir = %self.context.temp_dir.display(), "temp dir");
        if self.context.tags.is_empty() {
            info!(engine = %self.context.guid, "no tags configured");
        } else {
            let tags = serde_json::to_string(&self.context.tags).unwrap_or_default();
            info!(engine = %self.context.guid, tags = %tags, "tags");
        }

        fs::create_dir_all(&self.context.temp_dir).map_err(|e| {
            EngineError::Io(format!("creating temp dir {}: {e}", self.context.temp_dir.display()))
        })?;

        self.backups.recover()?;
        self.restores.recover()?;
        Ok(())
    }

    /// Run both processors until stopped, then wait for every worker.
    pub fn run(&self) -> Result<(), EngineError> {
        let backups = self.backups.start()?;
        let restores = match self.restores.start() {
            Ok(handle) => handle,
            Err(err) => {
                self.backups.request_stop();
                let _ = backups.join();
                return Err(err);
            }
        };

        for (name, handle) in [(self.backups.name(), backups), (self.restores.name(), restores)] {
            if handle.join().is_err() {
                error!(engine = %self.context.guid, processor = name, "processor thread panicked");
            }
        }
        self.backups.join_workers();
        self.restores.join_workers();
        info!(engine = %self.context.guid, "engine completed");
        Ok(())
    }
}

impl EngineControl for BackupEngine {
    fn request_stop(&self) -> Result<StopOutcome, EngineError> {
        info!(engine = %self.context.guid, "received stop command");
        self.backups.request_stop();
        self.restores.request_stop();

        let running = self.worker_counts().total();
        Ok(if running == 0 {
            StopOutcome::Stopped
        } else {
            StopOutcome::Draining(running)
        })
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        let status = if self.is_stopped() { STATUS_STOPPING } else { STATUS_RUNNING };
        Ok(EngineStatus {
            status: status.to_string(),
            workers: Some(self.worker_counts()),
        })
    }
}

impl<E: EngineControl + ?Sized> EngineControl for Arc<E> {
    fn request_stop(&self) -> Result<StopOutcome, EngineError> {
        (**self).request_stop()
    }

    fn status(&self) -> Result<EngineStatus, EngineError> {
        (**self).status()
    }
}

/// Host name used in the engine guid and the `$HOST` tag binding.
pub fn local_host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}
