//! Task bodies.

use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::Context;
use tracing::{debug, info};

use vaultline_core::{DomainError, DomainResult};
use vaultline_tasks::Task;

/// What actually runs for a claimed task.
///
/// `execute` may update the task (e.g. its target reference); the worker
/// persists the task after a successful run. Errors and panics are caught by
/// the worker and turned into a `FAILED` transition.
pub trait TaskExecutor<T: Task>: Send + Sync {
    fn execute(&self, task: &mut T) -> anyhow::Result<()>;

    /// Release whatever `execute` left behind. Also runs for tasks cancelled
    /// after failing.
    fn cleanup(&self, task: &T) -> anyhow::Result<()>;
}

/// Runs an external command per task inside the task's workspace.
///
/// The child sees `VAULTLINE_TASK_ID`, `VAULTLINE_TASK_TYPE`,
/// `VAULTLINE_WORKSPACE` and `VAULTLINE_TASK_JSON` (the full task document).
/// Cleanup removes the workspace directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
}

impl CommandExecutor {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Parse a command line using shell-style quoting (`'..'`, `".."`, `\`).
    pub fn parse(command_line: &str) -> DomainResult<Self> {
        let mut words = split_command_line(command_line)?.into_iter();
        let program = words
            .next()
            .ok_or_else(|| DomainError::configuration("command line is empty"))?;
        Ok(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl<T: Task> TaskExecutor<T> for CommandExecutor {
    fn execute(&self, task: &mut T) -> anyhow::Result<()> {
        let record = task.record();
        let workspace = record
            .workspace
            .clone()
            .ok_or_else(|| DomainError::task(format!("{} {} has no workspace", T::KIND, record.id)))?;
        let document = serde_json::to_string(&*task).context("serializing task for command")?;

        info!(task_id = %task.id(), program = %self.program, "running task command");
        let status = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&workspace)
            .env("VAULTLINE_TASK_ID", task.id().to_string())
            .env("VAULTLINE_TASK_TYPE", T::KIND.to_string())
            .env("VAULTLINE_WORKSPACE", &workspace)
            .env("VAULTLINE_TASK_JSON", document)
            .status()
            .with_context(|| format!("spawning '{}'", self.program))?;

        if !status.success() {
            return Err(DomainError::task(format!(
                "{} command '{}' failed with {}",
                T::KIND,
                self.program,
                status
            ))
            .into());
        }
        Ok(())
    }

    fn cleanup(&self, task: &T) -> anyhow::Result<()> {
        let Some(workspace) = task.record().workspace.as_deref() else {
            return Ok(());
        };
        let path = Path::new(workspace);
        if path.exists() {
            fs::remove_dir_all(path).with_context(|| format!("removing workspace {workspace}"))?;
            debug!(task_id = %task.id(), workspace = %workspace, "workspace removed");
        }
        Ok(())
    }
}

/// Fails every task with a configuration error. Used when no command is
/// configured for a task type.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredExecutor;

impl<T: Task> TaskExecutor<T> for UnconfiguredExecutor {
    fn execute(&self, _task: &mut T) -> anyhow::Result<()> {
        Err(DomainError::configuration(format!("no {} command configured for this engine", T::KIND)).into())
    }

    fn cleanup(&self, _task: &T) -> anyhow::Result<()> {
        Ok(())
    }
}

fn split_command_line(line: &str) -> DomainResult<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                let escaped = chars
                    .next()
                    .ok_or_else(|| DomainError::configuration("command line ends with a backslash"))?;
                current.push(escaped);
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }

    if quote.is_some() {
        return Err(DomainError::configuration("unterminated quote in command line"));
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
