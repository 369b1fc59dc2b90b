//! Pre, post and error task chains
//!
//! A [`Rule`] names the tasks run around a transfer. Pre-tasks run before
//! the first block, post-tasks after the last one, and error tasks when the
//! transfer fails. Error task failures are logged and never change the
//! outcome.

use crate::error::{Result, TransferError};
use crate::record::TransferRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// When a task runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskPhase {
    /// Before the block transfer
    Pre,
    /// After the block transfer
    Post,
    /// After a failure
    Error,
}

/// A step run around a transfer.
///
/// Tasks may change the record (a rename updates `filename`); the state
/// machine persists it after every task.
#[async_trait]
pub trait Task: Send + Sync {
    /// Task name for logs and failure reports
    fn name(&self) -> &str;

    /// Run the task
    async fn run(&self, phase: TaskPhase, record: &mut TransferRecord) -> Result<()>;
}

/// Optional business hook around the pre and post phases.
///
/// Both methods default to a pass-through.
#[async_trait]
pub trait BusinessHook: Send + Sync {
    /// Called before the tasks of `phase`
    async fn before(&self, _phase: TaskPhase, _record: &TransferRecord) -> Result<()> {
        Ok(())
    }

    /// Called after the tasks of `phase` succeeded
    async fn after(&self, _phase: TaskPhase, _record: &TransferRecord) -> Result<()> {
        Ok(())
    }
}

/// Declarative task description, as found in rule files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskSpec {
    /// Log a message
    Log {
        /// Message text
        message: String,
    },
    /// Copy the file into a directory
    Copy {
        /// Target directory
        to: PathBuf,
    },
    /// Move the file into a directory
    Rename {
        /// Target directory
        to: PathBuf,
    },
    /// Delete the file
    Delete,
}

impl TaskSpec {
    /// Instantiate the task
    pub fn build(&self) -> Arc<dyn Task> {
        match self {
            TaskSpec::Log { message } => Arc::new(LogTask::new(message.clone())),
            TaskSpec::Copy { to } => Arc::new(CopyTask::new(to.clone())),
            TaskSpec::Rename { to } => Arc::new(RenameTask::new(to.clone())),
            TaskSpec::Delete => Arc::new(DeleteTask),
        }
    }
}

/// Named set of task lists
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Rule id carried in transfer requests
    pub id: String,
    /// Tasks before the transfer
    #[serde(default)]
    pub pre: Vec<TaskSpec>,
    /// Tasks after the transfer
    #[serde(default)]
    pub post: Vec<TaskSpec>,
    /// Tasks after a failure
    #[serde(default)]
    pub error: Vec<TaskSpec>,
}

impl Rule {
    /// Rule without tasks
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Instantiated task lists of a rule
#[derive(Clone, Default)]
pub struct TaskChain {
    pre: Vec<Arc<dyn Task>>,
    post: Vec<Arc<dyn Task>>,
    error: Vec<Arc<dyn Task>>,
}

impl TaskChain {
    /// Chain without tasks
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the chain described by `rule`
    pub fn from_rule(rule: &Rule) -> Self {
        let build = |specs: &[TaskSpec]| specs.iter().map(TaskSpec::build).collect();
        Self {
            pre: build(&rule.pre),
            post: build(&rule.post),
            error: build(&rule.error),
        }
    }

    /// Append a task to `phase`
    #[must_use]
    pub fn with(mut self, phase: TaskPhase, task: Arc<dyn Task>) -> Self {
        match phase {
            TaskPhase::Pre => self.pre.push(task),
            TaskPhase::Post => self.post.push(task),
            TaskPhase::Error => self.error.push(task),
        }
        self
    }

    /// Tasks of `phase`, in execution order
    pub fn tasks(&self, phase: TaskPhase) -> &[Arc<dyn Task>] {
        match phase {
            TaskPhase::Pre => &self.pre,
            TaskPhase::Post => &self.post,
            TaskPhase::Error => &self.error,
        }
    }
}

impl std::fmt::Debug for TaskChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |tasks: &[Arc<dyn Task>]| {
            tasks
                .iter()
                .map(|t| t.name().to_string())
                .collect::<Vec<_>>()
        };
        f.debug_struct("TaskChain")
            .field("pre", &names(&self.pre))
            .field("post", &names(&self.post))
            .field("error", &names(&self.error))
            .finish()
    }
}

fn target_path(dir: &Path, record: &TransferRecord) -> PathBuf {
    let name = Path::new(&record.filename)
        .file_name()
        .map_or_else(
            || std::ffi::OsString::from(record.key.file_stem()),
            |n| n.to_os_string(),
        );
    dir.join(name)
}

/// Logs the transfer and a message
#[derive(Debug, Clone)]
pub struct LogTask {
    message: String,
}

impl LogTask {
    /// Create a log task
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Task for LogTask {
    fn name(&self) -> &str {
        "log"
    }

    async fn run(&self, phase: TaskPhase, record: &mut TransferRecord) -> Result<()> {
        tracing::info!(
            transfer = %record.key,
            ?phase,
            file = %record.filename,
            rank = record.rank,
            "{}",
            self.message
        );
        Ok(())
    }
}

/// Copies the file into a directory
#[derive(Debug, Clone)]
pub struct CopyTask {
    dir: PathBuf,
}

impl CopyTask {
    /// Create a copy task targeting `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Task for CopyTask {
    fn name(&self) -> &str {
        "copy"
    }

    async fn run(&self, _phase: TaskPhase, record: &mut TransferRecord) -> Result<()> {
        let target = target_path(&self.dir, record);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TransferError::task("copy", e))?;
        tokio::fs::copy(&record.filename, &target)
            .await
            .map_err(|e| TransferError::task("copy", format!("{}: {}", record.filename, e)))?;
        tracing::debug!("Copied {} to {}", record.filename, target.display());
        Ok(())
    }
}

/// Moves the file into a directory and points the record at the new path
#[derive(Debug, Clone)]
pub struct RenameTask {
    dir: PathBuf,
}

impl RenameTask {
    /// Create a rename task targeting `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl Task for RenameTask {
    fn name(&self) -> &str {
        "rename"
    }

    async fn run(&self, _phase: TaskPhase, record: &mut TransferRecord) -> Result<()> {
        let target = target_path(&self.dir, record);
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TransferError::task("rename", e))?;

        match tokio::fs::rename(&record.filename, &target).await {
            Ok(()) => {}
            // Already moved by an attempt that died before persisting
            Err(e) if e.kind() == io::ErrorKind::NotFound && target.exists() => {}
            Err(_) => {
                // Cross-device move
                tokio::fs::copy(&record.filename, &target)
                    .await
                    .map_err(|e| TransferError::task("rename", format!("{}: {}", record.filename, e)))?;
                tokio::fs::remove_file(&record.filename)
                    .await
                    .map_err(|e| TransferError::task("rename", e))?;
            }
        }

        tracing::debug!("Moved {} to {}", record.filename, target.display());
        record.filename = target.to_string_lossy().into_owned();
        Ok(())
    }
}

/// Deletes the file; a missing file counts as deleted
#[derive(Debug, Clone, Copy)]
pub struct DeleteTask;

#[async_trait]
impl Task for DeleteTask {
    fn name(&self) -> &str {
        "delete"
    }

    async fn run(&self, _phase: TaskPhase, record: &mut TransferRecord) -> Result<()> {
        match tokio::fs::remove_file(&record.filename).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TransferError::task("delete", format!("{}: {}", record.filename, e))),
        }
    }
}
