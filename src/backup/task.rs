use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use derive_more::Display;

use super::DumpError;

const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Path of the archive of `database` started at `started`.
///
/// `<backup_root>/backup-<YYYYMMDD-HHMMSS>-<database>.gz`
pub fn destination_path(backup_root: &Path, database: &str, started: NaiveDateTime) -> PathBuf {
    let timestamp = started.format(TIMESTAMP_FORMAT);
    backup_root.join(format!("backup-{timestamp}-{database}.gz"))
}

/// Reason a [BackupTask] was skipped.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    #[display("database does not exist")]
    DoesNotExist,
}

/// State of a [BackupTask].
///
/// `Pending -> {Skipped | Cancelled | Running -> {Success | Failed}}`
#[derive(Debug, Default)]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Success,
    Skipped(SkipReason),
    Failed(DumpError),
    /// The run was cancelled before the task started.
    Cancelled,
}

impl TaskState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

/// Backup of a single database within a run.
#[derive(Debug)]
pub struct BackupTask {
    database: String,
    destination: Option<PathBuf>,
    state: TaskState,
}

impl BackupTask {
    pub(super) fn new(database: String) -> Self {
        Self {
            database,
            destination: None,
            state: TaskState::Pending,
        }
    }

    pub(super) fn start(&mut self, destination: PathBuf) {
        debug_assert!(matches!(self.state, TaskState::Pending));
        self.destination = Some(destination);
        self.state = TaskState::Running;
    }

    pub(super) fn finish(&mut self, state: TaskState) {
        debug_assert!(state.is_finished());
        self.state = state;
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Archive path, known once the task started running.
    pub fn destination(&self) -> Option<&Path> {
        self.destination.as_deref()
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn is_success(&self) -> bool {
        matches!(self.state, TaskState::Success)
    }
}
