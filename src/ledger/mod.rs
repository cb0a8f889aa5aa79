//! Transactional recorder of run lifecycles.
//!
//! The ledger owns persistence of [`RunGroup`] and [`RunRecord`] rows. Every
//! lifecycle transition (begin, end, fail) is one committed transaction on
//! the backing store; a failed commit surfaces as [`LedgerError`] and is
//! never swallowed.
//!
//! # Exactly-once finalization
//!
//! `begin_run` hands out a [`RunHandle`], and both finalizers consume it.
//! A record therefore cannot be finalized twice, and a handle that is
//! neither completed nor failed is a bug visible in the ledger (the record
//! stays `running`).
//!
//! # Layout
//!
//! One group per sandboxed experiment-over-project invocation; every run
//! recorded during that invocation points back at its group.

mod store;

pub use store::{JsonStore, LedgerStore, MemoryStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::project::Project;

/// Unique identifier for a run.
pub type RunId = Uuid;

/// Unique identifier for a run group.
pub type GroupId = Uuid;

/// Status code recorded when a run is cut short by an interrupt.
pub const INTERRUPT_SENTINEL: i32 = -1;

/// Fixed message recorded for interrupted runs.
pub const INTERRUPT_MESSAGE: &str = "interrupted by user";

/// Lifecycle status shared by runs and run groups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Started but not yet finalized.
    #[default]
    Running,
    /// Finalized successfully.
    Completed,
    /// Finalized unsuccessfully.
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Captured output and numeric status of one finalized run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLog {
    /// Exit code of the command, or [`INTERRUPT_SENTINEL`].
    pub status_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// One execution of an external command under an experiment.
///
/// Created with status `running` before the command starts and finalized
/// exactly once; never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Unique run identifier.
    pub id: RunId,
    /// Group this run belongs to.
    pub group: GroupId,
    /// Owning project name.
    pub project: String,
    /// Owning experiment name.
    pub experiment: String,
    /// Rendered command line, for post-mortem correlation.
    pub command: String,
    /// When the command started.
    pub begin: DateTime<Utc>,
    /// When the command ended; `None` while running.
    pub end: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Captured output; `None` while running.
    pub log: Option<RunLog>,
}

/// Aggregates all runs of one logical experiment-over-project invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunGroup {
    /// Unique group identifier.
    pub id: GroupId,
    /// Owning project name.
    pub project: String,
    /// Owning experiment name.
    pub experiment: String,
    /// When the invocation started.
    pub begin: DateTime<Utc>,
    /// When the invocation ended; `None` while running.
    pub end: Option<DateTime<Utc>>,
    /// Lifecycle status.
    pub status: RunStatus,
}

/// Consuming handle for an unfinalized run.
///
/// Not clonable; finalizing moves the handle, so exactly one finalization
/// can ever happen.
#[derive(Debug)]
pub struct RunHandle {
    record: RunRecord,
}

impl RunHandle {
    /// Returns the run id for correlation.
    #[must_use]
    pub fn id(&self) -> RunId {
        self.record.id
    }
}

/// Consuming handle for an unfinalized run group.
#[derive(Debug)]
pub struct GroupHandle {
    group: RunGroup,
}

impl GroupHandle {
    /// Returns the group id for correlation.
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.group.id
    }
}

/// Transactional run recorder backed by a [`LedgerStore`].
pub struct Ledger {
    store: Box<dyn LedgerStore>,
}

impl Ledger {
    /// Creates a ledger over the given backing store.
    #[must_use]
    pub fn new(store: Box<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Begins a run group for one experiment-over-project invocation.
    ///
    /// The group is committed with status `running` before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the commit fails.
    pub fn begin_run_group(
        &self,
        project: &Project,
        experiment: &str,
    ) -> Result<GroupHandle, LedgerError> {
        let group = RunGroup {
            id: Uuid::new_v4(),
            project: project.name.clone(),
            experiment: experiment.to_string(),
            begin: Utc::now(),
            end: None,
            status: RunStatus::Running,
        };
        self.store.commit_group(&group)?;
        tracing::debug!(group = %group.id, project = %group.project, "Run group started");
        Ok(GroupHandle { group })
    }

    /// Finalizes a run group successfully.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the commit fails.
    pub fn end_run_group(&self, handle: GroupHandle) -> Result<GroupId, LedgerError> {
        self.finalize_group(handle, RunStatus::Completed)
    }

    /// Finalizes a run group unsuccessfully.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the commit fails.
    pub fn fail_run_group(&self, handle: GroupHandle) -> Result<GroupId, LedgerError> {
        self.finalize_group(handle, RunStatus::Failed)
    }

    fn finalize_group(
        &self,
        handle: GroupHandle,
        status: RunStatus,
    ) -> Result<GroupId, LedgerError> {
        let mut group = handle.group;
        group.end = Some(Utc::now());
        group.status = status;
        self.store.commit_group(&group)?;
        tracing::debug!(group = %group.id, %status, "Run group finalized");
        Ok(group.id)
    }

    /// Begins a run for one external command.
    ///
    /// The record is committed with status `running` before the command is
    /// allowed to start.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the commit fails.
    pub fn begin_run(
        &self,
        command: &str,
        project: &Project,
        experiment: &str,
        group: GroupId,
    ) -> Result<RunHandle, LedgerError> {
        let record = RunRecord {
            id: Uuid::new_v4(),
            group,
            project: project.name.clone(),
            experiment: experiment.to_string(),
            command: command.to_string(),
            begin: Utc::now(),
            end: None,
            status: RunStatus::Running,
            log: None,
        };
        self.store.commit_run(&record)?;
        tracing::debug!(run = %record.id, command = %record.command, "Run started");
        Ok(RunHandle { record })
    }

    /// Finalizes a run successfully with status code 0 and captured output.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the commit fails.
    pub fn end_run(
        &self,
        handle: RunHandle,
        stdout: String,
        stderr: String,
    ) -> Result<RunId, LedgerError> {
        self.finalize_run(handle, RunStatus::Completed, 0, stdout, stderr)
    }

    /// Finalizes a run unsuccessfully with the given status code and output.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the commit fails.
    pub fn fail_run(
        &self,
        handle: RunHandle,
        status_code: i32,
        stdout: String,
        stderr: String,
    ) -> Result<RunId, LedgerError> {
        self.finalize_run(handle, RunStatus::Failed, status_code, stdout, stderr)
    }

    fn finalize_run(
        &self,
        handle: RunHandle,
        status: RunStatus,
        status_code: i32,
        stdout: String,
        stderr: String,
    ) -> Result<RunId, LedgerError> {
        let mut record = handle.record;
        record.end = Some(Utc::now());
        record.status = status;
        record.log = Some(RunLog {
            status_code,
            stdout,
            stderr,
        });
        self.store.commit_run(&record)?;
        tracing::debug!(run = %record.id, %status, status_code, "Run finalized");
        Ok(record.id)
    }

    /// Loads a run record for post-mortem inspection.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the store cannot be read.
    pub fn run(&self, id: RunId) -> Result<Option<RunRecord>, LedgerError> {
        self.store.load_run(id)
    }

    /// Loads a run group for post-mortem inspection.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the store cannot be read.
    pub fn group(&self, id: GroupId) -> Result<Option<RunGroup>, LedgerError> {
        self.store.load_group(id)
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger").finish_non_exhaustive()
    }
}
