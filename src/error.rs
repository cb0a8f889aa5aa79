//! Error types for benchbox.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;
use uuid::Uuid;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Sandbox could not be established
    #[error("Sandbox setup failed")]
    #[diagnostic(code(benchbox::sandbox::setup))]
    Setup(#[from] SetupError),

    /// Sandbox could not be torn down
    #[error("Sandbox teardown failed")]
    #[diagnostic(code(benchbox::sandbox::teardown))]
    Teardown(#[from] TeardownError),

    /// A guarded command failed or was interrupted
    #[error("Guarded command error")]
    #[diagnostic(code(benchbox::run::command))]
    Command(#[from] CommandError),

    /// The run ledger could not record a lifecycle transition
    #[error("Run ledger error")]
    #[diagnostic(code(benchbox::ledger))]
    Ledger(#[from] LedgerError),

    /// A pipeline step failed
    #[error("Pipeline step failed")]
    #[diagnostic(code(benchbox::pipeline))]
    Pipeline(#[from] PipelineError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(benchbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors raised while establishing a sandbox.
///
/// These are fatal and never retried: the sandbox never enters the
/// mounted state when one of these occurs.
#[derive(Error, Debug, Diagnostic)]
pub enum SetupError {
    /// The read-only base layer is missing
    #[error("Base directory does not exist: {path}")]
    #[diagnostic(
        code(benchbox::sandbox::missing_base),
        help("Unpack the project's container image before mounting")
    )]
    MissingBaseDir { path: PathBuf },

    /// The writable image layer is missing
    #[error("Image directory does not exist: {path}")]
    #[diagnostic(
        code(benchbox::sandbox::missing_image),
        help("Create the image directory inside the build tree, or check the image prefix")
    )]
    MissingImageDir { path: PathBuf },

    /// The overlay tool refused to mount
    #[error("Overlay mount failed at {mountpoint}: {detail}")]
    #[diagnostic(code(benchbox::sandbox::mount_failed))]
    MountFailed { mountpoint: PathBuf, detail: String },

    /// Failed to create a mountpoint or helper directory
    #[error("Failed to prepare {path}: {source}")]
    #[diagnostic(code(benchbox::sandbox::prepare))]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while tearing down a sandbox.
///
/// Surfaced only after the retry budget is exhausted. A teardown error
/// triggered by a prior step failure never masks that failure; both are
/// reported.
#[derive(Error, Debug, Diagnostic)]
pub enum TeardownError {
    /// The mountpoint vanished before teardown
    #[error("Mountpoint does not exist: {path}")]
    #[diagnostic(code(benchbox::sandbox::missing_mountpoint))]
    MissingMountpoint { path: PathBuf },

    /// The mountpoint still reports as mounted after all retries
    #[error("Failed to unmount {mountpoint} after {attempts} attempts")]
    #[diagnostic(
        code(benchbox::sandbox::still_mounted),
        help("Check for lingering open file handles below the mountpoint, then unmount manually")
    )]
    StillMounted { mountpoint: PathBuf, attempts: u32 },
}

/// Errors surfaced by the guarded command runner.
///
/// Both variants carry the run id so the ledger entry can be correlated
/// after the fact.
#[derive(Error, Debug, Diagnostic)]
pub enum CommandError {
    /// The command exited with an unaccepted return code
    #[error("Command failed with exit code {exit_code} (run {run_id})")]
    #[diagnostic(
        code(benchbox::run::failed),
        help("stdout/stderr are preserved in the run ledger for post-mortem inspection")
    )]
    Failed {
        run_id: Uuid,
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    /// The command was interrupted before it could exit normally
    #[error("Command interrupted (run {run_id})")]
    #[diagnostic(code(benchbox::run::interrupted))]
    Interrupted { run_id: Uuid },

    /// The command could not be spawned at all
    #[error("Failed to spawn {program}: {source}")]
    #[diagnostic(code(benchbox::run::spawn))]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the run ledger's backing store.
///
/// A failed commit is never swallowed; every lifecycle transition must be
/// durable before the pipeline proceeds.
#[derive(Error, Debug, Diagnostic)]
pub enum LedgerError {
    /// A lifecycle transition could not be committed
    #[error("Failed to commit {context}: {source}")]
    #[diagnostic(code(benchbox::ledger::commit))]
    Commit {
        context: String,
        #[source]
        source: std::io::Error,
    },

    /// A stored record could not be decoded
    #[error("Corrupt ledger entry: {reason}")]
    #[diagnostic(code(benchbox::ledger::corrupt))]
    Corrupt { reason: String },
}

/// Errors raised by a single pipeline step.
#[derive(Error, Debug, Diagnostic)]
pub enum PipelineError {
    /// A guarded command inside the step failed
    #[error("Command error in step")]
    #[diagnostic(code(benchbox::pipeline::command))]
    Command(#[from] CommandError),

    /// The ledger refused a transition inside the step
    #[error("Ledger error in step")]
    #[diagnostic(code(benchbox::pipeline::ledger))]
    Ledger(#[from] LedgerError),

    /// The recipe reported a failure that is not tied to one command
    #[error("Recipe step '{step}' failed: {reason}")]
    #[diagnostic(code(benchbox::pipeline::recipe))]
    Recipe { step: &'static str, reason: String },

    /// Filesystem work inside the step failed
    #[error("I/O error in step: {context}")]
    #[diagnostic(code(benchbox::pipeline::io))]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
