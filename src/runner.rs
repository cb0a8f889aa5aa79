//! Guarded execution of external commands.
//!
//! Every externally visible command runs through [`GuardedRunner`], which
//! wraps the spawn in ledger bookkeeping: the run record is committed as
//! `running` before the process starts, and finalized exactly once with the
//! exit code and captured output. Output pipes are drained on dedicated
//! threads while the child runs, so a chatty build cannot deadlock against
//! a full pipe buffer.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::{CommandError, PipelineError};
use crate::ledger::{GroupId, Ledger, RunId, INTERRUPT_MESSAGE, INTERRUPT_SENTINEL};
use crate::project::Project;
use crate::sandbox::CommandSpec;

/// Installs a process-wide SIGINT flag handler and returns the flag.
///
/// A terminal Ctrl-C is delivered to the whole foreground process group.
/// The driver must outlive it: the in-flight child dies with the signal,
/// [`GuardedRunner::run_guarded`] records the interrupted run, and the
/// sandbox scope still tears down before the process exits non-zero. The
/// flag turns true once the signal arrives so the caller can stop
/// scheduling further work.
///
/// # Errors
///
/// Returns an I/O error if the handler cannot be registered.
pub fn install_interrupt_flag() -> std::io::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&flag))?;
    Ok(flag)
}

/// One command to execute under ledger guard.
#[derive(Debug, Clone)]
pub struct RunCommand {
    /// The command tree to spawn.
    pub spec: CommandSpec,
    /// Exit code treated as success.
    pub accepted_code: i32,
}

impl RunCommand {
    /// Creates a command that accepts exit code 0.
    #[must_use]
    pub fn new(spec: CommandSpec) -> Self {
        Self {
            spec,
            accepted_code: 0,
        }
    }

    /// Treats the given exit code as success instead of 0.
    ///
    /// Some benchmark workloads signal success through a nonzero code.
    #[must_use]
    pub fn with_accepted_code(mut self, code: i32) -> Self {
        self.accepted_code = code;
        self
    }
}

/// Result of one guarded command that was accepted as successful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// Ledger id of the run record.
    pub run_id: RunId,
    /// Actual exit code of the command.
    pub exit_code: i32,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl RunOutcome {
    /// True when the command exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Folds another outcome into this one: the first nonzero exit code
    /// wins, outputs are concatenated, and the latest run id is kept.
    #[must_use]
    pub fn fold(mut self, other: Self) -> Self {
        if self.exit_code == 0 {
            self.exit_code = other.exit_code;
        }
        self.stdout.push_str(&other.stdout);
        self.stderr.push_str(&other.stderr);
        self.run_id = other.run_id;
        self
    }
}

/// Everything a recipe operation needs to execute commands under guard.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    /// Name of the experiment driving this invocation.
    pub experiment: &'a str,
    /// Process configuration.
    pub config: &'a Config,
    /// Runner scoped to the current run group.
    pub runner: &'a GuardedRunner<'a>,
}

/// Executes commands with ledger bookkeeping, scoped to one run group.
#[derive(Debug, Clone, Copy)]
pub struct GuardedRunner<'a> {
    ledger: &'a Ledger,
    group: GroupId,
}

impl<'a> GuardedRunner<'a> {
    /// Creates a runner recording into the given group.
    #[must_use]
    pub fn new(ledger: &'a Ledger, group: GroupId) -> Self {
        Self { ledger, group }
    }

    /// Returns the group all runs are recorded under.
    #[must_use]
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// Spawns the command and records its full lifecycle in the ledger.
    ///
    /// The run record is committed as `running` before the process starts.
    /// Environment overrides from the command tree are applied on top of
    /// the ambient process environment; isolation from the host environment
    /// is the restricted-root tool's job, not this one's.
    ///
    /// # Errors
    ///
    /// - [`CommandError::Spawn`] if the process cannot start (recorded as a
    ///   failed run with status code 127);
    /// - [`CommandError::Failed`] on an unaccepted exit code;
    /// - [`CommandError::Interrupted`] when the process is terminated by a
    ///   signal (recorded with the interrupt sentinel);
    /// - [`PipelineError::Ledger`] when a lifecycle transition cannot be
    ///   committed.
    #[instrument(skip(self, command, project), fields(project = %project.name))]
    pub fn run_guarded(
        &self,
        command: &RunCommand,
        project: &Project,
        experiment: &str,
    ) -> Result<RunOutcome, PipelineError> {
        let rendered = command.spec.rendered();
        let handle = self
            .ledger
            .begin_run(&rendered, project, experiment, self.group)?;
        let run_id = handle.id();

        let flat = command.spec.flatten();
        let mut process = Command::new(&flat.program);
        process
            .args(&flat.argv)
            .envs(&flat.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &flat.cwd {
            process.current_dir(cwd);
        }

        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                let program = flat.program.display().to_string();
                let detail = e.to_string();
                self.ledger.fail_run(handle, 127, String::new(), detail)?;
                return Err(CommandError::Spawn { program, source: e }.into());
            }
        };

        let stdout_thread = child.stdout.take().map(drain_pipe);
        let stderr_thread = child.stderr.take().map(drain_pipe);

        let status = match child.wait() {
            Ok(status) => status,
            Err(e) => {
                self.ledger
                    .fail_run(handle, 127, String::new(), e.to_string())?;
                return Err(PipelineError::Io {
                    context: format!("waiting for {rendered}"),
                    source: e,
                });
            }
        };

        let stdout = join_pipe(stdout_thread);
        let stderr = join_pipe(stderr_thread);

        match status.code() {
            Some(code) if code == command.accepted_code => {
                self.ledger.end_run(handle, stdout.clone(), stderr.clone())?;
                debug!(run = %run_id, code, "Command completed");
                Ok(RunOutcome {
                    run_id,
                    exit_code: code,
                    stdout,
                    stderr,
                })
            }
            Some(code) => {
                self.ledger
                    .fail_run(handle, code, stdout.clone(), stderr.clone())?;
                warn!(run = %run_id, code, "Command failed");
                Err(CommandError::Failed {
                    run_id,
                    exit_code: code,
                    stdout,
                    stderr,
                }
                .into())
            }
            None => {
                self.ledger.fail_run(
                    handle,
                    INTERRUPT_SENTINEL,
                    String::new(),
                    INTERRUPT_MESSAGE.to_string(),
                )?;
                warn!(run = %run_id, "Command interrupted");
                Err(CommandError::Interrupted { run_id }.into())
            }
        }
    }
}

fn drain_pipe<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        let _ = pipe.read_to_end(&mut buffer);
        buffer
    })
}

fn join_pipe(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}
