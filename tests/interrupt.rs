//! Integration tests for interrupt handling.
//!
//! A terminal Ctrl-C reaches the whole foreground process group. The driver
//! installs a flag handler so it survives the signal while the in-flight
//! child dies with it; the child's death is recorded as an interrupted run
//! and the overlay is torn down before the process exits non-zero.
//!
//! The flag handler is process-global, so these tests live in their own
//! binary.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use benchbox::config::Config;
use benchbox::error::{CommandError, Error, PipelineError};
use benchbox::ledger::{Ledger, MemoryStore, RunStatus, INTERRUPT_MESSAGE, INTERRUPT_SENTINEL};
use benchbox::project::Project;
use benchbox::runner::{install_interrupt_flag, RunCommand};
use benchbox::sandbox::{resolve_layout, with_sandbox, CommandSpec};
use tempfile::TempDir;

/// Writes an executable stub that records each invocation in a marker file
/// before exiting 0.
fn recording_stub(dir: &Path, name: &str, marker: &Path) -> PathBuf {
    let path = dir.join(name);
    fs::write(
        &path,
        format!("#!/bin/sh\ntouch {}\nexit 0\n", marker.display()),
    )
    .expect("Failed to write stub tool");
    let mut perms = fs::metadata(&path)
        .expect("Failed to stat stub tool")
        .permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).expect("Failed to mark stub tool executable");
    path
}

/// SIGINT sets the flag instead of killing the process.
#[test]
fn test_sigint_sets_flag_and_process_survives() {
    let flag = install_interrupt_flag().expect("Failed to install handler");
    assert!(!flag.load(Ordering::SeqCst));

    let status = Command::new("sh")
        .args(["-c", &format!("kill -INT {}", std::process::id())])
        .status()
        .expect("Failed to send signal");
    assert!(status.success());

    let deadline = Instant::now() + Duration::from_secs(5);
    while !flag.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "Flag was never set");
        std::thread::sleep(Duration::from_millis(10));
    }
    // Reaching this assertion at all means the signal did not kill us
    assert!(flag.load(Ordering::SeqCst));
}

/// A guarded command killed by SIGINT mid-sandbox: the run record and group
/// are finalized as failed, the builddir is restored, and the unmount tool
/// still runs before the error propagates.
#[test]
fn test_interrupted_command_finalizes_ledger_and_tears_down() {
    let dir = TempDir::new().expect("Failed to create temp dir");

    let marker = dir.path().join("unmount-ran");
    let unmount_tool = recording_stub(dir.path(), "unmount-stub", &marker);
    let config = Config::new(dir.path())
        .with_overlay_tool("true")
        .with_unmount_tool(&unmount_tool)
        .with_sync_tool("true");

    let ledger = Ledger::new(Box::new(MemoryStore::new()));
    let mut project = Project::new("gzip", "compression", dir.path().join("base"), &config);
    let original_builddir = project.builddir.clone();

    fs::create_dir_all(&project.builddir).expect("Failed to create builddir");
    let layout = resolve_layout(&project, &config);
    fs::create_dir_all(&layout.base_dir).expect("Failed to create base layer");
    fs::create_dir_all(&layout.image_dir).expect("Failed to create image layer");

    let mut group_id = None;
    let err = with_sandbox(
        &config,
        &layout,
        &mut project,
        &ledger,
        "raw",
        |project, runner| {
            group_id = Some(runner.group());
            // The child signals itself, standing in for a terminal-wide
            // SIGINT that the surviving driver observes through wait()
            let command = RunCommand::new(CommandSpec::new("sh").args(["-c", "kill -INT $$"]));
            runner.run_guarded(&command, project, "raw")?;
            Ok(())
        },
    )
    .expect_err("Interrupted run should fail");

    let Error::Pipeline(PipelineError::Command(CommandError::Interrupted { run_id })) = err else {
        panic!("Expected an interrupt, got {err:?}");
    };

    let record = ledger
        .run(run_id)
        .expect("Failed to load run")
        .expect("Run missing");
    assert_eq!(record.status, RunStatus::Failed);
    let log = record.log.expect("Log missing");
    assert_eq!(log.status_code, INTERRUPT_SENTINEL);
    assert_eq!(log.stderr, INTERRUPT_MESSAGE);

    let group = ledger
        .group(group_id.expect("Closure never ran"))
        .expect("Failed to load group")
        .expect("Group missing");
    assert_eq!(group.status, RunStatus::Failed);
    assert!(group.end.is_some());

    assert_eq!(project.builddir, original_builddir);
    assert!(marker.is_file(), "Unmount tool never ran");
}
