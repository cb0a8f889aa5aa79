//! Integration tests for the overlay sandbox scope.
//!
//! The overlay and unmount tools are stubbed with `true`/`false` so these
//! tests exercise the full lifecycle (group bookkeeping, build-directory
//! relocation, teardown on every exit path) without FUSE privileges.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use benchbox::config::Config;
use benchbox::error::{CommandError, Error, LedgerError, PipelineError, SetupError, TeardownError};
use benchbox::ledger::{GroupId, Ledger, LedgerStore, MemoryStore, RunGroup, RunId, RunRecord, RunStatus};
use benchbox::project::Project;
use benchbox::runner::RunCommand;
use benchbox::sandbox::{
    restricted_with_mounts, resolve_layout, with_sandbox, CommandSpec, OverlayLayout,
};
use tempfile::TempDir;

fn stubbed_config(dir: &Path) -> Config {
    Config::new(dir)
        .with_overlay_tool("true")
        .with_unmount_tool("true")
        .with_sync_tool("true")
}

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

fn fixture(dir: &TempDir) -> (Config, Ledger, Project, OverlayLayout) {
    let config = stubbed_config(dir.path());
    let ledger = Ledger::new(Box::new(MemoryStore::new()));
    let project = Project::new("gzip", "compression", dir.path().join("base"), &config);

    fs::create_dir_all(&project.builddir).expect("Failed to create builddir");
    let layout = resolve_layout(&project, &config);
    fs::create_dir_all(&layout.base_dir).expect("Failed to create base layer");
    fs::create_dir_all(&layout.image_dir).expect("Failed to create image layer");

    (config, ledger, project, layout)
}

/// A successful closure completes the group and restores the builddir.
#[test]
fn test_sandbox_success_path() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (config, ledger, mut project, layout) = fixture(&dir);
    let original_builddir = project.builddir.clone();

    let mut seen_builddir = None;
    let group = with_sandbox(
        &config,
        &layout,
        &mut project,
        &ledger,
        "raw",
        |project, runner| {
            seen_builddir = Some(project.builddir.clone());
            let command = RunCommand::new(
                CommandSpec::new("sh")
                    .args(["-c", "echo inside"])
                    .current_dir(&project.builddir),
            );
            runner.run_guarded(&command, project, "raw")?;
            Ok(runner.group())
        },
    )
    .expect("Sandboxed run failed");

    // builddir was relocated to the mountpoint while the closure ran
    assert_eq!(seen_builddir, Some(layout.mountpoint.clone()));
    assert_eq!(project.builddir, original_builddir);

    let stored = ledger
        .group(group)
        .expect("Failed to load group")
        .expect("Group missing");
    assert_eq!(stored.status, RunStatus::Completed);
    assert!(stored.end.is_some());
}

/// A failing command inside the scope propagates unchanged, the group is
/// finalized as failed, and the builddir is still restored.
#[test]
fn test_sandbox_propagates_closure_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (config, ledger, mut project, layout) = fixture(&dir);
    let original_builddir = project.builddir.clone();

    let mut group_id = None;
    let err = with_sandbox(
        &config,
        &layout,
        &mut project,
        &ledger,
        "raw",
        |project, runner| {
            group_id = Some(runner.group());
            let command =
                RunCommand::new(CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 2"]));
            runner.run_guarded(&command, project, "raw")?;
            Ok(())
        },
    )
    .expect_err("Sandboxed run should fail");

    let Error::Pipeline(PipelineError::Command(CommandError::Failed {
        exit_code, stderr, ..
    })) = err
    else {
        panic!("Expected a command failure, got {err:?}");
    };
    assert_eq!(exit_code, 2);
    assert_eq!(stderr, "boom\n");
    assert_eq!(project.builddir, original_builddir);

    let stored = ledger
        .group(group_id.expect("Closure never ran"))
        .expect("Failed to load group")
        .expect("Group missing");
    assert_eq!(stored.status, RunStatus::Failed);
}

/// A missing writable layer aborts before anything mounts, and the group
/// still ends up finalized as failed.
#[test]
fn test_sandbox_setup_failure_is_fatal() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (config, ledger, mut project, layout) = fixture(&dir);
    fs::remove_dir_all(&layout.image_dir).expect("Failed to remove image layer");

    let err = with_sandbox(
        &config,
        &layout,
        &mut project,
        &ledger,
        "raw",
        |_, _| -> benchbox::Result<()> { panic!("Closure must not run after setup failure") },
    )
    .expect_err("Setup should fail");

    assert!(matches!(
        err,
        Error::Setup(SetupError::MissingImageDir { .. })
    ));
}

/// An overlay tool that refuses the mount surfaces its stderr.
#[test]
fn test_sandbox_mount_refusal() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (config, ledger, mut project, layout) = fixture(&dir);
    let config = config.with_overlay_tool("false");

    let err = with_sandbox(
        &config,
        &layout,
        &mut project,
        &ledger,
        "raw",
        |_, _| -> benchbox::Result<()> { panic!("Closure must not run after mount refusal") },
    )
    .expect_err("Mount should be refused");

    assert!(matches!(
        err,
        Error::Setup(SetupError::MountFailed { .. })
    ));
}

/// A recipe that unwinds still gets its build directory restored and the
/// overlay torn down while the panic propagates.
#[test]
fn test_sandbox_recovers_from_panicking_closure() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let (config, ledger, mut project, layout) = fixture(&dir);

    let marker = dir.path().join("unmount-ran");
    let unmount_tool = recording_stub(dir.path(), "unmount-stub", &marker);
    let config = config.with_unmount_tool(&unmount_tool);
    let original_builddir = project.builddir.clone();

    let result = catch_unwind(AssertUnwindSafe(|| {
        with_sandbox(
            &config,
            &layout,
            &mut project,
            &ledger,
            "raw",
            |_, _| -> benchbox::Result<()> { panic!("recipe exploded") },
        )
    }));

    assert!(result.is_err(), "Panic should propagate");
    assert_eq!(project.builddir, original_builddir);
    assert!(marker.is_file(), "Unmount tool never ran");
}

/// Store that accepts the opening group commit and refuses finalization.
struct RefusingFinalizeStore {
    inner: MemoryStore,
    group_commits: AtomicUsize,
}

impl RefusingFinalizeStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            group_commits: AtomicUsize::new(0),
        }
    }
}

impl LedgerStore for RefusingFinalizeStore {
    fn commit_group(&self, group: &RunGroup) -> Result<(), LedgerError> {
        if self.group_commits.fetch_add(1, Ordering::SeqCst) >= 1 {
            return Err(LedgerError::Corrupt {
                reason: "finalization refused".to_string(),
            });
        }
        self.inner.commit_group(group)
    }

    fn commit_run(&self, record: &RunRecord) -> Result<(), LedgerError> {
        self.inner.commit_run(record)
    }

    fn load_group(&self, id: GroupId) -> Result<Option<RunGroup>, LedgerError> {
        self.inner.load_group(id)
    }

    fn load_run(&self, id: RunId) -> Result<Option<RunRecord>, LedgerError> {
        self.inner.load_run(id)
    }
}

/// A teardown failure is what the caller sees even when finalizing the
/// group fails too; the ledger error is only logged.
#[test]
fn test_teardown_error_survives_failed_group_finalization() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = stubbed_config(dir.path());
    let ledger = Ledger::new(Box::new(RefusingFinalizeStore::new()));
    let mut project = Project::new("gzip", "compression", dir.path().join("base"), &config);

    fs::create_dir_all(&project.builddir).expect("Failed to create builddir");
    let layout = resolve_layout(&project, &config);
    fs::create_dir_all(&layout.base_dir).expect("Failed to create base layer");
    fs::create_dir_all(&layout.image_dir).expect("Failed to create image layer");

    // The closure succeeds but removes the mountpoint, so teardown cannot
    // find it and fails.
    let err = with_sandbox(
        &config,
        &layout,
        &mut project,
        &ledger,
        "raw",
        |_, _| -> benchbox::Result<()> {
            fs::remove_dir_all(&layout.mountpoint).expect("Failed to remove mountpoint");
            Ok(())
        },
    )
    .expect_err("Teardown should fail");

    assert!(matches!(
        err,
        Error::Teardown(TeardownError::MissingMountpoint { .. })
    ));
}

/// Restricted-root composition: numbered mounts, search paths on every node.
#[test]
fn test_restricted_command_composition() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = stubbed_config(dir.path())
        .with_container_mounts(vec!["/srv/llvm".into(), "/srv/gcc".into()]);

    let cmd = restricted_with_mounts(&config, dir.path())
        .expect("Failed to compose restricted command")
        .wrap(CommandSpec::new("make").arg("all"));

    let flat = cmd.flatten();
    let root = dir.path().display().to_string();
    assert_eq!(
        flat.argv,
        vec![
            "-C", "-w", "/", "-r",
            root.as_str(),
            "-u", "0", "-g", "0", "-E", "-A",
            "-M", "/srv/llvm:/mnt/0",
            "-M", "/srv/gcc:/mnt/1",
            "--",
            "make", "all",
        ]
    );
    assert_eq!(
        flat.env.get("PATH").map(String::as_str),
        Some("/mnt/0/bin:/mnt/1/bin:/mnt/0:/mnt/1:/usr/bin:/bin:/usr/sbin:/sbin")
    );
    assert_eq!(
        flat.env.get("LD_LIBRARY_PATH").map(String::as_str),
        Some("/mnt/0/lib:/mnt/1/lib")
    );
    assert!(dir.path().join("mnt/0").is_dir());
    assert!(dir.path().join("mnt/1").is_dir());
}
