//! Copy-on-write overlay sessions around sandboxed builds.
//!
//! An overlay session moves through `unmounted -> mounting -> mounted ->
//! unmounting -> unmounted`. Setup failures are fatal and leave the session
//! unmounted; teardown retries the unmount a bounded number of times,
//! flushing writes between attempts, and only then fails hard.
//!
//! [`with_sandbox`] is the scoped-acquisition entry point: it opens a run
//! group, mounts the overlay, relocates the project's build directory into
//! the mountpoint for the duration of the closure, and unconditionally
//! restores the directory and tears the mount down afterwards. Teardown runs
//! on every exit path, and a teardown failure never masks the closure's own
//! error.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{Error, Result, SetupError, TeardownError};
use crate::ledger::Ledger;
use crate::project::Project;
use crate::runner::GuardedRunner;

/// Resolved directory layout of one overlay session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLayout {
    /// Read-only base layer (the unpacked container image).
    pub base_dir: PathBuf,
    /// Writable upper layer capturing all modifications.
    pub image_dir: PathBuf,
    /// Where the union of both layers is mounted.
    pub mountpoint: PathBuf,
}

/// Computes the overlay layout for a project.
///
/// The writable image layer normally lives inside the build directory. When
/// an image prefix is configured it is relocated there instead (keeping the
/// build-root-relative path), and the relocated directory is registered for
/// later reclamation since no build-directory cleanup will ever reach it.
#[must_use]
pub fn resolve_layout(project: &Project, config: &Config) -> OverlayLayout {
    let image_dir = match &config.image_prefix {
        Some(prefix) => {
            let relative = project
                .builddir
                .strip_prefix(&config.build_dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| PathBuf::from(&project.name));
            let relocated = prefix.join(relative);
            config.cleanup.register(&relocated);
            relocated.join("image")
        }
        None => project.builddir.join("image"),
    };

    OverlayLayout {
        base_dir: project.image.base.clone(),
        image_dir,
        mountpoint: project.builddir.join("union"),
    }
}

/// Mounts the copy-on-write union of the layout's layers.
///
/// Both layers must already exist; the mountpoint is created if missing.
/// Fatal on any failure, never retried.
///
/// # Errors
///
/// Returns [`SetupError`] if a layer is missing, the mountpoint cannot be
/// created, or the overlay tool refuses the mount.
#[instrument(skip(config, layout), fields(mountpoint = %layout.mountpoint.display()))]
pub fn unionfs_set_up(config: &Config, layout: &OverlayLayout) -> std::result::Result<(), SetupError> {
    if !layout.base_dir.is_dir() {
        return Err(SetupError::MissingBaseDir {
            path: layout.base_dir.clone(),
        });
    }
    if !layout.image_dir.is_dir() {
        return Err(SetupError::MissingImageDir {
            path: layout.image_dir.clone(),
        });
    }
    fs::create_dir_all(&layout.mountpoint).map_err(|e| SetupError::Io {
        path: layout.mountpoint.clone(),
        source: e,
    })?;

    let output = Command::new(&config.overlay_tool)
        .arg("-o")
        .arg("allow_other,cow")
        .arg(format!(
            "{}=RW:{}=RO",
            layout.image_dir.display(),
            layout.base_dir.display()
        ))
        .arg(&layout.mountpoint)
        .output()
        .map_err(|e| SetupError::MountFailed {
            mountpoint: layout.mountpoint.clone(),
            detail: format!("failed to run {}: {}", config.overlay_tool.display(), e),
        })?;

    if !output.status.success() {
        return Err(SetupError::MountFailed {
            mountpoint: layout.mountpoint.clone(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    info!("Overlay mounted");
    Ok(())
}

/// Reports whether a path is currently a mountpoint, per `/proc/mounts`.
#[must_use]
pub fn is_mount_point(path: &Path) -> bool {
    let Ok(mounts) = fs::read_to_string("/proc/mounts") else {
        return false;
    };
    let wanted = path.display().to_string();
    mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .any(|mountpoint| mountpoint == wanted)
}

/// Unmounts the overlay at `mountpoint`, verifying with the `is_mounted`
/// predicate and retrying up to the configured budget.
///
/// Between attempts, writes are flushed via the configured sync tool.
/// A mountpoint the predicate already reports as unmounted counts as
/// success, so teardown is safe to call on a mount that fell away on its
/// own.
///
/// # Errors
///
/// Returns [`TeardownError::MissingMountpoint`] if the mountpoint directory
/// has vanished, or [`TeardownError::StillMounted`] once the retry budget is
/// exhausted.
pub fn tear_down_with<M>(
    config: &Config,
    mountpoint: &Path,
    is_mounted: M,
) -> std::result::Result<(), TeardownError>
where
    M: Fn(&Path) -> bool,
{
    if !mountpoint.exists() {
        return Err(TeardownError::MissingMountpoint {
            path: mountpoint.to_path_buf(),
        });
    }

    for attempt in 1..=config.unmount_retries {
        match Command::new(&config.unmount_tool)
            .arg("-u")
            .arg(mountpoint)
            .output()
        {
            Ok(output) if output.status.success() => {}
            Ok(output) => {
                warn!(
                    attempt,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Unmount attempt reported failure"
                );
            }
            Err(e) => {
                warn!(attempt, error = %e, "Failed to run unmount tool");
            }
        }

        if !is_mounted(mountpoint) {
            debug!(attempt, mountpoint = %mountpoint.display(), "Overlay unmounted");
            return Ok(());
        }

        if attempt < config.unmount_retries {
            if let Err(e) = Command::new(&config.sync_tool).output() {
                warn!(attempt, error = %e, "Failed to run sync tool");
            }
        }
    }

    Err(TeardownError::StillMounted {
        mountpoint: mountpoint.to_path_buf(),
        attempts: config.unmount_retries,
    })
}

/// Unmounts the overlay at `mountpoint`, checking `/proc/mounts` between
/// attempts.
///
/// # Errors
///
/// See [`tear_down_with`].
#[instrument(skip(config))]
pub fn unionfs_tear_down(
    config: &Config,
    mountpoint: &Path,
) -> std::result::Result<(), TeardownError> {
    tear_down_with(config, mountpoint, is_mount_point)
}

/// Scope guard over one mounted session: relocates the project's build
/// directory to the mountpoint on construction, and on drop restores it
/// and tears the overlay down.
///
/// Construction is the only place the relocation happens, so `Drop`
/// covers every exit path out of the closure, including unwinding.
/// [`release`](Self::release) is the normal path; it disarms the drop
/// handler and surfaces the teardown result instead of just logging it.
struct SessionGuard<'a> {
    config: &'a Config,
    mountpoint: &'a Path,
    project: &'a mut Project,
    saved_builddir: Option<PathBuf>,
}

impl<'a> SessionGuard<'a> {
    fn new(config: &'a Config, mountpoint: &'a Path, project: &'a mut Project) -> Self {
        let saved = std::mem::replace(&mut project.builddir, mountpoint.to_path_buf());
        Self {
            config,
            mountpoint,
            project,
            saved_builddir: Some(saved),
        }
    }

    fn project(&mut self) -> &mut Project {
        self.project
    }

    fn restore_builddir(&mut self) {
        if let Some(saved) = self.saved_builddir.take() {
            self.project.builddir = saved;
        }
    }

    /// Restores the build directory and tears down, disarming the drop
    /// handler.
    fn release(mut self) -> std::result::Result<(), TeardownError> {
        self.restore_builddir();
        unionfs_tear_down(self.config, self.mountpoint)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        // Only reached when release() never ran, i.e. the closure unwound.
        if self.saved_builddir.is_some() {
            self.restore_builddir();
            if let Err(e) = unionfs_tear_down(self.config, self.mountpoint) {
                warn!(error = %e, "Teardown during unwind failed");
            }
        }
    }
}

/// Runs `f` inside a mounted overlay session, recording the whole
/// invocation as one run group.
///
/// Lifecycle:
///
/// 1. a run group is opened for `project` under `experiment`;
/// 2. the overlay is mounted (a setup failure finalizes the group as
///    failed and aborts);
/// 3. the project's build directory is relocated to the mountpoint and `f`
///    runs with a [`GuardedRunner`] scoped to the group;
/// 4. the build directory is restored and the overlay is torn down on
///    every exit path — a drop guard covers unwinding out of `f` as well,
///    though in that case the group is left `running` and the panic
///    continues to propagate;
/// 5. the group is finalized exactly once: completed only when both `f`
///    and teardown succeeded.
///
/// A teardown failure after `f` already failed is logged, and `f`'s error
/// is the one returned. A ledger failure while finalizing the group after
/// a teardown failure is likewise logged; the teardown error wins.
///
/// # Errors
///
/// Propagates setup, closure, teardown, and ledger errors per the lifecycle
/// above.
#[instrument(skip(config, layout, project, ledger, f), fields(project = %project.name, experiment))]
pub fn with_sandbox<T, F>(
    config: &Config,
    layout: &OverlayLayout,
    project: &mut Project,
    ledger: &Ledger,
    experiment: &str,
    f: F,
) -> Result<T>
where
    F: FnOnce(&mut Project, &GuardedRunner) -> Result<T>,
{
    let group = ledger.begin_run_group(project, experiment)?;
    let group_id = group.id();

    if let Err(e) = unionfs_set_up(config, layout) {
        if let Err(ledger_err) = ledger.fail_run_group(group) {
            warn!(group = %group_id, error = %ledger_err, "Failed to finalize group after setup failure");
        }
        return Err(Error::Setup(e));
    }

    let runner = GuardedRunner::new(ledger, group_id);
    let mut guard = SessionGuard::new(config, &layout.mountpoint, project);
    let result = f(guard.project(), &runner);
    let teardown = guard.release();

    match (result, teardown) {
        (Ok(value), Ok(())) => {
            ledger.end_run_group(group)?;
            Ok(value)
        }
        (Ok(_), Err(td)) => {
            if let Err(ledger_err) = ledger.fail_run_group(group) {
                warn!(group = %group_id, error = %ledger_err, "Failed to finalize group after teardown failure");
            }
            Err(Error::Teardown(td))
        }
        (Err(e), Ok(())) => {
            if let Err(ledger_err) = ledger.fail_run_group(group) {
                warn!(group = %group_id, error = %ledger_err, "Failed to finalize group after closure failure");
            }
            Err(e)
        }
        (Err(e), Err(td)) => {
            warn!(group = %group_id, error = %td, "Teardown failed while handling an earlier error");
            if let Err(ledger_err) = ledger.fail_run_group(group) {
                warn!(group = %group_id, error = %ledger_err, "Failed to finalize group after closure failure");
            }
            Err(e)
        }
    }
}

/// Removes every directory registered for reclamation, returning how many
/// were removed.
///
/// Failures are logged and skipped so one stubborn directory does not block
/// the rest; failed paths stay registered for a later pass.
pub fn reclaim_cleanup_paths(config: &Config) -> usize {
    let mut reclaimed = 0;
    for path in config.cleanup.paths() {
        if !path.exists() {
            config.cleanup.unregister(&path);
            continue;
        }
        let entries = WalkDir::new(&path).into_iter().filter_map(|e| e.ok()).count();
        match fs::remove_dir_all(&path) {
            Ok(()) => {
                debug!(path = %path.display(), entries, "Reclaimed relocated directory");
                config.cleanup.unregister(&path);
                reclaimed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to reclaim directory");
            }
        }
    }
    reclaimed
}
