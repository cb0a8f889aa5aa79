//! Process-wide configuration.
//!
//! One `Config` is constructed per process and passed by reference into each
//! component. There is no ambient global lookup inside core logic; anything a
//! component needs arrives through this struct.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Default number of unmount attempts before teardown fails hard.
pub const DEFAULT_UNMOUNT_RETRIES: u32 = 3;

/// Configuration for one benchbox process.
///
/// # Example
///
/// ```
/// use benchbox::config::Config;
///
/// let config = Config::new("/tmp/benchbox")
///     .with_container_mounts(vec!["/opt/llvm".into()])
///     .with_jobs(4)
///     .with_unmount_retries(5);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which all project build directories live.
    pub build_dir: PathBuf,

    /// Host directories made available inside the restricted root, in
    /// priority order (index 0 shadows index 1, and so on).
    pub container_mounts: Vec<PathBuf>,

    /// Prefix under which numbered mountpoints are materialized
    /// (`mnt/0`, `mnt/1`, ...).
    pub mount_prefix: PathBuf,

    /// External overlay-filesystem tool (copy-on-write union mount).
    pub overlay_tool: PathBuf,

    /// External tool used to unmount the overlay.
    pub unmount_tool: PathBuf,

    /// External tool invoked between unmount retries to flush writes.
    pub sync_tool: PathBuf,

    /// External restricted-root tool.
    pub chroot_tool: PathBuf,

    /// uid the restricted root runs as.
    pub uid: u32,

    /// gid the restricted root runs as.
    pub gid: u32,

    /// Unmount attempts before teardown is declared failed.
    pub unmount_retries: u32,

    /// Parallel job count handed to build recipes.
    pub jobs: u32,

    /// Optional prefix that relocates image directories onto separate
    /// storage (e.g. cluster-local scratch space).
    pub image_prefix: Option<PathBuf>,

    /// Registry of directories created outside the build tree that a later
    /// pass must reclaim.
    pub cleanup: CleanupRegistry,
}

impl Config {
    /// Creates a configuration rooted at the given build directory.
    #[must_use]
    pub fn new(build_dir: impl Into<PathBuf>) -> Self {
        Self {
            build_dir: build_dir.into(),
            container_mounts: Vec::new(),
            mount_prefix: PathBuf::from("mnt"),
            overlay_tool: PathBuf::from("unionfs"),
            unmount_tool: PathBuf::from("fusermount"),
            sync_tool: PathBuf::from("sync"),
            chroot_tool: PathBuf::from("uchroot"),
            uid: 0,
            gid: 0,
            unmount_retries: DEFAULT_UNMOUNT_RETRIES,
            jobs: 1,
            image_prefix: None,
            cleanup: CleanupRegistry::new(),
        }
    }

    /// Sets the host directories mounted into the restricted root.
    #[must_use]
    pub fn with_container_mounts(mut self, mounts: Vec<PathBuf>) -> Self {
        self.container_mounts = mounts;
        self
    }

    /// Sets the uid/gid the restricted root runs as.
    #[must_use]
    pub fn with_identity(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Sets the unmount retry budget.
    ///
    /// The default of 3 is a tunable, not a contract.
    #[must_use]
    pub fn with_unmount_retries(mut self, retries: u32) -> Self {
        self.unmount_retries = retries;
        self
    }

    /// Sets the parallel job count for build recipes.
    #[must_use]
    pub fn with_jobs(mut self, jobs: u32) -> Self {
        self.jobs = jobs;
        self
    }

    /// Relocates image directories under the given prefix.
    #[must_use]
    pub fn with_image_prefix(mut self, prefix: impl Into<PathBuf>) -> Self {
        self.image_prefix = Some(prefix.into());
        self
    }

    /// Overrides the external overlay tool.
    #[must_use]
    pub fn with_overlay_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.overlay_tool = tool.into();
        self
    }

    /// Overrides the external unmount tool.
    #[must_use]
    pub fn with_unmount_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.unmount_tool = tool.into();
        self
    }

    /// Overrides the external sync tool.
    #[must_use]
    pub fn with_sync_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.sync_tool = tool.into();
        self
    }

    /// Overrides the external restricted-root tool.
    #[must_use]
    pub fn with_chroot_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.chroot_tool = tool.into();
        self
    }
}

/// Tracks directories created outside the normal build tree so a later
/// pass can reclaim them.
///
/// Shared across components of one process; registration is serialized
/// internally.
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    paths: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl CleanupRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a directory for later reclamation. Duplicates are ignored.
    pub fn register(&self, path: impl Into<PathBuf>) {
        if let Ok(mut paths) = self.paths.lock() {
            paths.insert(path.into());
        }
    }

    /// Returns the registered paths in sorted order.
    #[must_use]
    pub fn paths(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Removes a path from the registry, returning true if it was present.
    pub fn unregister(&self, path: &Path) -> bool {
        self.paths
            .lock()
            .map(|mut paths| paths.remove(path))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::new("/tmp/bb");
        assert_eq!(config.build_dir, PathBuf::from("/tmp/bb"));
        assert_eq!(config.unmount_retries, DEFAULT_UNMOUNT_RETRIES);
        assert_eq!(config.uid, 0);
        assert_eq!(config.gid, 0);
        assert_eq!(config.mount_prefix, PathBuf::from("mnt"));
        assert!(config.container_mounts.is_empty());
        assert!(config.image_prefix.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = Config::new("/tmp/bb")
            .with_container_mounts(vec!["/srv/a".into(), "/srv/b".into()])
            .with_identity(1000, 1000)
            .with_unmount_retries(5)
            .with_jobs(8)
            .with_image_prefix("/scratch")
            .with_overlay_tool("/usr/bin/unionfs");

        assert_eq!(config.container_mounts.len(), 2);
        assert_eq!((config.uid, config.gid), (1000, 1000));
        assert_eq!(config.unmount_retries, 5);
        assert_eq!(config.jobs, 8);
        assert_eq!(config.image_prefix, Some(PathBuf::from("/scratch")));
        assert_eq!(config.overlay_tool, PathBuf::from("/usr/bin/unionfs"));
    }

    #[test]
    fn test_cleanup_registry_deduplicates() {
        let registry = CleanupRegistry::new();
        registry.register("/scratch/a");
        registry.register("/scratch/a");
        registry.register("/scratch/b");

        assert_eq!(
            registry.paths(),
            vec![PathBuf::from("/scratch/a"), PathBuf::from("/scratch/b")]
        );
    }

    #[test]
    fn test_cleanup_registry_shared_between_clones() {
        let registry = CleanupRegistry::new();
        let clone = registry.clone();
        clone.register("/scratch/x");

        assert_eq!(registry.paths(), vec![PathBuf::from("/scratch/x")]);
        assert!(registry.unregister(Path::new("/scratch/x")));
        assert!(clone.paths().is_empty());
    }
}
