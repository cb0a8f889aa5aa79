//! Isolated-filesystem sandboxing for benchmark builds.
//!
//! Three layers compose one sandboxed build environment:
//!
//! - [`mounts`] computes and creates the numbered mountpoints that expose
//!   host directories inside the restricted root, and derives the
//!   `PATH`/`LD_LIBRARY_PATH` entries they contribute.
//! - [`chroot`] builds the restricted-root command line (root reassignment,
//!   uid/gid, disabled environment pass-through) around an arbitrary inner
//!   command, modelled as a command tree.
//! - [`overlay`] establishes the copy-on-write union mount around a build,
//!   relocates the project's build directory into it, and guarantees
//!   teardown on every exit path.
//!
//! The restricted-root and overlay tools are external executables; this
//! module only composes their command lines and observes `/proc/mounts`.

pub mod chroot;
pub mod mounts;
pub mod overlay;

pub use chroot::{build_restricted_command, restricted_with_mounts, CommandSpec, FlatCommand};
pub use mounts::{derive_paths, list_to_path, prepare_mounts, Mount, SYSTEM_SEARCH_PATHS};
pub use overlay::{
    is_mount_point, reclaim_cleanup_paths, resolve_layout, unionfs_set_up, unionfs_tear_down,
    with_sandbox, OverlayLayout,
};
