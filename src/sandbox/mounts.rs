//! Mountpoint computation for restricted-root execution.
//!
//! Configured container mount sources are materialized as numbered
//! mountpoints under a fixed prefix (`mnt/0`, `mnt/1`, ...). The numbering
//! is significant: search paths and library paths are derived in the same
//! order, so mount 0 shadows mount 1, and every mount shadows the standard
//! system paths appended as a fallback.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::error::SetupError;

/// Standard system paths appended after all mount-derived search paths.
pub const SYSTEM_SEARCH_PATHS: &[&str] = &["/usr/bin", "/bin", "/usr/sbin", "/sbin"];

/// A host directory and the sandbox-relative mountpoint it appears at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Host path to expose inside the restricted root.
    pub source: PathBuf,
    /// Mountpoint relative to the sandbox root (e.g. `mnt/0`).
    pub mountpoint: PathBuf,
}

/// Creates numbered mountpoint directories for the given sources.
///
/// Returns the mounts in source order. Idempotent: existing mountpoint
/// directories are not an error, so a sandbox session can be re-prepared
/// with the same input.
///
/// # Errors
///
/// Returns [`SetupError::Io`] if a mountpoint directory cannot be created.
pub fn prepare_mounts(prefix: &Path, sources: &[PathBuf]) -> Result<Vec<Mount>, SetupError> {
    let mut mounts = Vec::with_capacity(sources.len());
    for (i, source) in sources.iter().enumerate() {
        let mountpoint = prefix.join(i.to_string());
        fs::create_dir_all(&mountpoint).map_err(|e| SetupError::Io {
            path: mountpoint.clone(),
            source: e,
        })?;
        trace!(source = %source.display(), mountpoint = %mountpoint.display(), "Prepared mountpoint");
        mounts.push(Mount {
            source: source.clone(),
            mountpoint,
        });
    }
    debug!(count = mounts.len(), "Mountpoints prepared");
    Ok(mounts)
}

/// Derives the search path and library path contributed by the mounts.
///
/// For mounts `m0..mn` the search path is
/// `[/m0/bin, ..., /mn/bin, /m0, ..., /mn]` followed by
/// [`SYSTEM_SEARCH_PATHS`], so sandbox-provided binaries shadow system
/// binaries of the same name. The library path is `[/m0/lib, ..., /mn/lib]`.
#[must_use]
pub fn derive_paths(mounts: &[Mount]) -> (Vec<String>, Vec<String>) {
    let mut search: Vec<String> = mounts
        .iter()
        .map(|m| format!("/{}/bin", m.mountpoint.display()))
        .collect();
    search.extend(mounts.iter().map(|m| format!("/{}", m.mountpoint.display())));
    search.extend(SYSTEM_SEARCH_PATHS.iter().map(|p| (*p).to_string()));

    let libraries: Vec<String> = mounts
        .iter()
        .map(|m| format!("/{}/lib", m.mountpoint.display()))
        .collect();

    (search, libraries)
}

/// Joins path entries into a single `PATH`-style value.
#[must_use]
pub fn list_to_path(parts: &[String]) -> String {
    parts.join(":")
}
