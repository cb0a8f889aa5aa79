//! Restricted-root command composition.
//!
//! Commands are modelled as a tree: a restricted-root invocation wraps an
//! inner command, which may itself wrap further commands. Environment
//! overrides are applied as a pre-order traversal setting the override at
//! every node, so the resolved `PATH`/`LD_LIBRARY_PATH` propagate through
//! all nested sub-commands rather than only the outermost one.
//!
//! The restricted-root tool is an external executable; this module only
//! composes its argument vector: root reassigned to a given directory,
//! uid/gid dropped to the configured identity, environment pass-through
//! disabled unless explicitly re-added, and one `-M source:/mountpoint`
//! per prepared mount.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::trace;

use crate::config::Config;
use crate::error::SetupError;
use crate::sandbox::mounts::{derive_paths, list_to_path, prepare_mounts, Mount};

/// A command tree node: one program invocation, optionally wrapping an
/// inner command whose argv is appended to this node's.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
    inner: Option<Box<CommandSpec>>,
}

/// A command tree rendered down to a single spawnable invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatCommand {
    /// Program of the outermost node.
    pub program: PathBuf,
    /// Concatenated argument vector, outermost first.
    pub argv: Vec<String>,
    /// Merged environment overrides (inner nodes win on conflict).
    pub env: BTreeMap<String, String>,
    /// Working directory, outermost node's taking precedence.
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a command for the given program.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets one environment override on this node only.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets the working directory for execution.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Wraps an inner command: the inner invocation is appended to this
    /// node's argv when flattened.
    #[must_use]
    pub fn wrap(mut self, inner: CommandSpec) -> Self {
        self.inner = Some(Box::new(inner));
        self
    }

    /// Returns the wrapped inner command, if any.
    #[must_use]
    pub fn inner(&self) -> Option<&CommandSpec> {
        self.inner.as_deref()
    }

    /// Returns this node's environment overrides.
    #[must_use]
    pub fn node_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Sets an environment override on every node of the tree, pre-order.
    pub fn set_env_recursive(&mut self, key: &str, value: &str) {
        self.env.insert(key.to_string(), value.to_string());
        if let Some(inner) = self.inner.as_deref_mut() {
            inner.set_env_recursive(key, value);
        }
    }

    /// Builder form of [`set_env_recursive`](Self::set_env_recursive).
    #[must_use]
    pub fn with_env_recursive(mut self, key: &str, value: &str) -> Self {
        self.set_env_recursive(key, value);
        self
    }

    /// Renders the tree to a single spawnable command.
    ///
    /// The argument vector is the pre-order concatenation of every node's
    /// program and args; environment maps are merged outermost-first so an
    /// inner node can override what its wrapper set.
    #[must_use]
    pub fn flatten(&self) -> FlatCommand {
        let mut argv = self.args.clone();
        let mut env = self.env.clone();
        let mut cwd = self.cwd.clone();

        let mut node = self.inner.as_deref();
        while let Some(spec) = node {
            argv.push(spec.program.display().to_string());
            argv.extend(spec.args.iter().cloned());
            env.extend(spec.env.clone());
            if cwd.is_none() {
                cwd = spec.cwd.clone();
            }
            node = spec.inner.as_deref();
        }

        FlatCommand {
            program: self.program.clone(),
            argv,
            env,
            cwd,
        }
    }

    /// Renders the command line as one string, for logging and the ledger.
    #[must_use]
    pub fn rendered(&self) -> String {
        let flat = self.flatten();
        let mut parts = vec![flat.program.display().to_string()];
        parts.extend(flat.argv);
        parts.join(" ")
    }
}

/// Composes a restricted-root invocation.
///
/// The command reassigns the filesystem root to `root`, drops to
/// `uid`/`gid` (0/0 unless the caller overrides), disables environment
/// pass-through, and binds every prepared mount at its numbered
/// mountpoint. Wrap the inner command afterwards with
/// [`CommandSpec::wrap`]; a literal `--` separates the tool's arguments
/// from the wrapped command.
#[must_use]
pub fn build_restricted_command(
    tool: &Path,
    root: &Path,
    uid: u32,
    gid: u32,
    mounts: &[Mount],
) -> CommandSpec {
    let mut cmd = CommandSpec::new(tool)
        .args(["-C", "-w", "/", "-r"])
        .arg(root.display().to_string())
        .arg("-u")
        .arg(uid.to_string())
        .arg("-g")
        .arg(gid.to_string())
        .args(["-E", "-A"]);

    for mount in mounts {
        cmd = cmd.arg("-M").arg(format!(
            "{}:/{}",
            mount.source.display(),
            mount.mountpoint.display()
        ));
    }

    cmd.arg("--")
}

/// Builds a restricted-root command with all configured container mounts
/// enabled and the derived `PATH`/`LD_LIBRARY_PATH` applied to every node.
///
/// Mountpoint directories are created under the configured prefix,
/// relative to `root` (the directory the restricted root is reassigned
/// to).
///
/// # Errors
///
/// Returns [`SetupError`] if a mountpoint directory cannot be created.
pub fn restricted_with_mounts(config: &Config, root: &Path) -> Result<CommandSpec, SetupError> {
    let mounts = prepare_mounts(&root.join(&config.mount_prefix), &config.container_mounts)?;

    // Mountpoints passed to the tool are sandbox-relative; strip the host
    // root prefix again for path derivation.
    let relative: Vec<Mount> = mounts
        .iter()
        .map(|m| Mount {
            source: m.source.clone(),
            mountpoint: m
                .mountpoint
                .strip_prefix(root)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| m.mountpoint.clone()),
        })
        .collect();

    let (search, libraries) = derive_paths(&relative);
    let cmd = build_restricted_command(&config.chroot_tool, root, config.uid, config.gid, &relative)
        .with_env_recursive("PATH", &list_to_path(&search))
        .with_env_recursive("LD_LIBRARY_PATH", &list_to_path(&libraries));

    trace!(command = %cmd.rendered(), "Composed restricted-root command");
    Ok(cmd)
}
