//! Benchmark projects and their build recipes.
//!
//! A [`Project`] is a plain configuration record: identity, build directory,
//! compiler flags, a per-configuration run identifier and a reference to its
//! container image. The per-benchmark build logic lives behind the
//! [`Recipe`] trait, and benchmarks are looked up through a data-driven
//! [`RecipeTable`] rather than a class hierarchy.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::error::PipelineError;
use crate::runner::RunContext;

/// Reference to a project's filesystem container image.
///
/// `base` is the unpacked, read-only layer the overlay mounts under the
/// project's writable image directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerImage {
    /// Root of the unpacked read-only layer.
    pub base: PathBuf,
}

/// One benchmark program under one experiment configuration.
///
/// Mutated by pipeline steps (flags appended, builddir relocated during
/// sandboxing) and restored after sandboxed execution completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Benchmark name (e.g. "gzip").
    pub name: String,
    /// Benchmark category (e.g. "compression").
    pub domain: String,
    /// Directory the benchmark is downloaded, configured and built in.
    pub builddir: PathBuf,
    /// Compiler flags for the instrumented compiler.
    pub cflags: Vec<String>,
    /// Linker flags.
    pub ldflags: Vec<String>,
    /// Run identifier, unique per distinct configuration.
    pub run_id: Uuid,
    /// Filesystem container image backing the sandbox.
    pub image: ContainerImage,
}

impl Project {
    /// Creates a project with a fresh run identifier.
    ///
    /// The build directory is placed under the configured build root,
    /// namespaced by project name.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        domain: impl Into<String>,
        image_base: impl Into<PathBuf>,
        config: &Config,
    ) -> Self {
        let name = name.into();
        Self {
            builddir: config.build_dir.join(&name),
            name,
            domain: domain.into(),
            cflags: Vec::new(),
            ldflags: Vec::new(),
            run_id: Uuid::new_v4(),
            image: ContainerImage {
                base: image_base.into(),
            },
        }
    }

    /// Deep copy with a freshly generated run identifier.
    ///
    /// Used when an experiment fans out into multiple sub-configurations;
    /// clones are structurally identical and run-to-run independent.
    #[must_use]
    pub fn clone_with_new_run_id(&self) -> Self {
        let mut clone = self.clone();
        clone.run_id = Uuid::new_v4();
        clone
    }

    /// Appends compiler flags for this configuration.
    pub fn append_cflags<I, S>(&mut self, flags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cflags.extend(flags.into_iter().map(Into::into));
    }
}

/// Per-benchmark build logic, invoked by the action pipeline.
///
/// Each operation either returns normally (success) or raises a typed
/// failure; no other contract is assumed. Externally visible command
/// execution inside an operation must go through the guarded runner on the
/// context so it lands in the run ledger.
pub trait Recipe: Send + Sync {
    /// Stages auxiliary files (test inputs) into the build directory.
    fn prepare(&self, _project: &Project, _ctx: &RunContext) -> Result<(), PipelineError> {
        Ok(())
    }

    /// Fetches the benchmark sources.
    fn download(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError>;

    /// Configures the source tree for the instrumented compiler.
    fn configure(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError>;

    /// Builds the benchmark binary.
    fn build(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError>;

    /// Executes the built binary's workload under the experiment.
    fn run_tests(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError>;

    /// Removes build products.
    fn clean(&self, _project: &Project, _ctx: &RunContext) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Data-driven table mapping benchmark identity to its recipe.
#[derive(Default, Clone)]
pub struct RecipeTable {
    entries: BTreeMap<String, Arc<dyn Recipe>>,
}

impl RecipeTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a recipe under a benchmark name, replacing any previous
    /// entry.
    pub fn register(&mut self, name: impl Into<String>, recipe: Arc<dyn Recipe>) {
        self.entries.insert(name.into(), recipe);
    }

    /// Looks up the recipe for a benchmark.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Recipe>> {
        self.entries.get(name).cloned()
    }

    /// Returns the registered benchmark names in sorted order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for RecipeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecipeTable")
            .field("names", &self.names())
            .finish()
    }
}

/// Generic recipe driven entirely by configured command lines.
///
/// Each phase is a list of commands executed in order through the guarded
/// runner, with the project's build directory as working directory. Useful
/// for autotools-style benchmarks (wget/tar, ./configure, make) without a
/// hand-written recipe type.
#[derive(Debug, Clone, Default)]
pub struct ShellRecipe {
    /// Commands for the download phase.
    pub download: Vec<crate::sandbox::CommandSpec>,
    /// Commands for the configure phase.
    pub configure: Vec<crate::sandbox::CommandSpec>,
    /// Commands for the build phase.
    pub build: Vec<crate::sandbox::CommandSpec>,
    /// Commands for the run phase.
    pub run: Vec<crate::sandbox::CommandSpec>,
}

impl ShellRecipe {
    fn run_phase(
        &self,
        commands: &[crate::sandbox::CommandSpec],
        project: &Project,
        ctx: &RunContext,
    ) -> Result<(), PipelineError> {
        for spec in commands {
            let command =
                crate::runner::RunCommand::new(spec.clone().current_dir(&project.builddir));
            ctx.runner.run_guarded(&command, project, ctx.experiment)?;
        }
        Ok(())
    }
}

impl Recipe for ShellRecipe {
    fn download(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError> {
        self.run_phase(&self.download, project, ctx)
    }

    fn configure(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError> {
        self.run_phase(&self.configure, project, ctx)
    }

    fn build(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError> {
        self.run_phase(&self.build, project, ctx)
    }

    fn run_tests(&self, project: &Project, ctx: &RunContext) -> Result<(), PipelineError> {
        self.run_phase(&self.run, project, ctx)
    }
}
