//! The ordered action pipeline.
//!
//! An experiment run over one project is a sequence of [`Action`] steps
//! executed strictly in order. Execution aborts at the first failing step;
//! the pipeline itself never catches or retries, leaving error handling to
//! the sandbox scope around it.

use std::fs;

use tracing::{info, instrument};

use crate::error::PipelineError;
use crate::project::{Project, Recipe};
use crate::runner::RunContext;

/// One step of an experiment pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Ensures the project's build directory exists.
    MakeBuildDir,
    /// Logs a progress message; always succeeds.
    Echo {
        /// Message logged when the step runs.
        message: String,
    },
    /// Stages auxiliary files into the build directory.
    Prepare,
    /// Fetches the benchmark sources.
    Download,
    /// Configures the source tree.
    Configure,
    /// Builds the benchmark binary.
    Build,
    /// Executes the benchmark workload.
    Run,
    /// Removes build products.
    Clean,
}

impl Action {
    /// Human-readable description of this step for the given project.
    #[must_use]
    pub fn describe(&self, project: &Project) -> String {
        match self {
            Self::MakeBuildDir => format!("Create build directory {}", project.builddir.display()),
            Self::Echo { message } => message.clone(),
            Self::Prepare => format!("Prepare {}", project.name),
            Self::Download => format!("Download {}", project.name),
            Self::Configure => format!("Configure {}", project.name),
            Self::Build => format!("Build {}", project.name),
            Self::Run => format!("Run {}", project.name),
            Self::Clean => format!("Clean {}", project.name),
        }
    }

    /// Executes this step against the project.
    ///
    /// # Errors
    ///
    /// Propagates the recipe's [`PipelineError`] unchanged.
    pub fn apply(
        &self,
        project: &mut Project,
        recipe: &dyn Recipe,
        ctx: &RunContext,
    ) -> Result<(), PipelineError> {
        match self {
            Self::MakeBuildDir => {
                fs::create_dir_all(&project.builddir).map_err(|e| PipelineError::Io {
                    context: format!("creating {}", project.builddir.display()),
                    source: e,
                })
            }
            Self::Echo { message } => {
                info!("{message}");
                Ok(())
            }
            Self::Prepare => recipe.prepare(project, ctx),
            Self::Download => recipe.download(project, ctx),
            Self::Configure => recipe.configure(project, ctx),
            Self::Build => recipe.build(project, ctx),
            Self::Run => recipe.run_tests(project, ctx),
            Self::Clean => recipe.clean(project, ctx),
        }
    }
}

/// An ordered sequence of actions for one project.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    steps: Vec<Action>,
}

impl Pipeline {
    /// Creates a pipeline from the given steps.
    #[must_use]
    pub fn new(steps: Vec<Action>) -> Self {
        Self { steps }
    }

    /// Returns the steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Action] {
        &self.steps
    }

    /// Returns the description of every step, in order.
    #[must_use]
    pub fn descriptions(&self, project: &Project) -> Vec<String> {
        self.steps.iter().map(|a| a.describe(project)).collect()
    }

    /// Executes every step in order, aborting at the first failure.
    ///
    /// Steps after a failed one never run. The failing step's error is
    /// returned unchanged.
    ///
    /// # Errors
    ///
    /// The first step failure, verbatim.
    #[instrument(skip(self, project, recipe, ctx), fields(project = %project.name, steps = self.steps.len()))]
    pub fn execute(
        &self,
        project: &mut Project,
        recipe: &dyn Recipe,
        ctx: &RunContext,
    ) -> Result<(), PipelineError> {
        for (index, action) in self.steps.iter().enumerate() {
            info!(step = index + 1, total = self.steps.len(), "{}", action.describe(project));
            action.apply(project, recipe, ctx)?;
        }
        Ok(())
    }
}
