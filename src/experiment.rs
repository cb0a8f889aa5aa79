//! Experiments: named measurement strategies applied to projects.
//!
//! An experiment decides how a project is configured (which flags the
//! instrumented compiler sees) and which pipeline it runs. Most experiments
//! keep the standard action sequence and only adjust project configuration;
//! some fan one project out into several sub-configurations, each with its
//! own run identifier.

use crate::actions::{Action, Pipeline};
use crate::project::Project;

/// A measurement strategy applied to every selected project.
pub trait Experiment: Send + Sync {
    /// Name recorded in the ledger for every run of this experiment.
    fn name(&self) -> &str;

    /// Adjusts the project's configuration (flags, etc.) before its
    /// pipeline is built. The default leaves the project untouched.
    fn configure_project(&self, _project: &mut Project) {}

    /// Builds the pipeline this experiment runs over the project.
    ///
    /// The default is the standard sequence from [`standard_actions`].
    fn actions_for_project(&self, project: &Project) -> Pipeline {
        standard_actions(project)
    }
}

/// Builds the pipeline the given experiment runs over the project.
///
/// Pure construction; nothing executes until [`Pipeline::execute`].
#[must_use]
pub fn build_pipeline(project: &Project, experiment: &dyn Experiment) -> Pipeline {
    experiment.actions_for_project(project)
}

/// The standard action sequence: create the build directory, then
/// prepare, download, configure and build the benchmark, then run its
/// workload and clean up, with progress markers around the two phases.
#[must_use]
pub fn standard_actions(project: &Project) -> Pipeline {
    Pipeline::new(vec![
        Action::MakeBuildDir,
        Action::Echo {
            message: format!("Compiling... {}", project.name),
        },
        Action::Prepare,
        Action::Download,
        Action::Configure,
        Action::Build,
        Action::Echo {
            message: format!("Running... {}", project.name),
        },
        Action::Run,
        Action::Clean,
    ])
}

/// Fans a project out into one sub-configuration per flag augmentation.
///
/// Each clone gets a fresh run identifier and its own copy of the extra
/// cflags, so the sub-configurations are run-to-run independent.
#[must_use]
pub fn fan_out(project: &Project, augmentations: &[Vec<String>]) -> Vec<Project> {
    augmentations
        .iter()
        .map(|flags| {
            let mut clone = project.clone_with_new_run_id();
            clone.append_cflags(flags.iter().cloned());
            clone
        })
        .collect()
}

/// Fans a project out over thread-count flags `-mllvm -polly-num-threads=N`
/// for N in 1..=max, doubling each step.
#[must_use]
pub fn fan_out_threads(project: &Project, max: u32) -> Vec<Project> {
    let mut augmentations = Vec::new();
    let mut n = 1;
    while n <= max {
        augmentations.push(vec![
            "-mllvm".to_string(),
            format!("-polly-num-threads={n}"),
        ]);
        n *= 2;
    }
    fan_out(project, &augmentations)
}

/// Baseline experiment: no flag changes, standard pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawTiming;

impl Experiment for RawTiming {
    fn name(&self) -> &str {
        "raw"
    }
}

/// Experiment that injects a fixed set of compiler and linker flags.
#[derive(Debug, Clone)]
pub struct FlagExperiment {
    name: String,
    cflags: Vec<String>,
    ldflags: Vec<String>,
}

impl FlagExperiment {
    /// Creates an experiment injecting the given flags into every project.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        cflags: Vec<String>,
        ldflags: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cflags,
            ldflags,
        }
    }
}

impl Experiment for FlagExperiment {
    fn name(&self) -> &str {
        &self.name
    }

    fn configure_project(&self, project: &mut Project) {
        project.append_cflags(self.cflags.iter().cloned());
        project.ldflags.extend(self.ldflags.iter().cloned());
    }
}
