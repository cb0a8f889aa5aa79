//! Benchbox - Sandboxed compiler-benchmark experiments.
//!
//! This crate runs measurement experiments over benchmark programs inside
//! isolated build environments: each invocation mounts a copy-on-write
//! overlay over the project's container image, executes an ordered action
//! pipeline (prepare, download, configure, build, run, clean) under a
//! restricted root, and records every external command in a transactional
//! run ledger.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use benchbox::config::Config;
//! use benchbox::experiment::{Experiment, RawTiming};
//! use benchbox::ledger::{JsonStore, Ledger};
//! use benchbox::project::{Project, ShellRecipe};
//! use benchbox::runner::RunContext;
//! use benchbox::sandbox::{resolve_layout, with_sandbox};
//!
//! fn main() -> miette::Result<()> {
//!     let config = Config::new("/tmp/benchbox");
//!     let ledger = Ledger::new(Box::new(JsonStore::open("/tmp/benchbox/ledger")?));
//!
//!     let experiment = RawTiming;
//!     let mut project = Project::new("gzip", "compression", "/srv/images/gzip", &config);
//!     experiment.configure_project(&mut project);
//!
//!     let recipe: Arc<dyn benchbox::project::Recipe> = Arc::new(ShellRecipe::default());
//!     let layout = resolve_layout(&project, &config);
//!     let pipeline = experiment.actions_for_project(&project);
//!
//!     with_sandbox(&config, &layout, &mut project, &ledger, experiment.name(), |project, runner| {
//!         let ctx = RunContext {
//!             experiment: experiment.name(),
//!             config: &config,
//!             runner,
//!         };
//!         pipeline.execute(project, recipe.as_ref(), &ctx)?;
//!         Ok(())
//!     })?;
//!
//!     Ok(())
//! }
//! ```

pub mod actions;
pub mod config;
pub mod error;
pub mod experiment;
pub mod ledger;
pub mod project;
pub mod runner;
pub mod sandbox;

// Re-export commonly used types
pub use actions::{Action, Pipeline};
pub use config::Config;
pub use error::{Error, Result};
pub use experiment::Experiment;
pub use ledger::{Ledger, RunRecord, RunStatus};
pub use project::{Project, Recipe, RecipeTable};
pub use runner::{GuardedRunner, RunCommand, RunOutcome};
pub use sandbox::{with_sandbox, CommandSpec, OverlayLayout};
