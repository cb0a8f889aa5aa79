//! Benchbox - Entry Point
//!
//! Command-line driver running one experiment over a set of projects.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use clap::Parser;
use miette::{miette, IntoDiagnostic, Result};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, EnvFilter};

use benchbox::config::Config;
use benchbox::experiment::{build_pipeline, Experiment, FlagExperiment, RawTiming};
use benchbox::ledger::{JsonStore, Ledger};
use benchbox::project::{Project, RecipeTable, ShellRecipe};
use benchbox::runner::{install_interrupt_flag, RunContext};
use benchbox::sandbox::{reclaim_cleanup_paths, resolve_layout, with_sandbox};

/// Benchbox - Sandboxed compiler-benchmark experiments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Projects to run the experiment over
    #[arg(required = true)]
    projects: Vec<String>,

    /// Root directory for build directories and the run ledger
    #[arg(long, default_value = "/tmp/benchbox")]
    build_dir: PathBuf,

    /// Directory holding one unpacked container image per project
    #[arg(long, default_value = "/var/lib/benchbox/images")]
    images: PathBuf,

    /// Host directory mounted into the restricted root (repeatable,
    /// earlier mounts shadow later ones)
    #[arg(long = "mount")]
    mounts: Vec<PathBuf>,

    /// Relocate writable image layers under this prefix
    #[arg(long)]
    image_prefix: Option<PathBuf>,

    /// Parallel job count handed to build recipes
    #[arg(long, default_value = "1")]
    jobs: u32,

    /// Extra compiler flags injected into every project (repeatable)
    #[arg(long = "cflag")]
    cflags: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout stays clean for captured benchmark output
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Benchbox v{}", env!("CARGO_PKG_VERSION"));

    // Survive Ctrl-C: the signal kills the in-flight child, whose death is
    // recorded as an interrupted run, and the sandbox scope tears down
    // before this process exits non-zero.
    let interrupted = install_interrupt_flag().into_diagnostic()?;

    let mut config = Config::new(&args.build_dir)
        .with_container_mounts(args.mounts.clone())
        .with_jobs(args.jobs);
    if let Some(prefix) = &args.image_prefix {
        config = config.with_image_prefix(prefix);
    }

    let store = JsonStore::open(args.build_dir.join("ledger"))?;
    let ledger = Ledger::new(Box::new(store));

    let experiment: Box<dyn Experiment> = if args.cflags.is_empty() {
        Box::new(RawTiming)
    } else {
        Box::new(FlagExperiment::new("flags", args.cflags.clone(), Vec::new()))
    };

    // Projects without a registered recipe get a command-driven recipe with
    // empty phases, which makes the pipeline a dry run.
    let mut recipes = RecipeTable::new();
    for name in &args.projects {
        if recipes.get(name).is_none() {
            warn!(project = %name, "No recipe registered; phases will be no-ops");
            recipes.register(name, Arc::new(ShellRecipe::default()));
        }
    }

    let mut failures = 0usize;
    for name in &args.projects {
        if interrupted.load(Ordering::SeqCst) {
            warn!("Interrupt received; not scheduling further projects");
            break;
        }

        let Some(recipe) = recipes.get(name) else {
            failures += 1;
            continue;
        };

        let mut project = Project::new(name, "generic", args.images.join(name), &config);
        experiment.configure_project(&mut project);

        fs::create_dir_all(&project.builddir).into_diagnostic()?;
        let layout = resolve_layout(&project, &config);
        fs::create_dir_all(&layout.image_dir).into_diagnostic()?;

        let pipeline = build_pipeline(&project, experiment.as_ref());
        let outcome = with_sandbox(
            &config,
            &layout,
            &mut project,
            &ledger,
            experiment.name(),
            |project, runner| {
                let ctx = RunContext {
                    experiment: experiment.name(),
                    config: &config,
                    runner,
                };
                pipeline.execute(project, recipe.as_ref(), &ctx)?;
                Ok(())
            },
        );

        match outcome {
            Ok(()) => info!(project = %name, "Experiment run completed"),
            Err(e) => {
                error!(project = %name, error = %e, "Experiment run failed");
                failures += 1;
            }
        }
    }

    let reclaimed = reclaim_cleanup_paths(&config);
    if reclaimed > 0 {
        info!(reclaimed, "Reclaimed relocated image directories");
    }

    if interrupted.load(Ordering::SeqCst) {
        return Err(miette!("Interrupted by user"));
    }
    if failures > 0 {
        return Err(miette!(
            "{failures} of {} project runs failed",
            args.projects.len()
        ));
    }
    Ok(())
}
