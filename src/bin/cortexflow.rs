use std::process::ExitCode;

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use console::style;
use cortexflow::engine::{Pbs, Slurm};
use cortexflow::neuro::{myelin, qsm};
use cortexflow::{
    ClusterOptions, DataSink, ExpandOptions, Policy, ResourceRequest, RunOptions, SchedulerKind,
    Settings, expand, run,
};

#[derive(Parser)]
#[command(name = "cortexflow", version)]
#[command(about = "Batch MRI pipelines over subjects and sessions")]
struct Cli {
    #[command(subcommand)]
    pipeline: Which,

    /// TOML settings file
    #[arg(short, long, global = true, env = "CORTEXFLOW_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Directory input files are selected from
    #[arg(long, global = true)]
    base_dir: Option<Utf8PathBuf>,

    /// Directory holding per-instance working directories
    #[arg(long, global = true)]
    work_dir: Option<Utf8PathBuf>,

    /// Result store, relative to the base directory unless absolute
    #[arg(long, global = true)]
    output_dir: Option<String>,

    /// Subject to process, repeatable; replaces the configured list
    #[arg(long = "subject", global = true)]
    subjects: Vec<String>,

    /// Session to process, repeatable; replaces the configured list
    #[arg(long = "session", global = true)]
    sessions: Vec<String>,

    /// Maximum number of instances running at once
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    #[arg(long, global = true, value_enum)]
    scheduler: Option<SchedulerKind>,

    /// Fail when any input file is missing instead of skipping its instance
    #[arg(long, global = true)]
    strict: bool,

    /// Remove working directories once nothing downstream needs them
    #[arg(long, global = true)]
    clean: bool,

    /// List the expanded instances without running anything
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print the task graph as a Mermaid diagram and exit
    #[arg(long, global = true)]
    graph: bool,
}

#[derive(Subcommand, Clone, Copy)]
enum Which {
    /// FLAIR and SPACE masking and bias correction against the T1w
    Myelin,
    /// Multi-echo TGV-QSM reconstruction
    Qsm,
}

impl Cli {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };

        if let Some(dir) = &self.base_dir {
            settings.experiment_dir = dir.clone();
        }
        if let Some(dir) = &self.work_dir {
            settings.working_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.output_dir {
            settings.output_container = dir.clone();
        }
        if let Some(jobs) = self.jobs {
            settings.jobs = Some(jobs);
        }
        if let Some(scheduler) = self.scheduler {
            settings.scheduler = scheduler;
        }
        settings.strict |= self.strict;
        settings.keep_intermediates &= !self.clean;

        if !self.subjects.is_empty() {
            settings.myelin.subjects = self.subjects.clone();
            settings.qsm.subjects = self.subjects.clone();
        }
        if !self.sessions.is_empty() {
            settings.myelin.sessions = self.sessions.clone();
        }

        Ok(settings)
    }
}

fn policy(settings: &Settings, resources: ResourceRequest) -> Policy {
    let cluster = |options: ClusterOptions| {
        Policy::Cluster(
            options
                .resources(resources.clone())
                .poll_interval(settings.poll_interval())
                .max_in_flight(settings.max_in_flight),
        )
    };

    match settings.scheduler {
        SchedulerKind::Local => Policy::Local {
            jobs: settings.jobs(),
        },
        SchedulerKind::Slurm => cluster(ClusterOptions::new(Slurm)),
        SchedulerKind::Pbs => cluster(ClusterOptions::new(Pbs)),
    }
}

fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    cortexflow::init_logging()?;

    let settings = cli.settings().context("Couldn't load settings")?;

    let (pipeline, axes, resources) = match cli.pipeline {
        Which::Myelin => {
            let (pipeline, axes) = myelin::pipeline(&settings)?;
            (pipeline, axes, settings.myelin.resources.clone())
        }
        Which::Qsm => {
            let (pipeline, axes) = qsm::pipeline(&settings)?;
            (pipeline, axes, ResourceRequest::default())
        }
    };

    if cli.graph {
        print!("{pipeline}");
        return Ok(ExitCode::SUCCESS);
    }

    for axis in &axes {
        if axis.values().is_empty() {
            tracing::warn!("No values for axis '{}', nothing to do", axis.name());
        }
    }

    let options = ExpandOptions::new(settings.experiment_dir.clone(), settings.working_dir())
        .strict(settings.strict);
    let graph = expand(&pipeline, &axes, &options)?;

    if cli.dry_run {
        for instance in graph.instances() {
            let state = if instance.is_resolved() {
                style("ready").green()
            } else {
                style("unresolved").red()
            };
            println!("{instance}  {state}  {}", instance.dir());
        }
        for err in graph.unresolved() {
            println!("{}", style(err).red());
        }
        for open in graph.open_requirements() {
            println!("{}  {}", open.step, style(&open.description).magenta());
        }
        return Ok(ExitCode::SUCCESS);
    }

    let options = RunOptions::new(policy(&settings, resources))
        .keep_intermediates(settings.keep_intermediates)
        .sink(DataSink::new(
            settings.experiment_dir.clone(),
            settings.output_container.clone(),
        ));

    let report = run(&graph, &options)?;
    print!("{}", report.render_styled());

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
