//! `amber-qa`: check on an Amber MD campaign. Parses each stage's log, measures structural drift
//! with cpptraj, and writes a Markdown report with plots under the report directory.

use std::path::PathBuf;

use amber_qa::{
    config::{PlotFormat, QaConfig, StageDef},
    cpptraj::CpptrajProcess,
    pipeline,
};
use anyhow::Context;
use clap::Parser;
use env_logger::Env;
use log::info;

#[derive(Parser)]
#[command(name = "amber-qa")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "QA report for Amber minimization, equilibration, and production runs", long_about = None)]
struct Cli {
    /// TOML config file. Fields left out use defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the stage directories and logs.
    #[arg(short, long)]
    work_dir: Option<PathBuf>,

    /// Topology, relative to the work dir.
    #[arg(short, long)]
    topology: Option<PathBuf>,

    /// Report directory, relative to the work dir.
    #[arg(short, long)]
    report_dir: Option<PathBuf>,

    /// cpptraj executable.
    #[arg(long)]
    cpptraj: Option<String>,

    /// `svg` or `png`.
    #[arg(long)]
    plot_format: Option<PlotFormat>,

    /// Don't write final-frame PDB snapshots.
    #[arg(long)]
    no_snapshots: bool,

    /// Write a re-imaged DCD trajectory for each dynamics stage.
    #[arg(long)]
    reimage: bool,

    /// Stage to process, as `name:kind` (e.g. `md1:md`). Repeat in order; replaces the
    /// configured list.
    #[arg(short, long = "stage")]
    stages: Vec<StageDef>,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<QaConfig> {
        let mut cfg = match &self.config {
            Some(path) => QaConfig::load(path)
                .with_context(|| format!("Loading config from {}", path.display()))?,
            None => QaConfig::default(),
        };

        if let Some(v) = self.work_dir {
            cfg.work_dir = v;
        }
        if let Some(v) = self.topology {
            cfg.topology = v;
        }
        if let Some(v) = self.report_dir {
            cfg.report_dir = v;
        }
        if let Some(v) = self.cpptraj {
            cfg.cpptraj_bin = v;
        }
        if let Some(v) = self.plot_format {
            cfg.plot_format = v;
        }
        if self.no_snapshots {
            cfg.snapshots = false;
        }
        if self.reimage {
            cfg.reimaged_trajectory = true;
        }
        if !self.stages.is_empty() {
            cfg.stages = self.stages;
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Cli::parse().into_config()?;

    info!("--- Starting Amber QA analysis ---");

    let runner = CpptrajProcess::new(&config.cpptraj_bin, &config.work_dir);
    let summary = pipeline::run(&config, &runner).context("QA analysis failed")?;

    info!(
        "--- Analysis complete. {} stages; report at {} ---",
        summary.rows.len(),
        summary.report_path.display()
    );

    Ok(())
}
