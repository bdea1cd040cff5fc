//! Runs the whole analysis: each stage in order, then the campaign-wide outputs.
//!
//! Single-threaded. A stage is fully processed before the next begins, since cumulative time
//! depends on stage order. Per-stage problems become a degraded row in the table; only report
//! directory and file failures abort.

use std::{
    path::{Path, PathBuf},
    time::SystemTime,
};

use log::{info, warn};

use crate::{
    config::{QaConfig, StageDef},
    cpptraj::{CpptrajRunner, StructureAnalyzer, dat::StructuralSample},
    error::Result,
    mdout::{Samples, StageResult},
    report::{ReportAssembler, SummaryRow, derive_status},
    timeline::{ReconciledTimeline, TimelineReconciler},
};

/// What a run produced.
#[derive(Debug)]
pub struct RunSummary {
    pub report_path: PathBuf,
    /// `None` if writing it failed.
    pub timeline_path: Option<PathBuf>,
    pub timeline: ReconciledTimeline,
    pub rows: Vec<SummaryRow>,
    pub plots: Vec<PathBuf>,
}

/// `<work_dir>/<stage>/<stage>.out`, falling back to `<work_dir>/<stage>.out`.
pub fn locate_log(config: &QaConfig, stage_name: &str) -> Option<PathBuf> {
    let file_name = format!("{stage_name}.out");

    [
        config.work_dir.join(stage_name).join(&file_name),
        config.work_dir.join(&file_name),
    ]
    .into_iter()
    .find(|p| p.is_file())
}

pub fn run(config: &QaConfig, runner: &dyn CpptrajRunner) -> Result<RunSummary> {
    config.validate()?;

    let mut report = ReportAssembler::new(config)?;
    let mut reconciler = TimelineReconciler::new();

    let has_topology = config.topology_path().is_file();
    if !has_topology {
        warn!(
            "Topology {} not found. Skipping RMSD/RoG and snapshots.",
            config.topology_path().display()
        );
    }

    let n_logs = config
        .stages
        .iter()
        .filter(|s| locate_log(config, &s.name).is_some())
        .count();
    if n_logs == 0 {
        warn!("No stage logs found under {}", config.work_dir.display());
    } else {
        info!("Found {n_logs} of {} stage logs", config.stages.len());
    }

    for stage in &config.stages {
        process_stage(config, stage, runner, has_topology, &mut report, &mut reconciler);
    }

    let timeline = reconciler.finish();
    report.plot_global(&timeline);

    let timeline_path = if timeline.is_empty() {
        None
    } else {
        let path = config.report_root().join(&config.timeline_file);
        match timeline.write_csv(&path) {
            Ok(()) => {
                info!("Timeline saved to {}", path.display());
                Some(path)
            }
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    };

    let report_path = report.save()?;

    Ok(RunSummary {
        report_path,
        timeline_path,
        timeline,
        rows: report.rows().to_vec(),
        plots: report.plots().to_vec(),
    })
}

fn process_stage(
    config: &QaConfig,
    stage: &StageDef,
    runner: &dyn CpptrajRunner,
    has_topology: bool,
    report: &mut ReportAssembler<'_>,
    reconciler: &mut TimelineReconciler,
) {
    let Some(log_path) = locate_log(config, &stage.name) else {
        warn!("{}: no log found; NO DATA", stage.name);
        report.add_missing(&stage.name);
        return;
    };

    info!("Analyzing: {} -> {}", stage.name, log_path.display());

    let result = match StageResult::load(stage, &log_path, config.tail_window_bytes) {
        Some(r) if !r.samples.is_empty() => r,
        _ => {
            warn!("{}: nothing parsed from {}; NO DATA", stage.name, log_path.display());
            report.add_missing(&stage.name);
            return;
        }
    };

    let status = derive_status(
        result.performance.finished_normally,
        &log_path,
        config.freshness_window(),
        SystemTime::now(),
    );
    info!(
        "  -> Parsed {} samples. Status: {status}",
        result.samples.len()
    );

    if let Samples::Dynamics(thermo) = &result.samples {
        let structural = if has_topology {
            analyze_structure(config, &stage.name, &log_path, runner)
        } else {
            None
        };
        reconciler.append_stage(&stage.name, thermo, structural.as_deref());
    }

    report.add_stage(&result, status);
}

/// Snapshot, optional re-imaged trajectory, then per-frame metrics. All best-effort.
fn analyze_structure(
    config: &QaConfig,
    stage_name: &str,
    log_path: &Path,
    runner: &dyn CpptrajRunner,
) -> Option<Vec<StructuralSample>> {
    let analyzer = StructureAnalyzer::new(config, stage_name, log_path)?;

    if config.snapshots {
        let msg = match analyzer.generate_snapshot(runner) {
            Some(_) => "PDB saved",
            None => "PDB failed",
        };
        info!("  -> {msg}");
    }

    if config.reimaged_trajectory {
        analyzer.generate_reimaged_trajectory(runner);
    }

    let structural = analyzer.run_analysis(runner);
    let n = structural.as_ref().map(|s| s.len()).unwrap_or(0);
    info!("  -> Struct stats: {n} frames");

    structural
}
