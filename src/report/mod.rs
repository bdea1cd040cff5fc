//! The QA report: a Markdown status table with one row per stage, plus plots.

pub mod plots;

use std::{
    fmt::{self, Display, Formatter},
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use log::{info, warn};

use crate::{
    config::{QaConfig, StageKind},
    error::{QaError, Result},
    mdout::{Samples, StageResult},
    timeline::ReconciledTimeline,
};

const TABLE_HEADER: &str = "| Step | Type | Status | NSTEP (Last) | Time (ps) | ns/day | Final Val |";
const TABLE_RULE: &str = "|---|---|---|---|---|---|---|";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StageStatus {
    Completed,
    /// No completion marker, but the log was written to recently.
    Running,
    Failed,
    NoData,
}

impl Display for StageStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let val = match self {
            Self::Completed => "COMPLETED",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::NoData => "NO DATA",
        };
        write!(f, "{val}")
    }
}

/// COMPLETED if a completion marker was found. Otherwise, RUNNING if the log was modified
/// within `window` of `now`, else FAILED. This is a guess from timestamps, not an exit code.
pub fn derive_status(
    finished_normally: bool,
    log_path: &Path,
    window: Duration,
    now: SystemTime,
) -> StageStatus {
    if finished_normally {
        return StageStatus::Completed;
    }

    let modified = match fs::metadata(log_path).and_then(|m| m.modified()) {
        Ok(t) => t,
        Err(e) => {
            warn!("Can't read the modification time of {}: {e}", log_path.display());
            return StageStatus::Failed;
        }
    };

    // A timestamp in the future (clock skew on a shared filesystem) counts as fresh.
    let age = now.duration_since(modified).unwrap_or_default();
    if age < window {
        StageStatus::Running
    } else {
        StageStatus::Failed
    }
}

/// The last column of the table.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum FinalValue {
    /// kcal/mol
    Energy(f64),
    /// g/cm³. `None` if the log had no density, e.g. a constant-volume stage.
    Density(Option<f64>),
}

#[derive(Clone, PartialEq, Debug)]
pub struct SummaryRow {
    pub stage_name: String,
    pub kind: Option<StageKind>,
    pub status: StageStatus,
    pub last_step: Option<u64>,
    /// ps
    pub last_time: Option<f64>,
    pub ns_per_day: Option<f64>,
    pub final_value: Option<FinalValue>,
}

impl SummaryRow {
    pub fn no_data(stage_name: &str) -> Self {
        Self {
            stage_name: stage_name.to_owned(),
            kind: None,
            status: StageStatus::NoData,
            last_step: None,
            last_time: None,
            ns_per_day: None,
            final_value: None,
        }
    }

    pub fn from_result(result: &StageResult, status: StageStatus) -> Self {
        let (last_time, ns_per_day, final_value) = match &result.samples {
            Samples::Minimization(s) => (None, None, s.last().map(|s| FinalValue::Energy(s.energy))),
            Samples::Dynamics(s) => {
                let last = s.last();
                (
                    last.and_then(|s| s.time_ps),
                    Some(result.performance.ns_per_day),
                    last.map(|s| FinalValue::Density(s.density)),
                )
            }
        };

        Self {
            stage_name: result.stage_name.clone(),
            kind: Some(result.kind()),
            status,
            last_step: result.samples.last_step(),
            last_time,
            ns_per_day,
            final_value,
        }
    }

    pub fn to_markdown(&self) -> String {
        let Some(kind) = self.kind else {
            return format!("| {} | - | NO DATA | - | - | - | - |", self.stage_name);
        };

        let dash = || "-".to_owned();

        let step = self.last_step.map(|s| s.to_string()).unwrap_or_else(dash);
        let time = self
            .last_time
            .map(|t| format!("{t:.1} ps"))
            .unwrap_or_else(dash);
        let perf = self
            .ns_per_day
            .map(|v| format!("{v:.1}"))
            .unwrap_or_else(dash);
        let final_val = match self.final_value {
            Some(FinalValue::Energy(e)) => format!("{e:.1} kcal"),
            Some(FinalValue::Density(Some(d))) => format!("{d:.4} g/cm³"),
            Some(FinalValue::Density(None)) => "N/A".to_owned(),
            None => dash(),
        };

        format!(
            "| {} | {} | {} | {step} | {time} | {perf} | {final_val} |",
            self.stage_name,
            kind.label(),
            self.status
        )
    }
}

/// Accumulates stage rows and plots, then writes the report. Creating the output directories
/// and writing the report file are the only failures that abort a run.
pub struct ReportAssembler<'a> {
    config: &'a QaConfig,
    rows: Vec<SummaryRow>,
    plots: Vec<PathBuf>,
}

impl<'a> ReportAssembler<'a> {
    pub fn new(config: &'a QaConfig) -> Result<Self> {
        for dir in [config.report_root(), config.plots_dir(), config.pdb_dir()] {
            fs::create_dir_all(&dir).map_err(|e| QaError::io(&dir, e))?;
        }

        Ok(Self {
            config,
            rows: Vec::new(),
            plots: Vec::new(),
        })
    }

    pub fn rows(&self) -> &[SummaryRow] {
        &self.rows
    }

    pub fn plots(&self) -> &[PathBuf] {
        &self.plots
    }

    /// Plot a parsed stage, and add its row.
    pub fn add_stage(&mut self, result: &StageResult, status: StageStatus) {
        let dir = self.config.plots_dir();
        let format = self.config.plot_format;

        let plotted = match &result.samples {
            Samples::Minimization(s) => plots::plot_minimization(&dir, format, &result.stage_name, s),
            Samples::Dynamics(s) => plots::plot_dynamics(&dir, format, &result.stage_name, s),
        };

        match plotted {
            Ok(Some(path)) => self.plots.push(path),
            Ok(None) => info!("{}: too few samples to plot", result.stage_name),
            Err(e) => warn!("{}: {e}", result.stage_name),
        }

        self.rows.push(SummaryRow::from_result(result, status));
    }

    /// A stage with no log, or nothing parsed from it.
    pub fn add_missing(&mut self, stage_name: &str) {
        self.rows.push(SummaryRow::no_data(stage_name));
    }

    /// The campaign-wide plot. Skipped when no dynamics stage made it onto the timeline.
    pub fn plot_global(&mut self, timeline: &ReconciledTimeline) -> Option<PathBuf> {
        if timeline.is_empty() {
            info!("No dynamics data on the timeline; skipping the global plot");
            return None;
        }

        info!("Generating global production plots...");
        match plots::plot_global(&self.config.plots_dir(), self.config.plot_format, timeline) {
            Ok(path) => {
                self.plots.push(path.clone());
                Some(path)
            }
            Err(e) => {
                warn!("{e}");
                None
            }
        }
    }

    pub fn render_markdown(&self, date: &str) -> String {
        let mut result = String::from("# Molecular Dynamics QA Report\n\n");
        result.push_str(&format!("**Date:** {date}\n\n"));
        result.push_str("## Execution Summary\n");
        result.push_str(TABLE_HEADER);
        result.push('\n');
        result.push_str(TABLE_RULE);
        result.push('\n');

        for row in &self.rows {
            result.push_str(&row.to_markdown());
            result.push('\n');
        }

        result
    }

    /// Write the report, dated now.
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.config.report_root().join(&self.config.report_file);
        let date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        fs::write(&path, self.render_markdown(&date)).map_err(|e| QaError::io(&path, e))?;

        info!("Report saved to {}", path.display());
        Ok(path)
    }
}
