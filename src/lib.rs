//! Quality assurance for Amber molecular dynamics campaigns: minimization, heating,
//! equilibration, and production stages run in sequence, each with its own log and trajectory.
//!
//! For each stage, we parse the `mdout` log, optionally measure RMSD and radius of gyration with
//! cpptraj, and place both on one cumulative time axis. The output is a Markdown status table,
//! per-stage and campaign-wide plots, and the stitched timeline as CSV.

pub mod config;
pub mod cpptraj;
pub mod dcd;
pub mod error;
pub mod mdout;
pub mod pipeline;
pub mod report;
pub mod timeline;

pub use config::{PlotFormat, QaConfig, Region, StageDef, StageKind};
pub use cpptraj::{CpptrajInput, CpptrajProcess, CpptrajRunner, RunOutcome, StructureAnalyzer};
pub use error::{QaError, Result};
pub use mdout::{DynSample, MinSample, Performance, Samples, StageResult};
pub use report::{ReportAssembler, StageStatus};
pub use timeline::{Column, ReconciledTimeline, TimelineReconciler};
