//! Run configuration: where the campaign lives, which stages to inspect, in what order, and
//! which atom selections to measure. Built once, then passed by reference to every component.
//!
//! Can be loaded from a TOML file; any field left out falls back to its default. For example:
//!
//! ```toml
//! topology = "system_hmass.prmtop"
//! centering_mask = ":1-1036"
//!
//! [[stages]]
//! name = "min_1_solvent"
//! kind = "minimization"
//!
//! [[stages]]
//! name = "md1"
//! kind = "dynamics"
//!
//! [[rmsd_regions]]
//! name = "receptor"
//! mask = ":1-1010&!@H="
//! ```

use std::{
    collections::HashSet,
    fmt::{self, Display, Formatter},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::Deserialize;

use crate::{
    cpptraj::file_safe,
    error::{QaError, Result},
    mdout::DEFAULT_TAIL_WINDOW,
};

/// Whether a stage minimizes energy, or integrates equations of motion. This determines both
/// the log layout we expect, and whether there's a trajectory to analyze.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    #[serde(alias = "min")]
    Minimization,
    /// Heating, equilibration, and production all fall here.
    #[serde(alias = "md")]
    Dynamics,
}

impl StageKind {
    /// Short label used in the status table.
    pub fn label(self) -> &'static str {
        match self {
            Self::Minimization => "MIN",
            Self::Dynamics => "MD",
        }
    }
}

impl Display for StageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let val = match self {
            Self::Minimization => "minimization",
            Self::Dynamics => "dynamics",
        };
        write!(f, "{val}")
    }
}

impl FromStr for StageKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "min" | "minimization" => Ok(Self::Minimization),
            "md" | "dyn" | "dynamics" => Ok(Self::Dynamics),
            other => Err(format!("Unknown stage kind: {other}")),
        }
    }
}

/// One entry of the ordered stage list. The kind is attached here, never guessed from the name.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct StageDef {
    pub name: String,
    pub kind: StageKind,
}

impl StageDef {
    pub fn minimization(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: StageKind::Minimization,
        }
    }

    pub fn dynamics(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: StageKind::Dynamics,
        }
    }
}

impl FromStr for StageDef {
    type Err = String;

    /// Parses `name:kind`, e.g. `min_1_solvent:min` or `md3:md`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, kind) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Expected `name:kind`, got `{s}`"))?;

        let name = name.trim();
        if name.is_empty() {
            return Err(format!("Missing stage name in `{s}`"));
        }

        Ok(Self {
            name: name.to_owned(),
            kind: kind.parse()?,
        })
    }
}

/// A named cpptraj atom selection, e.g. `receptor` = `:1-1010`.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Region {
    pub name: String,
    /// Amber mask syntax, passed through to cpptraj unchanged.
    pub mask: String,
}

impl Region {
    pub fn new(name: &str, mask: &str) -> Self {
        Self {
            name: name.to_owned(),
            mask: mask.to_owned(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlotFormat {
    /// Text renders without system fonts.
    #[default]
    Svg,
    /// Axis text requires the `fonts` feature.
    Png,
}

impl PlotFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Svg => "svg",
            Self::Png => "png",
        }
    }
}

impl FromStr for PlotFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "svg" => Ok(Self::Svg),
            "png" => Ok(Self::Png),
            other => Err(format!("Unknown plot format: {other}")),
        }
    }
}

/// The stage sequence of our standard protocol: staged restraint release during minimization,
/// heating, NPT equilibration, then production in 10 segments.
pub fn default_stages() -> Vec<StageDef> {
    let mut result: Vec<_> = [
        "min_1_solvent",
        "min_2_8RT",
        "min_3_5RT",
        "min_4_2RT",
        "min_5_full",
    ]
    .iter()
    .map(|n| StageDef::minimization(n))
    .collect();

    for name in ["heat_5RT", "npt_1_2RT", "npt_2_05RT", "npt_3_full"] {
        result.push(StageDef::dynamics(name));
    }
    for i in 1..=10 {
        result.push(StageDef::dynamics(&format!("md{i}")));
    }

    result
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct QaConfig {
    /// Stage directories, logs, and the topology are resolved relative to this.
    pub work_dir: PathBuf,
    /// Required for structural analysis only.
    pub topology: PathBuf,
    /// Processed strictly in this order; cumulative time depends on it.
    pub stages: Vec<StageDef>,
    pub rmsd_regions: Vec<Region>,
    pub rog_regions: Vec<Region>,
    /// Adds cpptraj's `mass` keyword to RMSD commands.
    pub rmsd_mass_weighted: bool,
    /// Anchor for `autoimage` when writing snapshots and re-imaged trajectories.
    pub centering_mask: String,
    pub report_dir: PathBuf,
    pub plots_subdir: String,
    pub pdb_subdir: String,
    pub report_file: String,
    pub timeline_file: String,
    /// A log modified more recently than this, without a completion marker, is assumed to
    /// belong to a stage still running.
    pub freshness_window_secs: u64,
    /// How many bytes at the end of a log we search for completion markers.
    pub tail_window_bytes: u64,
    pub cpptraj_bin: String,
    /// Write a centered PDB of each dynamics stage's last frame.
    pub snapshots: bool,
    /// Write a re-imaged DCD of each dynamics stage's full trajectory.
    pub reimaged_trajectory: bool,
    pub plot_format: PlotFormat,
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            topology: PathBuf::from("system_hmass.prmtop"),
            stages: default_stages(),
            rmsd_regions: vec![Region::new("complex", ":1-1036")],
            rog_regions: vec![Region::new("complex", ":1-1036")],
            rmsd_mass_weighted: false,
            centering_mask: ":1-1036".to_owned(),
            report_dir: PathBuf::from("QA_REPORT"),
            plots_subdir: "Plots".to_owned(),
            pdb_subdir: "PDB_Snapshots".to_owned(),
            report_file: "Simulation_QA_Report.md".to_owned(),
            timeline_file: "global_timeline.csv".to_owned(),
            freshness_window_secs: 3_600,
            tail_window_bytes: DEFAULT_TAIL_WINDOW,
            cpptraj_bin: "cpptraj".to_owned(),
            snapshots: true,
            reimaged_trajectory: false,
            plot_format: PlotFormat::Svg,
        }
    }
}

impl QaConfig {
    /// From the text of a TOML config file.
    pub fn from_toml(text: &str) -> Result<Self> {
        let result: Self = toml::from_str(text)?;
        result.validate()?;
        Ok(result)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(QaError::MissingInput(path.to_owned()));
        }
        let text = fs::read_to_string(path).map_err(|e| QaError::io(path, e))?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(QaError::Config("Stage names can't be empty".to_owned()));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(QaError::Config(format!(
                    "Duplicate stage name: {}",
                    stage.name
                )));
            }
        }

        for region in self.rmsd_regions.iter().chain(&self.rog_regions) {
            if region.name.trim().is_empty() || region.mask.trim().is_empty() {
                return Err(QaError::Config(format!(
                    "Regions need both a name and a mask: {region:?}"
                )));
            }
        }

        // Sanitized names key the cpptraj datasets and scratch tables, so they must stay distinct.
        for regions in [&self.rmsd_regions, &self.rog_regions] {
            let mut seen = HashSet::new();
            for region in regions {
                if !seen.insert(file_safe(&region.name)) {
                    return Err(QaError::Config(format!(
                        "Region name `{}` collides with another after sanitizing to `{}`",
                        region.name,
                        file_safe(&region.name)
                    )));
                }
            }
        }

        if self.tail_window_bytes == 0 {
            return Err(QaError::Config(
                "tail_window_bytes must be positive".to_owned(),
            ));
        }

        Ok(())
    }

    pub fn topology_path(&self) -> PathBuf {
        self.work_dir.join(&self.topology)
    }

    pub fn report_root(&self) -> PathBuf {
        self.work_dir.join(&self.report_dir)
    }

    pub fn plots_dir(&self) -> PathBuf {
        self.report_root().join(&self.plots_subdir)
    }

    pub fn pdb_dir(&self) -> PathBuf {
        self.report_root().join(&self.pdb_subdir)
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_secs(self.freshness_window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg = QaConfig::from_toml(
            r#"
topology = "complex.prmtop"
plot_format = "png"

[[stages]]
name = "min1"
kind = "min"

[[stages]]
name = "prod"
kind = "dynamics"

[[rog_regions]]
name = "ligand"
mask = ":1037"
"#,
        )
        .unwrap();

        assert_eq!(cfg.topology, PathBuf::from("complex.prmtop"));
        assert_eq!(cfg.plot_format, PlotFormat::Png);
        assert_eq!(
            cfg.stages,
            vec![StageDef::minimization("min1"), StageDef::dynamics("prod")]
        );
        assert_eq!(cfg.rog_regions, vec![Region::new("ligand", ":1037")]);
        // Untouched fields.
        assert_eq!(cfg.rmsd_regions, vec![Region::new("complex", ":1-1036")]);
        assert_eq!(cfg.tail_window_bytes, 8_192);
        assert_eq!(cfg.report_dir, PathBuf::from("QA_REPORT"));
    }

    #[test]
    fn duplicate_stage_rejected() {
        let err = QaConfig::from_toml(
            r#"
[[stages]]
name = "md1"
kind = "md"

[[stages]]
name = "md1"
kind = "md"
"#,
        )
        .unwrap_err();

        assert!(matches!(err, QaError::Config(_)));
    }

    #[test]
    fn colliding_region_names_rejected() {
        let cfg = QaConfig {
            rmsd_regions: vec![
                Region::new("rec+lig", ":1-1036"),
                Region::new("rec_lig", ":1-10"),
            ],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(QaError::Config(_))));

        let cfg = QaConfig {
            rog_regions: vec![Region::new("ligand", ":1037"), Region::new("ligand", ":1038")],
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(QaError::Config(_))));

        // One name may be used for both metrics.
        let cfg = QaConfig {
            rmsd_regions: vec![Region::new("rec+lig", ":1-1036")],
            rog_regions: vec![Region::new("rec+lig", ":1-1036")],
            ..Default::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = QaConfig::load(&dir.path().join("qa.toml")).unwrap_err();
        assert!(matches!(err, QaError::MissingInput(_)));
    }

    #[test]
    fn stage_def_from_str() {
        assert_eq!(
            "min_1_solvent:min".parse::<StageDef>().unwrap(),
            StageDef::minimization("min_1_solvent")
        );
        assert_eq!(
            "md3:dynamics".parse::<StageDef>().unwrap(),
            StageDef::dynamics("md3")
        );
        assert!("md3".parse::<StageDef>().is_err());
        assert!(":md".parse::<StageDef>().is_err());
        assert!("md3:relax".parse::<StageDef>().is_err());
    }

    #[test]
    fn default_stage_order() {
        let stages = default_stages();
        assert_eq!(stages.len(), 19);
        assert_eq!(stages[0], StageDef::minimization("min_1_solvent"));
        assert_eq!(stages[5], StageDef::dynamics("heat_5RT"));
        assert_eq!(stages[18], StageDef::dynamics("md10"));
        assert!(QaConfig::default().validate().is_ok());
    }
}
