//! For computing structural metrics of a stage's trajectory with [cpptraj](https://amberhub.chpc.utah.edu/cpptraj/),
//! and reading them back. We write a transient input script, run `cpptraj -i` on it, then read
//! the data files it was told to produce.
//!
//! Everything here is best-effort: a missing trajectory, a missing topology, or a failed run
//! results in `None` and a log line, never an error the caller must handle.

pub mod dat;

use std::{
    fmt::Write as _,
    fs::{self, File},
    io::{self, ErrorKind, Write},
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info, warn};

use crate::{
    config::{QaConfig, Region},
    dcd::DcdHeader,
    error::{QaError, Result},
};
use dat::{Metric, MetricTable, StructuralSample, load_dat, merge_by_frame};

/// Checked in this order, in the directory holding the stage's log. `{}` is the stage name.
const TRAJECTORY_CANDIDATES: [&str; 4] = ["{}.mdcrd", "{}.nc", "mdcrd", "prod.nc"];

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum TrajFormat {
    /// With extra points, e.g. TIP4P's virtual sites.
    Pdb,
    Dcd,
}

impl TrajFormat {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Pdb => "pdb include_ep",
            Self::Dcd => "dcd",
        }
    }
}

/// One cpptraj command, following `trajin`.
#[derive(Clone, PartialEq, Debug)]
pub enum Action {
    /// RMSD of each frame to the first, Å.
    Rms {
        name: String,
        mask: String,
        out: PathBuf,
        mass_weighted: bool,
    },
    /// Radius of gyration, Å.
    Radgyr {
        name: String,
        mask: String,
        out: PathBuf,
    },
    /// Re-image molecules split over periodic boundaries, centered on `anchor`.
    Autoimage { anchor: String },
    Trajout { path: PathBuf, format: TrajFormat },
}

impl Action {
    pub fn make_inp(&self) -> String {
        match self {
            Self::Rms {
                name,
                mask,
                out,
                mass_weighted,
            } => {
                let mut r = format!(
                    "rms {name}_rmsd {mask} first out {} time 1.0 noheader",
                    out.display()
                );
                if *mass_weighted {
                    r.push_str(" mass");
                }
                r
            }
            Self::Radgyr { name, mask, out } => format!(
                "radgyr {name}_rog {mask} out {} time 1.0 noheader nomax",
                out.display()
            ),
            Self::Autoimage { anchor } => format!("autoimage anchor {anchor}"),
            Self::Trajout { path, format } => {
                format!("trajout {} {}", path.display(), format.keyword())
            }
        }
    }

    /// The file this action writes, if any.
    pub fn output(&self) -> Option<&Path> {
        match self {
            Self::Rms { out, .. } | Self::Radgyr { out, .. } => Some(out),
            Self::Trajout { path, .. } => Some(path),
            Self::Autoimage { .. } => None,
        }
    }
}

/// A complete cpptraj input script: load a topology and one trajectory, apply actions, run.
#[derive(Clone, PartialEq, Debug)]
pub struct CpptrajInput {
    pub topology: PathBuf,
    pub trajectory: PathBuf,
    /// Read only the final frame.
    pub last_frame_only: bool,
    pub actions: Vec<Action>,
}

impl CpptrajInput {
    pub fn new(topology: &Path, trajectory: &Path) -> Self {
        Self {
            topology: topology.to_owned(),
            trajectory: trajectory.to_owned(),
            last_frame_only: false,
            actions: Vec::new(),
        }
    }

    pub fn make_inp(&self) -> String {
        let mut result = format!("parm {}\n", self.topology.display());

        let _ = write!(result, "trajin {}", self.trajectory.display());
        if self.last_frame_only {
            result.push_str(" lastframe");
        }
        result.push('\n');

        for action in &self.actions {
            result.push_str(&action.make_inp());
            result.push('\n');
        }

        result.push_str("run\n");
        result
    }

    /// Files the script declares it will write.
    pub fn outputs(&self) -> Vec<&Path> {
        self.actions.iter().filter_map(|a| a.output()).collect()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut file = File::create(path)?;
        let text = self.make_inp();

        write!(file, "{text}")
    }
}

/// What came of running a script.
#[derive(Clone, PartialEq, Debug)]
pub struct RunOutcome {
    /// `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub success: bool,
    pub stderr: String,
    /// The declared outputs that exist after the run.
    pub outputs: Vec<PathBuf>,
}

impl RunOutcome {
    /// The outputs, if the run succeeded and wrote at least one of them.
    pub fn checked(self, tool: &str) -> Result<Vec<PathBuf>> {
        if !self.success {
            return Err(QaError::ExternalTool {
                tool: tool.to_owned(),
                status: self.status,
                stderr: self.stderr,
            });
        }
        if self.outputs.is_empty() {
            return Err(QaError::NoToolOutput(tool.to_owned()));
        }
        Ok(self.outputs)
    }
}

/// Runs a cpptraj script. `label` identifies the run; implementations may use it to name
/// temporary files.
pub trait CpptrajRunner {
    fn run(&self, label: &str, input: &CpptrajInput) -> Result<RunOutcome>;
}

/// Runs the `cpptraj` executable as a blocking subprocess. No timeout is applied.
#[derive(Clone, Debug)]
pub struct CpptrajProcess {
    pub bin: String,
    /// The transient script is written here.
    pub scratch_dir: PathBuf,
}

impl CpptrajProcess {
    pub fn new(bin: &str, scratch_dir: &Path) -> Self {
        Self {
            bin: bin.to_owned(),
            scratch_dir: scratch_dir.to_owned(),
        }
    }
}

impl CpptrajRunner for CpptrajProcess {
    fn run(&self, label: &str, input: &CpptrajInput) -> Result<RunOutcome> {
        let script = self.scratch_dir.join(format!("temp_{label}.in"));
        input.save(&script).map_err(|e| QaError::io(&script, e))?;

        debug!("Running {} -i {}", self.bin, script.display());
        let out = Command::new(&self.bin).arg("-i").arg(&script).output();

        // Always try to remove the script, even on error.
        if let Err(e) = fs::remove_file(&script) {
            warn!("Unable to remove {}: {e}", script.display());
        }

        let out = match out {
            Ok(o) => o,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(QaError::ToolNotFound(self.bin.clone()));
            }
            Err(e) => return Err(QaError::io(&self.bin, e)),
        };

        Ok(RunOutcome {
            status: out.status.code(),
            success: out.status.success(),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            outputs: existing(&input.outputs()),
        })
    }
}

/// The subset of `paths` present on disk.
pub fn existing(paths: &[&Path]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|p| p.exists())
        .map(|p| p.to_path_buf())
        .collect()
}

/// Removes its files when dropped, whichever way the analysis exits.
struct Scratch(Vec<PathBuf>);

impl Scratch {
    /// Clears stale copies up front, so a previous run's output is never read as this one's.
    fn new(paths: Vec<PathBuf>) -> Self {
        let result = Self(paths);
        result.clear();
        result
    }

    fn clear(&self) {
        for path in &self.0 {
            remove_if_present(path);
        }
    }
}

/// A file that is already gone is fine; any other failure is logged.
fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => (),
        Err(e) if e.kind() == ErrorKind::NotFound => (),
        Err(e) => warn!("Unable to remove {}: {e}", path.display()),
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Region names become part of file names.
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Find a stage's trajectory in `dir`, trying conventional names in order.
pub fn locate_trajectory(dir: &Path, stage_name: &str) -> Option<PathBuf> {
    TRAJECTORY_CANDIDATES
        .iter()
        .map(|c| dir.join(c.replace("{}", stage_name)))
        .find(|p| p.is_file())
}

/// Structural analysis of one dynamics stage. Constructed only when both the topology and a
/// trajectory are present.
pub struct StructureAnalyzer<'a> {
    config: &'a QaConfig,
    stage_name: &'a str,
    stage_dir: PathBuf,
    topology: PathBuf,
    pub trajectory: PathBuf,
}

impl<'a> StructureAnalyzer<'a> {
    /// `log_path` is used only to find the stage's directory.
    pub fn new(config: &'a QaConfig, stage_name: &'a str, log_path: &Path) -> Option<Self> {
        let topology = config.topology_path();
        if !topology.is_file() {
            warn!(
                "Topology {} not found; skipping structural analysis of {stage_name}",
                topology.display()
            );
            return None;
        }

        let stage_dir = match log_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_owned(),
            _ => PathBuf::from("."),
        };

        let Some(trajectory) = locate_trajectory(&stage_dir, stage_name) else {
            warn!(
                "No trajectory for {stage_name} in {}; skipping structural analysis",
                stage_dir.display()
            );
            return None;
        };

        Some(Self {
            config,
            stage_name,
            stage_dir,
            topology,
            trajectory,
        })
    }

    fn input(&self) -> CpptrajInput {
        CpptrajInput::new(&self.topology, &self.trajectory)
    }

    fn table_path(&self, region: &Region, metric: Metric) -> PathBuf {
        self.stage_dir.join(format!(
            "cpptraj_{}_{}_{}.dat",
            self.stage_name,
            file_safe(&region.name),
            metric.suffix()
        ))
    }

    /// Per-frame RMSD and radius of gyration for each configured region, joined on frame.
    pub fn run_analysis(&self, runner: &dyn CpptrajRunner) -> Option<Vec<StructuralSample>> {
        let mut input = self.input();
        let mut tables = Vec::new();

        for region in &self.config.rmsd_regions {
            let out = self.table_path(region, Metric::Rmsd);
            input.actions.push(Action::Rms {
                name: file_safe(&region.name),
                mask: region.mask.clone(),
                out: out.clone(),
                mass_weighted: self.config.rmsd_mass_weighted,
            });
            tables.push((Metric::Rmsd, region.name.clone(), out));
        }

        for region in &self.config.rog_regions {
            let out = self.table_path(region, Metric::RadiusOfGyration);
            input.actions.push(Action::Radgyr {
                name: file_safe(&region.name),
                mask: region.mask.clone(),
                out: out.clone(),
            });
            tables.push((Metric::RadiusOfGyration, region.name.clone(), out));
        }

        if tables.is_empty() {
            return None;
        }

        let _scratch = Scratch::new(tables.iter().map(|(_, _, p)| p.clone()).collect());

        let label = format!("{}_metrics", file_safe(self.stage_name));
        let outcome = runner
            .run(&label, &input)
            .and_then(|o| o.checked(&self.config.cpptraj_bin));
        if let Err(e) = outcome {
            warn!("Structural analysis of {} failed: {e}", self.stage_name);
            return None;
        }

        let mut loaded = Vec::new();
        for (metric, region, path) in tables {
            match load_dat(&path) {
                Ok(rows) => loaded.push(MetricTable {
                    metric,
                    region,
                    rows,
                }),
                Err(e) => warn!("Skipping {}: {e}", path.display()),
            }
        }
        if loaded.is_empty() {
            return None;
        }

        let merged = merge_by_frame(&loaded);
        if merged.is_empty() {
            warn!("No frames in common across {}'s metric tables", self.stage_name);
            return None;
        }

        info!("{}: {} structural frames", self.stage_name, merged.len());
        Some(merged)
    }

    /// A PDB of the last frame, re-imaged around the centering mask.
    pub fn generate_snapshot(&self, runner: &dyn CpptrajRunner) -> Option<PathBuf> {
        let out = self
            .config
            .pdb_dir()
            .join(format!("{}_final.pdb", self.stage_name));

        let mut input = self.input();
        input.last_frame_only = true;
        input.actions = vec![
            Action::Autoimage {
                anchor: self.config.centering_mask.clone(),
            },
            Action::Trajout {
                path: out.clone(),
                format: TrajFormat::Pdb,
            },
        ];

        let label = format!("{}_snapshot", file_safe(self.stage_name));
        self.run_artifact(runner, &label, &input, &out)?;

        info!("Saved snapshot: {}", out.display());
        Some(out)
    }

    /// The full trajectory, re-imaged and written as DCD. The file is read back to confirm it
    /// parses and holds every frame its header declares; otherwise it's removed.
    pub fn generate_reimaged_trajectory(
        &self,
        runner: &dyn CpptrajRunner,
    ) -> Option<(PathBuf, DcdHeader)> {
        let out = self
            .stage_dir
            .join(format!("{}_imaged.dcd", self.stage_name));

        let mut input = self.input();
        input.actions = vec![
            Action::Autoimage {
                anchor: self.config.centering_mask.clone(),
            },
            Action::Trajout {
                path: out.clone(),
                format: TrajFormat::Dcd,
            },
        ];

        let label = format!("{}_imaged", file_safe(self.stage_name));
        self.run_artifact(runner, &label, &input, &out)?;

        match DcdHeader::load_complete(&out) {
            Ok(header) => {
                info!(
                    "Saved re-imaged trajectory: {} ({} frames, {} atoms)",
                    out.display(),
                    header.n_frames,
                    header.n_atoms
                );
                Some((out, header))
            }
            Err(e) => {
                warn!("Unusable re-imaged trajectory {}: {e}", out.display());
                remove_if_present(&out);
                None
            }
        }
    }

    /// Run a script that writes a single deliverable file. A partial file from a failed run is
    /// removed.
    fn run_artifact(
        &self,
        runner: &dyn CpptrajRunner,
        label: &str,
        input: &CpptrajInput,
        out: &Path,
    ) -> Option<()> {
        let outcome = runner
            .run(label, input)
            .and_then(|o| o.checked(&self.config.cpptraj_bin));

        match outcome {
            Ok(_) => Some(()),
            Err(e) => {
                warn!("Unable to write {}: {e}", out.display());
                remove_if_present(out);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use byteorder::LittleEndian;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::dcd::tests::make_dcd;

    /// Writes a canned table for each declared output, and records the scripts it was given.
    struct FakeRunner {
        succeed: bool,
        scripts: RefCell<Vec<String>>,
    }

    impl FakeRunner {
        fn new(succeed: bool) -> Self {
            Self {
                succeed,
                scripts: RefCell::new(Vec::new()),
            }
        }
    }

    impl CpptrajRunner for FakeRunner {
        fn run(&self, _label: &str, input: &CpptrajInput) -> Result<RunOutcome> {
            self.scripts.borrow_mut().push(input.make_inp());

            for out in input.outputs() {
                let name = out.to_string_lossy();
                let text = if name.ends_with("_rmsd.dat") {
                    "1 1.0 0.0\n2 2.0 0.9\n3 3.0 1.1\n"
                } else {
                    "2 2.0 20.1\n3 3.0 20.2\n4 4.0 20.3\n"
                };
                fs::write(out, text).unwrap();
            }

            Ok(RunOutcome {
                status: Some(if self.succeed { 0 } else { 1 }),
                success: self.succeed,
                stderr: String::new(),
                outputs: existing(&input.outputs()),
            })
        }
    }

    fn setup() -> (tempfile::TempDir, QaConfig, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let stage_dir = dir.path().join("md1");
        fs::create_dir_all(&stage_dir).unwrap();
        fs::write(dir.path().join("system_hmass.prmtop"), "%VERSION").unwrap();
        fs::write(stage_dir.join("md1.nc"), b"CDF").unwrap();

        let config = QaConfig {
            work_dir: dir.path().to_owned(),
            ..Default::default()
        };
        let log = stage_dir.join("md1.out");
        (dir, config, log)
    }

    fn dat_files(dir: &Path) -> Vec<PathBuf> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|e| e == "dat" || e == "in"))
            .collect()
    }

    #[test]
    fn script_text() {
        let mut input = CpptrajInput::new(Path::new("top.prmtop"), Path::new("md1.nc"));
        input.actions.push(Action::Rms {
            name: "complex".to_owned(),
            mask: ":1-1036&!@H=".to_owned(),
            out: PathBuf::from("a.dat"),
            mass_weighted: true,
        });
        input.actions.push(Action::Radgyr {
            name: "complex".to_owned(),
            mask: ":1-1036".to_owned(),
            out: PathBuf::from("b.dat"),
        });

        assert_eq!(
            input.make_inp(),
            "parm top.prmtop\n\
             trajin md1.nc\n\
             rms complex_rmsd :1-1036&!@H= first out a.dat time 1.0 noheader mass\n\
             radgyr complex_rog :1-1036 out b.dat time 1.0 noheader nomax\n\
             run\n"
        );
        assert_eq!(input.outputs(), vec![Path::new("a.dat"), Path::new("b.dat")]);
    }

    #[test]
    fn trajectory_priority() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(locate_trajectory(dir.path(), "md2"), None);

        fs::write(dir.path().join("prod.nc"), b"").unwrap();
        fs::write(dir.path().join("md2.nc"), b"").unwrap();
        assert_eq!(
            locate_trajectory(dir.path(), "md2"),
            Some(dir.path().join("md2.nc"))
        );

        fs::write(dir.path().join("md2.mdcrd"), b"").unwrap();
        assert_eq!(
            locate_trajectory(dir.path(), "md2"),
            Some(dir.path().join("md2.mdcrd"))
        );
    }

    #[test]
    fn analysis_merges_and_cleans_up() {
        let (_dir, config, log) = setup();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();
        let runner = FakeRunner::new(true);

        let samples = analyzer.run_analysis(&runner).unwrap();

        let frames: Vec<_> = samples.iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![2, 3]);
        assert_eq!(samples[0].rmsd["complex"], 0.9);
        assert_eq!(samples[1].rog["complex"], 20.2);
        assert!(dat_files(log.parent().unwrap()).is_empty());
    }

    #[test]
    fn failed_run_cleans_up() {
        let (_dir, config, log) = setup();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();

        assert!(analyzer.run_analysis(&FakeRunner::new(false)).is_none());
        assert!(dat_files(log.parent().unwrap()).is_empty());
    }

    #[test]
    fn missing_inputs() {
        let (dir, config, log) = setup();
        assert!(StructureAnalyzer::new(&config, "md2", &dir.path().join("md2/md2.out")).is_none());

        fs::remove_file(config.topology_path()).unwrap();
        assert!(StructureAnalyzer::new(&config, "md1", &log).is_none());
    }

    #[test]
    fn snapshot_script() {
        let (_dir, config, log) = setup();
        fs::create_dir_all(config.pdb_dir()).unwrap();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();
        let runner = FakeRunner::new(true);

        let out = analyzer.generate_snapshot(&runner).unwrap();
        assert_eq!(out, config.pdb_dir().join("md1_final.pdb"));

        let scripts = runner.scripts.borrow();
        assert!(scripts[0].contains(" lastframe\n"));
        assert!(scripts[0].contains("autoimage anchor :1-1036\n"));
        assert!(scripts[0].ends_with("md1_final.pdb pdb include_ep\nrun\n"));
    }

    #[test]
    fn reimaged_trajectory_rejects_bad_dcd() {
        let (_dir, config, log) = setup();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();

        // The fake writes a text table, which isn't a DCD.
        assert!(
            analyzer
                .generate_reimaged_trajectory(&FakeRunner::new(true))
                .is_none()
        );
        assert!(!config.work_dir.join("md1/md1_imaged.dcd").exists());
    }

    /// Writes fixed bytes to every declared output.
    struct DcdRunner(Vec<u8>);

    impl CpptrajRunner for DcdRunner {
        fn run(&self, _label: &str, input: &CpptrajInput) -> Result<RunOutcome> {
            for out in input.outputs() {
                fs::write(out, &self.0).unwrap();
            }
            Ok(RunOutcome {
                status: Some(0),
                success: true,
                stderr: String::new(),
                outputs: existing(&input.outputs()),
            })
        }
    }

    #[test]
    fn reimaged_trajectory_complete() {
        let (_dir, config, log) = setup();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();

        let bytes = make_dcd::<LittleEndian>(5, 12, true);
        let (path, header) = analyzer
            .generate_reimaged_trajectory(&DcdRunner(bytes))
            .unwrap();

        assert_eq!(path, config.work_dir.join("md1/md1_imaged.dcd"));
        assert_eq!((header.n_frames, header.n_atoms), (5, 12));
        assert!(path.is_file());
    }

    #[test]
    fn reimaged_trajectory_rejects_missing_frames() {
        let (_dir, config, log) = setup();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();
        let out = config.work_dir.join("md1/md1_imaged.dcd");

        // A header declaring 100 frames of 10 atoms, with no frames after it.
        let full = make_dcd::<LittleEndian>(100, 10, false);
        let header = DcdHeader::read(&mut full.as_slice()).unwrap();
        let header_only = full[..header.header_len as usize].to_vec();

        assert!(
            analyzer
                .generate_reimaged_trajectory(&DcdRunner(header_only))
                .is_none()
        );
        assert!(!out.exists());

        // Cut short partway through.
        let partial = full[..full.len() / 2].to_vec();
        assert!(
            analyzer
                .generate_reimaged_trajectory(&DcdRunner(partial))
                .is_none()
        );
        assert!(!out.exists());
    }

    #[test]
    fn failed_artifact_run_removes_partial_file() {
        let (_dir, config, log) = setup();
        fs::create_dir_all(config.pdb_dir()).unwrap();
        let analyzer = StructureAnalyzer::new(&config, "md1", &log).unwrap();

        // Exits nonzero after writing its output.
        assert_eq!(analyzer.generate_snapshot(&FakeRunner::new(false)), None);
        assert!(!config.pdb_dir().join("md1_final.pdb").exists());
    }
}
