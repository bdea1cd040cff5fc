//! For parsing Amber `mdout` logs (the `.out` files written by `sander` and `pmemd`).
//! These are semi-structured text: a minimization log holds a table of
//! `NSTEP ENERGY RMS GMAX ...` rows, and a dynamics log holds repeated blocks of
//! `LABEL = value` pairs, each opened by an `NSTEP =` line.
//!
//! Both end with summary sections (averages, fluctuations, timings) whose lines resemble data
//! rows; we stop before those.

use std::{
    fs::{self, File},
    io::{self, Read, Seek, SeekFrom},
    path::Path,
    sync::LazyLock,
};

use log::{debug, warn};
use regex::Regex;

use crate::config::{StageDef, StageKind};

/// Bytes at the end of the log checked for completion markers.
pub const DEFAULT_TAIL_WINDOW: u64 = 8_192;

/// If any of these is in the last few KB of a log, the run ended on its own terms.
pub const COMPLETION_MARKERS: [&str; 5] = [
    "Final Performance Info",
    "Job finished",
    "Run time",
    "Maximum number of minimization cycles reached",
    "Final Energy",
];

const AVERAGES: &str = "A V E R A G E S";
const FLUCTUATIONS: [&str; 2] = ["R M S  F L U C T U A T I O N S", "RMS fluctuations"];
// `sander` capitalizes this one in minimization logs.
const FINAL_RESULTS: [&str; 2] = ["Final Results", "FINAL RESULTS"];
const FINAL_PERFORMANCE: &str = "Final Performance Info";
const STEP_MARKER: &str = "NSTEP";

// Plain, fixed-point, or scientific notation, e.g. `300.15`, `-1.0E+02`.
const FLOAT: &str = r"[-+]?[0-9]*\.?[0-9]+(?:[eE][-+]?[0-9]+)?";

static RE_MIN_ROW: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\s*(\d+|{FLOAT})\s+({FLOAT})\s+({FLOAT})")).unwrap());

static RE_NSTEP: LazyLock<Regex> = LazyLock::new(|| field_re(r"NSTEP"));
static RE_TIME: LazyLock<Regex> = LazyLock::new(|| field_re(r"TIME\(PS\)"));
static RE_TEMP: LazyLock<Regex> = LazyLock::new(|| field_re(r"TEMP\(K\)"));
static RE_PRESS: LazyLock<Regex> = LazyLock::new(|| field_re(r"PRESS"));
static RE_ETOT: LazyLock<Regex> = LazyLock::new(|| field_re(r"Etot"));
static RE_EPTOT: LazyLock<Regex> = LazyLock::new(|| field_re(r"EPtot"));
static RE_DENSITY: LazyLock<Regex> = LazyLock::new(|| field_re(r"Density"));
static RE_NS_PER_DAY: LazyLock<Regex> = LazyLock::new(|| field_re(r"ns/day"));
// `sander` writes "elapsed time = ..."; `pmemd` writes "Elapsed(s) = ...".
static RE_ELAPSED: LazyLock<Regex> =
    LazyLock::new(|| field_re(r"(?i:elapsed(?: time|\(s\)))"));

/// `LABEL = number`, capturing the number.
fn field_re(label: &str) -> Regex {
    Regex::new(&format!(r"{label}\s*=\s*({FLOAT})")).unwrap()
}

fn is_final_results(line: &str) -> bool {
    FINAL_RESULTS.iter().any(|m| line.contains(m))
}

fn capture_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)?.get(1)?.as_str().parse().ok()
}

/// Step counters are occasionally written as floats; accept those, but not negative or
/// non-finite ones.
fn parse_step(s: &str) -> Option<u64> {
    let v: f64 = s.parse().ok()?;
    if v.is_finite() && v >= 0. {
        Some(v as u64)
    } else {
        None
    }
}

/// One row of a minimization table.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct MinSample {
    pub step: u64,
    /// kcal/mol
    pub energy: f64,
    /// kcal/mol/Å
    pub rms_force: f64,
}

/// One `NSTEP` block of a dynamics log. Any field other than the step may be absent.
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct DynSample {
    pub step: u64,
    /// Simulation time within this stage, ps.
    pub time_ps: Option<f64>,
    /// K
    pub temperature: Option<f64>,
    /// bar
    pub pressure: Option<f64>,
    /// kcal/mol
    pub total_energy: Option<f64>,
    /// kcal/mol
    pub potential_energy: Option<f64>,
    /// g/cm³
    pub density: Option<f64>,
}

/// Fields of the dynamics block currently being read. Each recognized label overwrites its
/// field; the block becomes a `DynSample` when the next one opens.
#[derive(Default)]
struct BlockBuilder {
    step: Option<u64>,
    time_ps: Option<f64>,
    temperature: Option<f64>,
    pressure: Option<f64>,
    total_energy: Option<f64>,
    potential_energy: Option<f64>,
    density: Option<f64>,
}

impl BlockBuilder {
    fn update(&mut self, line: &str) {
        if let Some(caps) = RE_NSTEP.captures(line) {
            if let Some(step) = parse_step(&caps[1]) {
                self.step = Some(step);
            }
        }

        let fields = [
            (&*RE_TIME, &mut self.time_ps),
            (&*RE_TEMP, &mut self.temperature),
            (&*RE_PRESS, &mut self.pressure),
            (&*RE_ETOT, &mut self.total_energy),
            (&*RE_EPTOT, &mut self.potential_energy),
            (&*RE_DENSITY, &mut self.density),
        ];

        for (re, field) in fields {
            if let Some(v) = capture_f64(re, line) {
                *field = Some(v);
            }
        }
    }

    /// A block without a step index is discarded.
    fn commit(self) -> Option<DynSample> {
        Some(DynSample {
            step: self.step?,
            time_ps: self.time_ps,
            temperature: self.temperature,
            pressure: self.pressure,
            total_energy: self.total_energy,
            potential_energy: self.potential_energy,
            density: self.density,
        })
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum Samples {
    Minimization(Vec<MinSample>),
    Dynamics(Vec<DynSample>),
}

impl Samples {
    pub fn kind(&self) -> StageKind {
        match self {
            Self::Minimization(_) => StageKind::Minimization,
            Self::Dynamics(_) => StageKind::Dynamics,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Minimization(s) => s.len(),
            Self::Dynamics(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_step(&self) -> Option<u64> {
        match self {
            Self::Minimization(s) => s.last().map(|s| s.step),
            Self::Dynamics(s) => s.last().map(|s| s.step),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Performance {
    pub ns_per_day: f64,
    /// Wall time, s.
    pub elapsed: f64,
    /// From a tail check for completion markers only: the rest of the log may still be truncated
    /// or malformed.
    pub finished_normally: bool,
}

/// The parsed outcome of one stage's log.
#[derive(Clone, PartialEq, Debug)]
pub struct StageResult {
    pub stage_name: String,
    pub samples: Samples,
    pub performance: Performance,
}

impl StageResult {
    pub fn kind(&self) -> StageKind {
        self.samples.kind()
    }

    /// Parse a stage's log file. `None` if the log doesn't exist or can't be read; the caller
    /// reports that stage as having no data, and moves on.
    pub fn load(stage: &StageDef, path: &Path, tail_window: u64) -> Option<Self> {
        if !path.exists() {
            debug!("No log for stage {} at {}", stage.name, path.display());
            return None;
        }

        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                warn!("Error reading {}: {e}", path.display());
                return None;
            }
        };
        // Logs of crashed runs can end mid-character.
        let text = String::from_utf8_lossy(&bytes);

        let mut result = Self::new(stage, &text);

        // Independent of whether the scan above found anything.
        result.performance.finished_normally = match tail_has_marker(path, tail_window) {
            Ok(v) => v,
            Err(e) => {
                warn!("Error reading the tail of {}: {e}", path.display());
                false
            }
        };

        Some(result)
    }

    /// Parse log text. `finished_normally` is left false; it comes from the file tail.
    pub fn new(stage: &StageDef, text: &str) -> Self {
        let (samples, performance) = match stage.kind {
            StageKind::Minimization => (
                Samples::Minimization(parse_minimization(text)),
                Performance::default(),
            ),
            StageKind::Dynamics => {
                let (samples, perf) = parse_dynamics(text);
                (Samples::Dynamics(samples), perf)
            }
        };

        Self {
            stage_name: stage.name.clone(),
            samples,
            performance,
        }
    }
}

/// Rows of three leading numbers: step, energy, RMS force. Header and separator lines are skipped,
/// and rows whose numbers don't parse are dropped. Stops for good at the summary section, whose
/// lines can otherwise look like data.
pub fn parse_minimization(text: &str) -> Vec<MinSample> {
    let mut result = Vec::new();

    for line in text.lines() {
        if is_final_results(line) || line.contains(AVERAGES) {
            break;
        }
        if line.contains(STEP_MARKER) || line.contains("---") {
            continue;
        }

        let Some(caps) = RE_MIN_ROW.captures(line) else {
            continue;
        };

        let (Some(step), Ok(energy), Ok(rms_force)) =
            (parse_step(&caps[1]), caps[2].parse::<f64>(), caps[3].parse::<f64>())
        else {
            debug!("Dropping malformed minimization row: {line}");
            continue;
        };

        result.push(MinSample {
            step,
            energy,
            rms_force,
        });
    }

    result
}

/// Accumulates `NSTEP` blocks. Within a block, each field is taken from whichever line carries its
/// label, in any order. Throughput and wall time are collected from anywhere in the scanned range.
pub fn parse_dynamics(text: &str) -> (Vec<DynSample>, Performance) {
    let mut samples = Vec::new();
    let mut perf = Performance::default();
    let mut block: Option<BlockBuilder> = None;
    let mut have_throughput = false;

    for line in text.lines() {
        if line.contains(AVERAGES)
            || FLUCTUATIONS.iter().any(|m| line.contains(m))
            || is_final_results(line)
        {
            break;
        }
        // The footer repeats the throughput line. If we've already seen one in the run body,
        // stop here instead of reading it again.
        if line.contains(FINAL_PERFORMANCE) && have_throughput {
            break;
        }

        if line.contains(STEP_MARKER) {
            if let Some(prev) = block.take() {
                samples.extend(prev.commit());
            }
            block = Some(BlockBuilder::default());
        }

        if let Some(b) = block.as_mut() {
            b.update(line);
        }

        if let Some(v) = capture_f64(&RE_NS_PER_DAY, line) {
            perf.ns_per_day = v;
            have_throughput = true;
        }
        if let Some(v) = capture_f64(&RE_ELAPSED, line) {
            perf.elapsed = v;
        }
    }

    if let Some(b) = block {
        samples.extend(b.commit());
    }

    (samples, perf)
}

/// Check the last `window` bytes of a file for any of the completion markers. A marker further
/// back than that isn't seen.
pub fn tail_has_marker(path: &Path, window: u64) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();

    file.seek(SeekFrom::Start(len.saturating_sub(window)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let tail = String::from_utf8_lossy(&buf);
    Ok(COMPLETION_MARKERS.iter().any(|m| tail.contains(m)))
}
