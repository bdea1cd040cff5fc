//! Stitches per-stage samples into one time series spanning the whole campaign.
//!
//! Each stage's log restarts (or continues) its own clock. We normalize every stage to start at
//! zero, then place it after the stages before it. Thermodynamic samples and trajectory frames
//! are placed independently, each with its own running offset, since their cadences differ.

use std::{
    borrow::Cow,
    collections::{BTreeMap, BTreeSet},
    fmt::{self, Display, Formatter},
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use log::{debug, warn};

use crate::{
    cpptraj::dat::StructuralSample,
    error::{QaError, Result},
    mdout::DynSample,
};

const PS_PER_NS: f64 = 1_000.;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stream {
    /// From the simulation log.
    Thermo,
    /// From trajectory frames.
    Structural,
}

impl Display for Stream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let val = match self {
            Self::Thermo => "thermo",
            Self::Structural => "structural",
        };
        write!(f, "{val}")
    }
}

/// A quantity on the timeline. Structural ones are per region.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Column {
    /// K
    Temperature,
    /// bar
    Pressure,
    /// kcal/mol
    TotalEnergy,
    /// kcal/mol
    PotentialEnergy,
    /// g/cm³
    Density,
    /// Å
    Rmsd(String),
    /// Å
    RadiusOfGyration(String),
}

impl Column {
    pub const THERMO: [Self; 5] = [
        Self::Temperature,
        Self::Pressure,
        Self::TotalEnergy,
        Self::PotentialEnergy,
        Self::Density,
    ];

    pub fn header(&self) -> String {
        match self {
            Self::Temperature => "temperature".to_owned(),
            Self::Pressure => "pressure".to_owned(),
            Self::TotalEnergy => "total_energy".to_owned(),
            Self::PotentialEnergy => "potential_energy".to_owned(),
            Self::Density => "density".to_owned(),
            Self::Rmsd(r) => format!("rmsd_{r}"),
            Self::RadiusOfGyration(r) => format!("rog_{r}"),
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct TimelineRow {
    pub stage_name: String,
    pub stream: Stream,
    pub cumulative_time_ns: f64,
    /// A column absent here has no value for this row.
    pub values: BTreeMap<Column, f64>,
}

impl TimelineRow {
    pub fn get(&self, col: &Column) -> Option<f64> {
        self.values.get(col).copied()
    }
}

/// Where a stage sits on the cumulative axis.
#[derive(Clone, PartialEq, Debug)]
pub struct StageSpan {
    pub stage_name: String,
    pub start_ns: f64,
    pub end_ns: f64,
}

/// The finished timeline. Rows are in stage order; within a stage, thermodynamic rows precede
/// structural ones.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ReconciledTimeline {
    rows: Vec<TimelineRow>,
    spans: Vec<StageSpan>,
}

impl ReconciledTimeline {
    pub fn rows(&self) -> &[TimelineRow] {
        &self.rows
    }

    pub fn spans(&self) -> &[StageSpan] {
        &self.spans
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// `(cumulative time ns, value)` for every row that has this column. Gaps are skipped.
    pub fn series(&self, col: &Column) -> Vec<(f64, f64)> {
        self.rows
            .iter()
            .filter_map(|r| r.get(col).map(|v| (r.cumulative_time_ns, v)))
            .collect()
    }

    /// Every column with at least one value, in order.
    pub fn columns(&self) -> BTreeSet<Column> {
        self.rows
            .iter()
            .flat_map(|r| r.values.keys().cloned())
            .collect()
    }

    /// Regions with RMSD values, in order.
    pub fn rmsd_regions(&self) -> Vec<String> {
        self.columns()
            .into_iter()
            .filter_map(|c| match c {
                Column::Rmsd(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    pub fn rog_regions(&self) -> Vec<String> {
        self.columns()
            .into_iter()
            .filter_map(|c| match c {
                Column::RadiusOfGyration(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    /// Write as CSV. The thermodynamic columns are always present; structural ones appear per
    /// region. Missing values are empty cells.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| QaError::io(path, e))?;
        let mut w = BufWriter::new(file);

        let mut cols: Vec<Column> = Column::THERMO.to_vec();
        cols.extend(
            self.columns()
                .into_iter()
                .filter(|c| matches!(c, Column::Rmsd(_) | Column::RadiusOfGyration(_))),
        );

        let mut header = String::from("stage,stream,cumulative_time_ns");
        for col in &cols {
            header.push(',');
            header.push_str(&csv_field(&col.header()));
        }

        let write_all = |w: &mut BufWriter<File>| -> std::io::Result<()> {
            writeln!(w, "{header}")?;

            for row in &self.rows {
                write!(
                    w,
                    "{},{},{:.6}",
                    csv_field(&row.stage_name),
                    row.stream,
                    row.cumulative_time_ns
                )?;
                for col in &cols {
                    match row.get(col) {
                        Some(v) => write!(w, ",{v}")?,
                        None => write!(w, ",")?,
                    }
                }
                writeln!(w)?;
            }
            w.flush()
        };

        write_all(&mut w).map_err(|e| QaError::io(path, e))
    }
}

/// RFC 4180 quoting, applied only to fields that need it.
fn csv_field(s: &str) -> Cow<'_, str> {
    if s.contains([',', '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", s.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(s)
    }
}

/// Accumulates stages in order. Owns the timeline until `finish`.
#[derive(Debug, Default)]
pub struct TimelineReconciler {
    /// ps
    thermo_offset: f64,
    /// ps
    struct_offset: f64,
    timeline: ReconciledTimeline,
}

impl TimelineReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a dynamics stage. Thermodynamic samples without a time value can't be placed,
    /// and are left out. A stage with no timed samples has no known duration; it adds nothing,
    /// and its structural frames are left out too.
    pub fn append_stage(
        &mut self,
        stage_name: &str,
        thermo: &[DynSample],
        structural: Option<&[StructuralSample]>,
    ) {
        let timed: Vec<(f64, &DynSample)> = thermo
            .iter()
            .filter_map(|s| s.time_ps.map(|t| (t, s)))
            .collect();

        let (Some((t_first, _)), Some((t_last, _))) = (timed.first(), timed.last()) else {
            warn!("{stage_name}: no timed samples; leaving it off the timeline");
            return;
        };
        let (t_first, t_last) = (*t_first, *t_last);

        if timed.len() < thermo.len() {
            debug!(
                "{stage_name}: {} samples without a time value left out",
                thermo.len() - timed.len()
            );
        }

        // A non-monotonic log can end earlier than it started; never let that move us back.
        let duration = (t_last - t_first).max(0.);

        for (t, sample) in &timed {
            let mut values = BTreeMap::new();
            let fields = [
                (Column::Temperature, sample.temperature),
                (Column::Pressure, sample.pressure),
                (Column::TotalEnergy, sample.total_energy),
                (Column::PotentialEnergy, sample.potential_energy),
                (Column::Density, sample.density),
            ];
            for (col, v) in fields {
                if let Some(v) = v {
                    values.insert(col, v);
                }
            }

            let in_stage = (t - t_first).clamp(0., duration);
            self.timeline.rows.push(TimelineRow {
                stage_name: stage_name.to_owned(),
                stream: Stream::Thermo,
                cumulative_time_ns: (in_stage + self.thermo_offset) / PS_PER_NS,
                values,
            });
        }

        if let Some(frames) = structural.filter(|f| !f.is_empty()) {
            let increment = duration / frames.len() as f64;

            for (i, frame) in frames.iter().enumerate() {
                let mut values = BTreeMap::new();
                for (region, v) in &frame.rmsd {
                    values.insert(Column::Rmsd(region.clone()), *v);
                }
                for (region, v) in &frame.rog {
                    values.insert(Column::RadiusOfGyration(region.clone()), *v);
                }

                let t = (i + 1) as f64 * increment + self.struct_offset;
                self.timeline.rows.push(TimelineRow {
                    stage_name: stage_name.to_owned(),
                    stream: Stream::Structural,
                    cumulative_time_ns: t / PS_PER_NS,
                    values,
                });
            }
        }

        self.timeline.spans.push(StageSpan {
            stage_name: stage_name.to_owned(),
            start_ns: self.thermo_offset / PS_PER_NS,
            end_ns: (self.thermo_offset + duration) / PS_PER_NS,
        });

        // Both advance by the same duration, even when there were no frames, so the two streams
        // stay aligned at stage boundaries.
        self.thermo_offset += duration;
        self.struct_offset += duration;
    }

    pub fn finish(self) -> ReconciledTimeline {
        self.timeline
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn samples(times_ps: &[f64]) -> Vec<DynSample> {
        times_ps
            .iter()
            .enumerate()
            .map(|(i, &t)| DynSample {
                step: i as u64 * 500,
                time_ps: Some(t),
                temperature: Some(300.),
                ..Default::default()
            })
            .collect()
    }

    fn frame(i: u32, rmsd: f64) -> StructuralSample {
        let mut result = StructuralSample {
            frame: i,
            ..Default::default()
        };
        result.rmsd.insert("complex".to_owned(), rmsd);
        result
    }

    /// First and last cumulative time of each stage's thermodynamic rows.
    fn bounds(timeline: &ReconciledTimeline, stage: &str) -> (f64, f64) {
        let times: Vec<_> = timeline
            .rows()
            .iter()
            .filter(|r| r.stage_name == stage && r.stream == Stream::Thermo)
            .map(|r| r.cumulative_time_ns)
            .collect();
        (times[0], *times.last().unwrap())
    }

    #[test]
    fn stages_concatenate() {
        let mut rec = TimelineReconciler::new();
        rec.append_stage("a", &samples(&[0., 5_000., 10_000.]), None);
        rec.append_stage("b", &samples(&[100., 2_000., 5_100.]), None);
        rec.append_stage("c", &samples(&[7_000., 17_000., 27_000.]), None);
        let timeline = rec.finish();

        assert_eq!(bounds(&timeline, "a"), (0., 10.));
        assert_eq!(bounds(&timeline, "b"), (10., 15.));
        assert_eq!(bounds(&timeline, "c"), (15., 35.));

        let spans: Vec<_> = timeline.spans().iter().map(|s| (s.start_ns, s.end_ns)).collect();
        assert_eq!(spans, vec![(0., 10.), (10., 15.), (15., 35.)]);
    }

    #[test]
    fn timer_reset_never_goes_back() {
        let mut rec = TimelineReconciler::new();
        rec.append_stage("npt", &samples(&[1_000., 1_500., 2_000.]), None);
        // Restarted with time reset to near zero.
        rec.append_stage("md1", &samples(&[0.002, 500., 1_000.]), None);
        let timeline = rec.finish();

        let times: Vec<_> = timeline.rows().iter().map(|r| r.cumulative_time_ns).collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
        assert!((times.last().unwrap() - 1.999_998).abs() < 1e-9);
    }

    #[test]
    fn structural_frames_spread_evenly() {
        let mut rec = TimelineReconciler::new();
        rec.append_stage("md1", &samples(&[0., 4_000.]), Some(&[frame(1, 0.), frame(2, 1.)]));
        rec.append_stage(
            "md2",
            &samples(&[4_000., 8_000.]),
            Some(&[frame(1, 1.2), frame(2, 1.3), frame(3, 1.4), frame(4, 1.5)]),
        );
        let timeline = rec.finish();

        let rmsd = timeline.series(&Column::Rmsd("complex".to_owned()));
        assert_eq!(
            rmsd,
            vec![(2., 0.), (4., 1.), (5., 1.2), (6., 1.3), (7., 1.4), (8., 1.5)]
        );
        assert_eq!(timeline.rmsd_regions(), vec!["complex".to_owned()]);
    }

    #[test]
    fn missing_values_are_gaps() {
        let mut thermo = samples(&[0., 1_000., 2_000.]);
        thermo[1].temperature = None;
        thermo[2].density = Some(1.02);
        thermo.push(DynSample {
            step: 9_999,
            time_ps: None,
            ..Default::default()
        });

        let mut rec = TimelineReconciler::new();
        rec.append_stage("heat", &thermo, None);
        let timeline = rec.finish();

        assert_eq!(timeline.rows().len(), 3);
        assert_eq!(timeline.series(&Column::Temperature), vec![(0., 300.), (2., 300.)]);
        assert_eq!(timeline.series(&Column::Density), vec![(2., 1.02)]);
        assert_eq!(timeline.rows()[0].get(&Column::Pressure), None);
    }

    #[test]
    fn untimed_stage_skipped() {
        let mut rec = TimelineReconciler::new();
        let untimed = vec![DynSample::default()];
        rec.append_stage("md1", &untimed, Some(&[frame(1, 0.5)]));
        rec.append_stage("md2", &samples(&[0., 1_000.]), None);
        let timeline = rec.finish();

        assert!(timeline.rows().iter().all(|r| r.stage_name == "md2"));
        assert_eq!(bounds(&timeline, "md2"), (0., 1.));
    }

    #[test]
    fn csv_export() {
        let mut rec = TimelineReconciler::new();
        rec.append_stage("md1", &samples(&[0., 2_000.]), Some(&[frame(1, 0.75)]));
        let timeline = rec.finish();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.csv");
        timeline.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "stage,stream,cumulative_time_ns,temperature,pressure,total_energy,potential_energy,density,rmsd_complex",
                "md1,thermo,0.000000,300,,,,,",
                "md1,thermo,2.000000,300,,,,,",
                "md1,structural,2.000000,,,,,,0.75",
            ]
        );
    }

    #[test]
    fn csv_quotes_names() {
        let mut sample = StructuralSample {
            frame: 1,
            ..Default::default()
        };
        sample.rmsd.insert("a\"b".to_owned(), 0.5);

        let mut rec = TimelineReconciler::new();
        rec.append_stage("md,1", &samples(&[0., 1_000.]), Some(&[sample]));
        let timeline = rec.finish();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timeline.csv");
        timeline.write_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            vec![
                "stage,stream,cumulative_time_ns,temperature,pressure,total_energy,potential_energy,density,\"rmsd_a\"\"b\"",
                "\"md,1\",thermo,0.000000,300,,,,,",
                "\"md,1\",thermo,1.000000,300,,,,,",
                "\"md,1\",structural,1.000000,,,,,,0.5",
            ]
        );
        assert_eq!(csv_field("md1"), "md1");
    }
}
