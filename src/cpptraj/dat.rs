//! Reading the data files cpptraj writes for `rms`, `radgyr` etc: whitespace-separated columns,
//! one row per frame, `#` comments. Depending on the flags passed, a row is `frame time value`
//! or `frame value`; we accept either, as long as a file is consistent.

use std::{collections::BTreeMap, fs, path::Path};

use log::debug;

use crate::error::{QaError, Result};

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct DatRow {
    /// 1-based
    pub frame: u32,
    /// ps. Absent in 2-column files.
    pub time_ps: Option<f64>,
    pub value: f64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Metric {
    /// RMSD to the first frame, Å
    Rmsd,
    /// Radius of gyration, Å
    RadiusOfGyration,
}

impl Metric {
    /// Used in output file names.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Rmsd => "rmsd",
            Self::RadiusOfGyration => "rog",
        }
    }
}

/// One metric over one atom selection, as read from a single data file.
#[derive(Clone, PartialEq, Debug)]
pub struct MetricTable {
    pub metric: Metric,
    pub region: String,
    pub rows: Vec<DatRow>,
}

/// Structural metrics for one trajectory frame, keyed by region name.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct StructuralSample {
    pub frame: u32,
    pub time_ps: Option<f64>,
    pub rmsd: BTreeMap<String, f64>,
    pub rog: BTreeMap<String, f64>,
}

fn parse_frame(s: &str) -> Option<u32> {
    let v: f64 = s.parse().ok()?;
    let v = v.round();
    if v >= 1. && v <= u32::MAX as f64 {
        Some(v as u32)
    } else {
        None
    }
}

/// Parse the text of a cpptraj data file. Rows whose numbers don't parse are dropped; a file
/// that switches column count partway, or has a shape other than 2 or 3 columns, is rejected.
pub fn parse_dat(text: &str) -> Result<Vec<DatRow>> {
    let mut result = Vec::new();
    let mut n_cols = None;

    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let cols: Vec<_> = line.split_whitespace().collect();

        let expected = *n_cols.get_or_insert(cols.len());
        if cols.len() != expected {
            return Err(QaError::Table(format!(
                "Line {}: expected {expected} columns, found {}",
                i + 1,
                cols.len()
            )));
        }

        let row = match cols.as_slice() {
            [frame, time, value] => match (
                parse_frame(frame),
                time.parse::<f64>(),
                value.parse::<f64>(),
            ) {
                (Some(frame), Ok(time), Ok(value)) => Some(DatRow {
                    frame,
                    time_ps: Some(time),
                    value,
                }),
                _ => None,
            },
            [frame, value] => match (parse_frame(frame), value.parse::<f64>()) {
                (Some(frame), Ok(value)) => Some(DatRow {
                    frame,
                    time_ps: None,
                    value,
                }),
                _ => None,
            },
            _ => {
                return Err(QaError::Table(format!(
                    "Unsupported column count: {expected}"
                )));
            }
        };

        match row {
            Some(r) => result.push(r),
            None => debug!("Dropping malformed data row: {line}"),
        }
    }

    Ok(result)
}

pub fn load_dat(path: &Path) -> Result<Vec<DatRow>> {
    let text = fs::read_to_string(path).map_err(|e| QaError::io(path, e))?;
    parse_dat(&text)
}

/// Join tables on frame number. Only frames present in every table are kept. Time comes from
/// the first table that has it for a given frame.
pub fn merge_by_frame(tables: &[MetricTable]) -> Vec<StructuralSample> {
    let Some((first, rest)) = tables.split_first() else {
        return Vec::new();
    };

    let mut merged: BTreeMap<u32, StructuralSample> = BTreeMap::new();
    for row in &first.rows {
        let sample = merged.entry(row.frame).or_insert_with(|| StructuralSample {
            frame: row.frame,
            ..Default::default()
        });
        insert_value(sample, first, row);
    }

    for table in rest {
        let by_frame: BTreeMap<u32, &DatRow> = table.rows.iter().map(|r| (r.frame, r)).collect();

        merged.retain(|frame, _| by_frame.contains_key(frame));

        for (frame, sample) in merged.iter_mut() {
            insert_value(sample, table, by_frame[frame]);
        }
    }

    merged.into_values().collect()
}

fn insert_value(sample: &mut StructuralSample, table: &MetricTable, row: &DatRow) {
    if sample.time_ps.is_none() {
        sample.time_ps = row.time_ps;
    }

    let map = match table.metric {
        Metric::Rmsd => &mut sample.rmsd,
        Metric::RadiusOfGyration => &mut sample.rog,
    };
    map.insert(table.region.clone(), row.value);
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn table(metric: Metric, region: &str, frames: &[u32]) -> MetricTable {
        MetricTable {
            metric,
            region: region.to_owned(),
            rows: frames
                .iter()
                .map(|&frame| DatRow {
                    frame,
                    time_ps: None,
                    value: frame as f64 / 10.,
                })
                .collect(),
        }
    }

    #[test]
    fn three_columns() {
        let rows = parse_dat(
            "#Frame Time complex_rmsd\n       1       1.000    0.0000\n       2       2.000    0.8125\n",
        )
        .unwrap();

        assert_eq!(
            rows,
            vec![
                DatRow {
                    frame: 1,
                    time_ps: Some(1.),
                    value: 0.
                },
                DatRow {
                    frame: 2,
                    time_ps: Some(2.),
                    value: 0.8125
                },
            ]
        );
    }

    #[test]
    fn two_columns_and_malformed_rows() {
        let rows = parse_dat("1 15.2\n2 nan?\n3.000 15.4\n").unwrap();

        let frames: Vec<_> = rows.iter().map(|r| r.frame).collect();
        assert_eq!(frames, vec![1, 3]);
        assert!(rows.iter().all(|r| r.time_ps.is_none()));
    }

    #[test]
    fn inconsistent_shape_rejected() {
        assert!(parse_dat("1 1.0 0.5\n2 0.6\n").is_err());
        assert!(parse_dat("1 1.0 0.5 0.2\n").is_err());
    }

    #[test]
    fn merge_is_inner_join() {
        let merged = merge_by_frame(&[
            table(Metric::Rmsd, "complex", &[1, 2, 3]),
            table(Metric::RadiusOfGyration, "complex", &[2, 3, 4]),
        ]);

        let frames: Vec<_> = merged.iter().map(|s| s.frame).collect();
        assert_eq!(frames, vec![2, 3]);
        assert_eq!(merged[0].rmsd["complex"], 0.2);
        assert_eq!(merged[1].rog["complex"], 0.3);
    }

    #[test]
    fn merge_single_table_and_empty() {
        let merged = merge_by_frame(&[table(Metric::Rmsd, "ligand", &[1, 2])]);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].rog.is_empty());

        assert!(merge_by_frame(&[]).is_empty());
    }
}
