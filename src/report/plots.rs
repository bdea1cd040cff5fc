//! Stage and campaign plots, drawn with `plotters`. SVG by default: it needs no system fonts.

use std::{
    error::Error,
    path::{Path, PathBuf},
};

use plotters::{coord::Shift, prelude::*};

use crate::{
    config::PlotFormat,
    error::{QaError, Result},
    mdout::{DynSample, MinSample},
    timeline::{Column, ReconciledTimeline},
};

const PANEL_WIDTH: u32 = 900;
const PANEL_HEIGHT: u32 = 320;

const ORANGE: RGBColor = RGBColor(230, 126, 34);
const NAVY: RGBColor = RGBColor(31, 58, 147);
const PURPLE: RGBColor = RGBColor(142, 68, 173);

const PALETTE: [RGBColor; 6] = [BLUE, RED, GREEN, ORANGE, PURPLE, NAVY];

type Points = Vec<(f64, f64)>;

/// One chart in a figure.
#[derive(Clone, Debug)]
pub struct Panel {
    pub title: String,
    pub x_desc: String,
    pub y_desc: String,
    /// `(label, points)`. Labels show in a legend when there's more than one series.
    pub series: Vec<(String, Points)>,
    pub log_y: bool,
}

impl Panel {
    fn new(title: &str, x_desc: &str, y_desc: &str, series: Vec<(String, Points)>) -> Self {
        Self {
            title: title.to_owned(),
            x_desc: x_desc.to_owned(),
            y_desc: y_desc.to_owned(),
            series,
            log_y: false,
        }
    }

    fn single(title: &str, x_desc: &str, y_desc: &str, points: Points) -> Self {
        Self::new(title, x_desc, y_desc, vec![(String::new(), points)])
    }

    fn has_data(&self) -> bool {
        self.series.iter().any(|(_, pts)| !pts.is_empty())
    }
}

/// Min and max over all points, padded so flat lines stay visible.
fn bounds(panel: &Panel) -> ((f64, f64), (f64, f64)) {
    let mut x = (f64::INFINITY, f64::NEG_INFINITY);
    let mut y = (f64::INFINITY, f64::NEG_INFINITY);

    for (xv, yv) in panel.series.iter().flat_map(|(_, p)| p) {
        x = (x.0.min(*xv), x.1.max(*xv));
        // Non-positive values aren't drawn on a log axis.
        if !panel.log_y || *yv > 0. {
            y = (y.0.min(*yv), y.1.max(*yv));
        }
    }

    if x.1 <= x.0 {
        x = (x.0 - 0.5, x.0 + 0.5);
    }

    if panel.log_y {
        y = if y.0.is_finite() {
            (y.0 / 1.5, y.1 * 1.5)
        } else {
            (0.1, 10.)
        };
    } else {
        let pad = if y.1 > y.0 { (y.1 - y.0) * 0.05 } else { y.0.abs().max(1.) * 0.05 };
        y = (y.0 - pad, y.1 + pad);
    }

    (x, y)
}

fn draw_panel<DB: DrawingBackend>(
    area: &DrawingArea<DB, Shift>,
    panel: &Panel,
) -> std::result::Result<(), Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    if !panel.has_data() {
        let (w, h) = area.dim_in_pixel();
        area.draw(&Text::new(
            format!("{}: No data", panel.title),
            (w as i32 / 2 - 60, h as i32 / 2),
            ("sans-serif", 18).into_font().color(&BLACK),
        ))?;
        return Ok(());
    }

    let ((x0, x1), (y0, y1)) = bounds(panel);
    let legend = panel.series.len() > 1;

    let mut builder = ChartBuilder::on(area);
    builder
        .caption(&panel.title, ("sans-serif", 18))
        .margin(10)
        .x_label_area_size(35)
        .y_label_area_size(70);

    // The coordinate types differ between linear and log axes, so each gets its own chart.
    if panel.log_y {
        let mut chart = builder.build_cartesian_2d(x0..x1, (y0..y1).log_scale())?;
        chart
            .configure_mesh()
            .x_desc(&panel.x_desc)
            .y_desc(&panel.y_desc)
            .draw()?;

        for (i, (label, pts)) in panel.series.iter().enumerate() {
            let color = PALETTE[i % PALETTE.len()];
            let s = chart.draw_series(LineSeries::new(
                pts.iter().copied().filter(|(_, y)| *y > 0.),
                &color,
            ))?;
            if legend {
                s.label(label)
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
        }
        if legend {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }
    } else {
        let mut chart = builder.build_cartesian_2d(x0..x1, y0..y1)?;
        chart
            .configure_mesh()
            .x_desc(&panel.x_desc)
            .y_desc(&panel.y_desc)
            .draw()?;

        for (i, (label, pts)) in panel.series.iter().enumerate() {
            let color = PALETTE[i % PALETTE.len()];
            let s = chart.draw_series(LineSeries::new(pts.iter().copied(), &color))?;
            if legend {
                s.label(label)
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
        }
        if legend {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()?;
        }
    }

    Ok(())
}

fn draw_panels<DB: DrawingBackend>(
    root: DrawingArea<DB, Shift>,
    grid: (usize, usize),
    panels: &[Panel],
) -> std::result::Result<(), Box<dyn Error>>
where
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;

    let areas = root.split_evenly(grid);
    for (area, panel) in areas.iter().zip(panels) {
        draw_panel(area, panel)?;
    }

    root.present()?;
    Ok(())
}

/// Render panels in a `(rows, cols)` grid, to `dir/<stem>.<ext>`.
pub fn render_panels(
    dir: &Path,
    stem: &str,
    format: PlotFormat,
    grid: (usize, usize),
    panels: &[Panel],
) -> Result<PathBuf> {
    let path = dir.join(format!("{stem}.{}", format.extension()));
    let size = (
        PANEL_WIDTH * grid.1 as u32,
        PANEL_HEIGHT * grid.0 as u32,
    );

    let result = match format {
        PlotFormat::Svg => draw_panels(SVGBackend::new(&path, size).into_drawing_area(), grid, panels),
        PlotFormat::Png => {
            draw_panels(BitMapBackend::new(&path, size).into_drawing_area(), grid, panels)
        }
    };

    result.map_err(|e| QaError::Plot(format!("{}: {e}", path.display())))?;
    Ok(path)
}

/// Potential energy and RMS force (log scale) against step, side by side. `None` with fewer
/// than 2 samples.
pub fn plot_minimization(
    dir: &Path,
    format: PlotFormat,
    stage_name: &str,
    samples: &[MinSample],
) -> Result<Option<PathBuf>> {
    if samples.len() < 2 {
        return Ok(None);
    }

    let energy = samples.iter().map(|s| (s.step as f64, s.energy)).collect();
    let force = samples.iter().map(|s| (s.step as f64, s.rms_force)).collect();

    let mut force_panel = Panel::single(
        &format!("{stage_name}: RMS Force"),
        "Step",
        "Force (kcal/mol/Å)",
        force,
    );
    force_panel.log_y = true;

    let panels = [
        Panel::single(
            &format!("{stage_name}: Potential Energy"),
            "Step",
            "Energy (kcal/mol)",
            energy,
        ),
        force_panel,
    ];

    render_panels(dir, &format!("{stage_name}_min"), format, (1, 2), &panels).map(Some)
}

/// Temperature and potential energy against step, with density and pressure when the log has
/// them. `None` with fewer than 2 samples.
pub fn plot_dynamics(
    dir: &Path,
    format: PlotFormat,
    stage_name: &str,
    samples: &[DynSample],
) -> Result<Option<PathBuf>> {
    if samples.len() < 2 {
        return Ok(None);
    }

    let field = |f: fn(&DynSample) -> Option<f64>| -> Points {
        samples
            .iter()
            .filter_map(|s| f(s).map(|v| (s.step as f64, v)))
            .collect()
    };

    let x_desc = "Step (NSTEP)";
    let mut panels = vec![
        Panel::single(
            &format!("{stage_name}: Temperature"),
            x_desc,
            "T (K)",
            field(|s| s.temperature),
        ),
        Panel::single(
            "Potential Energy",
            x_desc,
            "kcal/mol",
            field(|s| s.potential_energy),
        ),
    ];

    let density = field(|s| s.density);
    if !density.is_empty() {
        panels.push(Panel::single("Density", x_desc, "g/cm³", density));
    }
    let pressure = field(|s| s.pressure);
    if !pressure.is_empty() {
        panels.push(Panel::single("Pressure", x_desc, "bar", pressure));
    }

    let grid = (panels.len(), 1);
    render_panels(dir, &format!("{stage_name}_thermo"), format, grid, &panels).map(Some)
}

/// Five stacked panels over the whole campaign: RMSD and radius of gyration per region,
/// potential energy, density, and temperature.
pub fn plot_global(
    dir: &Path,
    format: PlotFormat,
    timeline: &ReconciledTimeline,
) -> Result<PathBuf> {
    let x_desc = "Cumulative Time (ns)";

    let rmsd = timeline
        .rmsd_regions()
        .into_iter()
        .map(|r| {
            let pts = timeline.series(&Column::Rmsd(r.clone()));
            (r, pts)
        })
        .collect();
    let rog = timeline
        .rog_regions()
        .into_iter()
        .map(|r| {
            let pts = timeline.series(&Column::RadiusOfGyration(r.clone()));
            (r, pts)
        })
        .collect();

    let panels = [
        Panel::new("Global RMSD (vs Start)", x_desc, "RMSD (Å)", rmsd),
        Panel::new("Radius of Gyration", x_desc, "RoG (Å)", rog),
        Panel::single(
            "Global Potential Energy",
            x_desc,
            "kcal/mol",
            timeline.series(&Column::PotentialEnergy),
        ),
        Panel::single(
            "Density",
            x_desc,
            "g/cm³",
            timeline.series(&Column::Density),
        ),
        Panel::single(
            "Temperature",
            x_desc,
            "K",
            timeline.series(&Column::Temperature),
        ),
    ];

    render_panels(dir, "GLOBAL_PRODUCTION_METRICS", format, (5, 1), &panels)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn min_samples(n: u64) -> Vec<MinSample> {
        (0..n)
            .map(|i| MinSample {
                step: i * 100,
                energy: -5.0e5 - i as f64 * 10.,
                rms_force: 10. / (i as f64 + 1.),
            })
            .collect()
    }

    #[test]
    fn too_few_samples_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let out = plot_minimization(dir.path(), PlotFormat::Svg, "min_1", &min_samples(1)).unwrap();
        assert!(out.is_none());
        assert!(
            plot_dynamics(dir.path(), PlotFormat::Svg, "md1", &[])
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn minimization_svg() {
        let dir = tempfile::tempdir().unwrap();
        let out = plot_minimization(dir.path(), PlotFormat::Svg, "min_1", &min_samples(5))
            .unwrap()
            .unwrap();

        assert_eq!(out, dir.path().join("min_1_min.svg"));
        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("<svg"));
    }

    #[test]
    fn global_with_empty_panels() {
        let dir = tempfile::tempdir().unwrap();
        let out = plot_global(dir.path(), PlotFormat::Svg, &ReconciledTimeline::default()).unwrap();

        let text = std::fs::read_to_string(&out).unwrap();
        assert!(text.contains("No data"));
    }

    #[test]
    fn bounds_padding() {
        let flat = Panel::single("t", "x", "y", vec![(1., 2.), (1., 2.)]);
        let ((x0, x1), (y0, y1)) = bounds(&flat);
        assert!(x0 < 1. && x1 > 1.);
        assert!(y0 < 2. && y1 > 2.);
    }
}
