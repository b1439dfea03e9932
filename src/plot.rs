//! PNG figures: per-chain traces of the global parameters and a forest plot
//! of the instrument-specific slopes.

use crate::posterior::{Posterior, ReportError};
use crate::summary::{SlopeEffect, slope_effects};
use ndarray::Array2;
use plotters::prelude::*;
use plotters::style::{FontStyle, register_font};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const PANEL_WIDTH: u32 = 900;
const PANEL_HEIGHT: u32 = 180;
const CHAIN_COLORS: [RGBColor; 6] = [
    RGBColor(31, 119, 180),
    RGBColor(255, 127, 14),
    RGBColor(44, 160, 44),
    RGBColor(214, 39, 40),
    RGBColor(148, 103, 189),
    RGBColor(140, 86, 75),
];

/// Global series drawn in the trace figure, in panel order. Vector-valued
/// entries get one panel per element.
const TRACE_PARAMETERS: [&str; 7] = [
    "alpha",
    "beta_time",
    "sigma_id",
    "corr_id",
    "sd_u0",
    "sd_u1",
    "sigma",
];

const FONT_FAMILY: &str = "sans-serif";
static FONT_BYTES: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");
static FONT_READY: OnceLock<bool> = OnceLock::new();

/// Registers the bundled face once per process; plotters has no system font
/// lookup in this build.
fn ensure_font(path: &Path) -> Result<(), ReportError> {
    let ready = *FONT_READY
        .get_or_init(|| register_font(FONT_FAMILY, FontStyle::Normal, FONT_BYTES).is_ok());
    if ready {
        Ok(())
    } else {
        Err(plot_err(path, "bundled font could not be parsed"))
    }
}

fn plot_err(path: &Path, e: impl std::fmt::Display) -> ReportError {
    ReportError::Plot {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn padded_range(lo: f64, hi: f64) -> std::ops::Range<f64> {
    if !(lo.is_finite() && hi.is_finite()) {
        return -1.0..1.0;
    }
    let pad = ((hi - lo) * 0.05).max(1e-6);
    (lo - pad)..(hi + pad)
}

fn trace_series(post: &Posterior) -> Vec<(String, Array2<f64>)> {
    TRACE_PARAMETERS
        .iter()
        .filter_map(|name| post.get(name))
        .flat_map(|var| (0..var.n_elements()).map(move |k| (var, k)))
        .map(|(var, k)| (post.element_label(var, k), var.element(k)))
        .collect()
}

/// One panel per global parameter element, one line per chain. Returns the
/// written path.
pub fn plot_trace(post: &Posterior, outdir: &Path) -> Result<PathBuf, ReportError> {
    let dir = outdir.join("figures");
    std::fs::create_dir_all(&dir).map_err(|e| ReportError::io(&dir, e))?;
    let path = dir.join("trace.png");

    let series = trace_series(post);
    if series.is_empty() {
        return Err(ReportError::Malformed(
            "no global parameters to plot".to_string(),
        ));
    }
    draw_trace(&path, &series)?;
    log::info!("wrote {}", path.display());
    Ok(path)
}

fn draw_trace(path: &Path, series: &[(String, Array2<f64>)]) -> Result<(), ReportError> {
    ensure_font(path)?;
    let height = PANEL_HEIGHT * series.len() as u32;
    let root = BitMapBackend::new(path, (PANEL_WIDTH, height)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_err(path, e))?;
    let panels = root.split_evenly((series.len(), 1));

    for (panel, (label, draws)) in panels.iter().zip(series) {
        let (n_chains, n_draws) = draws.dim();
        let lo = draws.iter().copied().fold(f64::INFINITY, f64::min);
        let hi = draws.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mut chart = ChartBuilder::on(panel)
            .caption(label.as_str(), (FONT_FAMILY, 16))
            .margin(8)
            .x_label_area_size(24)
            .y_label_area_size(48)
            .build_cartesian_2d(0f64..n_draws.max(1) as f64, padded_range(lo, hi))
            .map_err(|e| plot_err(path, e))?;
        chart
            .configure_mesh()
            .disable_mesh()
            .draw()
            .map_err(|e| plot_err(path, e))?;
        for c in 0..n_chains {
            let color = CHAIN_COLORS[c % CHAIN_COLORS.len()];
            chart
                .draw_series(LineSeries::new(
                    draws.row(c).iter().enumerate().map(|(d, v)| (d as f64, *v)),
                    &color,
                ))
                .map_err(|e| plot_err(path, e))?;
        }
    }
    root.present().map_err(|e| plot_err(path, e))?;
    Ok(())
}

fn draw_forest(path: &Path, effects: &[SlopeEffect]) -> Result<(), ReportError> {
    ensure_font(path)?;
    let n = effects.len();
    let lo = effects.iter().map(|e| e.hdi_low).fold(0.0, f64::min);
    let hi = effects.iter().map(|e| e.hdi_high).fold(0.0, f64::max);
    let root = BitMapBackend::new(path, (PANEL_WIDTH, 60 + 40 * n as u32)).into_drawing_area();
    root.fill(&WHITE).map_err(|e| plot_err(path, e))?;

    let labels: Vec<String> = effects.iter().map(|e| e.measure.clone()).collect();
    let mut chart = ChartBuilder::on(&root)
        .caption("beta_m", (FONT_FAMILY, 18))
        .margin(12)
        .x_label_area_size(28)
        .y_label_area_size(180)
        .build_cartesian_2d(padded_range(lo, hi), -0.5f64..(n as f64 - 0.5))
        .map_err(|e| plot_err(path, e))?;
    chart
        .configure_mesh()
        .disable_mesh()
        .y_labels(n)
        .y_label_formatter(&|y| {
            let i = y.round();
            if i >= 0.0 && (i as usize) < labels.len() {
                labels[n - 1 - i as usize].clone()
            } else {
                String::new()
            }
        })
        .draw()
        .map_err(|e| plot_err(path, e))?;

    // Zero reference line.
    chart
        .draw_series(LineSeries::new(
            vec![(0.0, -0.5), (0.0, n as f64 - 0.5)],
            &BLACK.mix(0.4),
        ))
        .map_err(|e| plot_err(path, e))?;

    // First instrument at the top.
    let row = |i: usize| (n - 1 - i) as f64;
    chart
        .draw_series(effects.iter().enumerate().map(|(i, e)| {
            PathElement::new(
                vec![(e.hdi_low, row(i)), (e.hdi_high, row(i))],
                CHAIN_COLORS[0].stroke_width(2),
            )
        }))
        .map_err(|e| plot_err(path, e))?;
    chart
        .draw_series(
            effects
                .iter()
                .enumerate()
                .map(|(i, e)| Circle::new((e.mean, row(i)), 4, CHAIN_COLORS[0].filled())),
        )
        .map_err(|e| plot_err(path, e))?;
    root.present().map_err(|e| plot_err(path, e))?;
    Ok(())
}

/// Interval and mean of `beta_m` per instrument. `Ok(None)` when the draws
/// carry no `beta_m`.
pub fn plot_slope_forest(
    post: &Posterior,
    outdir: &Path,
    hdi_prob: f64,
) -> Result<Option<PathBuf>, ReportError> {
    let Some(effects) = slope_effects(post, hdi_prob) else {
        log::warn!("posterior has no beta_m; skipping forest plot");
        return Ok(None);
    };
    if effects.is_empty() {
        return Ok(None);
    }
    let dir = outdir.join("figures");
    std::fs::create_dir_all(&dir).map_err(|e| ReportError::io(&dir, e))?;
    let path = dir.join("beta_m_forest.png");
    draw_forest(&path, &effects)?;
    log::info!("wrote {}", path.display());
    Ok(Some(path))
}

#[cfg(test)]
mod tests {
    use super::{plot_slope_forest, plot_trace, trace_series};
    use crate::posterior::{Posterior, Variable};
    use ndarray::{Array2, Array3};
    use tempfile::tempdir;

    fn posterior(with_beta: bool) -> Posterior {
        let mut p = Posterior::default();
        p.coords
            .insert("measure".into(), vec!["A".into(), "B".into(), "C".into()]);
        p.coords
            .insert("coef2".into(), vec!["intercept".into(), "time".into()]);
        p.variables.push(Variable::new(
            "sigma_id",
            &["coef2"],
            Array3::from_shape_fn((2, 40, 2), |(c, d, k)| 1.0 + k as f64 + 0.01 * (c + d) as f64)
                .into_dyn(),
        ));
        for name in ["alpha", "sigma"] {
            p.variables.push(Variable::scalar(
                name,
                Array2::from_shape_fn((2, 40), |(c, d)| ((c + d) as f64 * 0.3).sin()),
            ));
        }
        if with_beta {
            p.variables.push(Variable::new(
                "beta_m",
                &["measure"],
                Array3::from_shape_fn((2, 40, 3), |(c, d, m)| {
                    m as f64 - 1.0 + 0.1 * ((c * 40 + d) as f64).cos()
                })
                .into_dyn(),
            ));
        }
        p
    }

    #[test]
    fn figures_are_written_as_png() {
        let dir = tempdir().unwrap();
        let trace = plot_trace(&posterior(true), dir.path()).unwrap();
        assert_eq!(trace, dir.path().join("figures").join("trace.png"));
        let forest = plot_slope_forest(&posterior(true), dir.path(), 0.95)
            .unwrap()
            .unwrap();
        for path in [trace, forest] {
            let bytes = std::fs::read(&path).unwrap();
            assert_eq!(&bytes[..4], b"\x89PNG", "{}", path.display());
        }
    }

    #[test]
    fn forest_plot_is_skipped_without_slopes() {
        let dir = tempdir().unwrap();
        assert!(
            plot_slope_forest(&posterior(false), dir.path(), 0.95)
                .unwrap()
                .is_none()
        );
        assert!(!dir.path().join("figures").join("beta_m_forest.png").exists());
    }

    #[test]
    fn trace_covers_every_global_element_in_order() {
        let labels: Vec<String> = trace_series(&posterior(false))
            .into_iter()
            .map(|(label, draws)| {
                assert_eq!(draws.dim(), (2, 40));
                label
            })
            .collect();
        assert_eq!(
            labels,
            ["alpha", "sigma_id[intercept]", "sigma_id[time]", "sigma"]
        );
    }
}
