//! Posterior summaries and the tabular artifacts written after a fit.

use crate::diagnostics::{effective_sample_size, split_rhat};
use crate::posterior::{Posterior, ReportError, Variable, pooled};
use crate::standardize::Standardization;
use comfy_table::{Cell, ContentArrangement, Row, Table, presets::UTF8_FULL};
use csv::WriterBuilder;
use rayon::prelude::*;
use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Scalar quantities shown in the console table.
pub const GLOBAL_PARAMETERS: [&str; 7] = [
    "alpha",
    "beta_time",
    "sigma_id",
    "corr_id",
    "sd_u0",
    "sd_u1",
    "sigma",
];

const RHAT_WARN: f64 = 1.01;
const ESS_WARN: f64 = 100.0;

#[derive(Clone, Debug, PartialEq)]
pub struct SummaryRow {
    pub variable: String,
    pub label: String,
    pub mean: f64,
    pub sd: f64,
    pub hdi_low: f64,
    pub hdi_high: f64,
    pub ess: f64,
    pub r_hat: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SlopeEffect {
    pub measure_index: usize,
    pub measure: String,
    pub mean: f64,
    pub hdi_low: f64,
    pub hdi_high: f64,
}

/// Shortest interval containing `prob` of the draws.
pub fn hdi(values: &[f64], prob: f64) -> (f64, f64) {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let width = ((prob * n as f64).floor() as usize).min(n - 1);
    let n_intervals = n - width;
    let mut best = 0;
    let mut best_width = f64::INFINITY;
    for i in 0..n_intervals {
        let w = sorted[i + width] - sorted[i];
        if w < best_width {
            best_width = w;
            best = i;
        }
    }
    (sorted[best], sorted[best + width])
}

/// Column names for the interval bounds, e.g. `hdi_2.5%` / `hdi_97.5%`.
pub fn hdi_labels(prob: f64) -> (String, String) {
    let tidy = |x: f64| (x * 1e6).round() / 1e6;
    let lo = tidy((1.0 - prob) / 2.0 * 100.0);
    let hi = tidy(100.0 - lo);
    (format!("hdi_{lo}%"), format!("hdi_{hi}%"))
}

fn mean_sd(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    if xs.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let mean = xs.iter().sum::<f64>() / n;
    if xs.len() < 2 {
        return (mean, 0.0);
    }
    let var = xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (mean, var.sqrt())
}

fn summarize_variable(post: &Posterior, var: &Variable, hdi_prob: f64) -> Vec<SummaryRow> {
    (0..var.n_elements())
        .map(|k| {
            let series = var.element(k);
            let draws = pooled(series.view());
            let (mean, sd) = mean_sd(&draws);
            let (hdi_low, hdi_high) = hdi(&draws, hdi_prob);
            SummaryRow {
                variable: var.name.clone(),
                label: post.element_label(var, k),
                mean,
                sd,
                hdi_low,
                hdi_high,
                ess: effective_sample_size(series.view()),
                r_hat: split_rhat(series.view()),
            }
        })
        .collect()
}

/// One row per scalar element of every variable, in variable order.
pub fn summarize_posterior(post: &Posterior, hdi_prob: f64) -> Vec<SummaryRow> {
    let rows: Vec<SummaryRow> = post
        .variables
        .par_iter()
        .map(|var| summarize_variable(post, var, hdi_prob))
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();
    log::debug!("summarized {} scalar elements", rows.len());
    rows
}

/// Logs convergence problems; never fails.
pub fn warn_on_convergence(rows: &[SummaryRow]) {
    let max_rhat = rows
        .iter()
        .map(|r| r.r_hat)
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::max);
    let min_ess = rows
        .iter()
        .map(|r| r.ess)
        .filter(|v| v.is_finite())
        .fold(f64::NAN, f64::min);
    if max_rhat >= RHAT_WARN {
        let worst: Vec<&str> = rows
            .iter()
            .filter(|r| r.r_hat >= RHAT_WARN)
            .take(5)
            .map(|r| r.label.as_str())
            .collect();
        log::warn!("max r_hat = {max_rhat:.3} (>= {RHAT_WARN}); e.g. {}", worst.join(", "));
    }
    if min_ess < ESS_WARN {
        log::warn!("min ess = {min_ess:.1} (< {ESS_WARN}); consider more draws");
    }
}

/// Instrument-specific total time slopes, or `None` when `beta_m` was not
/// recorded.
pub fn slope_effects(post: &Posterior, hdi_prob: f64) -> Option<Vec<SlopeEffect>> {
    let var = post.get("beta_m")?;
    let labels = post.coord("measure");
    Some(
        (0..var.n_elements())
            .map(|m| {
                let draws = pooled(var.element(m).view());
                let (mean, _) = mean_sd(&draws);
                let (hdi_low, hdi_high) = hdi(&draws, hdi_prob);
                SlopeEffect {
                    measure_index: m,
                    measure: labels
                        .and_then(|l| l.get(m))
                        .cloned()
                        .unwrap_or_else(|| m.to_string()),
                    mean,
                    hdi_low,
                    hdi_high,
                }
            })
            .collect(),
    )
}

fn csv_err(path: &Path, e: impl std::fmt::Display) -> ReportError {
    ReportError::Csv {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn ensure_parent(path: &Path) -> Result<(), ReportError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|e| ReportError::io(parent, e))?;
    }
    Ok(())
}

fn write_rows<I>(path: &Path, header: Vec<String>, rows: I) -> Result<(), ReportError>
where
    I: IntoIterator<Item = Vec<String>>,
{
    ensure_parent(path)?;
    let mut wtr = WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| csv_err(path, e))?;
    wtr.write_record(&header).map_err(|e| csv_err(path, e))?;
    for row in rows {
        wtr.write_record(&row).map_err(|e| csv_err(path, e))?;
    }
    wtr.flush().map_err(|e| csv_err(path, e))?;
    log::info!("wrote {}", path.display());
    Ok(())
}

pub fn write_summary_csv(
    path: &Path,
    rows: &[SummaryRow],
    hdi_prob: f64,
) -> Result<(), ReportError> {
    let (lo, hi) = hdi_labels(hdi_prob);
    let header = ["", "mean", "sd", lo.as_str(), hi.as_str(), "ess", "r_hat"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    write_rows(
        path,
        header,
        rows.iter().map(|r| {
            vec![
                r.label.clone(),
                format!("{:.12}", r.mean),
                format!("{:.12}", r.sd),
                format!("{:.12}", r.hdi_low),
                format!("{:.12}", r.hdi_high),
                format!("{:.3}", r.ess),
                format!("{:.6}", r.r_hat),
            ]
        }),
    )
}

pub fn write_slope_effects_csv(
    path: &Path,
    effects: &[SlopeEffect],
    hdi_prob: f64,
) -> Result<(), ReportError> {
    let (lo, hi) = hdi_labels(hdi_prob);
    let header = ["measure_index", "measure", "mean", lo.as_str(), hi.as_str()]
        .iter()
        .map(|s| s.to_string())
        .collect();
    write_rows(
        path,
        header,
        effects.iter().map(|e| {
            vec![
                e.measure_index.to_string(),
                e.measure.clone(),
                format!("{:.12}", e.mean),
                format!("{:.12}", e.hdi_low),
                format!("{:.12}", e.hdi_high),
            ]
        }),
    )
}

pub fn write_standardization_csv(
    path: &Path,
    scales: &[Standardization],
) -> Result<(), ReportError> {
    let header = ["measure", "n", "mean", "sd"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    write_rows(
        path,
        header,
        scales.iter().map(|s| {
            vec![
                s.instrument.clone(),
                s.n.to_string(),
                format!("{:.12}", s.mean),
                format!("{:.12}", s.sd),
            ]
        }),
    )
}

#[derive(Serialize)]
struct MeasuresFile<'a> {
    measures: &'a [String],
}

/// Instrument names in index order.
pub fn write_measures_json(path: &Path, measures: &[String]) -> Result<(), ReportError> {
    ensure_parent(path)?;
    let file = File::create(path).map_err(|e| ReportError::io(path, e))?;
    serde_json::to_writer_pretty(BufWriter::new(file), &MeasuresFile { measures })?;
    log::info!("wrote {}", path.display());
    Ok(())
}

/// Console table of the global parameters.
pub fn global_parameter_table(rows: &[SummaryRow], hdi_prob: f64) -> Table {
    let (lo, hi) = hdi_labels(hdi_prob);
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            "parameter".to_string(),
            "mean".to_string(),
            "sd".to_string(),
            lo,
            hi,
            "ess".to_string(),
            "r_hat".to_string(),
        ]);
    for r in rows
        .iter()
        .filter(|r| GLOBAL_PARAMETERS.contains(&r.variable.as_str()))
    {
        table.add_row(Row::from(vec![
            Cell::new(&r.label),
            Cell::new(format!("{:.3}", r.mean)),
            Cell::new(format!("{:.3}", r.sd)),
            Cell::new(format!("{:.3}", r.hdi_low)),
            Cell::new(format!("{:.3}", r.hdi_high)),
            Cell::new(format!("{:.0}", r.ess)),
            Cell::new(format!("{:.3}", r.r_hat)),
        ]));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::{
        global_parameter_table, hdi, hdi_labels, slope_effects, summarize_posterior,
        write_slope_effects_csv, write_summary_csv,
    };
    use crate::posterior::{Posterior, Variable};
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, Array3};
    use rand::{SeedableRng, rngs::StdRng};
    use rand_distr::{Distribution, Normal};
    use tempfile::tempdir;

    fn posterior() -> Posterior {
        let mut rng = StdRng::seed_from_u64(4);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut p = Posterior::default();
        p.coords
            .insert("measure".into(), vec!["BFI-E".into(), "STAI-E".into()]);
        p.variables.push(Variable::scalar(
            "alpha",
            Array2::from_shape_fn((2, 200), |_| normal.sample(&mut rng)),
        ));
        p.variables.push(Variable::new(
            "beta_m",
            &["measure"],
            Array3::from_shape_fn((2, 200, 2), |(_, _, m)| {
                normal.sample(&mut rng) * 0.1 + if m == 0 { 0.5 } else { -0.2 }
            })
            .into_dyn(),
        ));
        p
    }

    #[test]
    fn hdi_of_uniform_grid_is_central() {
        let xs: Vec<f64> = (0..=100).map(|i| i as f64).collect();
        let (lo, hi) = hdi(&xs, 0.9);
        assert_abs_diff_eq!(hi - lo, 90.0, epsilon = 1e-12);
    }

    #[test]
    fn hdi_prefers_the_dense_region_of_skewed_draws() {
        let mut xs: Vec<f64> = (0..95).map(|i| i as f64 * 0.01).collect();
        xs.extend([50.0, 60.0, 70.0, 80.0, 90.0]);
        let (lo, hi) = hdi(&xs, 0.9);
        assert!(lo < 0.1);
        assert!(hi < 1.0);
    }

    #[test]
    fn interval_labels_match_probability() {
        assert_eq!(
            hdi_labels(0.95),
            ("hdi_2.5%".to_string(), "hdi_97.5%".to_string())
        );
        assert_eq!(hdi_labels(0.9), ("hdi_5%".to_string(), "hdi_95%".to_string()));
    }

    #[test]
    fn summary_has_one_row_per_scalar_element() {
        let rows = summarize_posterior(&posterior(), 0.95);
        let labels: Vec<&str> = rows.iter().map(|r| r.label.as_str()).collect();
        assert_eq!(labels, vec!["alpha", "beta_m[BFI-E]", "beta_m[STAI-E]"]);
        assert_abs_diff_eq!(rows[1].mean, 0.5, epsilon = 0.05);
        assert!(rows.iter().all(|r| r.hdi_low < r.mean && r.mean < r.hdi_high));
        assert!(rows.iter().all(|r| (r.r_hat - 1.0).abs() < 0.05));
    }

    #[test]
    fn slope_table_uses_measure_labels_and_is_optional() {
        let effects = slope_effects(&posterior(), 0.95).unwrap();
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[1].measure, "STAI-E");
        assert_eq!(effects[1].measure_index, 1);

        let mut no_beta = posterior();
        no_beta.variables.retain(|v| v.name != "beta_m");
        assert!(slope_effects(&no_beta, 0.95).is_none());
    }

    #[test]
    fn csv_artifacts_have_expected_headers() {
        let dir = tempdir().unwrap();
        let post = posterior();
        let rows = summarize_posterior(&post, 0.95);
        let summary = dir.path().join("summary.csv");
        write_summary_csv(&summary, &rows, 0.95).unwrap();
        let text = std::fs::read_to_string(&summary).unwrap();
        assert!(text.starts_with(",mean,sd,hdi_2.5%,hdi_97.5%,ess,r_hat\n"));
        assert_eq!(text.lines().count(), 4);

        let slopes = dir.path().join("tables").join("beta_m_effects.csv");
        write_slope_effects_csv(&slopes, &slope_effects(&post, 0.95).unwrap(), 0.95).unwrap();
        let text = std::fs::read_to_string(&slopes).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("measure_index,measure,mean,hdi_2.5%,hdi_97.5%")
        );
        assert!(lines.next().unwrap().starts_with("0,BFI-E,"));
    }

    #[test]
    fn console_table_lists_only_global_parameters() {
        let rows = summarize_posterior(&posterior(), 0.95);
        let rendered = global_parameter_table(&rows, 0.95).to_string();
        assert!(rendered.contains("alpha"));
        assert!(!rendered.contains("beta_m"));
    }
}
