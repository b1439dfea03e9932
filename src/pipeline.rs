//! End-to-end orchestration for the `run`, `summarize` and `plot` commands.

use crate::columns::{InstrumentRegistry, validate_columns};
use crate::config::{Config, ConfigError};
use crate::download::{FetchError, Transport, fetch_dataset};
use crate::hmc::{SamplerConfig, SamplerError, sample_posterior};
use crate::model::{HierarchicalModel, ModelData, ModelError, Priors};
use crate::plot::{plot_slope_forest, plot_trace};
use crate::posterior::{Posterior, ReportError};
use crate::reshape::reshape_long;
use crate::standardize::{Standardization, standardize_within_instrument};
use crate::summary::{
    SummaryRow, slope_effects, summarize_posterior, warn_on_convergence, write_measures_json,
    write_slope_effects_csv, write_standardization_csv, write_summary_csv,
};
use crate::table::WideTable;
use crate::types::{DataError, TimeCoding};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Sampler(#[from] SamplerError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

/// Everything the fit needs besides the table and registry.
#[derive(Clone, Debug)]
pub struct FitSettings {
    pub sampler: SamplerConfig,
    pub priors: Priors,
    pub time_coding: TimeCoding,
    pub id_column: Option<String>,
}

/// Result of an in-memory fit.
#[derive(Clone, Debug)]
pub struct Fit {
    pub posterior: Posterior,
    pub scales: Vec<Standardization>,
    pub measures: Vec<String>,
    pub n_obs: usize,
    pub n_subjects: usize,
}

/// IO-free core: validate columns, reshape, standardize, build, sample.
pub fn fit_table(
    table: &WideTable,
    registry: &InstrumentRegistry,
    settings: &FitSettings,
) -> Result<Fit, PipelineError> {
    let registry = validate_columns(table, registry)?;
    let long = reshape_long(table, registry, settings.id_column.as_deref())?;
    let standardized = standardize_within_instrument(long)?;
    let data = ModelData::from_standardized(&standardized, settings.time_coding)?;
    let (n_obs, n_subjects) = (data.n_obs(), data.n_subjects());
    let measures = data.instrument_labels().to_vec();
    let model = HierarchicalModel::new(data, settings.priors)?;
    let mut posterior = sample_posterior(&model, &settings.sampler)?;
    posterior
        .attrs
        .insert("time_coding".into(), settings.time_coding.as_str().into());
    Ok(Fit {
        posterior,
        scales: standardized.scales,
        measures,
        n_obs,
        n_subjects,
    })
}

/// Files written by [`run_pipeline`].
#[derive(Clone, Debug, Default)]
pub struct RunOutcome {
    pub dataset: PathBuf,
    pub idata: Option<PathBuf>,
    pub summary: Option<PathBuf>,
    pub slope_table: Option<PathBuf>,
    pub measures: PathBuf,
    pub standardization: PathBuf,
    pub summary_rows: Vec<SummaryRow>,
}

/// fetch -> load -> fit -> persist.
pub fn run_pipeline(config: &Config, transport: &dyn Transport) -> Result<RunOutcome, PipelineError> {
    let fetched = fetch_dataset(
        &config.data.url,
        &config.data.out_path,
        config.data.md5.as_deref(),
        transport,
    )?;
    let table = WideTable::from_csv_path(fetched.path())?;
    log::info!(
        "loaded {} rows x {} columns from {}",
        table.n_rows(),
        table.headers().len(),
        fetched.path().display()
    );

    let settings = FitSettings {
        sampler: config.sampler.clone(),
        priors: config.model.priors,
        time_coding: config.model.time_coding,
        id_column: config.data.id_column.clone(),
    };
    let fit = fit_table(&table, &config.registry, &settings)?;
    log::info!(
        "fit complete: {} observations, {} subjects, {} instruments",
        fit.n_obs,
        fit.n_subjects,
        fit.measures.len()
    );

    let outdir = &config.outputs.outdir;
    std::fs::create_dir_all(outdir).map_err(|e| ReportError::io(outdir, e))?;
    let hdi_prob = config.model.hdi_prob;
    let mut outcome = RunOutcome {
        dataset: fetched.path().to_path_buf(),
        measures: outdir.join("measures.json"),
        standardization: outdir.join("tables").join("standardization.csv"),
        ..RunOutcome::default()
    };

    if config.outputs.save_idata {
        let path = outdir.join("idata.json");
        fit.posterior.write(&path)?;
        outcome.idata = Some(path);
    }

    let rows = summarize_posterior(&fit.posterior, hdi_prob);
    warn_on_convergence(&rows);
    if config.outputs.save_summary {
        let path = outdir.join("summary.csv");
        write_summary_csv(&path, &rows, hdi_prob)?;
        outcome.summary = Some(path);
        outcome.slope_table = write_slopes(&fit.posterior, outdir, hdi_prob)?;
    }
    write_measures_json(&outcome.measures, &fit.measures)?;
    write_standardization_csv(&outcome.standardization, &fit.scales)?;
    outcome.summary_rows = rows;
    Ok(outcome)
}

fn write_slopes(
    post: &Posterior,
    outdir: &Path,
    hdi_prob: f64,
) -> Result<Option<PathBuf>, ReportError> {
    let Some(effects) = slope_effects(post, hdi_prob) else {
        log::warn!("posterior has no beta_m; skipping beta_m_effects.csv");
        return Ok(None);
    };
    let path = outdir.join("tables").join("beta_m_effects.csv");
    write_slope_effects_csv(&path, &effects, hdi_prob)?;
    Ok(Some(path))
}

/// Paths written by [`summarize_idata`].
#[derive(Clone, Debug)]
pub struct SummarizeOutcome {
    pub summary: PathBuf,
    pub slope_table: Option<PathBuf>,
    pub rows: Vec<SummaryRow>,
}

/// Re-summarizes persisted draws into `<outdir>/tables/`.
pub fn summarize_idata(
    idata: &Path,
    outdir: &Path,
    hdi_prob: f64,
) -> Result<SummarizeOutcome, PipelineError> {
    let post = Posterior::read(idata)?;
    let rows = summarize_posterior(&post, hdi_prob);
    warn_on_convergence(&rows);
    let summary = outdir.join("tables").join("posterior_summary.csv");
    write_summary_csv(&summary, &rows, hdi_prob)?;
    let slope_table = write_slopes(&post, outdir, hdi_prob)?;
    Ok(SummarizeOutcome {
        summary,
        slope_table,
        rows,
    })
}

/// Renders trace and forest figures from persisted draws.
pub fn plot_idata(
    idata: &Path,
    outdir: &Path,
    hdi_prob: f64,
) -> Result<Vec<PathBuf>, PipelineError> {
    let post = Posterior::read(idata)?;
    let mut written = vec![plot_trace(&post, outdir)?];
    if let Some(forest) = plot_slope_forest(&post, outdir, hdi_prob)? {
        written.push(forest);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::{FitSettings, PipelineError, fit_table};
    use crate::columns::{Instrument, InstrumentRegistry};
    use crate::hmc::SamplerConfig;
    use crate::model::Priors;
    use crate::table::WideTable;
    use crate::types::{DataError, TimeCoding};

    #[test]
    fn missing_columns_stop_the_fit_before_sampling() {
        let table = WideTable::from_columns(&[("A1", vec![Some(1.0)])]).unwrap();
        let registry = InstrumentRegistry::new(vec![Instrument::new("A", "A1", "A2")]).unwrap();
        let settings = FitSettings {
            sampler: SamplerConfig::default(),
            priors: Priors::default(),
            time_coding: TimeCoding::Centered,
            id_column: None,
        };
        let err = fit_table(&table, &registry, &settings).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Data(DataError::MissingColumns(_))
        ));
        assert!(err.to_string().contains("A: A2"));
    }
}
