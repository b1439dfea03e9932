//! NUTS driver using general-mcmc.
//!
//! The hierarchical model exposes an unconstrained log density with an
//! analytic gradient; this module wraps it as a `HamiltonianTarget`, picks
//! initial positions, runs `GenericNUTS`, and maps every draw back to named,
//! constrained quantities in a [`Posterior`].
//!
//! Model data is held in an `Arc`, so the per-chain clones general-mcmc makes
//! share one copy.

use crate::model::{HierarchicalModel, ModelData};
use crate::posterior::{Posterior, Variable};
use general_mcmc::generic_hmc::HamiltonianTarget;
use general_mcmc::generic_nuts::{GenericNUTS, MassMatrixAdaptation, NUTSMassMatrixConfig};
use ndarray::{Array1, Array2, Array3, Array4};
use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsError};

const INIT_JITTER: f64 = 0.1;

#[derive(Error, Debug)]
pub enum SamplerError {
    #[error("invalid sampler configuration: {0}")]
    InvalidConfig(String),

    #[error("log density is not finite at the initial point of chain {chain}")]
    NonFiniteInit { chain: usize },

    #[error("mode search for initialization failed: {0}")]
    ModeSearch(String),

    #[error("sampler returned {got:?} draws, expected {expected:?}")]
    UnexpectedShape {
        expected: [usize; 3],
        got: Vec<usize>,
    },
}

/// Where chains start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InitStrategy {
    /// Small Gaussian jitter around the origin of the unconstrained space.
    #[default]
    Jitter,
    /// Same jitter, centered at the posterior mode.
    Map,
}

impl InitStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jitter => "jitter",
            Self::Map => "map",
        }
    }
}

/// NUTS settings. The seed is always explicit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Retained draws per chain.
    pub draws: usize,
    /// Warmup iterations per chain, discarded.
    pub tune: usize,
    pub chains: usize,
    /// Target acceptance probability of step-size adaptation.
    pub target_accept: f64,
    #[serde(default = "default_max_treedepth")]
    pub max_treedepth: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default)]
    pub init: InitStrategy,
}

fn default_max_treedepth() -> usize {
    12
}

fn default_seed() -> u64 {
    42
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            draws: 1000,
            tune: 1000,
            chains: 4,
            target_accept: 0.9,
            max_treedepth: default_max_treedepth(),
            seed: default_seed(),
            init: InitStrategy::Jitter,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.draws == 0 {
            return Err(SamplerError::InvalidConfig("draws must be >= 1".into()));
        }
        if self.chains == 0 {
            return Err(SamplerError::InvalidConfig("chains must be >= 1".into()));
        }
        if !(self.target_accept > 0.0 && self.target_accept < 1.0) {
            return Err(SamplerError::InvalidConfig(format!(
                "target_accept must be in (0, 1), got {}",
                self.target_accept
            )));
        }
        if !(1..=30).contains(&self.max_treedepth) {
            return Err(SamplerError::InvalidConfig(format!(
                "max_treedepth must be in 1..=30, got {}",
                self.max_treedepth
            )));
        }
        Ok(())
    }
}

/// `HamiltonianTarget` view of the model.
#[derive(Clone)]
struct PosteriorTarget {
    model: HierarchicalModel,
}

impl HamiltonianTarget<Array1<f64>> for PosteriorTarget {
    fn logp_and_grad(&self, position: &Array1<f64>, grad: &mut Array1<f64>) -> f64 {
        let (logp, g) = self.model.logp_and_grad(position.view());
        grad.assign(&g);
        logp
    }
}

fn mass_matrix_config(dim: usize, tune: usize) -> NUTSMassMatrixConfig {
    if tune < 80 {
        return NUTSMassMatrixConfig::disabled();
    }
    // Dense adaptation only for small models.
    let dense = dim <= 50;
    NUTSMassMatrixConfig {
        adaptation: if dense {
            MassMatrixAdaptation::Dense
        } else {
            MassMatrixAdaptation::Diagonal
        },
        start_buffer: (tune / 10).clamp(25, 150),
        end_buffer: (tune / 8).clamp(25, 150),
        initial_window: (tune / 12).clamp(20, 120),
        regularize: if dense { 0.03 } else { 0.08 },
        jitter: 1e-6,
        dense_max_dim: 75,
    }
}

/// Posterior mode in the unconstrained space, via BFGS on the negative log
/// density.
fn find_mode(model: &HierarchicalModel, seed: u64) -> Result<Array1<f64>, SamplerError> {
    let x0 = Array1::<f64>::zeros(model.dim());
    let mut solver = Bfgs::new(x0, |x| {
        let (lp, g) = model.logp_and_grad(x.view());
        if lp.is_finite() && g.iter().all(|v| v.is_finite()) {
            (-lp, -g)
        } else {
            (f64::INFINITY, Array1::zeros(x.len()))
        }
    })
    .with_tolerance(1e-6)
    .with_max_iterations(500)
    .with_rng_seed(seed);

    let solution = match solver.run() {
        Ok(sol) => sol,
        Err(BfgsError::MaxIterationsReached { last_solution })
        | Err(BfgsError::LineSearchFailed { last_solution, .. }) => {
            log::warn!("mode search stopped early; using its last point as the chain center");
            *last_solution
        }
        Err(e) => return Err(SamplerError::ModeSearch(format!("{e:?}"))),
    };
    log::info!(
        "mode search: -logp={:.4} after {} iterations",
        solution.final_value,
        solution.iterations
    );
    Ok(solution.final_point)
}

/// Seeded starting points, one per chain. With `InitStrategy::Map` each
/// chain starts from the jittered mode, unless that point is worse than the
/// same jitter around the origin. An exact-fit mode sits at sigma -> 0,
/// where any jitter collapses the density.
fn initial_positions(
    model: &HierarchicalModel,
    config: &SamplerConfig,
) -> Result<Vec<Array1<f64>>, SamplerError> {
    let mode = match config.init {
        InitStrategy::Jitter => None,
        InitStrategy::Map => Some(find_mode(model, config.seed)?),
    };
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut out = Vec::with_capacity(config.chains);
    for chain in 0..config.chains {
        let jitter = Array1::from_shape_fn(model.dim(), |_| {
            let z: f64 = StandardNormal.sample(&mut rng);
            INIT_JITTER * z
        });
        let (origin_lp, _) = model.logp_and_grad(jitter.view());
        let mut pos = jitter;
        let mut lp = origin_lp;
        if let Some(mode) = &mode {
            let candidate = mode + &pos;
            let (mode_lp, _) = model.logp_and_grad(candidate.view());
            if mode_lp.is_finite() && (mode_lp >= origin_lp || !origin_lp.is_finite()) {
                pos = candidate;
                lp = mode_lp;
            } else {
                log::warn!(
                    "chain {chain}: jittered mode start has logp {mode_lp:.3e}, below {origin_lp:.3e} at the origin; starting from the origin"
                );
            }
        }
        if !lp.is_finite() {
            return Err(SamplerError::NonFiniteInit { chain });
        }
        out.push(pos);
    }
    Ok(out)
}

/// Runs NUTS on the model and returns every named quantity per draw.
pub fn sample_posterior(
    model: &HierarchicalModel,
    config: &SamplerConfig,
) -> Result<Posterior, SamplerError> {
    config.validate()?;
    let dim = model.dim();
    let init = initial_positions(model, config)?;

    log::info!(
        "NUTS: {} chains x ({} tune + {} draws), target_accept={}, max_treedepth={}, seed={}, init={}",
        config.chains,
        config.tune,
        config.draws,
        config.target_accept,
        config.max_treedepth,
        config.seed,
        config.init.as_str()
    );

    let target = PosteriorTarget {
        model: model.clone(),
    };
    let mut sampler = GenericNUTS::new_with_mass_matrix(
        target,
        init,
        config.target_accept,
        mass_matrix_config(dim, config.tune),
    );
    let started = Instant::now();
    let raw = sampler.run(config.draws, config.tune);
    log::info!("sampling finished in {:.2?}", started.elapsed());

    let expected = [config.chains, config.draws, dim];
    if raw.shape() != &expected[..] {
        return Err(SamplerError::UnexpectedShape {
            expected,
            got: raw.shape().to_vec(),
        });
    }
    Ok(assemble_posterior(model, config, &raw))
}

/// Maps raw unconstrained draws `(chain, draw, dim)` to named variables.
pub fn assemble_posterior(
    model: &HierarchicalModel,
    config: &SamplerConfig,
    raw: &Array3<f64>,
) -> Posterior {
    let (n_chains, n_draws, _) = raw.dim();
    let data = model.data();
    let n_sub = data.n_subjects();
    let n_ins = data.n_instruments();

    let scalar = || Array2::<f64>::zeros((n_chains, n_draws));
    let per_ins = || Array3::<f64>::zeros((n_chains, n_draws, n_ins));
    let per_sub = || Array4::<f64>::zeros((n_chains, n_draws, n_sub, 2));

    let (mut alpha, mut beta_time, mut corr_id) = (scalar(), scalar(), scalar());
    let (mut sd_u0, mut sd_u1, mut sigma) = (scalar(), scalar(), scalar());
    let mut sigma_id = Array3::<f64>::zeros((n_chains, n_draws, 2));
    let (mut z_id, mut re_id) = (per_sub(), per_sub());
    let (mut z_u0, mut z_u1) = (per_ins(), per_ins());
    let (mut u0_m, mut u1_m, mut beta_m) = (per_ins(), per_ins(), per_ins());

    for c in 0..n_chains {
        for d in 0..n_draws {
            let v = model.constrain(raw.slice(ndarray::s![c, d, ..]));
            alpha[[c, d]] = v.alpha;
            beta_time[[c, d]] = v.beta_time;
            corr_id[[c, d]] = v.corr_id;
            sd_u0[[c, d]] = v.sd_u0;
            sd_u1[[c, d]] = v.sd_u1;
            sigma[[c, d]] = v.sigma;
            sigma_id[[c, d, 0]] = v.sigma_id[0];
            sigma_id[[c, d, 1]] = v.sigma_id[1];
            z_id.slice_mut(ndarray::s![c, d, .., ..]).assign(&v.z_id);
            re_id.slice_mut(ndarray::s![c, d, .., ..]).assign(&v.re_id);
            z_u0.slice_mut(ndarray::s![c, d, ..]).assign(&v.z_u0);
            z_u1.slice_mut(ndarray::s![c, d, ..]).assign(&v.z_u1);
            u0_m.slice_mut(ndarray::s![c, d, ..]).assign(&v.u0_m);
            u1_m.slice_mut(ndarray::s![c, d, ..]).assign(&v.u1_m);
            beta_m.slice_mut(ndarray::s![c, d, ..]).assign(&v.beta_m);
        }
    }

    let mut posterior = Posterior::default();
    posterior.coords.insert("id".into(), data.subject_labels().to_vec());
    posterior
        .coords
        .insert("measure".into(), data.instrument_labels().to_vec());
    posterior
        .coords
        .insert("coef2".into(), vec!["intercept".into(), "time".into()]);

    posterior.variables = vec![
        Variable::scalar("alpha", alpha),
        Variable::scalar("beta_time", beta_time),
        Variable::new("sigma_id", &["coef2"], sigma_id.into_dyn()),
        Variable::scalar("corr_id", corr_id),
        Variable::new("z_id", &["id", "coef2"], z_id.into_dyn()),
        Variable::new("RE_id", &["id", "coef2"], re_id.into_dyn()),
        Variable::scalar("sd_u0", sd_u0),
        Variable::scalar("sd_u1", sd_u1),
        Variable::new("z_u0", &["measure"], z_u0.into_dyn()),
        Variable::new("z_u1", &["measure"], z_u1.into_dyn()),
        Variable::new("u0_m", &["measure"], u0_m.into_dyn()),
        Variable::new("u1_m", &["measure"], u1_m.into_dyn()),
        Variable::scalar("sigma", sigma),
        Variable::new("beta_m", &["measure"], beta_m.into_dyn()),
    ];

    record_attrs(&mut posterior, model.data(), config);
    posterior
}

fn record_attrs(posterior: &mut Posterior, data: &ModelData, config: &SamplerConfig) {
    let attrs = &mut posterior.attrs;
    attrs.insert("created_by".into(), format!("prepost {}", env!("CARGO_PKG_VERSION")));
    attrs.insert("build_timestamp".into(), env!("PREPOST_BUILD_TIMESTAMP").into());
    attrs.insert("sampler".into(), "nuts".into());
    attrs.insert("draws".into(), config.draws.to_string());
    attrs.insert("tune".into(), config.tune.to_string());
    attrs.insert("chains".into(), config.chains.to_string());
    attrs.insert("target_accept".into(), config.target_accept.to_string());
    attrs.insert("max_treedepth".into(), config.max_treedepth.to_string());
    attrs.insert("seed".into(), config.seed.to_string());
    attrs.insert("init".into(), config.init.as_str().into());
    attrs.insert("n_obs".into(), data.n_obs().to_string());
}
