//! Hierarchical pre/post regression on standardized scores.
//!
//! ```text
//! z_i ~ Normal(mu_i, sigma)
//! mu_i = alpha + beta * t_i
//!      + b0[s_i] + b1[s_i] * t_i          (subject effects, correlated)
//!      + u0[m_i] + u1[m_i] * t_i          (instrument effects, independent)
//! ```
//!
//! # Parameterization
//!
//! Every random effect is noncentered. Subject effects are
//! `(b0, b1)_j = z_id[j] · Lᵀ` with `z_id[j] ~ N(0, I₂)` and `L` the 2×2
//! lower Cholesky factor of the subject covariance, assembled in closed form by
//! [`cholesky_2x2`]. Instrument effects are `u0 = sd_u0 · z_u0`,
//! `u1 = sd_u1 · z_u1`.
//!
//! The sampler works on an unconstrained vector: scales enter as logs and the
//! subject correlation as `atanh(corr)`, with the matching log-Jacobian terms
//! added to the density. Gradients are analytic.

use crate::standardize::StandardizedTable;
use crate::types::{TimeCoding, Timepoint};
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

const LN_2PI: f64 = 1.837_877_066_409_345_5;
const HALF_LN_2_OVER_PI: f64 = -0.225_791_352_644_727_4;

#[derive(Error, Debug, PartialEq)]
pub enum ModelError {
    #[error("length mismatch: {what} has {got} entries, expected {expected}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{what} index {index} at observation {position} is outside [0, {count})")]
    IndexOutOfRange {
        what: &'static str,
        index: usize,
        position: usize,
        count: usize,
    },

    #[error("{what} index {index} has no observations; indices must be contiguous")]
    EmptyLevel { what: &'static str, index: usize },

    #[error("non-finite {what} at observation {position}")]
    NonFinite { what: &'static str, position: usize },

    #[error("model needs at least one observation, subject and instrument")]
    Empty,

    #[error("invalid prior: {0}")]
    InvalidPrior(String),
}

/// Observation-level inputs, validated once at construction.
#[derive(Clone, Debug)]
pub struct ModelData {
    z: Vec<f64>,
    time: Vec<f64>,
    subject: Vec<usize>,
    instrument: Vec<usize>,
    n_subjects: usize,
    n_instruments: usize,
    subject_labels: Vec<String>,
    instrument_labels: Vec<String>,
}

impl ModelData {
    /// Validates the four parallel arrays before anything is built on them:
    /// equal lengths, finite values, indices inside `[0, count)`, and every
    /// index level observed at least once.
    pub fn new(
        z: Vec<f64>,
        time: Vec<f64>,
        subject: Vec<usize>,
        instrument: Vec<usize>,
        n_subjects: usize,
        n_instruments: usize,
    ) -> Result<Self, ModelError> {
        let n = z.len();
        if n == 0 || n_subjects == 0 || n_instruments == 0 {
            return Err(ModelError::Empty);
        }
        for (what, got) in [
            ("time", time.len()),
            ("subject index", subject.len()),
            ("instrument index", instrument.len()),
        ] {
            if got != n {
                return Err(ModelError::LengthMismatch {
                    what,
                    expected: n,
                    got,
                });
            }
        }
        if let Some(position) = z.iter().position(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite {
                what: "response",
                position,
            });
        }
        if let Some(position) = time.iter().position(|v| !v.is_finite()) {
            return Err(ModelError::NonFinite {
                what: "time",
                position,
            });
        }
        check_levels("subject", &subject, n_subjects)?;
        check_levels("instrument", &instrument, n_instruments)?;

        Ok(Self {
            z,
            time,
            subject,
            instrument,
            n_subjects,
            n_instruments,
            subject_labels: (0..n_subjects).map(|i| i.to_string()).collect(),
            instrument_labels: (0..n_instruments).map(|i| i.to_string()).collect(),
        })
    }

    /// Builds model inputs from a standardized long table, keeping its
    /// subject and instrument index orders and labels.
    pub fn from_standardized(
        table: &StandardizedTable,
        coding: TimeCoding,
    ) -> Result<Self, ModelError> {
        let records = &table.long.records;
        let raw: Vec<f64> = records
            .iter()
            .map(|r| Timepoint::indicator(r.timepoint))
            .collect();
        let time = match coding {
            TimeCoding::Indicator => raw,
            TimeCoding::Centered => {
                let mean = raw.iter().sum::<f64>() / raw.len().max(1) as f64;
                raw.into_iter().map(|t| t - mean).collect()
            }
        };
        let mut data = Self::new(
            table.z.clone(),
            time,
            records.iter().map(|r| r.subject).collect(),
            records.iter().map(|r| r.instrument).collect(),
            table.long.n_subjects(),
            table.long.n_instruments(),
        )?;
        data.subject_labels = table.long.subjects.clone();
        data.instrument_labels = table.long.instruments.clone();
        Ok(data)
    }

    pub fn n_obs(&self) -> usize {
        self.z.len()
    }

    pub fn n_subjects(&self) -> usize {
        self.n_subjects
    }

    pub fn n_instruments(&self) -> usize {
        self.n_instruments
    }

    pub fn response(&self) -> &[f64] {
        &self.z
    }

    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn subject_labels(&self) -> &[String] {
        &self.subject_labels
    }

    pub fn instrument_labels(&self) -> &[String] {
        &self.instrument_labels
    }
}

fn check_levels(what: &'static str, idx: &[usize], count: usize) -> Result<(), ModelError> {
    let mut seen = vec![false; count];
    for (position, &index) in idx.iter().enumerate() {
        if index >= count {
            return Err(ModelError::IndexOutOfRange {
                what,
                index,
                position,
                count,
            });
        }
        seen[index] = true;
    }
    if let Some(index) = seen.iter().position(|s| !s) {
        return Err(ModelError::EmptyLevel { what, index });
    }
    Ok(())
}

/// Prior scales. Defaults follow the published analysis.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Priors {
    /// Normal(0, fixed_sd) on the global intercept and time slope.
    pub fixed_sd: f64,
    /// HalfNormal scale of both subject random-effect scales.
    pub subject_scale: f64,
    /// HalfNormal scale of both instrument random-effect scales.
    pub instrument_scale: f64,
    /// HalfNormal scale of the residual standard deviation.
    pub residual_scale: f64,
}

impl Default for Priors {
    fn default() -> Self {
        Self {
            fixed_sd: 1.0,
            subject_scale: 0.75,
            instrument_scale: 0.75,
            residual_scale: 1.0,
        }
    }
}

impl Priors {
    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, v) in [
            ("fixed_sd", self.fixed_sd),
            ("subject_scale", self.subject_scale),
            ("instrument_scale", self.instrument_scale),
            ("residual_scale", self.residual_scale),
        ] {
            if !(v.is_finite() && v > 0.0) {
                return Err(ModelError::InvalidPrior(format!(
                    "{name} must be finite and > 0, got {v}"
                )));
            }
        }
        Ok(())
    }
}

/// Lower Cholesky factor of the 2×2 covariance with marginal scales
/// `(scale0, scale1)` and correlation `corr`.
///
/// Closed form, entry by entry. Combined "scales + correlation → factor"
/// helpers have produced mis-shaped factors through chained contractions, so
/// the factor is never delegated.
#[inline]
pub fn cholesky_2x2(scale0: f64, scale1: f64, corr: f64) -> [[f64; 2]; 2] {
    [
        [scale0, 0.0],
        [corr * scale1, scale1 * (1.0 - corr * corr).max(0.0).sqrt()],
    ]
}

/// Instrument-specific total time slope: `beta_time + u1_m`.
pub fn derived_slopes(beta_time: f64, u1_m: ArrayView1<f64>) -> Array1<f64> {
    u1_m.mapv(|u| beta_time + u)
}

/// Offsets of each block in the unconstrained parameter vector.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamLayout {
    pub n_subjects: usize,
    pub n_instruments: usize,
}

impl ParamLayout {
    pub const ALPHA: usize = 0;
    pub const BETA_TIME: usize = 1;
    pub const LOG_SIGMA_ID: usize = 2;
    pub const ATANH_CORR_ID: usize = 4;
    pub const Z_ID: usize = 5;

    pub fn log_sd_u0(&self) -> usize {
        Self::Z_ID + 2 * self.n_subjects
    }

    pub fn log_sd_u1(&self) -> usize {
        self.log_sd_u0() + 1
    }

    pub fn z_u0(&self) -> usize {
        self.log_sd_u1() + 1
    }

    pub fn z_u1(&self) -> usize {
        self.z_u0() + self.n_instruments
    }

    pub fn log_sigma(&self) -> usize {
        self.z_u1() + self.n_instruments
    }

    pub fn dim(&self) -> usize {
        self.log_sigma() + 1
    }
}

/// Constrained values of every model quantity for one draw.
#[derive(Clone, Debug, PartialEq)]
pub struct DrawValues {
    pub alpha: f64,
    pub beta_time: f64,
    pub sigma_id: [f64; 2],
    pub corr_id: f64,
    /// Raw standard-normal subject draws, `[subject, coef]`.
    pub z_id: Array2<f64>,
    /// Correlated subject effects `z_id · Lᵀ`, `[subject, coef]`.
    pub re_id: Array2<f64>,
    pub sd_u0: f64,
    pub sd_u1: f64,
    pub z_u0: Array1<f64>,
    pub z_u1: Array1<f64>,
    pub u0_m: Array1<f64>,
    pub u1_m: Array1<f64>,
    pub sigma: f64,
    pub beta_m: Array1<f64>,
}

/// The model graph: data, priors and parameter layout.
///
/// Data sits behind an `Arc` so cloning the model per chain is cheap.
#[derive(Clone, Debug)]
pub struct HierarchicalModel {
    data: Arc<ModelData>,
    priors: Priors,
    layout: ParamLayout,
}

impl HierarchicalModel {
    pub fn new(data: ModelData, priors: Priors) -> Result<Self, ModelError> {
        priors.validate()?;
        let layout = ParamLayout {
            n_subjects: data.n_subjects,
            n_instruments: data.n_instruments,
        };
        log::info!(
            "built hierarchical model: {} observations, {} subjects, {} instruments, dim={}",
            data.n_obs(),
            data.n_subjects,
            data.n_instruments,
            layout.dim()
        );
        Ok(Self {
            data: Arc::new(data),
            priors,
            layout,
        })
    }

    pub fn dim(&self) -> usize {
        self.layout.dim()
    }

    pub fn layout(&self) -> ParamLayout {
        self.layout
    }

    pub fn data(&self) -> &ModelData {
        &self.data
    }

    pub fn priors(&self) -> &Priors {
        &self.priors
    }

    /// Maps an unconstrained vector to every named model quantity.
    pub fn constrain(&self, theta: ArrayView1<f64>) -> DrawValues {
        let l = &self.layout;
        let n_sub = l.n_subjects;
        let n_ins = l.n_instruments;

        let alpha = theta[ParamLayout::ALPHA];
        let beta_time = theta[ParamLayout::BETA_TIME];
        let sigma_id = [
            theta[ParamLayout::LOG_SIGMA_ID].exp(),
            theta[ParamLayout::LOG_SIGMA_ID + 1].exp(),
        ];
        let corr_id = theta[ParamLayout::ATANH_CORR_ID].tanh();
        let chol = cholesky_2x2(sigma_id[0], sigma_id[1], corr_id);

        let mut z_id = Array2::<f64>::zeros((n_sub, 2));
        let mut re_id = Array2::<f64>::zeros((n_sub, 2));
        for j in 0..n_sub {
            let z0 = theta[ParamLayout::Z_ID + 2 * j];
            let z1 = theta[ParamLayout::Z_ID + 2 * j + 1];
            z_id[[j, 0]] = z0;
            z_id[[j, 1]] = z1;
            re_id[[j, 0]] = chol[0][0] * z0;
            re_id[[j, 1]] = chol[1][0] * z0 + chol[1][1] * z1;
        }

        let sd_u0 = theta[l.log_sd_u0()].exp();
        let sd_u1 = theta[l.log_sd_u1()].exp();
        let z_u0 = theta.slice(ndarray::s![l.z_u0()..l.z_u0() + n_ins]).to_owned();
        let z_u1 = theta.slice(ndarray::s![l.z_u1()..l.z_u1() + n_ins]).to_owned();
        let u0_m = z_u0.mapv(|z| sd_u0 * z);
        let u1_m = z_u1.mapv(|z| sd_u1 * z);
        let sigma = theta[l.log_sigma()].exp();
        let beta_m = derived_slopes(beta_time, u1_m.view());

        DrawValues {
            alpha,
            beta_time,
            sigma_id,
            corr_id,
            z_id,
            re_id,
            sd_u0,
            sd_u1,
            z_u0,
            z_u1,
            u0_m,
            u1_m,
            sigma,
            beta_m,
        }
    }

    /// Joint log density (priors, likelihood, log-Jacobians) and its gradient
    /// in the unconstrained space.
    pub fn logp_and_grad(&self, theta: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let l = &self.layout;
        let p = &self.priors;
        let d = &*self.data;
        let n_sub = l.n_subjects;
        let n_ins = l.n_instruments;
        let mut grad = Array1::<f64>::zeros(l.dim());

        let alpha = theta[ParamLayout::ALPHA];
        let beta = theta[ParamLayout::BETA_TIME];
        let log_s0 = theta[ParamLayout::LOG_SIGMA_ID];
        let log_s1 = theta[ParamLayout::LOG_SIGMA_ID + 1];
        let (s0, s1) = (log_s0.exp(), log_s1.exp());
        let v = theta[ParamLayout::ATANH_CORR_ID];
        let rho = v.tanh();
        let chol = cholesky_2x2(s0, s1, rho);
        let log_sd0 = theta[l.log_sd_u0()];
        let log_sd1 = theta[l.log_sd_u1()];
        let (sd0, sd1) = (log_sd0.exp(), log_sd1.exp());
        let log_sigma = theta[l.log_sigma()];
        let sigma = log_sigma.exp();
        let inv_var = 1.0 / (sigma * sigma);

        // Priors and Jacobians.
        let mut lp = normal_lpdf(alpha, p.fixed_sd) + normal_lpdf(beta, p.fixed_sd);
        lp += half_normal_lpdf(s0, p.subject_scale) + log_s0;
        lp += half_normal_lpdf(s1, p.subject_scale) + log_s1;
        lp += log_one_minus_tanh_sq(v);
        lp += half_normal_lpdf(sd0, p.instrument_scale) + log_sd0;
        lp += half_normal_lpdf(sd1, p.instrument_scale) + log_sd1;
        lp += half_normal_lpdf(sigma, p.residual_scale) + log_sigma;

        let z_id = theta.slice(ndarray::s![ParamLayout::Z_ID..ParamLayout::Z_ID + 2 * n_sub]);
        let z_u0 = theta.slice(ndarray::s![l.z_u0()..l.z_u0() + n_ins]);
        let z_u1 = theta.slice(ndarray::s![l.z_u1()..l.z_u1() + n_ins]);
        lp -= 0.5 * (z_id.dot(&z_id) + z_u0.dot(&z_u0) + z_u1.dot(&z_u1));
        lp -= 0.5 * LN_2PI * (2 * n_sub + 2 * n_ins) as f64;

        let mut b0 = vec![0.0; n_sub];
        let mut b1 = vec![0.0; n_sub];
        for j in 0..n_sub {
            let (z0, z1) = (z_id[2 * j], z_id[2 * j + 1]);
            b0[j] = chol[0][0] * z0;
            b1[j] = chol[1][0] * z0 + chol[1][1] * z1;
        }
        let u0: Vec<f64> = z_u0.iter().map(|z| sd0 * z).collect();
        let u1: Vec<f64> = z_u1.iter().map(|z| sd1 * z).collect();

        // Likelihood, accumulating d/dmu per parameter group.
        let (mut g_alpha, mut g_beta, mut ss) = (0.0, 0.0, 0.0);
        let mut g_b0 = vec![0.0; n_sub];
        let mut g_b1 = vec![0.0; n_sub];
        let mut g_u0 = vec![0.0; n_ins];
        let mut g_u1 = vec![0.0; n_ins];
        for i in 0..d.n_obs() {
            let t = d.time[i];
            let s = d.subject[i];
            let m = d.instrument[i];
            let mu = alpha + beta * t + b0[s] + b1[s] * t + u0[m] + u1[m] * t;
            let r = d.z[i] - mu;
            ss += r * r;
            let e = r * inv_var;
            let et = e * t;
            g_alpha += e;
            g_beta += et;
            g_b0[s] += e;
            g_b1[s] += et;
            g_u0[m] += e;
            g_u1[m] += et;
        }
        let n_obs = d.n_obs() as f64;
        lp += -0.5 * LN_2PI * n_obs - n_obs * log_sigma - 0.5 * ss * inv_var;

        // Gradient, chained back through the noncentered transforms.
        grad[ParamLayout::ALPHA] = g_alpha - alpha / (p.fixed_sd * p.fixed_sd);
        grad[ParamLayout::BETA_TIME] = g_beta - beta / (p.fixed_sd * p.fixed_sd);

        let one_minus_rho_sq = 1.0 - rho * rho;
        let (mut g_s0, mut g_s1, mut g_v) = (0.0, 0.0, 0.0);
        for j in 0..n_sub {
            let (z0, z1) = (z_id[2 * j], z_id[2 * j + 1]);
            grad[ParamLayout::Z_ID + 2 * j] = -z0 + chol[0][0] * g_b0[j] + chol[1][0] * g_b1[j];
            grad[ParamLayout::Z_ID + 2 * j + 1] = -z1 + chol[1][1] * g_b1[j];
            g_s0 += g_b0[j] * b0[j];
            g_s1 += g_b1[j] * b1[j];
            // dL10/dv = s1 (1 - rho^2), dL11/dv = -rho L11.
            g_v += g_b1[j] * (z0 * s1 * one_minus_rho_sq - z1 * rho * chol[1][1]);
        }
        let c_sub = p.subject_scale * p.subject_scale;
        grad[ParamLayout::LOG_SIGMA_ID] = g_s0 + 1.0 - s0 * s0 / c_sub;
        grad[ParamLayout::LOG_SIGMA_ID + 1] = g_s1 + 1.0 - s1 * s1 / c_sub;
        grad[ParamLayout::ATANH_CORR_ID] = g_v - 2.0 * rho;

        let (mut g_sd0, mut g_sd1) = (0.0, 0.0);
        for m in 0..n_ins {
            grad[l.z_u0() + m] = -z_u0[m] + sd0 * g_u0[m];
            grad[l.z_u1() + m] = -z_u1[m] + sd1 * g_u1[m];
            g_sd0 += g_u0[m] * u0[m];
            g_sd1 += g_u1[m] * u1[m];
        }
        let c_ins = p.instrument_scale * p.instrument_scale;
        grad[l.log_sd_u0()] = g_sd0 + 1.0 - sd0 * sd0 / c_ins;
        grad[l.log_sd_u1()] = g_sd1 + 1.0 - sd1 * sd1 / c_ins;

        let c_res = p.residual_scale * p.residual_scale;
        grad[l.log_sigma()] = -n_obs + ss * inv_var + 1.0 - sigma * sigma / c_res;

        (lp, grad)
    }
}

#[inline]
fn normal_lpdf(x: f64, sd: f64) -> f64 {
    -0.5 * LN_2PI - sd.ln() - 0.5 * (x / sd) * (x / sd)
}

#[inline]
fn half_normal_lpdf(x: f64, scale: f64) -> f64 {
    HALF_LN_2_OVER_PI - scale.ln() - 0.5 * (x / scale) * (x / scale)
}

/// `ln(1 - tanh(v)^2) = -2 ln cosh(v)`, stable for large `|v|`.
#[inline]
fn log_one_minus_tanh_sq(v: f64) -> f64 {
    let a = v.abs();
    -2.0 * (a + (-2.0 * a).exp().ln_1p() - std::f64::consts::LN_2)
}
