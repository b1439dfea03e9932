//! Convergence diagnostics for one scalar series of shape `(chain, draw)`.
//!
//! Split-chain formulation without rank normalization: every chain is cut in
//! half so a single chain still yields two sequences to compare.

use ndarray::ArrayView2;

/// Splits each chain into its two halves; an odd trailing draw is dropped.
fn split_halves(series: ArrayView2<f64>) -> Vec<Vec<f64>> {
    let (n_chains, n_draws) = series.dim();
    let half = n_draws / 2;
    let mut out = Vec::with_capacity(2 * n_chains);
    for c in 0..n_chains {
        let row = series.row(c);
        out.push(row.iter().take(half).copied().collect());
        out.push(row.iter().skip(half).take(half).copied().collect());
    }
    out
}

fn mean_and_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0).max(1.0);
    (mean, var)
}

/// Split-chain Gelman-Rubin potential scale reduction.
///
/// Returns `NaN` with fewer than four draws per chain, and `1.0` when the
/// within-sequence variance vanishes.
pub fn split_rhat(series: ArrayView2<f64>) -> f64 {
    let (n_chains, n_draws) = series.dim();
    if n_chains == 0 || n_draws < 4 {
        return f64::NAN;
    }
    let seqs = split_halves(series);
    let m = seqs.len() as f64;
    let n = seqs[0].len() as f64;
    let stats: Vec<(f64, f64)> = seqs.iter().map(|s| mean_and_var(s)).collect();

    let w = stats.iter().map(|(_, v)| v).sum::<f64>() / m;
    if w <= 1e-10 {
        return 1.0;
    }
    let grand = stats.iter().map(|(mu, _)| mu).sum::<f64>() / m;
    let b = stats.iter().map(|(mu, _)| (mu - grand).powi(2)).sum::<f64>() * n / (m - 1.0);
    let var_hat = (n - 1.0) / n * w + b / n;
    (var_hat / w).sqrt()
}

/// Effective sample size from the split-sequence autocorrelation, truncated
/// with Geyer's initial positive sequence.
///
/// Bounded to `[1, total draws]`.
pub fn effective_sample_size(series: ArrayView2<f64>) -> f64 {
    let (n_chains, n_draws) = series.dim();
    let total_raw = (n_chains * n_draws).max(1) as f64;
    if n_chains == 0 || n_draws < 8 {
        return total_raw;
    }
    let seqs = split_halves(series);
    let m = seqs.len();
    let n = seqs[0].len();

    let mut means = Vec::with_capacity(m);
    let mut gamma0 = Vec::with_capacity(m);
    for s in &seqs {
        let mu = s.iter().sum::<f64>() / n as f64;
        let g0 = s.iter().map(|x| (x - mu) * (x - mu)).sum::<f64>() / n as f64;
        means.push(mu);
        gamma0.push(g0.max(1e-16));
    }

    let autocorr = |lag: usize| -> f64 {
        let mut acc = 0.0;
        for (k, s) in seqs.iter().enumerate() {
            let mu = means[k];
            let cov = s
                .iter()
                .zip(s.iter().skip(lag))
                .map(|(a, b)| (a - mu) * (b - mu))
                .sum::<f64>()
                / (n - lag) as f64;
            acc += cov / gamma0[k];
        }
        acc / m as f64
    };

    let max_lag = (n - 1).min(1000);
    let mut tau = 1.0;
    let mut lag = 1;
    while lag < max_lag {
        let pair = autocorr(lag) + autocorr(lag + 1);
        if !pair.is_finite() || pair <= 0.0 {
            break;
        }
        tau += 2.0 * pair;
        lag += 2;
    }
    let total = (m * n) as f64;
    if !tau.is_finite() || tau <= 0.0 {
        return 1.0;
    }
    (total / tau).clamp(1.0, total)
}

#[cfg(test)]
mod tests {
    use super::{effective_sample_size, split_rhat};
    use ndarray::Array2;
    use rand::{SeedableRng, rngs::StdRng};
    use rand_distr::{Distribution, Normal};

    fn iid(chains: usize, draws: usize, seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        Array2::from_shape_fn((chains, draws), |_| normal.sample(&mut rng))
    }

    #[test]
    fn iid_chains_have_rhat_near_one_and_high_ess() {
        let x = iid(4, 500, 11);
        let r = split_rhat(x.view());
        assert!((r - 1.0).abs() < 0.02, "rhat={r}");
        let ess = effective_sample_size(x.view());
        assert!(ess > 1000.0, "ess={ess}");
        assert!(ess <= 2000.0);
    }

    #[test]
    fn shifted_chains_inflate_rhat() {
        let mut x = iid(2, 200, 3);
        x.row_mut(1).mapv_inplace(|v| v + 5.0);
        assert!(split_rhat(x.view()) > 1.5);
    }

    #[test]
    fn random_walk_has_low_ess() {
        let steps = iid(1, 400, 5);
        let mut walk = Array2::<f64>::zeros((1, 400));
        let mut acc = 0.0;
        for t in 0..400 {
            acc += steps[[0, t]];
            walk[[0, t]] = acc;
        }
        assert!(effective_sample_size(walk.view()) < 40.0);
    }

    #[test]
    fn short_or_constant_series_are_handled() {
        let short = Array2::<f64>::zeros((1, 3));
        assert!(split_rhat(short.view()).is_nan());
        let flat = Array2::<f64>::from_elem((2, 20), 1.5);
        assert_eq!(split_rhat(flat.view()), 1.0);
    }
}
