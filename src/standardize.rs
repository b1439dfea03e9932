//! Within-instrument z-scoring.

use crate::reshape::LongTable;
use crate::types::DataError;
use serde::{Deserialize, Serialize};

/// Per-instrument location and scale used for z-scoring.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Standardization {
    pub instrument: String,
    pub n: usize,
    pub mean: f64,
    /// Sample standard deviation (n - 1 denominator).
    pub sd: f64,
}

impl Standardization {
    /// Maps a z-score back onto the instrument's raw scale.
    pub fn unstandardize(&self, z: f64) -> f64 {
        self.mean + z * self.sd
    }

    /// Maps a difference of z-scores (e.g. a time slope) back onto raw units.
    pub fn unstandardize_difference(&self, dz: f64) -> f64 {
        dz * self.sd
    }
}

/// Long table plus one z-score per record.
#[derive(Clone, Debug)]
pub struct StandardizedTable {
    pub long: LongTable,
    /// `z[i]` belongs to `long.records[i]`.
    pub z: Vec<f64>,
    /// Indexed by instrument, declaration order.
    pub scales: Vec<Standardization>,
}

impl StandardizedTable {
    pub fn len(&self) -> usize {
        self.z.len()
    }

    pub fn is_empty(&self) -> bool {
        self.z.is_empty()
    }
}

/// Computes mean and sample sd per instrument over all of its surviving
/// pre and post scores, then z-scores every record against its own
/// instrument.
///
/// An instrument with fewer than two scores, or with zero spread, is a
/// [`DataError::DegenerateInstrument`].
pub fn standardize_within_instrument(long: LongTable) -> Result<StandardizedTable, DataError> {
    let m = long.n_instruments();
    let mut count = vec![0usize; m];
    let mut sum = vec![0.0f64; m];
    for rec in &long.records {
        count[rec.instrument] += 1;
        sum[rec.instrument] += rec.score;
    }
    let mean: Vec<f64> = (0..m)
        .map(|j| if count[j] > 0 { sum[j] / count[j] as f64 } else { f64::NAN })
        .collect();
    let mut ss = vec![0.0f64; m];
    for rec in &long.records {
        let d = rec.score - mean[rec.instrument];
        ss[rec.instrument] += d * d;
    }

    let mut scales = Vec::with_capacity(m);
    for j in 0..m {
        let n = count[j];
        let sd = if n > 1 {
            (ss[j] / (n - 1) as f64).sqrt()
        } else {
            f64::NAN
        };
        if n <= 1 || !sd.is_finite() || sd <= 0.0 {
            return Err(DataError::DegenerateInstrument {
                instrument: long.instruments[j].clone(),
                n,
                sd,
            });
        }
        log::debug!(
            "instrument '{}': n={} mean={:.4} sd={:.4}",
            long.instruments[j],
            n,
            mean[j],
            sd
        );
        scales.push(Standardization {
            instrument: long.instruments[j].clone(),
            n,
            mean: mean[j],
            sd,
        });
    }

    let z = long
        .records
        .iter()
        .map(|r| {
            let s = &scales[r.instrument];
            (r.score - s.mean) / s.sd
        })
        .collect();

    Ok(StandardizedTable { long, z, scales })
}

#[cfg(test)]
mod tests {
    use super::standardize_within_instrument;
    use crate::columns::{Instrument, InstrumentRegistry};
    use crate::reshape::reshape_long;
    use crate::table::WideTable;
    use crate::types::DataError;
    use approx::assert_abs_diff_eq;

    fn registry() -> InstrumentRegistry {
        InstrumentRegistry::new(vec![
            Instrument::new("A", "A1", "A2"),
            Instrument::new("B", "B1", "B2"),
        ])
        .unwrap()
    }

    #[test]
    fn z_scores_have_zero_mean_unit_sd_per_instrument() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(10.0), Some(12.0), None, Some(15.0)]),
            ("A2", vec![Some(11.0), Some(14.0), Some(9.0), Some(20.0)]),
            ("B1", vec![Some(100.0), Some(300.0), Some(250.0), Some(120.0)]),
            ("B2", vec![None, Some(310.0), Some(200.0), Some(90.0)]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        let st = standardize_within_instrument(long).unwrap();
        for j in 0..2 {
            let zs: Vec<f64> = st
                .long
                .records
                .iter()
                .zip(st.z.iter())
                .filter(|(r, _)| r.instrument == j)
                .map(|(_, z)| *z)
                .collect();
            let n = zs.len() as f64;
            let mean = zs.iter().sum::<f64>() / n;
            let sd = (zs.iter().map(|z| (z - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt();
            assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(sd, 1.0, epsilon = 1e-12);
        }
        assert_eq!(st.scales[0].n, 7);
        assert_eq!(st.scales[1].n, 7);
    }

    #[test]
    fn scale_of_one_instrument_does_not_leak_into_another() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), Some(2.0)]),
            ("A2", vec![Some(3.0), Some(4.0)]),
            ("B1", vec![Some(1000.0), Some(2000.0)]),
            ("B2", vec![Some(3000.0), Some(4000.0)]),
        ])
        .unwrap();
        let st = standardize_within_instrument(reshape_long(&t, &registry(), None).unwrap())
            .unwrap();
        // B is A scaled by 1000, so z-scores coincide record by record.
        for i in 0..4 {
            assert_abs_diff_eq!(st.z[i], st.z[i + 4], epsilon = 1e-12);
        }
        assert_abs_diff_eq!(st.scales[0].mean, 2.5, epsilon = 1e-12);
        assert_abs_diff_eq!(st.scales[1].mean, 2500.0, epsilon = 1e-9);
        assert_abs_diff_eq!(st.scales[1].unstandardize(st.z[5]), 2000.0, epsilon = 1e-9);
    }

    #[test]
    fn single_score_instrument_is_rejected() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), Some(2.0)]),
            ("A2", vec![Some(3.0), Some(4.0)]),
            ("B1", vec![Some(5.0), None]),
            ("B2", vec![None, None]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        match standardize_within_instrument(long) {
            Err(DataError::DegenerateInstrument { instrument, n, .. }) => {
                assert_eq!(instrument, "B");
                assert_eq!(n, 1);
            }
            other => panic!("expected degenerate instrument, got {other:?}"),
        }
    }

    #[test]
    fn constant_instrument_is_rejected() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), Some(2.0)]),
            ("A2", vec![Some(3.0), Some(4.0)]),
            ("B1", vec![Some(5.0), Some(5.0)]),
            ("B2", vec![Some(5.0), Some(5.0)]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        assert!(matches!(
            standardize_within_instrument(long),
            Err(DataError::DegenerateInstrument { .. })
        ));
    }
}
