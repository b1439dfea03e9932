//! Wide-to-long transform.
//!
//! Every instrument block is cut from the same wide table, so a subject key
//! (row position, or the value of an explicit id column) names the same
//! respondent in every block. Subject indices are assigned once over the whole
//! long table, never per block.

use crate::columns::InstrumentRegistry;
use crate::table::WideTable;
use crate::types::{DataError, Timepoint};
use std::collections::HashMap;

/// One surviving (non-missing) score.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LongRecord {
    /// Contiguous subject index into `LongTable::subjects`.
    pub subject: usize,
    /// Instrument index in registry declaration order.
    pub instrument: usize,
    pub timepoint: Timepoint,
    pub score: f64,
}

/// Tidy table of `(subject, instrument, timepoint, score)` records.
#[derive(Clone, Debug)]
pub struct LongTable {
    /// Instrument names, index order = registry declaration order.
    pub instruments: Vec<String>,
    /// Subject labels, index order = first appearance in the wide table.
    pub subjects: Vec<String>,
    pub records: Vec<LongRecord>,
}

impl LongTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn n_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn n_instruments(&self) -> usize {
        self.instruments.len()
    }

    pub fn records_for(&self, instrument: usize) -> impl Iterator<Item = &LongRecord> {
        self.records
            .iter()
            .filter(move |r| r.instrument == instrument)
    }
}

/// Resolves one key per wide-table row.
fn subject_keys(table: &WideTable, id_column: Option<&str>) -> Result<Vec<String>, DataError> {
    let Some(col) = id_column else {
        return Ok((0..table.n_rows()).map(|i| i.to_string()).collect());
    };
    let values = table
        .text_column(col)
        .ok_or_else(|| DataError::MissingIdColumn(col.to_string()))?;
    let mut first_row: HashMap<&str, usize> = HashMap::with_capacity(values.len());
    for (row, key) in values.iter().copied().enumerate() {
        if key.is_empty() {
            return Err(DataError::Csv(format!(
                "empty subject id in column '{col}' at data row {}",
                row + 1
            )));
        }
        if let Some(prev) = first_row.insert(key, row) {
            return Err(DataError::DuplicateSubject {
                key: key.to_string(),
                first: prev + 1,
                second: row + 1,
            });
        }
    }
    Ok(values.into_iter().map(str::to_string).collect())
}

/// Unpivots every registered instrument into long format and drops missing
/// scores.
///
/// Blocks are concatenated in registry order; inside a block all pre rows come
/// before all post rows, each in wide-table row order.
pub fn reshape_long(
    table: &WideTable,
    registry: &InstrumentRegistry,
    id_column: Option<&str>,
) -> Result<LongTable, DataError> {
    let keys = subject_keys(table, id_column)?;

    // (row, instrument, timepoint, score) before subject re-encoding.
    let mut staged: Vec<(usize, usize, Timepoint, f64)> =
        Vec::with_capacity(2 * registry.len() * table.n_rows());
    let mut dropped = 0usize;
    for (m, inst) in registry.iter().enumerate() {
        let before = staged.len();
        for time in [Timepoint::Pre, Timepoint::Post] {
            let scores = table.numeric_column(inst.column(time))?;
            for (row, score) in scores.into_iter().enumerate() {
                match score {
                    Some(v) => staged.push((row, m, time, v)),
                    None => dropped += 1,
                }
            }
        }
        log::debug!(
            "instrument '{}' contributes {} records",
            inst.name,
            staged.len() - before
        );
    }
    if staged.is_empty() {
        return Err(DataError::NoObservations);
    }

    let mut present = vec![false; table.n_rows()];
    for &(row, ..) in &staged {
        present[row] = true;
    }
    let mut row_to_subject = vec![usize::MAX; table.n_rows()];
    let mut subjects = Vec::new();
    for (row, seen) in present.iter().enumerate() {
        if *seen {
            row_to_subject[row] = subjects.len();
            subjects.push(keys[row].clone());
        }
    }

    let records = staged
        .into_iter()
        .map(|(row, instrument, timepoint, score)| LongRecord {
            subject: row_to_subject[row],
            instrument,
            timepoint,
            score,
        })
        .collect::<Vec<_>>();

    log::info!(
        "reshaped {} rows x {} instruments into {} records ({} missing dropped, {} subjects)",
        table.n_rows(),
        registry.len(),
        records.len(),
        dropped,
        subjects.len()
    );

    Ok(LongTable {
        instruments: registry.names(),
        subjects,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::reshape_long;
    use crate::columns::{Instrument, InstrumentRegistry};
    use crate::table::WideTable;
    use crate::types::{DataError, Timepoint};

    fn registry() -> InstrumentRegistry {
        InstrumentRegistry::new(vec![
            Instrument::new("A", "A1", "A2"),
            Instrument::new("B", "B1", "B2"),
        ])
        .unwrap()
    }

    #[test]
    fn complete_instrument_yields_two_records_per_subject() {
        let k = 4;
        let full = |base: f64| (0..k).map(|i| Some(base + i as f64)).collect::<Vec<_>>();
        let t = WideTable::from_columns(&[
            ("A1", full(0.0)),
            ("A2", full(10.0)),
            ("B1", full(20.0)),
            ("B2", full(30.0)),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        assert_eq!(long.records_for(0).count(), 2 * k);
        assert_eq!(long.records_for(1).count(), 2 * k);
        assert_eq!(long.len(), 4 * k);
        assert_eq!(long.instruments, vec!["A", "B"]);
    }

    #[test]
    fn missing_scores_are_dropped_not_imputed() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), None, Some(3.0)]),
            ("A2", vec![None, Some(2.0), Some(4.0)]),
            ("B1", vec![Some(1.0), Some(2.0), Some(3.0)]),
            ("B2", vec![Some(1.0), Some(2.0), Some(3.0)]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        // K = 3 subjects, M = 2 missing cells in instrument A.
        assert_eq!(long.records_for(0).count(), 2 * 3 - 2);
        assert_eq!(long.records_for(1).count(), 2 * 3);
        assert!(long.records.iter().all(|r| r.score.is_finite()));
    }

    #[test]
    fn block_order_is_instrument_then_pre_then_post() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), Some(2.0)]),
            ("A2", vec![Some(3.0), Some(4.0)]),
            ("B1", vec![Some(5.0), Some(6.0)]),
            ("B2", vec![Some(7.0), Some(8.0)]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        let scores: Vec<f64> = long.records.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        let times: Vec<Timepoint> = long.records.iter().map(|r| r.timepoint).collect();
        assert_eq!(times[0], Timepoint::Pre);
        assert_eq!(times[2], Timepoint::Post);
    }

    #[test]
    fn subject_index_is_shared_across_instruments() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), Some(2.0), Some(3.0)]),
            ("A2", vec![Some(1.5), Some(2.5), Some(3.5)]),
            ("B1", vec![Some(9.0), Some(8.0), Some(7.0)]),
            ("B2", vec![Some(9.5), Some(8.5), Some(7.5)]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        for inst in 0..2 {
            let subjects: Vec<usize> = long
                .records_for(inst)
                .filter(|r| r.timepoint == Timepoint::Pre)
                .map(|r| r.subject)
                .collect();
            assert_eq!(subjects, vec![0, 1, 2]);
        }
        // Row 1 carries 2.0 in A1 and 8.0 in B1: same subject.
        let a = long.records.iter().find(|r| r.score == 2.0).unwrap();
        let b = long.records.iter().find(|r| r.score == 8.0).unwrap();
        assert_eq!(a.subject, b.subject);
    }

    #[test]
    fn subjects_without_any_score_are_reencoded_out() {
        let t = WideTable::from_columns(&[
            ("A1", vec![Some(1.0), None, Some(3.0)]),
            ("A2", vec![Some(1.0), None, Some(3.0)]),
            ("B1", vec![Some(1.0), None, Some(3.0)]),
            ("B2", vec![Some(1.0), None, Some(3.0)]),
        ])
        .unwrap();
        let long = reshape_long(&t, &registry(), None).unwrap();
        assert_eq!(long.subjects, vec!["0", "2"]);
        assert!(long.records.iter().all(|r| r.subject < 2));
    }

    #[test]
    fn explicit_id_column_labels_subjects_and_rejects_duplicates() {
        let csv = "pid,A1,A2,B1,B2\ns7,1,2,3,4\ns3,5,6,7,8\n";
        let t = WideTable::from_reader(csv.as_bytes()).unwrap();
        let long = reshape_long(&t, &registry(), Some("pid")).unwrap();
        assert_eq!(long.subjects, vec!["s7", "s3"]);

        let dup = "pid,A1,A2,B1,B2\ns7,1,2,3,4\ns7,5,6,7,8\n";
        let t = WideTable::from_reader(dup.as_bytes()).unwrap();
        assert!(matches!(
            reshape_long(&t, &registry(), Some("pid")),
            Err(DataError::DuplicateSubject { .. })
        ));
        assert!(matches!(
            reshape_long(&t, &registry(), Some("nope")),
            Err(DataError::MissingIdColumn(_))
        ));
    }
}
