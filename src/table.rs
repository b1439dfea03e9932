//! Wide-format source table.
//!
//! Cells are kept as text; numeric parsing happens per column on demand so a
//! malformed cell in a column nobody references never fails the load.

use crate::types::DataError;
use csv::ReaderBuilder;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;

/// Cell spellings treated as a missing score.
const MISSING_TOKENS: [&str; 9] = ["", "NA", "N/A", "NaN", "nan", "null", "NULL", "None", "#N/A"];

#[derive(Clone, Debug)]
pub struct WideTable {
    headers: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<String>>,
}

impl WideTable {
    pub fn from_csv_path(path: &Path) -> Result<Self, DataError> {
        let file = std::fs::File::open(path)
            .map_err(|e| DataError::Csv(format!("failed to open '{}': {e}", path.display())))?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DataError> {
        let mut rdr = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| DataError::Csv(format!("failed to read csv headers: {e}")))?
            .iter()
            .map(|s| s.trim().to_string())
            .collect::<Vec<_>>();
        if headers.is_empty() {
            return Err(DataError::Csv("csv has no headers".to_string()));
        }

        let mut rows = Vec::new();
        for (i, rec) in rdr.records().enumerate() {
            let record =
                rec.map_err(|e| DataError::Csv(format!("failed reading csv row {}: {e}", i + 1)))?;
            if record.len() != headers.len() {
                return Err(DataError::Csv(format!(
                    "csv row {} width mismatch: got {} fields, expected {}",
                    i + 1,
                    record.len(),
                    headers.len()
                )));
            }
            rows.push(record.iter().map(|s| s.trim().to_string()).collect());
        }
        if rows.is_empty() {
            return Err(DataError::EmptyTable);
        }
        Ok(Self::assemble(headers, rows))
    }

    /// Builds a table from in-memory score columns; shorter columns are padded
    /// with missing cells.
    pub fn from_columns(columns: &[(&str, Vec<Option<f64>>)]) -> Result<Self, DataError> {
        let n_rows = columns.iter().map(|(_, v)| v.len()).max().unwrap_or(0);
        if n_rows == 0 {
            return Err(DataError::EmptyTable);
        }
        let headers = columns.iter().map(|(h, _)| h.to_string()).collect();
        let rows = (0..n_rows)
            .map(|i| {
                columns
                    .iter()
                    .map(|(_, v)| match v.get(i).copied().flatten() {
                        Some(x) => format!("{x}"),
                        None => String::new(),
                    })
                    .collect()
            })
            .collect();
        Ok(Self::assemble(headers, rows))
    }

    fn assemble(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let mut index = HashMap::with_capacity(headers.len());
        for (i, h) in headers.iter().enumerate() {
            // First occurrence wins for duplicated headers.
            index.entry(h.clone()).or_insert(i);
        }
        Self {
            headers,
            index,
            rows,
        }
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn text_column(&self, name: &str) -> Option<Vec<&str>> {
        let j = *self.index.get(name)?;
        Some(self.rows.iter().map(|r| r[j].as_str()).collect())
    }

    /// Parses a column as scores; missing spellings become `None`.
    pub fn numeric_column(&self, name: &str) -> Result<Vec<Option<f64>>, DataError> {
        let j = *self
            .index
            .get(name)
            .ok_or_else(|| DataError::UnknownColumn(name.to_string()))?;
        let mut out = Vec::with_capacity(self.rows.len());
        for (i, row) in self.rows.iter().enumerate() {
            let raw = row[j].as_str();
            if MISSING_TOKENS.contains(&raw) {
                out.push(None);
                continue;
            }
            let v = raw.parse::<f64>().map_err(|_| DataError::InvalidScore {
                column: name.to_string(),
                row: i + 1,
                value: raw.to_string(),
            })?;
            out.push(if v.is_finite() { Some(v) } else { None });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::WideTable;
    use crate::types::DataError;

    #[test]
    fn missing_tokens_become_none() {
        let csv = "a,b\n1.5,NA\n,2\nnan,3\n";
        let t = WideTable::from_reader(csv.as_bytes()).expect("table");
        assert_eq!(t.n_rows(), 3);
        assert_eq!(t.numeric_column("a").unwrap(), vec![Some(1.5), None, None]);
        assert_eq!(t.numeric_column("b").unwrap(), vec![None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn garbage_cell_is_reported_with_position() {
        let csv = "a\n1\nabc\n";
        let t = WideTable::from_reader(csv.as_bytes()).expect("table");
        match t.numeric_column("a") {
            Err(DataError::InvalidScore { column, row, value }) => {
                assert_eq!(column, "a");
                assert_eq!(row, 2);
                assert_eq!(value, "abc");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let csv = "a,b\n1,2\n3\n";
        assert!(WideTable::from_reader(csv.as_bytes()).is_err());
    }

    #[test]
    fn header_only_csv_is_empty() {
        let csv = "a,b\n";
        assert!(matches!(
            WideTable::from_reader(csv.as_bytes()),
            Err(DataError::EmptyTable)
        ));
    }

    #[test]
    fn from_columns_round_trips_missing_cells() {
        let t = WideTable::from_columns(&[("x", vec![Some(1.0), None]), ("y", vec![Some(2.0)])])
            .expect("table");
        assert_eq!(t.n_rows(), 2);
        assert_eq!(t.numeric_column("x").unwrap(), vec![Some(1.0), None]);
        assert_eq!(t.numeric_column("y").unwrap(), vec![Some(2.0), None]);
    }
}
