use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Measurement occasion of a single score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timepoint {
    Pre,
    Post,
}

impl Timepoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }

    /// 0 for pre, 1 for post.
    pub fn indicator(self) -> f64 {
        match self {
            Self::Pre => 0.0,
            Self::Post => 1.0,
        }
    }
}

impl fmt::Display for Timepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the time covariate enters the linear predictor.
///
/// `Centered` subtracts the mean of the 0/1 indicator over all observations,
/// so the global intercept is the grand mean of the standardized scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeCoding {
    Indicator,
    #[default]
    Centered,
}

impl TimeCoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Indicator => "indicator",
            Self::Centered => "centered",
        }
    }
}

/// Configuration, schema and data-integrity failures of the data layer.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("failed to read csv: {0}")]
    Csv(String),

    #[error("csv has no rows")]
    EmptyTable,

    #[error("{}", format_missing_columns(.0))]
    MissingColumns(Vec<(String, String)>),

    #[error("column '{0}' not found in dataset")]
    UnknownColumn(String),

    #[error("invalid instrument registry: {0}")]
    InvalidRegistry(String),

    #[error("non-numeric score '{value}' in column '{column}' at data row {row}")]
    InvalidScore {
        column: String,
        row: usize,
        value: String,
    },

    #[error("subject id column '{0}' not found in dataset")]
    MissingIdColumn(String),

    #[error("subject id '{key}' appears more than once (data rows {first} and {second})")]
    DuplicateSubject {
        key: String,
        first: usize,
        second: usize,
    },

    #[error(
        "instrument '{instrument}' cannot be standardized: {n} non-missing score(s), sd = {sd}"
    )]
    DegenerateInstrument { instrument: String, n: usize, sd: f64 },

    #[error("no observations survived reshaping")]
    NoObservations,
}

fn format_missing_columns(missing: &[(String, String)]) -> String {
    let mut msg = String::from("Missing expected columns in dataset:");
    for (instrument, column) in missing {
        msg.push_str(&format!("\n  {instrument}: {column}"));
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::{DataError, TimeCoding, Timepoint};

    #[test]
    fn missing_columns_message_lists_every_pair() {
        let err = DataError::MissingColumns(vec![
            ("BFI-E".to_string(), "BFI1-E".to_string()),
            ("STAI-E".to_string(), "STAI2-E".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "Missing expected columns in dataset:\n  BFI-E: BFI1-E\n  STAI-E: STAI2-E"
        );
    }

    #[test]
    fn timepoint_indicator_and_default_coding() {
        assert_eq!(Timepoint::Pre.indicator(), 0.0);
        assert_eq!(Timepoint::Post.indicator(), 1.0);
        assert_eq!(TimeCoding::default(), TimeCoding::Centered);
    }
}
