//! Instrument registry: which wide-table columns hold each instrument's
//! pre and post score.
//!
//! The registry is hand-curated per dataset release and never inferred from
//! headers. Validation is eager and exhaustive so one run reports every column
//! a schema change removed.

use crate::table::WideTable;
use crate::types::{DataError, Timepoint};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named psychometric scale and its pre/post column pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub name: String,
    pub pre: String,
    pub post: String,
}

impl Instrument {
    pub fn new(name: impl Into<String>, pre: impl Into<String>, post: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pre: pre.into(),
            post: post.into(),
        }
    }

    pub fn column(&self, time: Timepoint) -> &str {
        match time {
            Timepoint::Pre => &self.pre,
            Timepoint::Post => &self.post,
        }
    }
}

/// Ordered instrument registry. Declaration order is the canonical
/// instrument index order used by every downstream array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InstrumentRegistry {
    instruments: Vec<Instrument>,
}

impl InstrumentRegistry {
    pub fn new(instruments: Vec<Instrument>) -> Result<Self, DataError> {
        if instruments.is_empty() {
            return Err(DataError::InvalidRegistry(
                "at least one instrument is required".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(instruments.len());
        for inst in &instruments {
            if inst.name.trim().is_empty() {
                return Err(DataError::InvalidRegistry(
                    "instrument names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(inst.name.as_str()) {
                return Err(DataError::InvalidRegistry(format!(
                    "instrument '{}' is declared more than once",
                    inst.name
                )));
            }
        }
        Ok(Self { instruments })
    }

    /// Pre/post mapping for the published `scales_results.csv` release.
    ///
    /// Pre columns carry a `1` after the scale prefix, post columns a `2`.
    /// STAI trait anxiety is absent on purpose: only the pre column exists.
    pub fn scales_results() -> Self {
        let mut instruments = Vec::with_capacity(12);
        for sub in ["E", "A", "C", "N", "O"] {
            instruments.push(Instrument::new(
                format!("BFI-{sub}"),
                format!("BFI1-{sub}"),
                format!("BFI2-{sub}"),
            ));
        }
        instruments.push(Instrument::new("STAI-E", "STAI1-E", "STAI2-E"));
        for sub in [
            "Dualismo",
            "Idealismo",
            "Materialismo",
            "OtrosReinos",
            "DeterminismoFatalista",
            "LibreAlbedrio",
        ] {
            instruments.push(Instrument::new(
                format!("MBS-{sub}"),
                format!("MBS1-{sub}"),
                format!("MBS2-{sub}"),
            ));
        }
        Self { instruments }
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Instrument> {
        self.instruments.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.instruments.iter().map(|i| i.name.clone()).collect()
    }
}

/// Checks that every pre and post column named by the registry exists.
///
/// On failure the error lists every missing `(instrument, column)` pair in
/// registry order, pre before post.
pub fn validate_columns<'a>(
    table: &WideTable,
    registry: &'a InstrumentRegistry,
) -> Result<&'a InstrumentRegistry, DataError> {
    let mut missing = Vec::new();
    for inst in registry.iter() {
        for time in [Timepoint::Pre, Timepoint::Post] {
            let col = inst.column(time);
            if !table.has_column(col) {
                missing.push((inst.name.clone(), col.to_string()));
            }
        }
    }
    if !missing.is_empty() {
        return Err(DataError::MissingColumns(missing));
    }
    log::info!(
        "validated {} instruments ({} columns) against {} headers",
        registry.len(),
        2 * registry.len(),
        table.headers().len()
    );
    Ok(registry)
}
