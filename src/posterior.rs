//! Named posterior draws with coordinates, persisted as `idata.json`.

use ndarray::{Array2, ArrayD, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use thiserror::Error;

pub const CHAIN_DIM: &str = "chain";
pub const DRAW_DIM: &str = "draw";

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("io error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to (de)serialize draws: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to write csv '{path}': {message}")]
    Csv { path: String, message: String },

    #[error("failed to render plot '{path}': {message}")]
    Plot { path: String, message: String },

    #[error("malformed posterior: {0}")]
    Malformed(String),
}

impl ReportError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

/// One named quantity. `values` has shape `(chain, draw, dims[2..]...)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub dims: Vec<String>,
    pub values: ArrayD<f64>,
}

impl Variable {
    pub fn scalar(name: &str, values: Array2<f64>) -> Self {
        Self {
            name: name.to_string(),
            dims: vec![CHAIN_DIM.to_string(), DRAW_DIM.to_string()],
            values: values.into_dyn(),
        }
    }

    pub fn new(name: &str, extra_dims: &[&str], values: ArrayD<f64>) -> Self {
        let mut dims = vec![CHAIN_DIM.to_string(), DRAW_DIM.to_string()];
        dims.extend(extra_dims.iter().map(|d| d.to_string()));
        Self {
            name: name.to_string(),
            dims,
            values,
        }
    }

    /// Dimensions after `(chain, draw)`.
    pub fn element_dims(&self) -> &[String] {
        self.dims.get(2..).unwrap_or(&[])
    }

    /// Number of scalar elements per draw.
    pub fn n_elements(&self) -> usize {
        self.values.shape().iter().skip(2).product()
    }

    /// `(chain, draw)` series of the `k`-th scalar element in row-major order.
    pub fn element(&self, k: usize) -> Array2<f64> {
        let shape = self.values.shape();
        let (n_chains, n_draws) = (shape[0], shape[1]);
        let flat = self
            .values
            .view()
            .into_shape_with_order((n_chains, n_draws, self.n_elements()));
        match flat {
            Ok(v) => v.index_axis(Axis(2), k).to_owned(),
            Err(_) => Array2::from_elem((n_chains, n_draws), f64::NAN),
        }
    }

    /// Multi-index of the `k`-th element over the element dims.
    pub fn element_index(&self, k: usize) -> Vec<usize> {
        let shape = &self.values.shape()[2..];
        let mut idx = vec![0; shape.len()];
        let mut rem = k;
        for (slot, &extent) in idx.iter_mut().zip(shape).rev() {
            *slot = rem % extent.max(1);
            rem /= extent.max(1);
        }
        idx
    }
}

/// Container for every sampled and derived quantity of one fit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Posterior {
    pub attrs: BTreeMap<String, String>,
    pub coords: BTreeMap<String, Vec<String>>,
    pub variables: Vec<Variable>,
}

impl Posterior {
    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }

    pub fn coord(&self, dim: &str) -> Option<&[String]> {
        self.coords.get(dim).map(Vec::as_slice)
    }

    pub fn n_chains(&self) -> usize {
        self.variables
            .first()
            .and_then(|v| v.values.shape().first().copied())
            .unwrap_or(0)
    }

    pub fn n_draws(&self) -> usize {
        self.variables
            .first()
            .and_then(|v| v.values.shape().get(1).copied())
            .unwrap_or(0)
    }

    /// Human-readable label of one element, e.g. `u1_m[BFI-E]` or
    /// `RE_id[3,time]`. Falls back to the numeric index when a dimension has
    /// no coordinate labels.
    pub fn element_label(&self, var: &Variable, k: usize) -> String {
        let dims = var.element_dims();
        if dims.is_empty() {
            return var.name.clone();
        }
        let parts: Vec<String> = dims
            .iter()
            .zip(var.element_index(k))
            .map(|(dim, i)| {
                self.coord(dim)
                    .and_then(|labels| labels.get(i))
                    .cloned()
                    .unwrap_or_else(|| i.to_string())
            })
            .collect();
        format!("{}[{}]", var.name, parts.join(","))
    }

    /// Checks that every variable shares `(chain, draw)` extents and that
    /// every labelled dimension matches its extent.
    pub fn validate(&self) -> Result<(), ReportError> {
        let (c, d) = (self.n_chains(), self.n_draws());
        for var in &self.variables {
            let shape = var.values.shape();
            if var.dims.len() != shape.len() || shape.len() < 2 {
                return Err(ReportError::Malformed(format!(
                    "variable '{}' has dims {:?} but shape {:?}",
                    var.name, var.dims, shape
                )));
            }
            if shape[0] != c || shape[1] != d {
                return Err(ReportError::Malformed(format!(
                    "variable '{}' has {}x{} draws, expected {c}x{d}",
                    var.name, shape[0], shape[1]
                )));
            }
            for (dim, &extent) in var.element_dims().iter().zip(&shape[2..]) {
                if let Some(labels) = self.coord(dim)
                    && labels.len() != extent
                {
                    return Err(ReportError::Malformed(format!(
                        "variable '{}' dimension '{dim}' has extent {extent} but {} labels",
                        var.name,
                        labels.len()
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<(), ReportError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| ReportError::io(parent, e))?;
        }
        let file = File::create(path).map_err(|e| ReportError::io(path, e))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        log::info!("wrote posterior draws to {}", path.display());
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self, ReportError> {
        let file = File::open(path).map_err(|e| ReportError::io(path, e))?;
        let posterior: Self = serde_json::from_reader(BufReader::new(file))?;
        posterior.validate()?;
        log::debug!(
            "loaded {} variables ({} chains x {} draws) from {}",
            posterior.variables.len(),
            posterior.n_chains(),
            posterior.n_draws(),
            path.display()
        );
        Ok(posterior)
    }
}

/// Pools a `(chain, draw)` series into one flat vector, chain-major.
pub fn pooled(series: ArrayView2<f64>) -> Vec<f64> {
    series.iter().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::{Posterior, ReportError, Variable};
    use ndarray::{Array2, Array3};
    use tempfile::tempdir;

    fn sample() -> Posterior {
        let mut p = Posterior::default();
        p.coords
            .insert("measure".to_string(), vec!["A".to_string(), "B".to_string()]);
        p.attrs.insert("seed".to_string(), "7".to_string());
        p.variables.push(Variable::scalar(
            "alpha",
            Array2::from_shape_fn((2, 3), |(c, d)| (c * 10 + d) as f64),
        ));
        p.variables.push(Variable::new(
            "beta_m",
            &["measure"],
            Array3::from_shape_fn((2, 3, 2), |(c, d, m)| (100 * m + 10 * c + d) as f64).into_dyn(),
        ));
        p
    }

    #[test]
    fn element_extraction_and_labels_follow_coords() {
        let p = sample();
        let beta = p.get("beta_m").unwrap();
        assert_eq!(beta.n_elements(), 2);
        let b = beta.element(1);
        assert_eq!(b.dim(), (2, 3));
        assert_eq!(b[[1, 2]], 112.0);
        assert_eq!(p.element_label(beta, 1), "beta_m[B]");
        assert_eq!(p.element_label(p.get("alpha").unwrap(), 0), "alpha");
    }

    #[test]
    fn json_round_trip_preserves_everything() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("idata.json");
        let p = sample();
        p.write(&path).unwrap();
        let back = Posterior::read(&path).unwrap();
        assert_eq!(back, p);
        assert_eq!(back.n_chains(), 2);
        assert_eq!(back.n_draws(), 3);
    }

    #[test]
    fn mismatched_coordinate_extent_is_malformed() {
        let mut p = sample();
        p.coords.insert("measure".to_string(), vec!["A".to_string()]);
        assert!(p.validate().is_err());
    }

    #[test]
    fn zero_rank_values_are_rejected_without_panicking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("idata.json");
        let mut p = sample();
        p.variables.insert(
            0,
            Variable {
                name: "alpha0".to_string(),
                dims: Vec::new(),
                values: ndarray::ArrayD::from_elem(ndarray::IxDyn(&[]), 1.0),
            },
        );
        assert_eq!(p.n_chains(), 0);
        p.write(&path).unwrap();
        assert!(matches!(
            Posterior::read(&path),
            Err(ReportError::Malformed(_))
        ));
    }
}
