#![deny(dead_code)]
#![deny(unused_imports)]

pub mod columns;
pub mod config;
pub mod diagram;
pub mod diagnostics;
pub mod download;
pub mod hmc;
pub mod model;
pub mod pipeline;
pub mod plot;
pub mod posterior;
pub mod reshape;
pub mod standardize;
pub mod summary;
pub mod table;
pub mod types;

pub use columns::{Instrument, InstrumentRegistry, validate_columns};
pub use config::{Config, ConfigError};
pub use download::{FetchError, HttpTransport, Transport, fetch_dataset};
pub use hmc::{InitStrategy, SamplerConfig, SamplerError, sample_posterior};
pub use model::{HierarchicalModel, ModelData, ModelError, Priors, cholesky_2x2};
pub use pipeline::{FitSettings, PipelineError, RunOutcome, fit_table, run_pipeline};
pub use posterior::{Posterior, ReportError, Variable};
pub use reshape::{LongRecord, LongTable, reshape_long};
pub use standardize::{Standardization, StandardizedTable, standardize_within_instrument};
pub use table::WideTable;
pub use types::{DataError, TimeCoding, Timepoint};
