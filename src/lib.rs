//! Query a remote emissions database, fit regressions of pollutant
//! emissions on transportation activity, and project scenarios with
//! confidence intervals — a fast approximation of EPA MOVES simulation
//! outputs.

pub mod api;
pub mod diagnose;
pub mod error;
pub mod model;
pub mod predict;
pub mod table;

pub use api::{ApiClient, QueryOptions};
pub use error::{Error, Result};
pub use model::{fit, Formula, LinearModel, Transform};
pub use predict::{
    project, ProjectOptions, ProjectionTable, RowKind, ScenarioInput, ScenarioOptions,
    SimulationOptions,
};
pub use table::DataTable;
