//! Regression modeling: formula parsing, outcome transforms, and the OLS
//! fitting capability behind the `fit`/`predict` seam.

pub mod formula;
pub mod ols;

pub use formula::{Formula, Term, Transform};
pub use ols::{fit, LinearModel, Prediction};
