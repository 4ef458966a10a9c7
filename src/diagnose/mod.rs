//! Formula diagnostics: fit a grid of candidate formulas and keep every
//! outcome, so a caller can see which specifications the data supports.
//!
//! Fit failures are entries in the report, not aborts — the point of the
//! sweep is to try many formulas and keep the ones that fit.

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::{fit, Formula, Transform};
use crate::table::DataTable;

const TRANSFORMS: [Transform; 4] = [
    Transform::Identity,
    Transform::Log,
    Transform::Log10,
    Transform::Sqrt,
];

/// Options for [`sweep`]. Every recognized option and its default.
#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Highest polynomial degree tried for the polynomial variable.
    pub max_degree: u32,
    /// Variable receiving the polynomial expansion; defaults to `year` when
    /// present among the predictors, else the first predictor.
    pub poly_var: Option<String>,
}

impl Default for SweepOptions {
    fn default() -> Self {
        Self {
            max_degree: 2,
            poly_var: None,
        }
    }
}

/// One candidate formula and how its fit went.
#[derive(Debug, Clone)]
pub struct SweepEntry {
    pub formula: String,
    pub transform: Transform,
    pub degree: u32,
    pub r_squared: Option<f64>,
    pub adj_r_squared: Option<f64>,
    pub bic: Option<f64>,
    /// Why the fit was rejected, for candidates that failed.
    pub error: Option<String>,
    /// Lowest-BIC successful fit.
    pub best: bool,
}

impl SweepEntry {
    pub fn fitted(&self) -> bool {
        self.error.is_none()
    }
}

/// Sweep report, successful fits first in ascending BIC order.
#[derive(Debug, Clone)]
pub struct SweepReport {
    pub entries: Vec<SweepEntry>,
}

impl SweepReport {
    pub fn best(&self) -> Option<&SweepEntry> {
        self.entries.iter().find(|e| e.best)
    }

    pub fn n_fitted(&self) -> usize {
        self.entries.iter().filter(|e| e.fitted()).count()
    }
}

/// Fit every candidate formula over `predictors` against `data`.
///
/// Candidates are the cross of the four outcome transforms and polynomial
/// degrees `1..=max_degree` on the polynomial variable; the remaining
/// predictors enter linearly.
pub fn sweep(
    data: &DataTable,
    outcome: &str,
    predictors: &[String],
    opts: &SweepOptions,
) -> Result<SweepReport> {
    if predictors.is_empty() {
        return Err(Error::configuration(
            "diagnose",
            "at least one predictor is required",
        ));
    }
    if opts.max_degree == 0 {
        return Err(Error::configuration(
            "diagnose",
            "max_degree must be positive",
        ));
    }
    let poly_var = match &opts.poly_var {
        Some(var) => {
            if !predictors.iter().any(|p| p == var) {
                return Err(Error::configuration(
                    "diagnose",
                    format!("poly_var `{var}` is not among the predictors"),
                ));
            }
            var.clone()
        }
        None => predictors
            .iter()
            .find(|p| p.as_str() == "year")
            .unwrap_or(&predictors[0])
            .clone(),
    };

    let mut entries = Vec::new();
    for transform in TRANSFORMS {
        for degree in 1..=opts.max_degree {
            let text = candidate_formula(outcome, transform, predictors, &poly_var, degree);
            let outcome_of_fit = Formula::parse(&text).and_then(|f| fit(&f, data));
            let entry = match outcome_of_fit {
                Ok(model) => SweepEntry {
                    formula: text,
                    transform,
                    degree,
                    r_squared: Some(model.r_squared()),
                    adj_r_squared: Some(model.adj_r_squared()),
                    bic: Some(model.bic()),
                    error: None,
                    best: false,
                },
                Err(err) => {
                    debug!(formula = %text, error = %err, "candidate rejected");
                    SweepEntry {
                        formula: text,
                        transform,
                        degree,
                        r_squared: None,
                        adj_r_squared: None,
                        bic: None,
                        error: Some(err.to_string()),
                        best: false,
                    }
                }
            };
            entries.push(entry);
        }
    }

    // successes first, ascending BIC; failures keep their grid order
    entries.sort_by(|a, b| match (a.bic, b.bic) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => std::cmp::Ordering::Equal,
    });
    if let Some(first) = entries.first_mut() {
        if first.fitted() {
            first.best = true;
        }
    }

    let report = SweepReport { entries };
    info!(
        candidates = report.entries.len(),
        fitted = report.n_fitted(),
        "diagnostic sweep complete"
    );
    Ok(report)
}

/// Candidate formula text: wrapped outcome, linear terms, polynomial on the
/// chosen variable when degree > 1.
fn candidate_formula(
    outcome: &str,
    transform: Transform,
    predictors: &[String],
    poly_var: &str,
    degree: u32,
) -> String {
    let lhs = match transform {
        Transform::Identity => outcome.to_string(),
        other => format!("{}({outcome})", other.as_str()),
    };
    let rhs: Vec<String> = predictors
        .iter()
        .map(|p| {
            if p == poly_var && degree > 1 {
                format!("poly({p}, {degree})")
            } else {
                p.clone()
            }
        })
        .collect();
    format!("{lhs} ~ {}", rhs.join(" + "))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(emissions: Vec<f64>) -> DataTable {
        let n = emissions.len();
        let mut t = DataTable::new();
        t.push_numeric("year", (0..n).map(|i| 2010.0 + i as f64).collect())
            .unwrap();
        // wobble keeps vmt out of the polynomial span of year
        t.push_numeric(
            "vmt",
            (0..n)
                .map(|i| 1000.0 + 37.0 * i as f64 + if i % 2 == 0 { 8.0 } else { -8.0 })
                .collect(),
        )
        .unwrap();
        t.push_numeric("emissions", emissions).unwrap();
        t
    }

    #[test]
    fn sweep_covers_the_candidate_grid() {
        let table = data((0..10).map(|i| 500.0 + 21.0 * i as f64).collect());
        let report = sweep(
            &table,
            "emissions",
            &["vmt".to_string(), "year".to_string()],
            &SweepOptions::default(),
        )
        .unwrap();

        assert_eq!(report.entries.len(), 8);
        assert_eq!(report.n_fitted(), 8);
        let best = report.best().unwrap();
        assert!(best.fitted());
        // successes are in ascending BIC order
        let bics: Vec<f64> = report.entries.iter().filter_map(|e| e.bic).collect();
        let mut sorted = bics.clone();
        sorted.sort_by(f64::total_cmp);
        assert_eq!(bics, sorted);
    }

    #[test]
    fn failed_candidates_stay_in_the_report() {
        // a negative outcome makes log/log10/sqrt candidates unfittable
        let mut emissions: Vec<f64> = (0..10).map(|i| 500.0 + 21.0 * i as f64).collect();
        emissions[3] = -1.0;
        let table = data(emissions);
        let report = sweep(
            &table,
            "emissions",
            &["year".to_string()],
            &SweepOptions::default(),
        )
        .unwrap();

        assert_eq!(report.entries.len(), 8);
        assert_eq!(report.n_fitted(), 2);
        for entry in report.entries.iter().filter(|e| !e.fitted()) {
            assert!(entry.error.is_some());
            assert_ne!(entry.transform, Transform::Identity);
        }
        assert!(report.best().unwrap().transform == Transform::Identity);
    }

    #[test]
    fn poly_var_prefers_year() {
        let text = candidate_formula(
            "emissions",
            Transform::Log,
            &["vmt".to_string(), "year".to_string()],
            "year",
            2,
        );
        assert_eq!(text, "log(emissions) ~ vmt + poly(year, 2)");
    }

    #[test]
    fn unknown_poly_var_is_a_configuration_error() {
        let table = data((0..6).map(|i| 10.0 + i as f64).collect());
        let opts = SweepOptions {
            poly_var: Some("starts".to_string()),
            ..Default::default()
        };
        let err = sweep(&table, "emissions", &["year".to_string()], &opts).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
