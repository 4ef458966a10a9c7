//! Ordinary-least-squares fitting and prediction.
//!
//! This is the crate's implementation of the fitting seam: build the design
//! matrix from a [`Formula`], solve the normal equations, and predict with
//! the standard error of the mean response. Rows with missing (NaN) values
//! in any used column are dropped before the solve.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::formula::{Formula, Term, Transform};
use crate::table::DataTable;

/// Per-row prediction on the transformed (fitting) scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub fit: f64,
    pub se: f64,
}

/// A fitted regression model. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearModel {
    formula: Formula,
    coefficients: Array1<f64>,
    xtx_inv: Array2<f64>,
    sigma2: f64,
    df: f64,
    n_obs: usize,
    r_squared: f64,
    adj_r_squared: f64,
    bic: f64,
}

/// Fit `formula` against `data` by ordinary least squares.
pub fn fit(formula: &Formula, data: &DataTable) -> Result<LinearModel> {
    let outcome = data.numeric(formula.response())?;
    let predictors: Vec<(&str, &[f64])> = formula
        .predictors()
        .into_iter()
        .map(|name| data.numeric(name).map(|col| (name, col)))
        .collect::<Result<_>>()?;

    // 1) transform the outcome and drop rows with missing cells
    let transform = formula.transform();
    let mut rows: Vec<usize> = Vec::with_capacity(outcome.len());
    for i in 0..outcome.len() {
        let complete =
            outcome[i].is_finite() && predictors.iter().all(|(_, col)| col[i].is_finite());
        if complete {
            rows.push(i);
        }
    }
    if rows.len() < outcome.len() {
        debug!(
            dropped = outcome.len() - rows.len(),
            "dropping rows with missing values"
        );
    }

    let y: Vec<f64> = rows.iter().map(|&i| transform.apply(outcome[i])).collect();
    if let Some(bad) = y.iter().position(|v| !v.is_finite()) {
        return Err(Error::model_fit(
            "fit",
            format!(
                "transform `{}` of `{}` is not finite at value {}",
                transform.as_str(),
                formula.response(),
                outcome[rows[bad]]
            ),
        ));
    }

    // 2) assemble the design matrix
    let n = rows.len();
    let p = formula.design_width();
    if n <= p {
        return Err(Error::model_fit(
            "fit",
            format!("{n} usable observations for {p} coefficients"),
        ));
    }
    let mut flat = Vec::with_capacity(n * p);
    for &i in &rows {
        let row = formula.design_row(|name| {
            predictors
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, col)| col[i])
                .unwrap_or(f64::NAN)
        });
        flat.extend(row);
    }
    let x = Array2::from_shape_vec((n, p), flat).expect("design matrix shape");
    let y = Array1::from_vec(y);

    // 3) solve the normal equations on mean-centered columns; the raw Gram
    // matrix is badly conditioned for calendar-year predictors
    let means: Vec<f64> = (1..p).map(|j| x.column(j).sum() / n as f64).collect();
    let mut centered = Array2::<f64>::zeros((n, p - 1));
    for i in 0..n {
        for j in 1..p {
            centered[[i, j - 1]] = x[[i, j]] - means[j - 1];
        }
    }
    let ybar = y.sum() / n as f64;
    let gram = centered.t().dot(&centered);
    let gram_inv = invert(&gram).ok_or_else(|| {
        Error::model_fit(
            "fit",
            format!("singular design matrix for `{}`", formula.text()),
        )
    })?;
    let slopes = gram_inv.dot(&centered.t().dot(&y.mapv(|v| v - ybar)));
    let intercept = ybar
        - slopes
            .iter()
            .zip(&means)
            .map(|(b, m)| b * m)
            .sum::<f64>();
    let mut coefficients = Array1::<f64>::zeros(p);
    coefficients[0] = intercept;
    for j in 1..p {
        coefficients[j] = slopes[j - 1];
    }

    // reconstruct inv(X'X) from the centered inverse:
    //   [ 1/n + m'Am   -(Am)' ]
    //   [   -Am           A   ]
    let am = gram_inv.dot(&Array1::from_vec(means.clone()));
    let mut xtx_inv = Array2::<f64>::zeros((p, p));
    xtx_inv[[0, 0]] = 1.0 / n as f64
        + means
            .iter()
            .zip(am.iter())
            .map(|(m, v)| m * v)
            .sum::<f64>();
    for j in 1..p {
        xtx_inv[[0, j]] = -am[j - 1];
        xtx_inv[[j, 0]] = -am[j - 1];
        for k in 1..p {
            xtx_inv[[j, k]] = gram_inv[[j - 1, k - 1]];
        }
    }

    // 4) fit statistics
    let fitted = x.dot(&coefficients);
    let residuals = &y - &fitted;
    let rss: f64 = residuals.iter().map(|r| r * r).sum();
    let tss: f64 = y.iter().map(|v| (v - ybar) * (v - ybar)).sum();
    let df = (n - p) as f64;
    let sigma2 = rss / df;
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 1.0 };
    let adj_r_squared = 1.0 - (1.0 - r_squared) * (n as f64 - 1.0) / df;
    let bic = n as f64 * (rss / n as f64).ln() + p as f64 * (n as f64).ln();

    info!(
        formula = %formula.text(),
        n,
        r_squared = format!("{r_squared:.4}").as_str(),
        "fitted model"
    );

    Ok(LinearModel {
        formula: formula.clone(),
        coefficients,
        xtx_inv,
        sigma2,
        df,
        n_obs: n,
        r_squared,
        adj_r_squared,
        bic,
    })
}

impl LinearModel {
    pub fn formula(&self) -> &Formula {
        &self.formula
    }

    /// Outcome transform detected from the fitted formula. Model-level, so
    /// callers detect once per projection rather than once per row.
    pub fn transform(&self) -> Transform {
        self.formula.transform()
    }

    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }

    /// Coefficient labels aligned with [`coefficients`](Self::coefficients).
    pub fn coefficient_names(&self) -> Vec<String> {
        let mut names = vec!["(Intercept)".to_string()];
        for term in self.formula.terms() {
            match term {
                Term::Linear(var) => names.push(var.clone()),
                Term::Poly { var, degree } => {
                    names.extend((1..=*degree).map(|d| format!("{var}^{d}")));
                }
            }
        }
        names
    }

    /// Residual degrees of freedom.
    pub fn df(&self) -> f64 {
        self.df
    }

    pub fn n_obs(&self) -> usize {
        self.n_obs
    }

    pub fn sigma2(&self) -> f64 {
        self.sigma2
    }

    pub fn r_squared(&self) -> f64 {
        self.r_squared
    }

    pub fn adj_r_squared(&self) -> f64 {
        self.adj_r_squared
    }

    pub fn bic(&self) -> f64 {
        self.bic
    }

    /// Predict each row of `newdata` on the transformed scale, with the
    /// standard error of the mean response. A predictor column missing from
    /// `newdata` is surfaced as a `Data` error naming the column.
    pub fn predict(&self, newdata: &DataTable) -> Result<Vec<Prediction>> {
        let predictors: Vec<(&str, &[f64])> = self
            .formula
            .predictors()
            .into_iter()
            .map(|name| newdata.numeric(name).map(|col| (name, col)))
            .collect::<Result<_>>()?;

        let mut out = Vec::with_capacity(newdata.n_rows());
        for i in 0..newdata.n_rows() {
            let row = self.formula.design_row(|name| {
                predictors
                    .iter()
                    .find(|(n, _)| *n == name)
                    .map(|(_, col)| col[i])
                    .unwrap_or(f64::NAN)
            });
            let x = Array1::from_vec(row);
            let fit = x.dot(&self.coefficients);
            let leverage = x.dot(&self.xtx_inv.dot(&x));
            let se = (self.sigma2 * leverage).max(0.0).sqrt();
            out.push(Prediction { fit, se });
        }
        Ok(out)
    }
}

/// Invert a small symmetric Gram matrix by Gauss-Jordan with partial
/// pivoting. The matrix is first rescaled to unit diagonal so the pivot
/// tolerance is scale-free across predictors of very different magnitudes.
/// Returns `None` when singular or numerically rank-deficient.
fn invert(a: &Array2<f64>) -> Option<Array2<f64>> {
    let p = a.nrows();
    let mut d = Vec::with_capacity(p);
    for i in 0..p {
        let diag = a[[i, i]];
        if !(diag > 0.0) {
            // a centered column with zero variance cannot be inverted out
            return None;
        }
        d.push(1.0 / diag.sqrt());
    }

    let mut work = Array2::<f64>::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            work[[i, j]] = a[[i, j]] * d[i] * d[j];
        }
    }
    let mut inv = Array2::<f64>::eye(p);

    for col in 0..p {
        // pick the largest remaining pivot
        let mut pivot = col;
        for row in (col + 1)..p {
            if work[[row, col]].abs() > work[[pivot, col]].abs() {
                pivot = row;
            }
        }
        if work[[pivot, col]].abs() < 1e-10 {
            return None;
        }
        if pivot != col {
            for k in 0..p {
                work.swap([pivot, k], [col, k]);
                inv.swap([pivot, k], [col, k]);
            }
        }

        let diag = work[[col, col]];
        for k in 0..p {
            work[[col, k]] /= diag;
            inv[[col, k]] /= diag;
        }
        for row in 0..p {
            if row == col {
                continue;
            }
            let factor = work[[row, col]];
            if factor == 0.0 {
                continue;
            }
            for k in 0..p {
                work[[row, k]] -= factor * work[[col, k]];
                inv[[row, k]] -= factor * inv[[col, k]];
            }
        }
    }

    // undo the diagonal rescaling: inv(A) = D inv(D A D) D
    let mut out = Array2::<f64>::zeros((p, p));
    for i in 0..p {
        for j in 0..p {
            out[[i, j]] = inv[[i, j]] * d[i] * d[j];
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(columns: &[(&str, Vec<f64>)]) -> DataTable {
        let mut t = DataTable::new();
        for (name, values) in columns {
            t.push_numeric(*name, values.clone()).unwrap();
        }
        t
    }

    #[test]
    fn recovers_exact_linear_coefficients() {
        let years: Vec<f64> = (2015..=2020).map(f64::from).collect();
        let emissions: Vec<f64> = years.iter().map(|y| 3.0 * y - 5000.0).collect();
        let data = table(&[("year", years), ("emissions", emissions)]);

        let formula = Formula::parse("emissions ~ year").unwrap();
        let model = fit(&formula, &data).unwrap();

        let beta = model.coefficients();
        assert!((beta[0] - -5000.0).abs() < 1e-6);
        assert!((beta[1] - 3.0).abs() < 1e-9);
        assert!((model.r_squared() - 1.0).abs() < 1e-9);
        assert_eq!(model.df(), 4.0);
        assert_eq!(model.coefficient_names(), vec!["(Intercept)", "year"]);
    }

    #[test]
    fn log_transform_recovers_exponential_trend() {
        let years: Vec<f64> = (2015..=2020).map(f64::from).collect();
        let emissions: Vec<f64> = years.iter().map(|y| (0.1 * (y - 2015.0)).exp()).collect();
        let data = table(&[("year", years), ("emissions", emissions)]);

        let model = fit(&Formula::parse("log(emissions) ~ year").unwrap(), &data).unwrap();
        assert!((model.coefficients()[1] - 0.1).abs() < 1e-9);
        assert_eq!(model.transform(), Transform::Log);
    }

    #[test]
    fn duplicated_column_is_singular() {
        let years: Vec<f64> = (2015..=2020).map(f64::from).collect();
        let copy = years.clone();
        let emissions: Vec<f64> = years.iter().map(|y| y * 2.0).collect();
        let data = table(&[("year", years), ("year2", copy), ("emissions", emissions)]);

        let err = fit(&Formula::parse("emissions ~ year + year2").unwrap(), &data).unwrap_err();
        assert!(matches!(err, Error::ModelFit { .. }), "{err}");
    }

    #[test]
    fn negative_outcome_under_log_is_a_fit_error() {
        let data = table(&[
            ("year", vec![2015.0, 2016.0, 2017.0, 2018.0]),
            ("emissions", vec![1.0, 2.0, -3.0, 4.0]),
        ]);
        let err = fit(&Formula::parse("log(emissions) ~ year").unwrap(), &data).unwrap_err();
        assert!(err.to_string().contains("-3"), "{err}");
    }

    #[test]
    fn too_few_observations_is_a_fit_error() {
        let data = table(&[
            ("year", vec![2015.0, 2016.0]),
            ("emissions", vec![1.0, 2.0]),
        ]);
        let err = fit(&Formula::parse("emissions ~ poly(year, 2)").unwrap(), &data).unwrap_err();
        assert!(matches!(err, Error::ModelFit { .. }));
    }

    #[test]
    fn missing_rows_are_dropped_not_fatal() {
        let data = table(&[
            ("year", vec![2015.0, 2016.0, 2017.0, 2018.0, 2019.0]),
            ("emissions", vec![1.0, f64::NAN, 3.0, 4.0, 5.0]),
        ]);
        let model = fit(&Formula::parse("emissions ~ year").unwrap(), &data).unwrap();
        assert_eq!(model.n_obs(), 4);
    }

    #[test]
    fn predict_flags_missing_columns() {
        let years: Vec<f64> = (2015..=2020).map(f64::from).collect();
        let vmt: Vec<f64> = years.iter().map(|y| 10.0 * y).collect();
        let emissions: Vec<f64> = vmt.iter().map(|v| 0.5 * v).collect();
        let data = table(&[("year", years), ("vmt", vmt), ("emissions", emissions)]);
        let model = fit(&Formula::parse("emissions ~ vmt").unwrap(), &data).unwrap();

        let newdata = table(&[("year", vec![2030.0])]);
        let err = model.predict(&newdata).unwrap_err();
        assert!(err.to_string().contains("vmt"), "{err}");
    }

    #[test]
    fn models_round_trip_through_json() {
        let years: Vec<f64> = (2015..=2020).map(f64::from).collect();
        let emissions: Vec<f64> = years
            .iter()
            .enumerate()
            .map(|(i, y)| 3.0 * y + if i % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        let data = table(&[("year", years), ("emissions", emissions)]);
        let model = fit(&Formula::parse("log(emissions) ~ year").unwrap(), &data).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        std::fs::write(&path, serde_json::to_string_pretty(&model).unwrap()).unwrap();
        let loaded: LinearModel =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(loaded.coefficients(), model.coefficients());
        assert_eq!(loaded.df(), model.df());
        let newdata = table(&[("year", vec![2022.0, 2025.0])]);
        assert_eq!(
            loaded.predict(&newdata).unwrap(),
            model.predict(&newdata).unwrap()
        );
    }

    #[test]
    fn prediction_se_grows_away_from_the_data() {
        // noisy but deterministic outcome around a linear trend
        let years: Vec<f64> = (2010..=2020).map(f64::from).collect();
        let emissions: Vec<f64> = years
            .iter()
            .enumerate()
            .map(|(i, y)| 2.0 * y + if i % 2 == 0 { 1.5 } else { -1.5 })
            .collect();
        let data = table(&[("year", years), ("emissions", emissions)]);
        let model = fit(&Formula::parse("emissions ~ year").unwrap(), &data).unwrap();

        let near = table(&[("year", vec![2015.0])]);
        let far = table(&[("year", vec![2035.0])]);
        let se_near = model.predict(&near).unwrap()[0].se;
        let se_far = model.predict(&far).unwrap()[0].se;
        assert!(se_near > 0.0);
        assert!(se_far > se_near);
    }
}
