//! Scenario projection: build the prediction input, predict through the
//! fitted model, detect the outcome transform, back-transform when needed,
//! and assemble the annotated output table.

pub mod backtransform;
pub mod scenario;

use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::{ContinuousCDF, StudentsT};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::model::LinearModel;
use crate::table::DataTable;

pub use backtransform::{simulate, simulate_with, Backtransformed, SimulationOptions};
pub use scenario::{
    build_scenario, Interpolant, RowKind, ScenarioInput, ScenarioOptions, ScenarioRow,
    ScenarioTable,
};

/// Options for [`project`]. Every recognized option and its default.
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    pub scenario: ScenarioOptions,
    pub simulation: SimulationOptions,
}

/// One projected row on the original measurement scale.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionRow {
    pub stratum: f64,
    pub kind: RowKind,
    /// Predictor values aligned with [`ProjectionTable::predictor_names`].
    pub predictors: Vec<f64>,
    pub emissions: f64,
    pub se: f64,
    pub lower: f64,
    pub upper: f64,
}

/// The projection result: guaranteed columns
/// `{stratify_key, type, emissions, se, lower, upper}` plus the pass-through
/// predictor columns other tooling relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionTable {
    pub stratify_by: String,
    pub predictor_names: Vec<String>,
    pub rows: Vec<ProjectionRow>,
}

impl ProjectionTable {
    /// Materialize as a [`DataTable`] in the guaranteed column order.
    pub fn to_table(&self) -> DataTable {
        let mut table = DataTable::new();
        table
            .push_numeric(
                self.stratify_by.clone(),
                self.rows.iter().map(|r| r.stratum).collect(),
            )
            .expect("first column");
        table
            .push_text(
                "type",
                self.rows.iter().map(|r| r.kind.as_str().to_string()).collect(),
            )
            .expect("same length");
        for (i, name) in self.predictor_names.iter().enumerate() {
            table
                .push_numeric(
                    name.clone(),
                    self.rows.iter().map(|r| r.predictors[i]).collect(),
                )
                .expect("same length");
        }
        table
            .push_numeric("emissions", self.rows.iter().map(|r| r.emissions).collect())
            .expect("same length");
        table
            .push_numeric("se", self.rows.iter().map(|r| r.se).collect())
            .expect("same length");
        table
            .push_numeric("lower", self.rows.iter().map(|r| r.lower).collect())
            .expect("same length");
        table
            .push_numeric("upper", self.rows.iter().map(|r| r.upper).collect())
            .expect("same length");
        table
    }

    pub fn to_csv_string(&self) -> Result<String> {
        self.to_table().to_csv_string()
    }
}

/// Two-sided t quantile for a `confidence`-level interval.
fn t_quantile(confidence: f64, df: f64) -> Result<f64> {
    let dist = StudentsT::new(0.0, 1.0, df).map_err(|e| {
        Error::data("project", format!("t-distribution with df {df}: {e}"))
    })?;
    Ok(dist.inverse_cdf(1.0 - (1.0 - confidence) / 2.0))
}

/// Project `input` against `baseline` through `model`.
///
/// Stages run strictly in sequence: build the scenario, predict on the
/// transformed scale, detect the model's outcome transform once, then
/// either back-transform every row by simulation or, for an identity
/// outcome, take the direct t interval. Prediction failures surface
/// immediately; nothing is retried.
pub fn project(
    model: &LinearModel,
    baseline: &DataTable,
    input: &ScenarioInput,
    opts: &ProjectOptions,
) -> Result<ProjectionTable> {
    if !(opts.simulation.confidence > 0.0 && opts.simulation.confidence < 1.0) {
        return Err(Error::configuration(
            "project",
            format!(
                "confidence must be in (0, 1), got {}",
                opts.simulation.confidence
            ),
        ));
    }

    // the model's outcome column must not masquerade as a predictor
    let mut scenario_opts = opts.scenario.clone();
    let response = model.formula().response();
    if !scenario_opts.exclude.iter().any(|e| e == response) {
        scenario_opts.exclude.push(response.to_string());
    }

    let scenario = build_scenario(baseline, input, &scenario_opts)?;
    debug!(rows = scenario.rows.len(), "scenario built");

    let newdata = scenario.to_table();
    let predictions = model.predict(&newdata)?;

    let transform = model.transform();
    let df = model.df();
    debug!(transform = transform.as_str(), df, "detected outcome transform");

    let mut rng = match opts.simulation.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let direct_quantile = if transform.is_identity() {
        Some(t_quantile(opts.simulation.confidence, df)?)
    } else {
        None
    };

    let mut rows = Vec::with_capacity(scenario.rows.len());
    for (scenario_row, prediction) in scenario.rows.iter().zip(&predictions) {
        let summary = match direct_quantile {
            Some(q) => Backtransformed {
                emissions: prediction.fit,
                se: prediction.se,
                lower: prediction.fit - q * prediction.se,
                upper: prediction.fit + q * prediction.se,
            },
            None => simulate_with(
                prediction.fit,
                prediction.se,
                transform,
                df,
                &opts.simulation,
                &mut rng,
            )?,
        };
        rows.push(ProjectionRow {
            stratum: scenario_row.stratum,
            kind: scenario_row.kind,
            predictors: scenario
                .predictor_names
                .iter()
                .map(|name| scenario_row.values.get(name).copied().unwrap_or(f64::NAN))
                .collect(),
            emissions: summary.emissions,
            se: summary.se,
            lower: summary.lower,
            upper: summary.upper,
        });
    }

    info!(
        rows = rows.len(),
        transform = transform.as_str(),
        "projection complete"
    );
    Ok(ProjectionTable {
        stratify_by: scenario.stratify_by,
        predictor_names: scenario.predictor_names,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{fit, Formula};

    /// Baseline with years 2015–2020, linear VMT growth, and emissions that
    /// track VMT with a small deterministic wobble so fits keep a nonzero
    /// residual.
    fn baseline() -> DataTable {
        let years: Vec<f64> = (2015..=2020).map(f64::from).collect();
        let vmt: Vec<f64> = (0..6).map(|i| 1000.0 + 100.0 * i as f64).collect();
        let emissions: Vec<f64> = vmt
            .iter()
            .enumerate()
            .map(|(i, v)| 0.5 * v + if i % 2 == 0 { 2.0 } else { -2.0 })
            .collect();
        let mut t = DataTable::new();
        t.push_numeric("year", years).unwrap();
        t.push_numeric("vmt", vmt).unwrap();
        t.push_numeric("emissions", emissions).unwrap();
        t
    }

    fn seeded_opts(seed: u64) -> ProjectOptions {
        ProjectOptions {
            simulation: SimulationOptions {
                seed: Some(seed),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn identity_projection_has_expected_row_census() {
        let data = baseline();
        let model = fit(&Formula::parse("emissions ~ vmt").unwrap(), &data).unwrap();
        let input = ScenarioInput::new().set("year", vec![2023.0]);
        let table = project(&model, &data, &input, &ProjectOptions::default()).unwrap();

        let census = |kind: RowKind| table.rows.iter().filter(|r| r.kind == kind).count();
        assert_eq!(census(RowKind::Custom), 1);
        assert_eq!(census(RowKind::Benchmark), 6);
        assert_eq!(census(RowKind::PreBenchmark), 0);
        assert_eq!(census(RowKind::PostBenchmark), 0);

        assert_eq!(table.rows[0].stratum, 2023.0);
        for row in &table.rows {
            assert!(
                row.lower <= row.emissions && row.emissions <= row.upper,
                "{row:?}"
            );
        }
    }

    #[test]
    fn identity_interval_matches_the_t_quantile() {
        let data = baseline();
        let model = fit(&Formula::parse("emissions ~ vmt").unwrap(), &data).unwrap();
        let input = ScenarioInput::new().set("year", vec![2018.0]);
        let table = project(&model, &data, &input, &ProjectOptions::default()).unwrap();

        let q = t_quantile(0.95, model.df()).unwrap();
        // df = 4 here, so the quantile is well above the normal 1.96
        assert!(q > 2.7 && q < 2.8, "q = {q}");
        let row = &table.rows[0];
        assert!((row.upper - row.emissions - q * row.se).abs() < 1e-9);
        assert!((row.emissions - row.lower - q * row.se).abs() < 1e-9);
    }

    #[test]
    fn log_projection_back_transforms_every_row() {
        let data = baseline();
        let model = fit(&Formula::parse("log(emissions) ~ vmt").unwrap(), &data).unwrap();
        let input = ScenarioInput::new().set("year", vec![2017.5]);
        let table = project(&model, &data, &input, &seeded_opts(11)).unwrap();

        for row in &table.rows {
            assert!(row.emissions > 0.0, "{row:?}");
            assert!(row.lower <= row.emissions && row.emissions <= row.upper);
        }
    }

    #[test]
    fn seeded_projections_are_idempotent() {
        let data = baseline();
        let model = fit(&Formula::parse("log(emissions) ~ vmt").unwrap(), &data).unwrap();
        let input = ScenarioInput::new().set("year", vec![2019.5, 2022.0]);

        let a = project(&model, &data, &input, &seeded_opts(3)).unwrap();
        let b = project(&model, &data, &input, &seeded_opts(3)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_csv_string().unwrap(), b.to_csv_string().unwrap());
    }

    #[test]
    fn output_table_has_the_guaranteed_columns() {
        let data = baseline();
        let model = fit(&Formula::parse("emissions ~ vmt").unwrap(), &data).unwrap();
        let input = ScenarioInput::new().set("year", vec![2021.0]);
        let table = project(&model, &data, &input, &ProjectOptions::default()).unwrap();

        let out = table.to_table();
        let names: Vec<&str> = out.names().collect();
        assert_eq!(
            names,
            vec!["year", "type", "vmt", "emissions", "se", "lower", "upper"]
        );
        assert_eq!(
            out.column("type").unwrap().data,
            crate::table::ColumnData::Text(
                std::iter::once("custom".to_string())
                    .chain((0..6).map(|_| "benchmark".to_string()))
                    .collect()
            )
        );
    }
}
