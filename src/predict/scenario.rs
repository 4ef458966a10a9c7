//! Scenario construction: blend caller-supplied predictor values with
//! time-interpolated defaults from the baseline series, and tag every row
//! with its provenance.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::table::{ColumnData, DataTable};

/// Provenance of a prediction row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Custom,
    Benchmark,
    PreBenchmark,
    PostBenchmark,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Custom => "custom",
            RowKind::Benchmark => "benchmark",
            RowKind::PreBenchmark => "pre_benchmark",
            RowKind::PostBenchmark => "post_benchmark",
        }
    }

    fn sort_rank(&self) -> u8 {
        match self {
            RowKind::Custom => 0,
            RowKind::PreBenchmark => 1,
            RowKind::Benchmark => 2,
            RowKind::PostBenchmark => 3,
        }
    }
}

/// Caller-supplied predictor values: name → one value per custom row, or a
/// single value broadcast across them.
#[derive(Debug, Clone, Default)]
pub struct ScenarioInput {
    values: BTreeMap<String, Vec<f64>>,
}

impl ScenarioInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.values.insert(name.into(), values);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.values.insert(name.into(), values);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.values.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}

/// Options for [`build_scenario`]. Every recognized option and its default.
#[derive(Debug, Clone)]
pub struct ScenarioOptions {
    /// Stratifying variable the scenario is built over.
    pub stratify_by: String,
    /// Baseline columns never treated as predictors.
    pub exclude: Vec<String>,
    /// Whether to add pre/post benchmark context rows around the custom
    /// range.
    pub include_context: bool,
}

impl Default for ScenarioOptions {
    fn default() -> Self {
        Self {
            stratify_by: "year".to_string(),
            exclude: vec!["geoid".to_string()],
            include_context: true,
        }
    }
}

/// One fully populated prediction input row.
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioRow {
    pub stratum: f64,
    pub kind: RowKind,
    /// Every predictor value used for this row, stratifier included.
    pub values: BTreeMap<String, f64>,
}

/// The prediction input table produced by [`build_scenario`].
#[derive(Debug, Clone)]
pub struct ScenarioTable {
    pub stratify_by: String,
    /// Predictor names in baseline column order, stratifier excluded.
    pub predictor_names: Vec<String>,
    pub rows: Vec<ScenarioRow>,
}

impl ScenarioTable {
    /// Materialize as a [`DataTable`] for the model-prediction seam.
    pub fn to_table(&self) -> DataTable {
        let mut table = DataTable::new();
        let strata: Vec<f64> = self.rows.iter().map(|r| r.stratum).collect();
        table
            .push_numeric(self.stratify_by.clone(), strata)
            .expect("first column");
        for name in &self.predictor_names {
            let values: Vec<f64> = self
                .rows
                .iter()
                .map(|r| r.values.get(name).copied().unwrap_or(f64::NAN))
                .collect();
            table.push_numeric(name.clone(), values).expect("same length");
        }
        table
    }
}

/// A one-dimensional linear interpolant with flat extrapolation beyond the
/// observed range. Duplicate abscissae are collapsed by mean.
#[derive(Debug, Clone)]
pub struct Interpolant {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl Interpolant {
    /// Build from unordered (x, y) pairs; NaN y-values are skipped. Needs at
    /// least two distinct x values.
    pub fn new(points: impl IntoIterator<Item = (f64, f64)>) -> Result<Self> {
        let (xs, ys) = collapse_by_mean(points);
        if xs.len() < 2 {
            return Err(Error::data(
                "build",
                format!(
                    "interpolation needs at least 2 distinct values, got {}",
                    xs.len()
                ),
            ));
        }
        Ok(Self { xs, ys })
    }

    /// Evaluate at `x`: linear between the two bracketing points, flat
    /// beyond the boundaries.
    pub fn eval(&self, x: f64) -> f64 {
        if x <= self.xs[0] {
            return self.ys[0];
        }
        if x >= *self.xs.last().unwrap() {
            return *self.ys.last().unwrap();
        }
        let hi = self.xs.partition_point(|&v| v < x);
        let lo = hi - 1;
        if self.xs[hi] == x {
            return self.ys[hi];
        }
        let frac = (x - self.xs[lo]) / (self.xs[hi] - self.xs[lo]);
        self.ys[lo] + frac * (self.ys[hi] - self.ys[lo])
    }
}

/// Sort by x and average y over duplicate x values, skipping NaN y.
fn collapse_by_mean(points: impl IntoIterator<Item = (f64, f64)>) -> (Vec<f64>, Vec<f64>) {
    let mut pairs: Vec<(f64, f64)> = points
        .into_iter()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

    let mut xs = Vec::new();
    let mut ys = Vec::new();
    let mut i = 0;
    while i < pairs.len() {
        let x = pairs[i].0;
        let mut sum = 0.0;
        let mut count = 0usize;
        while i < pairs.len() && pairs[i].0 == x {
            sum += pairs[i].1;
            count += 1;
            i += 1;
        }
        xs.push(x);
        ys.push(sum / count as f64);
    }
    (xs, ys)
}

/// Build the prediction input table for `input` against `baseline`.
///
/// Custom rows carry the caller's values, with every unsupplied predictor
/// filled by interpolation over the baseline series. Benchmark rows carry
/// the baseline's own values, one per distinct stratifier value. With
/// context enabled, the nearest single bracketing baseline value on each
/// side of the custom range is added as a pre/post benchmark row — only
/// when the custom range lies inside the baseline span on that side.
pub fn build_scenario(
    baseline: &DataTable,
    input: &ScenarioInput,
    opts: &ScenarioOptions,
) -> Result<ScenarioTable> {
    let stratify_by = opts.stratify_by.as_str();
    let strat_col = baseline.numeric(stratify_by)?;

    let custom_strata = input.get(stratify_by).ok_or_else(|| {
        Error::configuration(
            "build",
            format!("scenario input is missing the stratifying variable `{stratify_by}`"),
        )
    })?;

    // predictors: numeric baseline columns minus exclusions and stratifier
    let mut predictor_names: Vec<String> = Vec::new();
    for column in baseline.names() {
        if column == stratify_by || opts.exclude.iter().any(|e| e == column) {
            continue;
        }
        match baseline.column(column).map(|c| &c.data) {
            Some(ColumnData::Numeric(_)) => predictor_names.push(column.to_string()),
            _ => debug!(column, "skipping non-numeric baseline column"),
        }
    }
    for name in input.names() {
        if name != stratify_by && !predictor_names.iter().any(|p| p == name) {
            warn!(name, "scenario value has no matching baseline column");
            predictor_names.push(name.to_string());
        }
    }

    let distinct = {
        let (xs, _) = collapse_by_mean(strat_col.iter().map(|&x| (x, 0.0)));
        xs
    };
    if distinct.len() < 2 {
        return Err(Error::data(
            "build",
            format!(
                "baseline has {} distinct `{stratify_by}` values, need at least 2",
                distinct.len()
            ),
        ));
    }

    // 1) one interpolant per baseline-backed predictor
    let mut interpolants: BTreeMap<String, Interpolant> = BTreeMap::new();
    for name in &predictor_names {
        if let Ok(values) = baseline.numeric(name) {
            let interp = Interpolant::new(strat_col.iter().copied().zip(values.iter().copied()))?;
            interpolants.insert(name.clone(), interp);
        }
    }

    // 2) custom rows: caller's values, interpolated fills elsewhere
    let mut rows: Vec<ScenarioRow> = Vec::new();
    for (i, &stratum) in custom_strata.iter().enumerate() {
        if !stratum.is_finite() {
            return Err(Error::configuration(
                "build",
                format!("`{stratify_by}` value {stratum} is not finite"),
            ));
        }
        if rows.iter().any(|r| r.stratum == stratum) {
            continue;
        }
        let mut values = BTreeMap::new();
        values.insert(stratify_by.to_string(), stratum);
        for name in &predictor_names {
            let value = match input.get(name) {
                Some([single]) => *single,
                Some(supplied) if supplied.len() == custom_strata.len() => supplied[i],
                Some(supplied) => {
                    return Err(Error::configuration(
                        "build",
                        format!(
                            "`{name}` has {} values for {} `{stratify_by}` values; supply 1 or {}",
                            supplied.len(),
                            custom_strata.len(),
                            custom_strata.len()
                        ),
                    ))
                }
                None => interpolants
                    .get(name)
                    .map(|interp| interp.eval(stratum))
                    .unwrap_or(f64::NAN),
            };
            values.insert(name.clone(), value);
        }
        rows.push(ScenarioRow {
            stratum,
            kind: RowKind::Custom,
            values,
        });
    }
    rows.sort_by(|a, b| a.stratum.total_cmp(&b.stratum));

    let min_custom = rows.first().map(|r| r.stratum);
    let max_custom = rows.last().map(|r| r.stratum);

    // 3) benchmark rows: the baseline's own series, unchanged
    let benchmark_values = |stratum: f64| {
        let mut values = BTreeMap::new();
        values.insert(stratify_by.to_string(), stratum);
        for name in &predictor_names {
            let value = interpolants
                .get(name)
                .map(|interp| interp.eval(stratum))
                .unwrap_or(f64::NAN);
            values.insert(name.clone(), value);
        }
        values
    };
    let mut context_rows: Vec<ScenarioRow> = Vec::new();
    for &stratum in &distinct {
        rows.push(ScenarioRow {
            stratum,
            kind: RowKind::Benchmark,
            values: benchmark_values(stratum),
        });
    }

    // 4) context rows bracketing the custom range
    if opts.include_context {
        if let (Some(lo), Some(hi)) = (min_custom, max_custom) {
            let span_min = distinct[0];
            let span_max = *distinct.last().unwrap();
            if lo <= span_max {
                if let Some(&pre) = distinct.iter().rev().find(|&&v| v < lo) {
                    context_rows.push(ScenarioRow {
                        stratum: pre,
                        kind: RowKind::PreBenchmark,
                        values: benchmark_values(pre),
                    });
                }
            }
            if hi >= span_min {
                if let Some(&post) = distinct.iter().find(|&&v| v > hi) {
                    context_rows.push(ScenarioRow {
                        stratum: post,
                        kind: RowKind::PostBenchmark,
                        values: benchmark_values(post),
                    });
                }
            }
        }
    }
    rows.extend(context_rows);

    // 5) custom rows first, then the rest interleaved by stratum
    rows.sort_by(|a, b| {
        let a_custom = (a.kind != RowKind::Custom) as u8;
        let b_custom = (b.kind != RowKind::Custom) as u8;
        a_custom
            .cmp(&b_custom)
            .then(a.stratum.total_cmp(&b.stratum))
            .then(a.kind.sort_rank().cmp(&b.kind.sort_rank()))
    });

    debug!(
        custom = rows.iter().filter(|r| r.kind == RowKind::Custom).count(),
        total = rows.len(),
        "built scenario"
    );

    Ok(ScenarioTable {
        stratify_by: stratify_by.to_string(),
        predictor_names,
        rows,
    })
}
