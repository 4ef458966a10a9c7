//! Model formula parsing: `log(emissions) ~ vmt + poly(year, 2)`.
//!
//! The left-hand side may wrap the outcome in a transform; the right-hand
//! side is a `+`-separated list of predictor terms, each either a bare
//! column name or a raw polynomial expansion `poly(name, degree)`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

static WRAPPED_LHS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*\(\s*([A-Za-z_][A-Za-z0-9_.]*)\s*\)$").unwrap()
});
static BARE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_.]*$").unwrap());
static POLY_TERM: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^poly\s*\(\s*([A-Za-z_][A-Za-z0-9_.]*)\s*,\s*(\d+)\s*\)$").unwrap()
});

/// Outcome transform applied during fitting.
///
/// Unrecognized wrappers fall back to `Identity` on purpose: an unknown
/// transform must not abort a projection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transform {
    Log,
    Log10,
    Sqrt,
    Identity,
}

impl Transform {
    /// Classify the wrapper of a left-hand-side expression. Ordering
    /// matters: `log10` must be tried before the looser `log`.
    pub fn detect(lhs: &str) -> Transform {
        let wrapper = match WRAPPED_LHS.captures(lhs.trim()) {
            Some(caps) => caps.get(1).unwrap().as_str().to_string(),
            None => return Transform::Identity,
        };
        match wrapper.as_str() {
            "log10" => Transform::Log10,
            "log" => Transform::Log,
            "sqrt" => Transform::Sqrt,
            other => {
                warn!(wrapper = %other, "unrecognized outcome transform, treating as identity");
                Transform::Identity
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::Log => "log",
            Transform::Log10 => "log10",
            Transform::Sqrt => "sqrt",
            Transform::Identity => "identity",
        }
    }

    /// Inverse expression over a single free variable `y`.
    pub fn inverse_expr(&self) -> &'static str {
        match self {
            Transform::Log => "exp(y)",
            Transform::Log10 => "10^y",
            Transform::Sqrt => "y^2",
            Transform::Identity => "y",
        }
    }

    /// Apply the transform (outcome scale → fitting scale).
    pub fn apply(&self, y: f64) -> f64 {
        match self {
            Transform::Log => y.ln(),
            Transform::Log10 => y.log10(),
            Transform::Sqrt => y.sqrt(),
            Transform::Identity => y,
        }
    }

    /// Apply the inverse (fitting scale → outcome scale).
    pub fn inverse(&self, y: f64) -> f64 {
        match self {
            Transform::Log => y.exp(),
            Transform::Log10 => 10f64.powf(y),
            Transform::Sqrt => y * y,
            Transform::Identity => y,
        }
    }

    pub fn is_identity(&self) -> bool {
        matches!(self, Transform::Identity)
    }
}

/// A right-hand-side predictor term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Term {
    Linear(String),
    Poly { var: String, degree: u32 },
}

impl Term {
    /// Number of design-matrix columns the term expands into.
    pub fn width(&self) -> usize {
        match self {
            Term::Linear(_) => 1,
            Term::Poly { degree, .. } => *degree as usize,
        }
    }

    pub fn var(&self) -> &str {
        match self {
            Term::Linear(var) => var,
            Term::Poly { var, .. } => var,
        }
    }
}

/// A parsed model formula.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formula {
    text: String,
    response: String,
    transform: Transform,
    terms: Vec<Term>,
}

impl Formula {
    /// Parse formula text. Unparseable text is a `ModelFit` error carrying
    /// the offending string.
    pub fn parse(text: &str) -> Result<Formula> {
        let bad = |detail: String| Error::model_fit("parse", detail);

        let (lhs, rhs) = text
            .split_once('~')
            .ok_or_else(|| bad(format!("formula `{text}` has no `~`")))?;
        let lhs = lhs.trim();
        let rhs = rhs.trim();
        if rhs.is_empty() {
            return Err(bad(format!("formula `{text}` has an empty right-hand side")));
        }

        let transform = Transform::detect(lhs);
        let response = match WRAPPED_LHS.captures(lhs) {
            Some(caps) => caps.get(2).unwrap().as_str().to_string(),
            None if BARE_NAME.is_match(lhs) => lhs.to_string(),
            None => return Err(bad(format!("unparseable outcome expression `{lhs}`"))),
        };

        let mut terms = Vec::new();
        for raw in rhs.split('+') {
            let raw = raw.trim();
            if let Some(caps) = POLY_TERM.captures(raw) {
                let var = caps.get(1).unwrap().as_str().to_string();
                let degree: u32 = caps.get(2).unwrap().as_str().parse().unwrap();
                if degree == 0 {
                    return Err(bad(format!("poly degree must be positive in `{raw}`")));
                }
                terms.push(Term::Poly { var, degree });
            } else if BARE_NAME.is_match(raw) {
                terms.push(Term::Linear(raw.to_string()));
            } else {
                return Err(bad(format!("unparseable term `{raw}` in `{text}`")));
            }
        }

        Ok(Formula {
            text: text.to_string(),
            response,
            transform,
            terms,
        })
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn response(&self) -> &str {
        &self.response
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Distinct predictor names referenced on the right-hand side.
    pub fn predictors(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for term in &self.terms {
            if !out.contains(&term.var()) {
                out.push(term.var());
            }
        }
        out
    }

    /// Design-matrix width including the intercept.
    pub fn design_width(&self) -> usize {
        1 + self.terms.iter().map(Term::width).sum::<usize>()
    }

    /// Expand one observation into a design row: intercept, then each term's
    /// columns in declaration order.
    pub fn design_row(&self, mut value_of: impl FnMut(&str) -> f64) -> Vec<f64> {
        let mut row = Vec::with_capacity(self.design_width());
        row.push(1.0);
        for term in &self.terms {
            match term {
                Term::Linear(var) => row.push(value_of(var)),
                Term::Poly { var, degree } => {
                    let x = value_of(var);
                    for d in 1..=*degree {
                        row.push(x.powi(d as i32));
                    }
                }
            }
        }
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detector_classifies_known_wrappers_in_order() {
        assert_eq!(Transform::detect("log(emissions)"), Transform::Log);
        assert_eq!(Transform::detect("log10(emissions)"), Transform::Log10);
        assert_eq!(Transform::detect("sqrt(emissions)"), Transform::Sqrt);
        assert_eq!(Transform::detect("emissions"), Transform::Identity);
    }

    #[test]
    fn detector_falls_back_to_identity_on_unknown_wrappers() {
        assert_eq!(Transform::detect("asinh(emissions)"), Transform::Identity);
        assert_eq!(Transform::detect("cbrt(emissions)"), Transform::Identity);
    }

    #[test]
    fn inverse_expressions_match_their_kind() {
        assert_eq!(Transform::Log.inverse_expr(), "exp(y)");
        assert_eq!(Transform::Log10.inverse_expr(), "10^y");
        assert_eq!(Transform::Sqrt.inverse_expr(), "y^2");
        assert_eq!(Transform::Identity.inverse_expr(), "y");
    }

    #[test]
    fn transform_and_inverse_round_trip() {
        for t in [Transform::Log, Transform::Log10, Transform::Sqrt, Transform::Identity] {
            let y = 42.5;
            assert!((t.inverse(t.apply(y)) - y).abs() < 1e-9, "{}", t.as_str());
        }
    }

    #[test]
    fn parses_transform_and_poly_terms() {
        let f = Formula::parse("log(emissions) ~ vmt + poly(year, 2)").unwrap();
        assert_eq!(f.response(), "emissions");
        assert_eq!(f.transform(), Transform::Log);
        assert_eq!(
            f.terms(),
            &[
                Term::Linear("vmt".into()),
                Term::Poly {
                    var: "year".into(),
                    degree: 2
                }
            ]
        );
        assert_eq!(f.design_width(), 4);
        assert_eq!(f.predictors(), vec!["vmt", "year"]);
    }

    #[test]
    fn design_row_expands_polynomials_raw() {
        let f = Formula::parse("emissions ~ poly(year, 3)").unwrap();
        let row = f.design_row(|_| 2.0);
        assert_eq!(row, vec![1.0, 2.0, 4.0, 8.0]);
    }

    #[test]
    fn rejects_malformed_formulas() {
        assert!(matches!(
            Formula::parse("emissions").unwrap_err(),
            Error::ModelFit { .. }
        ));
        assert!(Formula::parse("emissions ~ ").is_err());
        assert!(Formula::parse("emissions ~ vmt * year").is_err());
        assert!(Formula::parse("emissions ~ poly(year, 0)").is_err());
    }
}
