//! Model comparison by PSIS-LOO expected log predictive density.
//!
//! Models are compared on the same observations, so the standard error of a
//! difference is computed from the pointwise differences rather than from the
//! two models' standard errors. Pairing removes the variation the models
//! share.

use crate::psis::{psisloo, total_se, LogLikMatrix, PsisConfig, PsisError, PsisLoo};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use thiserror::Error;

/// Errors from model comparison
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompareError {
    #[error("At least two models are required, got {0}")]
    TooFewModels(usize),

    #[error("Model '{model}' has {found} observations, expected {expected}")]
    ShapeMismatch {
        model: String,
        expected: usize,
        found: usize,
    },

    #[error("Duplicate model name: {0}")]
    DuplicateName(String),

    #[error(transparent)]
    Psis(#[from] PsisError),
}

/// A model's contribution to a comparison
#[derive(Debug, Clone)]
pub enum ModelLoo {
    /// Already computed PSIS-LOO result
    Loo(PsisLoo),
    /// Pointwise log-likelihoods; PSIS-LOO is run on them
    LogLik(LogLikMatrix),
}

impl ModelLoo {
    fn n_observations(&self) -> usize {
        match self {
            Self::Loo(loo) => loo.n_observations(),
            Self::LogLik(m) => m.n_observations(),
        }
    }

    fn into_loo(self, config: &PsisConfig) -> Result<PsisLoo, PsisError> {
        match self {
            Self::Loo(loo) => Ok(loo),
            Self::LogLik(m) => psisloo(&m, config),
        }
    }
}

impl From<PsisLoo> for ModelLoo {
    fn from(loo: PsisLoo) -> Self {
        Self::Loo(loo)
    }
}

impl From<LogLikMatrix> for ModelLoo {
    fn from(m: LogLikMatrix) -> Self {
        Self::LogLik(m)
    }
}

/// Difference in ELPD between two models with its paired standard error
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ElpdDifference {
    /// Summed pointwise difference
    pub diff: f64,
    /// Standard error of `diff`
    pub se_diff: f64,
}

/// One row of a comparison table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonRow {
    /// Model name
    pub name: String,
    /// Total ELPD
    pub elpd_loo: f64,
    /// Standard error of `elpd_loo`
    pub se_elpd_loo: f64,
    /// `elpd_best - elpd_loo`; `None` for the best model
    pub elpd_diff: Option<f64>,
    /// Paired standard error of `elpd_diff`; `None` for the best model
    pub se_diff: Option<f64>,
    /// Observations with Pareto k above threshold
    pub n_unreliable: usize,
}

/// Models ranked by ELPD, best first
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonTable {
    /// Rows in rank order
    pub rows: Vec<ComparisonRow>,
    /// Observations each model was evaluated on
    pub n_observations: usize,
}

impl ComparisonTable {
    /// The highest-ranked model; `None` only for a hand-built empty table
    #[must_use]
    pub fn best(&self) -> Option<&ComparisonRow> {
        self.rows.first()
    }

    /// Model names in rank order
    #[must_use]
    pub fn ranking(&self) -> Vec<&str> {
        self.rows.iter().map(|r| r.name.as_str()).collect()
    }

    /// Look up a row by model name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ComparisonRow> {
        self.rows.iter().find(|r| r.name == name)
    }
}

/// Paired comparison of two models on the same observations.
///
/// `diff` is `Σ (b_i - a_i)`, so a positive value means `b` predicts better.
///
/// # Errors
///
/// Returns `CompareError::ShapeMismatch` when the observation counts differ.
pub fn elpd_difference(a: &PsisLoo, b: &PsisLoo) -> Result<ElpdDifference, CompareError> {
    if a.n_observations() != b.n_observations() {
        return Err(CompareError::ShapeMismatch {
            model: "b".to_string(),
            expected: a.n_observations(),
            found: b.n_observations(),
        });
    }
    let diffs = pointwise_diff(b, a);
    Ok(ElpdDifference {
        diff: diffs.iter().sum(),
        se_diff: total_se(&diffs),
    })
}

/// Rank two or more models by PSIS-LOO ELPD.
///
/// Inputs keep their order for ties. Every model must have the same number
/// of observations; this is checked for all models before any PSIS-LOO is
/// computed.
///
/// # Errors
///
/// Returns `CompareError` for fewer than two models, a repeated name, a
/// mismatched observation count, or a PSIS failure on a raw matrix.
pub fn loo_compare(
    models: Vec<(String, ModelLoo)>,
    config: &PsisConfig,
) -> Result<ComparisonTable, CompareError> {
    if models.len() < 2 {
        return Err(CompareError::TooFewModels(models.len()));
    }

    let mut seen = HashSet::new();
    for (name, _) in &models {
        if !seen.insert(name.as_str()) {
            return Err(CompareError::DuplicateName(name.clone()));
        }
    }

    let expected = models[0].1.n_observations();
    if let Some((name, model)) = models
        .iter()
        .find(|(_, model)| model.n_observations() != expected)
    {
        return Err(CompareError::ShapeMismatch {
            model: name.clone(),
            expected,
            found: model.n_observations(),
        });
    }

    let mut results = Vec::with_capacity(models.len());
    for (name, model) in models {
        let loo = model.into_loo(config)?;
        results.push((name, loo));
    }

    // stable: ties keep input order
    results.sort_by(|(_, a), (_, b)| {
        b.elpd_loo
            .partial_cmp(&a.elpd_loo)
            .unwrap_or(Ordering::Equal)
    });

    let (_, best) = &results[0];
    let rows = results
        .iter()
        .enumerate()
        .map(|(rank, (name, loo))| {
            let (elpd_diff, se_diff) = if rank == 0 {
                (None, None)
            } else {
                let diffs = pointwise_diff(best, loo);
                (Some(best.elpd_loo - loo.elpd_loo), Some(total_se(&diffs)))
            };
            ComparisonRow {
                name: name.clone(),
                elpd_loo: loo.elpd_loo,
                se_elpd_loo: loo.se_elpd_loo,
                elpd_diff,
                se_diff,
                n_unreliable: loo.count_above(config.k_threshold),
            }
        })
        .collect();

    tracing::info!(
        models = results.len(),
        best = %results[0].0,
        n_observations = expected,
        "Models compared"
    );
    Ok(ComparisonTable {
        rows,
        n_observations: expected,
    })
}

fn pointwise_diff(minuend: &PsisLoo, subtrahend: &PsisLoo) -> Vec<f64> {
    minuend
        .pointwise
        .iter()
        .zip(&subtrahend.pointwise)
        .map(|(m, s)| m.elpd - s.elpd)
        .collect()
}
