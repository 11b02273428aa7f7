//! Pareto smoothed importance sampling (PSIS) and PSIS leave-one-out
//! cross-validation.
//!
//! Given pointwise log-likelihoods `log p(y_i | θ_s)` for posterior draws
//! `s = 1..S` and observations `i = 1..N`, the leave-one-out predictive
//! density of each observation is estimated by importance sampling with
//! ratios `1 / p(y_i | θ_s)`. The upper tail of those ratios is replaced by
//! quantiles of a fitted generalized Pareto distribution (GPD), which
//! stabilizes the estimate and yields the shape parameter `k` as a
//! reliability diagnostic.
//!
//! ## Conventions
//!
//! - Matrices are draws × observations. [`LogLikMatrix`] requires the caller
//!   to state the layout of the input and never guesses.
//! - Every function here is pure: no IO, no randomness.
//!
//! ## References
//!
//! - Vehtari, Gelman and Gabry (2017). Practical Bayesian model evaluation
//!   using leave-one-out cross-validation and WAIC.
//! - Vehtari, Simpson, Gelman, Yao and Gabry (2024). Pareto smoothed
//!   importance sampling.
//! - Zhang and Stephens (2009). A new and efficient estimation method for the
//!   generalized Pareto distribution.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from PSIS computations. All of them signal invalid input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PsisError {
    #[error("Invalid log-likelihood input: {0}")]
    InvalidInput(String),

    #[error("Non-finite value {value} at draw {draw}, observation {observation}")]
    NonFinite {
        draw: usize,
        observation: usize,
        value: f64,
    },

    #[error(
        "Too few draws for tail estimation: {draws} draws give {tail_len} tail points, need at least {min_tail_len}"
    )]
    TooFewDraws {
        draws: usize,
        tail_len: usize,
        min_tail_len: usize,
    },
}

/// Orientation of a log-likelihood matrix supplied by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layout {
    /// Rows are posterior draws, columns are observations
    DrawsByObservations,
    /// Rows are observations, columns are posterior draws
    ObservationsByDraws,
}

/// Pointwise log-likelihood matrix, stored draws × observations.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLikMatrix {
    values: Array2<f64>,
}

impl LogLikMatrix {
    /// Validate and wrap a matrix in the stated layout.
    ///
    /// # Errors
    ///
    /// Returns `PsisError::InvalidInput` for an empty matrix or fewer than
    /// two draws, and `PsisError::NonFinite` for NaN or infinite entries.
    pub fn new(values: Array2<f64>, layout: Layout) -> Result<Self, PsisError> {
        let values = match layout {
            Layout::DrawsByObservations => values,
            Layout::ObservationsByDraws => values.reversed_axes().as_standard_layout().into_owned(),
        };
        validate_matrix(values.view())?;
        Ok(Self { values })
    }

    /// Build from nested rows in the stated layout.
    ///
    /// # Errors
    ///
    /// Returns `PsisError::InvalidInput` for ragged rows, plus everything
    /// [`Self::new`] rejects.
    pub fn from_rows(rows: &[Vec<f64>], layout: Layout) -> Result<Self, PsisError> {
        let width = rows.first().map_or(0, Vec::len);
        if let Some(i) = rows.iter().position(|row| row.len() != width) {
            return Err(PsisError::InvalidInput(format!(
                "ragged rows: row {i} has {} entries, expected {width}",
                rows[i].len()
            )));
        }
        let flat: Vec<f64> = rows.iter().flatten().copied().collect();
        let values = Array2::from_shape_vec((rows.len(), width), flat)
            .map_err(|e| PsisError::InvalidInput(e.to_string()))?;
        Self::new(values, layout)
    }

    /// Number of posterior draws
    #[must_use]
    pub fn n_draws(&self) -> usize {
        self.values.nrows()
    }

    /// Number of observations
    #[must_use]
    pub fn n_observations(&self) -> usize {
        self.values.ncols()
    }

    /// Draws × observations view
    #[must_use]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.values.view()
    }
}

/// Tunable constants of the smoothing procedure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PsisConfig {
    /// Fraction of draws in the tail
    #[serde(default = "default_tail_fraction")]
    pub tail_fraction: f64,
    /// Multiplier on `sqrt(S)` capping the tail length
    #[serde(default = "default_tail_sqrt_factor")]
    pub tail_sqrt_factor: f64,
    /// Fewest tail points a GPD fit is attempted with
    #[serde(default = "default_min_tail_len")]
    pub min_tail_len: usize,
    /// Truncate weights above `S^truncation` times their mean; `None` disables
    #[serde(default = "default_truncation")]
    pub truncation: Option<f64>,
    /// Pareto k above which an observation's estimate is flagged
    #[serde(default = "default_k_threshold")]
    pub k_threshold: f64,
}

const fn default_tail_fraction() -> f64 {
    0.2
}
const fn default_tail_sqrt_factor() -> f64 {
    3.0
}
const fn default_min_tail_len() -> usize {
    5
}
const fn default_truncation() -> Option<f64> {
    Some(0.75)
}
const fn default_k_threshold() -> f64 {
    0.7
}

impl Default for PsisConfig {
    fn default() -> Self {
        Self {
            tail_fraction: default_tail_fraction(),
            tail_sqrt_factor: default_tail_sqrt_factor(),
            min_tail_len: default_min_tail_len(),
            truncation: default_truncation(),
            k_threshold: default_k_threshold(),
        }
    }
}

impl PsisConfig {
    /// Check the constants are usable
    ///
    /// # Errors
    ///
    /// Returns `PsisError::InvalidInput` naming the offending setting.
    pub fn validate(&self) -> Result<(), PsisError> {
        if !(self.tail_fraction > 0.0 && self.tail_fraction < 1.0) {
            return Err(PsisError::InvalidInput(format!(
                "tail_fraction must be in (0, 1), got {}",
                self.tail_fraction
            )));
        }
        if !(self.tail_sqrt_factor > 0.0 && self.tail_sqrt_factor.is_finite()) {
            return Err(PsisError::InvalidInput(format!(
                "tail_sqrt_factor must be positive, got {}",
                self.tail_sqrt_factor
            )));
        }
        if self.min_tail_len < 2 {
            return Err(PsisError::InvalidInput(format!(
                "min_tail_len must be at least 2, got {}",
                self.min_tail_len
            )));
        }
        if let Some(t) = self.truncation {
            if !(t > 0.0 && t <= 1.0) {
                return Err(PsisError::InvalidInput(format!(
                    "truncation must be in (0, 1], got {t}"
                )));
            }
        }
        if !self.k_threshold.is_finite() {
            return Err(PsisError::InvalidInput("k_threshold must be finite".to_string()));
        }
        Ok(())
    }

    /// Number of tail draws used for `n_draws` draws:
    /// `ceil(min(tail_fraction * S, tail_sqrt_factor * sqrt(S)))`.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn tail_len(&self, n_draws: usize) -> usize {
        let s = n_draws as f64;
        let len = (self.tail_fraction * s)
            .min(self.tail_sqrt_factor * s.sqrt())
            .ceil() as usize;
        len.min(n_draws.saturating_sub(1))
    }
}

/// Result of a generalized Pareto fit
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpdFit {
    /// Shape parameter
    pub k: f64,
    /// Scale parameter
    pub sigma: f64,
}

/// Per-observation PSIS-LOO quantities
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PointwiseLoo {
    /// Leave-one-out expected log predictive density
    pub elpd: f64,
    /// Pareto shape diagnostic
    pub pareto_k: f64,
    /// Full-posterior log predictive density, when computed from draws
    pub lpd: Option<f64>,
}

/// Summary of the Pareto k diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ParetoKSummary {
    /// Observations summarized
    pub n_observations: usize,
    /// Share with k > 0.5 (variance of raw ratios infinite)
    pub frac_above_half: f64,
    /// Share with k above the configured threshold
    pub frac_above_threshold: f64,
    /// Share with k > 1 (mean of raw ratios infinite)
    pub frac_above_one: f64,
    /// Threshold used
    pub threshold: f64,
    /// Largest k
    pub max_k: f64,
}

/// PSIS-LOO estimate for one model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PsisLoo {
    /// Sum of pointwise leave-one-out ELPD
    pub elpd_loo: f64,
    /// Standard error of `elpd_loo`
    pub se_elpd_loo: f64,
    /// Sum of full-posterior log predictive densities
    pub lpd: Option<f64>,
    /// Effective number of parameters, `lpd - elpd_loo`
    pub p_loo: Option<f64>,
    /// Per-observation values, in input order
    pub pointwise: Vec<PointwiseLoo>,
    /// Smoothed, normalized log weights (draws × observations)
    #[serde(skip)]
    pub log_weights: Option<Array2<f64>>,
    /// Threshold used for [`Self::unreliable_observations`]
    pub k_threshold: f64,
}

impl PsisLoo {
    /// Assemble a result from precomputed pointwise ELPD and k values.
    ///
    /// # Errors
    ///
    /// Returns `PsisError::InvalidInput` when the vectors are empty, differ in
    /// length, or contain a non-finite ELPD.
    pub fn from_pointwise(elpd: &[f64], pareto_k: &[f64]) -> Result<Self, PsisError> {
        if elpd.is_empty() {
            return Err(PsisError::InvalidInput("no observations".to_string()));
        }
        if elpd.len() != pareto_k.len() {
            return Err(PsisError::InvalidInput(format!(
                "{} ELPD values but {} Pareto k values",
                elpd.len(),
                pareto_k.len()
            )));
        }
        if let Some(i) = elpd.iter().position(|v| !v.is_finite()) {
            return Err(PsisError::InvalidInput(format!(
                "non-finite ELPD at observation {i}"
            )));
        }

        let pointwise = elpd
            .iter()
            .zip(pareto_k)
            .map(|(&elpd, &pareto_k)| PointwiseLoo {
                elpd,
                pareto_k,
                lpd: None,
            })
            .collect();
        Ok(Self::from_parts(pointwise, None, default_k_threshold()))
    }

    fn from_parts(
        pointwise: Vec<PointwiseLoo>,
        log_weights: Option<Array2<f64>>,
        k_threshold: f64,
    ) -> Self {
        let elpd: Vec<f64> = pointwise.iter().map(|p| p.elpd).collect();
        let elpd_loo: f64 = elpd.iter().sum();
        let se_elpd_loo = total_se(&elpd);
        let lpd: Option<f64> = pointwise.iter().map(|p| p.lpd).sum();
        Self {
            elpd_loo,
            se_elpd_loo,
            lpd,
            p_loo: lpd.map(|lpd| lpd - elpd_loo),
            pointwise,
            log_weights,
            k_threshold,
        }
    }

    /// Use `k_threshold` for [`Self::unreliable_observations`] and the summary
    #[must_use]
    pub const fn with_k_threshold(mut self, k_threshold: f64) -> Self {
        self.k_threshold = k_threshold;
        self
    }

    /// Number of observations
    #[must_use]
    pub fn n_observations(&self) -> usize {
        self.pointwise.len()
    }

    /// Pointwise ELPD values in observation order
    #[must_use]
    pub fn pointwise_elpd(&self) -> Vec<f64> {
        self.pointwise.iter().map(|p| p.elpd).collect()
    }

    /// Pareto k values in observation order
    #[must_use]
    pub fn pareto_k(&self) -> Vec<f64> {
        self.pointwise.iter().map(|p| p.pareto_k).collect()
    }

    /// LOO information criterion, on the deviance scale
    #[must_use]
    pub fn looic(&self) -> f64 {
        -2.0 * self.elpd_loo
    }

    /// Standard error of [`Self::looic`]
    #[must_use]
    pub fn se_looic(&self) -> f64 {
        2.0 * self.se_elpd_loo
    }

    /// Indices of observations whose k exceeds the threshold
    #[must_use]
    pub fn unreliable_observations(&self) -> Vec<usize> {
        self.pointwise
            .iter()
            .enumerate()
            .filter(|(_, p)| exceeds(p.pareto_k, self.k_threshold))
            .map(|(i, _)| i)
            .collect()
    }

    /// Number of observations whose k exceeds `threshold`, regardless of the
    /// threshold stored in this result
    #[must_use]
    pub fn count_above(&self, threshold: f64) -> usize {
        self.pointwise
            .iter()
            .filter(|p| exceeds(p.pareto_k, threshold))
            .count()
    }

    /// Whether every observation's k is at or below the threshold
    #[must_use]
    pub fn is_reliable(&self) -> bool {
        self.unreliable_observations().is_empty()
    }

    /// Share of observations above 0.5, the threshold and 1
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn summary(&self) -> ParetoKSummary {
        let n = self.pointwise.len();
        let share = |limit: f64| {
            let count = self
                .pointwise
                .iter()
                .filter(|p| p.pareto_k > limit)
                .count();
            if n == 0 {
                0.0
            } else {
                count as f64 / n as f64
            }
        };
        ParetoKSummary {
            n_observations: n,
            frac_above_half: share(0.5),
            frac_above_threshold: share(self.k_threshold),
            frac_above_one: share(1.0),
            threshold: self.k_threshold,
            max_k: self
                .pointwise
                .iter()
                .map(|p| p.pareto_k)
                .fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

/// NaN k counts as unreliable
fn exceeds(k: f64, threshold: f64) -> bool {
    k.is_nan() || k > threshold
}

/// PSIS leave-one-out cross-validation.
///
/// Computes the smoothed importance weights of every observation, its LOO
/// predictive density and Pareto k, and the totals. Observations with k above
/// `config.k_threshold` are kept in the result and reported with a warning.
///
/// # Errors
///
/// Returns `PsisError` for invalid constants or when the draw count leaves
/// fewer than `config.min_tail_len` tail points.
#[allow(clippy::cast_precision_loss)]
pub fn psisloo(log_lik: &LogLikMatrix, config: &PsisConfig) -> Result<PsisLoo, PsisError> {
    let log_lik = log_lik.view();
    let (log_weights, ks) = psislw(log_lik.mapv(|v| -v).view(), config)?;

    let log_s = (log_lik.nrows() as f64).ln();
    let pointwise: Vec<PointwiseLoo> = log_lik
        .axis_iter(Axis(1))
        .zip(log_weights.axis_iter(Axis(1)))
        .zip(ks.iter())
        .map(|((ll, lw), &k)| {
            let weighted = &lw + &ll;
            PointwiseLoo {
                elpd: log_sum_exp(weighted.view()) - log_sum_exp(lw),
                pareto_k: k,
                lpd: Some(log_sum_exp(ll) - log_s),
            }
        })
        .collect();

    let result = PsisLoo::from_parts(pointwise, Some(log_weights), config.k_threshold);

    let flagged = result.unreliable_observations();
    if !flagged.is_empty() {
        tracing::warn!(
            count = flagged.len(),
            n_observations = result.n_observations(),
            threshold = config.k_threshold,
            max_k = result.summary().max_k,
            "Pareto k exceeds threshold; PSIS-LOO estimate is unreliable for some observations"
        );
    }
    tracing::debug!(
        elpd_loo = result.elpd_loo,
        se = result.se_elpd_loo,
        "PSIS-LOO computed"
    );

    Ok(result)
}

/// Pareto smoothed importance sampling.
///
/// `log_weights` holds raw log importance ratios, draws × sets. Returns the
/// smoothed log weights, each column normalized so its exponentials sum to
/// one, and the Pareto k of each column. A column whose tail cannot be fit
/// (all tail values equal) is left unsmoothed with `k = +inf`.
///
/// # Errors
///
/// Returns `PsisError` for invalid input or constants, or when the draw count
/// leaves fewer than `config.min_tail_len` tail points.
pub fn psislw(
    log_weights: ArrayView2<'_, f64>,
    config: &PsisConfig,
) -> Result<(Array2<f64>, Array1<f64>), PsisError> {
    config.validate()?;
    validate_matrix(log_weights)?;

    let n_draws = log_weights.nrows();
    let tail_len = config.tail_len(n_draws);
    if tail_len < config.min_tail_len {
        return Err(PsisError::TooFewDraws {
            draws: n_draws,
            tail_len,
            min_tail_len: config.min_tail_len,
        });
    }

    let mut smoothed = log_weights.to_owned();
    let mut ks = Array1::zeros(log_weights.ncols());
    for (mut column, k) in smoothed.axis_iter_mut(Axis(1)).zip(ks.iter_mut()) {
        let mut x = column.to_vec();
        *k = smooth_column(&mut x, tail_len, config);
        column.assign(&ArrayView1::from(&x));
    }

    Ok((smoothed, ks))
}

/// Smooth one set of log weights in place and return its Pareto k.
#[allow(clippy::cast_precision_loss, clippy::float_cmp)]
fn smooth_column(x: &mut [f64], tail_len: usize, config: &PsisConfig) -> f64 {
    let n = x.len();
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    for v in x.iter_mut() {
        *v -= max;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| x[a].total_cmp(&x[b]));

    let cutoff = x[order[n - tail_len - 1]].max(f64::MIN_POSITIVE.ln());
    let tail_ids: Vec<usize> = order[n - tail_len..]
        .iter()
        .copied()
        .filter(|&i| x[i] > cutoff)
        .collect();

    let mut k = f64::INFINITY;
    let all_equal = tail_ids.iter().all(|&i| x[i] == x[tail_ids[0]]);
    if tail_ids.len() >= config.min_tail_len && !all_equal {
        let exp_cutoff = cutoff.exp();
        let excess: Vec<f64> = tail_ids.iter().map(|&i| x[i].exp() - exp_cutoff).collect();

        if let Some(fit) = gpdfit(&excess).filter(|f| f.k.is_finite() && f.sigma > 0.0) {
            let m = tail_ids.len() as f64;
            for (rank, &i) in tail_ids.iter().enumerate() {
                let p = (rank as f64 + 0.5) / m;
                x[i] = (gpinv(p, fit.k, fit.sigma) + exp_cutoff).ln();
            }
            k = fit.k;
        }
    }

    if let Some(truncation) = config.truncation {
        let log_n = (n as f64).ln();
        let limit = truncation * log_n - log_n + log_sum_exp(ArrayView1::from(&*x));
        for v in x.iter_mut() {
            if *v > limit {
                *v = limit;
            }
        }
    }

    let total = log_sum_exp(ArrayView1::from(&*x));
    for v in x.iter_mut() {
        *v -= total;
    }

    k
}

/// Fit a generalized Pareto distribution to positive exceedances.
///
/// Empirical Bayes estimate of Zhang and Stephens (2009), returning `k` in
/// the usual sign convention (positive for heavy tails). `x` must be sorted
/// ascending. Returns `None` for fewer than two points or a non-positive
/// lower quartile.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn gpdfit(x: &[f64]) -> Option<GpdFit> {
    let n = x.len();
    if n < 2 {
        return None;
    }
    let n_f = n as f64;
    let quartile = x[((n_f / 4.0 + 0.5).floor() as usize).max(1) - 1];
    let x_max = x[n - 1];
    if quartile <= 0.0 || x_max <= 0.0 {
        return None;
    }

    let m = 80 + n_f.sqrt().floor() as usize;
    let m_f = m as f64;
    let bs: Vec<f64> = (1..=m)
        .map(|j| (1.0 - (m_f / (j as f64 - 0.5)).sqrt()) / (3.0 * quartile) + 1.0 / x_max)
        .collect();

    let log_lik: Vec<f64> = bs
        .iter()
        .map(|&b| {
            let k = x.iter().map(|&v| (-b * v).ln_1p()).sum::<f64>() / n_f;
            n_f * ((-b / k).ln() - k - 1.0)
        })
        .collect();

    let mut weights: Vec<f64> = log_lik
        .iter()
        .map(|&lj| 1.0 / log_lik.iter().map(|&l| (l - lj).exp()).sum::<f64>())
        .collect();

    // drop negligible weights before normalizing
    for w in &mut weights {
        if *w < 10.0 * f64::EPSILON {
            *w = 0.0;
        }
    }
    let total: f64 = weights.iter().sum();
    if total.is_nan() || total <= 0.0 {
        return None;
    }

    let b: f64 = bs.iter().zip(&weights).map(|(b, w)| b * w).sum::<f64>() / total;
    let k = x.iter().map(|&v| (-b * v).ln_1p()).sum::<f64>() / n_f;
    let sigma = -k / b;

    Some(GpdFit { k, sigma })
}

/// Inverse CDF of the generalized Pareto distribution with location zero.
///
/// Returns NaN for `sigma <= 0` or `p` outside `[0, 1]`.
#[must_use]
pub fn gpinv(p: f64, k: f64, sigma: f64) -> f64 {
    if sigma.is_nan() || sigma <= 0.0 || !(0.0..=1.0).contains(&p) {
        return f64::NAN;
    }
    if p == 0.0 {
        return 0.0;
    }
    if p == 1.0 {
        return if k >= 0.0 { f64::INFINITY } else { -sigma / k };
    }
    if k.abs() < f64::EPSILON {
        -(-p).ln_1p() * sigma
    } else {
        (-k * (-p).ln_1p()).exp_m1() / k * sigma
    }
}

/// `ln(Σ exp(x))` without overflow.
#[must_use]
pub fn log_sum_exp(x: ArrayView1<'_, f64>) -> f64 {
    let max = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    max + x.iter().map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Standard error of a sum of `n` pointwise terms: `sqrt(n · var)`, with the
/// sample variance. Zero for fewer than two terms.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn total_se(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean = values.iter().sum::<f64>() / n_f;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n_f - 1.0);
    (n_f * var).sqrt()
}

fn validate_matrix(values: ArrayView2<'_, f64>) -> Result<(), PsisError> {
    if values.is_empty() {
        return Err(PsisError::InvalidInput(format!(
            "matrix is empty ({} x {})",
            values.nrows(),
            values.ncols()
        )));
    }
    if values.nrows() < 2 {
        return Err(PsisError::InvalidInput(format!(
            "need at least two draws, got {}",
            values.nrows()
        )));
    }
    if let Some(((draw, observation), &value)) =
        values.indexed_iter().find(|(_, v)| !v.is_finite())
    {
        return Err(PsisError::NonFinite {
            draw,
            observation,
            value,
        });
    }
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    clippy::cast_precision_loss,
    clippy::cast_lossless
)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::{array, Array};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    /// Column whose importance ratios follow a Pareto law with the given
    /// shape, laid out on a deterministic quantile grid.
    fn pareto_ratio_column(n: usize, shape: f64) -> Vec<f64> {
        (0..n)
            .map(|j| {
                let u = (j as f64 + 0.5) / n as f64;
                shape * (1.0 - u).ln()
            })
            .collect()
    }

    fn random_log_lik(draws: usize, obs: usize, seed: u64) -> LogLikMatrix {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let values = Array::from_shape_fn((draws, obs), |_| -1.0 - rng.gen::<f64>() * 2.0);
        LogLikMatrix::new(values, Layout::DrawsByObservations).unwrap()
    }

    // =========================================================================
    // Input validation
    // =========================================================================

    #[test]
    fn test_layout_is_explicit() {
        let obs_by_draws = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let m = LogLikMatrix::new(obs_by_draws.clone(), Layout::ObservationsByDraws).unwrap();
        assert_eq!(m.n_draws(), 3);
        assert_eq!(m.n_observations(), 2);
        assert_eq!(m.view(), obs_by_draws.t());

        let m = LogLikMatrix::new(obs_by_draws, Layout::DrawsByObservations).unwrap();
        assert_eq!(m.n_draws(), 2);
    }

    #[test]
    fn test_rejects_non_finite() {
        let err = LogLikMatrix::new(
            array![[-1.0, -2.0], [f64::NAN, -1.0]],
            Layout::DrawsByObservations,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PsisError::NonFinite {
                draw: 1,
                observation: 0,
                ..
            }
        ));

        let err = LogLikMatrix::new(array![[-1.0], [f64::INFINITY]], Layout::DrawsByObservations)
            .unwrap_err();
        assert!(matches!(err, PsisError::NonFinite { draw: 1, .. }));
    }

    #[test]
    fn test_rejects_empty_and_single_draw() {
        let empty = Array2::<f64>::zeros((0, 4));
        assert!(matches!(
            LogLikMatrix::new(empty, Layout::DrawsByObservations),
            Err(PsisError::InvalidInput(_))
        ));
        assert!(matches!(
            LogLikMatrix::new(array![[-1.0, -2.0]], Layout::DrawsByObservations),
            Err(PsisError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_from_rows_ragged() {
        let rows = vec![vec![-1.0, -2.0], vec![-1.0]];
        let err = LogLikMatrix::from_rows(&rows, Layout::DrawsByObservations).unwrap_err();
        assert!(err.to_string().contains("ragged"));
    }

    #[test]
    fn test_three_draws_rejected() {
        let m = LogLikMatrix::from_rows(
            &[vec![-1.0, -2.0], vec![-1.5, -2.5], vec![-0.5, -1.0]],
            Layout::DrawsByObservations,
        )
        .unwrap();
        let err = psisloo(&m, &PsisConfig::default()).unwrap_err();
        assert_eq!(
            err,
            PsisError::TooFewDraws {
                draws: 3,
                tail_len: 1,
                min_tail_len: 5
            }
        );
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    #[test]
    fn test_tail_len() {
        let config = PsisConfig::default();
        assert_eq!(config.tail_len(1000), 95);
        assert_eq!(config.tail_len(4000), 190);
        assert_eq!(config.tail_len(25), 5);
        assert_eq!(config.tail_len(20), 4);
        assert_eq!(config.tail_len(3), 1);
    }

    #[test]
    fn test_config_validate() {
        assert!(PsisConfig::default().validate().is_ok());

        let bad = PsisConfig {
            tail_fraction: 1.5,
            ..PsisConfig::default()
        };
        assert!(bad.validate().is_err());

        let bad = PsisConfig {
            min_tail_len: 1,
            ..PsisConfig::default()
        };
        assert!(bad.validate().is_err());

        let no_trunc = PsisConfig {
            truncation: None,
            ..PsisConfig::default()
        };
        assert!(no_trunc.validate().is_ok());
    }

    #[test]
    fn test_config_from_yaml_partial() {
        let config: PsisConfig = serde_yaml::from_str("k_threshold: 0.5\ntruncation: null").unwrap();
        assert_eq!(config.k_threshold, 0.5);
        assert!(config.truncation.is_none());
        assert_eq!(config.min_tail_len, 5);
    }

    // =========================================================================
    // Numerical building blocks
    // =========================================================================

    #[test]
    fn test_log_sum_exp() {
        let x = array![1000.0, 1000.0];
        assert_relative_eq!(log_sum_exp(x.view()), 1000.0 + 2f64.ln(), epsilon = 1e-12);

        let x = array![f64::NEG_INFINITY, f64::NEG_INFINITY];
        assert_eq!(log_sum_exp(x.view()), f64::NEG_INFINITY);
    }

    #[test]
    fn test_gpinv_edges() {
        assert_eq!(gpinv(0.0, 0.5, 1.0), 0.0);
        assert_eq!(gpinv(1.0, 0.5, 1.0), f64::INFINITY);
        assert_relative_eq!(gpinv(1.0, -0.5, 2.0), 4.0);
        assert!(gpinv(0.5, 0.5, 0.0).is_nan());
        assert!(gpinv(1.5, 0.5, 1.0).is_nan());
        // exponential limit
        assert_relative_eq!(gpinv(0.5, 0.0, 1.0), 2f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_gpinv_matches_closed_form() {
        let (k, sigma, p): (f64, f64, f64) = (0.4, 1.3, 0.8);
        let expected = sigma / k * ((1.0 - p).powf(-k) - 1.0);
        assert_relative_eq!(gpinv(p, k, sigma), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_gpdfit_recovers_shape() {
        for &true_k in &[0.2, 0.5, 0.9] {
            let sigma = 1.0;
            let n = 2000;
            let x: Vec<f64> = (0..n)
                .map(|j| gpinv((j as f64 + 0.5) / n as f64, true_k, sigma))
                .collect();
            let fit = gpdfit(&x).unwrap();
            assert!(
                (fit.k - true_k).abs() < 0.15,
                "true k {true_k}, estimated {}",
                fit.k
            );
            assert!((fit.sigma - sigma).abs() < 0.25, "sigma {}", fit.sigma);
        }
    }

    #[test]
    fn test_gpdfit_degenerate() {
        assert!(gpdfit(&[1.0]).is_none());
        assert!(gpdfit(&[0.0, 0.0, 1.0, 2.0]).is_none());
    }

    #[test]
    fn test_total_se() {
        assert_eq!(total_se(&[1.0]), 0.0);
        // sample variance of [1, 2, 3] is 1
        assert_relative_eq!(total_se(&[1.0, 2.0, 3.0]), 3f64.sqrt());
    }

    // =========================================================================
    // Smoothing
    // =========================================================================

    #[test]
    fn test_psislw_columns_normalized() {
        let m = random_log_lik(400, 6, 7);
        let (lw, ks) = psislw(m.view().mapv(|v| -v).view(), &PsisConfig::default()).unwrap();
        assert_eq!(lw.dim(), (400, 6));
        assert_eq!(ks.len(), 6);
        for column in lw.axis_iter(Axis(1)) {
            let total: f64 = column.iter().map(|v| v.exp()).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_truncation_caps_largest_weight() {
        let n = 1000;
        let log_weights = Array2::from_shape_vec((n, 1), pareto_ratio_column(n, 1.2))
            .unwrap()
            .mapv(|v| -v);
        let uncapped_config = PsisConfig {
            truncation: None,
            ..PsisConfig::default()
        };
        let (capped, k_capped) = psislw(log_weights.view(), &PsisConfig::default()).unwrap();
        let (uncapped, k_uncapped) = psislw(log_weights.view(), &uncapped_config).unwrap();

        // truncation happens after the fit
        assert_eq!(k_capped[0], k_uncapped[0]);
        assert!(k_capped[0] > 0.7);

        let max = |a: &Array2<f64>| a.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let min = |a: &Array2<f64>| a.iter().copied().fold(f64::INFINITY, f64::min);
        assert!(max(&capped) < max(&uncapped));

        // untouched weights differ only by the renormalization shift, so the
        // cap sits at S^(3/4) times the mean weight of the smoothed column
        let log_s = (n as f64).ln();
        let cap = 0.75 * log_s - log_s;
        let shift = min(&capped) - min(&uncapped);
        assert_relative_eq!(max(&capped) - shift, cap, epsilon = 1e-9);
        assert!(max(&uncapped) > cap);

        for smoothed in [&capped, &uncapped] {
            let total: f64 = smoothed.iter().map(|v| v.exp()).sum();
            assert_relative_eq!(total, 1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_heavy_tail_flagged() {
        let n = 1000;
        let values = Array2::from_shape_vec((n, 1), pareto_ratio_column(n, 1.2)).unwrap();
        let m = LogLikMatrix::new(values, Layout::DrawsByObservations).unwrap();
        let loo = psisloo(&m, &PsisConfig::default()).unwrap();
        let k = loo.pointwise[0].pareto_k;
        assert!(k > 0.7, "heavy tail should give k > 0.7, got {k}");
        assert_eq!(loo.unreliable_observations(), vec![0]);
        assert!(!loo.is_reliable());
    }

    #[test]
    fn test_light_tail_not_flagged() {
        let n = 1000;
        let column: Vec<f64> = (0..n).map(|j| -(j as f64 + 0.5) / n as f64).collect();
        let values = Array2::from_shape_vec((n, 1), column).unwrap();
        let m = LogLikMatrix::new(values, Layout::DrawsByObservations).unwrap();
        let loo = psisloo(&m, &PsisConfig::default()).unwrap();
        let k = loo.pointwise[0].pareto_k;
        assert!(k < 0.3, "bounded ratios should give small k, got {k}");
        assert!(loo.is_reliable());
    }

    #[test]
    fn test_constant_column_unsmoothed() {
        let values = Array2::from_elem((100, 1), -2.0);
        let m = LogLikMatrix::new(values, Layout::DrawsByObservations).unwrap();
        let loo = psisloo(&m, &PsisConfig::default()).unwrap();
        assert_eq!(loo.pointwise[0].pareto_k, f64::INFINITY);
        assert_relative_eq!(loo.pointwise[0].elpd, -2.0, epsilon = 1e-12);
        assert_relative_eq!(loo.p_loo.unwrap(), 0.0, epsilon = 1e-12);
    }

    // =========================================================================
    // PSIS-LOO
    // =========================================================================

    #[test]
    fn test_psisloo_is_deterministic() {
        let m = random_log_lik(300, 10, 11);
        let a = psisloo(&m, &PsisConfig::default()).unwrap();
        let b = psisloo(&m, &PsisConfig::default()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_psisloo_totals() {
        let m = random_log_lik(500, 20, 3);
        let loo = psisloo(&m, &PsisConfig::default()).unwrap();

        let elpd = loo.pointwise_elpd();
        assert_eq!(elpd.len(), 20);
        assert_relative_eq!(loo.elpd_loo, elpd.iter().sum::<f64>(), epsilon = 1e-9);
        assert_relative_eq!(loo.se_elpd_loo, total_se(&elpd), epsilon = 1e-12);
        assert_relative_eq!(loo.looic(), -2.0 * loo.elpd_loo);
        assert_relative_eq!(loo.se_looic(), 2.0 * loo.se_elpd_loo);

        // leaving an observation out can only lower its predictive density
        let lpd = loo.lpd.unwrap();
        assert!(lpd >= loo.elpd_loo);
        assert!(loo.p_loo.unwrap() >= 0.0);
    }

    #[test]
    fn test_psisloo_elpd_bounded_by_draw_range() {
        let m = random_log_lik(400, 5, 21);
        let loo = psisloo(&m, &PsisConfig::default()).unwrap();
        for (i, column) in m.view().axis_iter(Axis(1)).enumerate() {
            let lo = column.iter().copied().fold(f64::INFINITY, f64::min);
            let hi = column.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let elpd = loo.pointwise[i].elpd;
            assert!(elpd >= lo - 1e-9 && elpd <= hi + 1e-9);
        }
    }

    #[test]
    fn test_from_pointwise() {
        let loo = PsisLoo::from_pointwise(&[-1.0, -2.0, -3.0], &[0.1, 0.8, 1.2]).unwrap();
        assert_eq!(loo.elpd_loo, -6.0);
        assert!(loo.lpd.is_none());
        assert!(loo.p_loo.is_none());
        assert_eq!(loo.unreliable_observations(), vec![1, 2]);

        let summary = loo.summary();
        assert_eq!(summary.n_observations, 3);
        assert_relative_eq!(summary.frac_above_half, 2.0 / 3.0);
        assert_relative_eq!(summary.frac_above_one, 1.0 / 3.0);
        assert_eq!(summary.max_k, 1.2);

        assert!(PsisLoo::from_pointwise(&[-1.0], &[]).is_err());
        assert!(PsisLoo::from_pointwise(&[], &[]).is_err());
        assert!(PsisLoo::from_pointwise(&[f64::NAN], &[0.1]).is_err());
    }
}
