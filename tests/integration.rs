//! Integration tests for the stanity library.
//!
//! These tests verify end-to-end functionality including:
//! - Compiled models are cached and reused across fits
//! - Draws flow from an engine into PSIS-LOO
//! - Models are ranked and differenced by `loo_compare`
//! - Reports render the comparison

// Allow less strict lints for test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::float_cmp)]

use approx::assert_relative_eq;
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stanity::{
    loo_compare, parse_stan_csv, psisloo, psislw, CacheError, CacheStatus, CompareError,
    ComparisonReport, CompiledModel, DataPayload, Draws, EngineError, FitOptions, Layout,
    LogLikMatrix, LooReport, ModelCache, ModelEngine, ModelLoo, ModelSpec, PsisConfig, PsisError,
    PsisLoo, StanityConfig,
};
use statrs::distribution::{Continuous, Normal};
use std::cell::Cell;

const NORMAL_MODEL: &str = r"
data { int N; vector[N] y; real sigma; }
parameters { real mu; }
model { y ~ normal(mu, sigma); }
generated quantities {
  vector[N] log_lik;
  for (n in 1:N) log_lik[n] = normal_lpdf(y[n] | mu, sigma);
}
";

// ============================================================================
// Test engine
// ============================================================================

/// Engine that "samples" the conjugate posterior of a normal mean with known
/// scale and emits `mu` plus `log_lik.1..N` columns.
struct ConjugateNormalEngine {
    compiles: Cell<usize>,
    samples: Cell<usize>,
}

impl ConjugateNormalEngine {
    fn new() -> Self {
        Self {
            compiles: Cell::new(0),
            samples: Cell::new(0),
        }
    }
}

fn real_vector(data: &DataPayload, name: &str) -> Result<Vec<f64>, EngineError> {
    data.get(name)
        .and_then(serde_json::Value::as_array)
        .map(|values| values.iter().filter_map(serde_json::Value::as_f64).collect())
        .ok_or_else(|| EngineError::Sampling {
            stderr: format!("missing data: {name}"),
        })
}

impl ModelEngine for ConjugateNormalEngine {
    fn version(&self) -> &str {
        "conjugate-1.0"
    }

    fn compile(&self, spec: &ModelSpec) -> Result<Vec<u8>, EngineError> {
        self.compiles.set(self.compiles.get() + 1);
        if !spec.source().contains("model") {
            return Err(EngineError::Compilation {
                stderr: "no model block".to_string(),
            });
        }
        Ok(spec.source().as_bytes().to_vec())
    }

    fn sample(
        &self,
        _model: &CompiledModel,
        data: &DataPayload,
        options: &FitOptions,
    ) -> Result<Draws, EngineError> {
        use rand::distributions::Distribution;

        self.samples.set(self.samples.get() + 1);
        let y = real_vector(data, "y")?;
        let sigma = data
            .get("sigma")
            .and_then(serde_json::Value::as_f64)
            .unwrap_or(1.0);

        let n = y.len() as f64;
        let y_bar = y.iter().sum::<f64>() / n;
        let posterior = Normal::new(y_bar, sigma / n.sqrt()).map_err(|e| EngineError::Sampling {
            stderr: e.to_string(),
        })?;

        let mut rng = ChaCha8Rng::seed_from_u64(options.seed.unwrap_or(0));
        let n_draws = options.iter * options.chains;
        let mut columns = vec!["mu".to_string()];
        columns.extend((1..=y.len()).map(|i| format!("log_lik.{i}")));

        let mut values = Array2::zeros((n_draws, y.len() + 1));
        for mut row in values.axis_iter_mut(Axis(0)) {
            let mu = posterior.sample(&mut rng);
            let likelihood = Normal::new(mu, sigma).map_err(|e| EngineError::Sampling {
                stderr: e.to_string(),
            })?;
            row[0] = mu;
            for (j, &obs) in y.iter().enumerate() {
                row[j + 1] = likelihood.ln_pdf(obs);
            }
        }

        Draws::new(columns, values).ok_or_else(|| EngineError::Sampling {
            stderr: "column count mismatch".to_string(),
        })
    }
}

fn observations(n: usize, seed: u64) -> Vec<f64> {
    use rand::distributions::Distribution;

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let truth = Normal::new(0.5, 1.0).unwrap();
    (0..n).map(|_| truth.sample(&mut rng)).collect()
}

fn data_with_sigma(y: &[f64], sigma: f64) -> DataPayload {
    DataPayload::new()
        .with_int("N", i64::try_from(y.len()).unwrap())
        .with_vector("y", y)
        .unwrap()
        .with_real("sigma", sigma)
        .unwrap()
}

fn fit_options() -> FitOptions {
    FitOptions::default().with_iter(250).with_chains(4).with_seed(7)
}

fn log_lik(draws: &Draws) -> LogLikMatrix {
    LogLikMatrix::new(draws.extract("log_lik").unwrap(), Layout::DrawsByObservations).unwrap()
}

// ============================================================================
// End-to-end
// ============================================================================

#[test]
fn test_fit_loo_compare_report() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let spec = ModelSpec::new(NORMAL_MODEL);
    let y = observations(40, 11);

    let (_, well_specified) = cache
        .fit(&spec, &data_with_sigma(&y, 1.0), &fit_options())
        .unwrap();
    let (_, too_wide) = cache
        .fit(&spec, &data_with_sigma(&y, 4.0), &fit_options())
        .unwrap();

    // one compile serves both fits
    assert_eq!(cache.engine().compiles.get(), 1);
    assert_eq!(cache.engine().samples.get(), 2);
    assert_eq!(well_specified.n_draws(), 1000);
    assert!(well_specified.mean("mu").is_some());

    let config = PsisConfig::default();
    let loo = psisloo(&log_lik(&well_specified), &config).unwrap();
    assert_eq!(loo.n_observations(), 40);
    assert!(loo.is_reliable(), "k values: {:?}", loo.pareto_k());
    assert!(loo.p_loo.unwrap() > 0.0);
    assert!(loo.p_loo.unwrap() < 5.0);

    let table = loo_compare(
        vec![
            ("sigma_4".to_string(), log_lik(&too_wide).into()),
            ("sigma_1".to_string(), ModelLoo::Loo(loo.clone())),
        ],
        &config,
    )
    .unwrap();

    assert_eq!(table.ranking(), vec!["sigma_1", "sigma_4"]);
    assert_eq!(table.n_observations, 40);
    let best = table.best().unwrap();
    assert_relative_eq!(best.elpd_loo, loo.elpd_loo, epsilon = 1e-12);
    assert!(best.elpd_diff.is_none());
    let other = table.get("sigma_4").unwrap();
    assert!(other.elpd_diff.unwrap() > 0.0);
    assert!(other.se_diff.unwrap() > 0.0);

    let md = ComparisonReport::new(table).to_markdown();
    assert!(md.contains("sigma_1"));
    assert!(md.contains("sigma_4"));

    let loo_md = LooReport::new("sigma_1", &loo).to_markdown();
    assert!(loo_md.contains("All Pareto k estimates are at or below 0.7."));
}

#[test]
fn test_fit_is_seeded() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let spec = ModelSpec::new(NORMAL_MODEL);
    let data = data_with_sigma(&observations(10, 3), 1.0);

    let (_, a) = cache.fit(&spec, &data, &fit_options()).unwrap();
    let (_, b) = cache.fit(&spec, &data, &fit_options()).unwrap();
    assert_eq!(a, b);

    let config = PsisConfig::default();
    let loo_a = psisloo(&log_lik(&a), &config).unwrap();
    let loo_b = psisloo(&log_lik(&b), &config).unwrap();
    assert_eq!(loo_a.elpd_loo, loo_b.elpd_loo);
}

// ============================================================================
// Cache
// ============================================================================

#[test]
fn test_cache_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let spec = ModelSpec::new(NORMAL_MODEL);

    let (first, status) = cache.load_or_compile(&spec).unwrap();
    assert_eq!(status, CacheStatus::Miss);
    let (second, status) = cache.load_or_compile(&spec).unwrap();
    assert_eq!(status, CacheStatus::Hit);

    assert_eq!(first, second);
    assert_eq!(cache.engine().compiles.get(), 1);
    assert_eq!(cache.entries().unwrap().len(), 1);
}

#[test]
fn test_cache_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let spec = ModelSpec::new(NORMAL_MODEL);

    ModelCache::new(ConjugateNormalEngine::new(), dir.path())
        .load_or_compile(&spec)
        .unwrap();

    let reopened = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let (_, status) = reopened.load_or_compile(&spec).unwrap();
    assert_eq!(status, CacheStatus::Hit);
    assert_eq!(reopened.engine().compiles.get(), 0);
}

#[test]
fn test_cache_dir_from_config() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = format!("cache:\n  dir: {}\n", dir.path().join("models").display());
    let config = StanityConfig::from_yaml(&yaml).unwrap();

    let cache = ModelCache::new(ConjugateNormalEngine::new(), &config.cache.dir);
    cache.load_or_compile(&ModelSpec::new(NORMAL_MODEL)).unwrap();
    assert!(config.cache.dir.is_dir());
}

#[test]
fn test_compile_failure_not_cached() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let broken = ModelSpec::new("parameters { real mu; }");

    let err = cache.load_or_compile(&broken).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Engine(EngineError::Compilation { .. })
    ));
    assert!(!cache.contains(&broken));

    // retried, not served from cache
    cache.load_or_compile(&broken).unwrap_err();
    assert_eq!(cache.engine().compiles.get(), 2);
}

#[test]
fn test_sampling_error_propagates() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let err = cache
        .fit(&ModelSpec::new(NORMAL_MODEL), &DataPayload::new(), &fit_options())
        .unwrap_err();
    assert!(matches!(err, CacheError::Engine(EngineError::Sampling { .. })));
    assert!(err.to_string().contains("missing data: y"));
}

// ============================================================================
// PSIS
// ============================================================================

#[test]
fn test_smoothed_columns_normalized() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let (_, draws) = cache
        .fit(
            &ModelSpec::new(NORMAL_MODEL),
            &data_with_sigma(&observations(25, 5), 1.0),
            &fit_options(),
        )
        .unwrap();

    let ratios = draws.extract("log_lik").unwrap().mapv(|v| -v);
    let (smoothed, ks) = psislw(ratios.view(), &PsisConfig::default()).unwrap();
    assert_eq!(ks.len(), 25);
    for column in smoothed.axis_iter(Axis(1)) {
        let total: f64 = column.iter().map(|v| v.exp()).sum();
        assert_relative_eq!(total, 1.0, epsilon = 1e-9);
    }
}

#[test]
fn test_k_flags_heavy_tails_only() {
    let n = 2000;
    let values = Array2::from_shape_fn((n, 2), |(s, j)| {
        let u = (s as f64 + 0.5) / n as f64;
        if j == 0 {
            // importance ratios Pareto with shape 1/1.5
            1.5 * (1.0 - u).ln()
        } else {
            -1.0 - 0.05 * u
        }
    });
    let matrix = LogLikMatrix::new(values, Layout::DrawsByObservations).unwrap();
    let loo = psisloo(&matrix, &PsisConfig::default()).unwrap();

    let k = loo.pareto_k();
    assert!(k[0] > 0.7, "heavy column k = {}", k[0]);
    assert!(k[1] < 0.5, "near-uniform column k = {}", k[1]);
    assert_eq!(loo.unreliable_observations(), vec![0]);
    // flagged observations are kept in the totals
    assert_eq!(loo.pointwise.len(), 2);
}

#[test]
fn test_too_few_draws() {
    let matrix = LogLikMatrix::from_rows(
        &[vec![-1.0, -2.0], vec![-1.1, -2.1], vec![-0.9, -1.9]],
        Layout::DrawsByObservations,
    )
    .unwrap();
    let err = psisloo(&matrix, &PsisConfig::default()).unwrap_err();
    assert!(matches!(err, PsisError::TooFewDraws { draws: 3, .. }));
}

#[test]
fn test_observations_by_draws_layout() {
    let dir = tempfile::tempdir().unwrap();
    let cache = ModelCache::new(ConjugateNormalEngine::new(), dir.path());
    let (_, draws) = cache
        .fit(
            &ModelSpec::new(NORMAL_MODEL),
            &data_with_sigma(&observations(8, 9), 1.0),
            &fit_options(),
        )
        .unwrap();
    let by_draws = draws.extract("log_lik").unwrap();
    let by_obs = by_draws.t().to_owned();

    let config = PsisConfig::default();
    let a = psisloo(&log_lik(&draws), &config).unwrap();
    let b = psisloo(
        &LogLikMatrix::new(by_obs, Layout::ObservationsByDraws).unwrap(),
        &config,
    )
    .unwrap();
    assert_eq!(a.elpd_loo, b.elpd_loo);
}

// ============================================================================
// Comparison
// ============================================================================

fn constant_loo(total: f64, n: usize) -> PsisLoo {
    let elpd = vec![total / n as f64; n];
    PsisLoo::from_pointwise(&elpd, &vec![0.1; n]).unwrap()
}

#[test]
fn test_ranking_and_differences() {
    let table = loo_compare(
        vec![
            ("c".to_string(), constant_loo(-200.0, 10).into()),
            ("a".to_string(), constant_loo(-100.0, 10).into()),
            ("b".to_string(), constant_loo(-150.0, 10).into()),
        ],
        &PsisConfig::default(),
    )
    .unwrap();

    assert_eq!(table.ranking(), vec!["a", "b", "c"]);
    assert_relative_eq!(table.get("b").unwrap().elpd_diff.unwrap(), 50.0, epsilon = 1e-9);
    assert_relative_eq!(table.get("c").unwrap().elpd_diff.unwrap(), 100.0, epsilon = 1e-9);
}

#[test]
fn test_shape_mismatch_before_psis() {
    // the 60-observation matrix has too few draws; the shape error wins
    let short = LogLikMatrix::new(Array2::from_elem((3, 60), -1.0), Layout::DrawsByObservations)
        .unwrap();
    let err = loo_compare(
        vec![
            ("fifty".to_string(), constant_loo(-50.0, 50).into()),
            ("sixty".to_string(), short.into()),
        ],
        &PsisConfig::default(),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        CompareError::ShapeMismatch {
            expected: 50,
            found: 60,
            ..
        }
    ));
}

#[test]
fn test_psis_error_surfaces_through_compare() {
    let short = LogLikMatrix::new(Array2::from_elem((3, 4), -1.0), Layout::DrawsByObservations)
        .unwrap();
    let err = loo_compare(
        vec![
            ("ok".to_string(), constant_loo(-4.0, 4).into()),
            ("short".to_string(), short.into()),
        ],
        &PsisConfig::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CompareError::Psis(PsisError::TooFewDraws { .. })
    ));
}

// ============================================================================
// Stan CSV
// ============================================================================

#[test]
fn test_stan_csv_to_loo() {
    let mut csv = String::from("# model = normal\nlp__,mu,log_lik.1,log_lik.2\n");
    for s in 0..100 {
        let mu = f64::from(s) / 100.0 - 0.5;
        let ll1 = -0.5 * (1.0 - mu).powi(2);
        let ll2 = -0.5 * (0.2 - mu).powi(2);
        csv.push_str(&format!("-1.0,{mu},{ll1},{ll2}\n"));
    }
    csv.push_str("# Elapsed Time: 0.01 seconds\n");

    let draws = parse_stan_csv(&csv).unwrap();
    assert_eq!(draws.n_draws(), 100);

    let loo = psisloo(&log_lik(&draws), &PsisConfig::default()).unwrap();
    assert_eq!(loo.n_observations(), 2);
    assert!(loo.elpd_loo < 0.0);
}
