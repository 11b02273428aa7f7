//! Demo: PSIS-LOO comparison of three normal models with different scales.
//!
//! Posterior draws are simulated directly, so no CmdStan install is needed.
//! Run with `RUST_LOG=debug` to see per-model diagnostics.

#![allow(clippy::cast_precision_loss)]

use anyhow::Result;
use ndarray::Array2;
use rand::distributions::Distribution;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use stanity::{
    loo_compare, psisloo, ComparisonReport, Layout, LogLikMatrix, LooReport, ModelLoo, PsisConfig,
};
use statrs::distribution::{Continuous, Normal};
use tracing_subscriber::EnvFilter;

const OBSERVATIONS: usize = 60;
const DRAWS: usize = 4000;

/// Pointwise log-likelihood of `y` under draws of `mu` from its conjugate
/// posterior, with the scale fixed at `sigma`.
fn simulate_log_lik(y: &[f64], sigma: f64, rng: &mut ChaCha8Rng) -> Result<LogLikMatrix> {
    let n = y.len() as f64;
    let y_bar = y.iter().sum::<f64>() / n;
    let posterior = Normal::new(y_bar, sigma / n.sqrt())?;

    let mut values = Array2::zeros((DRAWS, y.len()));
    for mut row in values.rows_mut() {
        let likelihood = Normal::new(posterior.sample(rng), sigma)?;
        for (cell, &obs) in row.iter_mut().zip(y) {
            *cell = likelihood.ln_pdf(obs);
        }
    }
    Ok(LogLikMatrix::new(values, Layout::DrawsByObservations)?)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Stanity PSIS-LOO Demo ===\n");

    let mut rng = ChaCha8Rng::seed_from_u64(2024);
    let truth = Normal::new(0.5, 1.0)?;
    let mut y: Vec<f64> = (0..OBSERVATIONS).map(|_| truth.sample(&mut rng)).collect();
    // one gross outlier so the narrow model has something to struggle with
    y[0] = 6.0;

    let config = PsisConfig::default();
    let mut models = Vec::new();
    for (name, sigma) in [("narrow", 0.5), ("matched", 1.0), ("wide", 2.0)] {
        let log_lik = simulate_log_lik(&y, sigma, &mut rng)?;
        let loo = psisloo(&log_lik, &config)?;
        println!("{}", LooReport::new(name, &loo).to_markdown());
        models.push((name.to_string(), ModelLoo::Loo(loo)));
    }

    let table = loo_compare(models, &config)?;
    if let Some(best) = table.best() {
        println!("Best model: {}\n", best.name);
    }
    println!("{}", ComparisonReport::new(table).to_markdown());

    Ok(())
}
