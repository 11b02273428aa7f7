//! # Stanity
//!
//! Helpers for working with Stan-style Bayesian models: a compiled-model
//! cache, Pareto smoothed importance sampling leave-one-out cross-validation
//! (PSIS-LOO), and model comparison by expected log predictive density.
//!
//! ## Architecture
//!
//! ```text
//! Model source ──hash──▶ ModelCache ──miss──▶ ModelEngine::compile
//!                            │                       │
//!                            ▼                       ▼
//!                     cached artifact ◀──────── stored once
//!                            │
//!                            ▼
//!                  ModelEngine::sample ──▶ Draws ──extract("log_lik")──▶ LogLikMatrix
//!                                                                        │
//!                                                                        ▼
//!                                                                     psisloo
//!                                                                        │
//!                                                                        ▼
//!                                                    loo_compare ──▶ ComparisonTable
//! ```
//!
//! The engine is a trait; [`CmdStanEngine`] drives a CmdStan installation.
//! Everything downstream of the draws is pure computation.
//!
//! ## Example
//!
//! ```
//! use stanity::{loo_compare, psisloo, Layout, LogLikMatrix, ModelLoo, PsisConfig};
//!
//! let config = PsisConfig::default();
//! let draws = 100;
//! let a = LogLikMatrix::from_rows(
//!     &(0..draws).map(|s| vec![-1.0 - 0.01 * f64::from(s), -1.2]).collect::<Vec<_>>(),
//!     Layout::DrawsByObservations,
//! )?;
//! let b = LogLikMatrix::from_rows(
//!     &(0..draws).map(|s| vec![-2.0 - 0.01 * f64::from(s), -2.5]).collect::<Vec<_>>(),
//!     Layout::DrawsByObservations,
//! )?;
//!
//! let loo_a = psisloo(&a, &config)?;
//! let table = loo_compare(
//!     vec![("a".to_string(), ModelLoo::Loo(loo_a)), ("b".to_string(), b.into())],
//!     &config,
//! )?;
//! assert_eq!(table.ranking(), vec!["a", "b"]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod cache;
pub mod compare;
pub mod config;
pub mod engine;
pub mod model;
pub mod psis;
pub mod report;

pub use cache::{CacheEntry, CacheError, CacheStatus, ModelCache};
pub use compare::{
    elpd_difference, loo_compare, CompareError, ComparisonRow, ComparisonTable, ElpdDifference,
    ModelLoo,
};
pub use config::{CacheSettings, ConfigError, EngineSettings, StanityConfig};
pub use engine::{parse_stan_csv, CmdStanConfig, CmdStanEngine, EngineError, ModelEngine};
pub use model::{
    CompiledModel, DataError, DataPayload, Draws, FitOptions, ModelSpec, VariableSummary,
};
pub use psis::{
    gpdfit, gpinv, log_sum_exp, psisloo, psislw, GpdFit, Layout, LogLikMatrix, ParetoKSummary,
    PointwiseLoo, PsisConfig, PsisError, PsisLoo,
};
pub use report::{comparison_table, ComparisonReport, LooReport, ReportMetadata};
