//! Data model shared by the cache and the engine boundary.
//!
//! A [`ModelSpec`] is the model source text, a [`DataPayload`] binds names to
//! values for a fit, [`FitOptions`] carries sampler settings through to the
//! engine untouched, and [`Draws`] holds what comes back.

use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors binding values into a [`DataPayload`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Non-finite value for {name}[{index}]: {value}")]
    NonFinite {
        name: String,
        index: usize,
        value: f64,
    },
}

/// Statistical model definition, identified by the hash of its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    source: String,
}

impl ModelSpec {
    /// Wrap model source text
    #[must_use]
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Model source text
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the source contains nothing but whitespace
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.source.trim().is_empty()
    }

    /// Cache identity: SHA-256 of the source followed by the engine version.
    ///
    /// Changing the engine version invalidates every cached artifact, since
    /// compiled models are not portable across engine releases.
    #[must_use]
    pub fn hash(&self, engine_version: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update([0u8]);
        hasher.update(engine_version.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl From<&str> for ModelSpec {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

impl From<String> for ModelSpec {
    fn from(source: String) -> Self {
        Self::new(source)
    }
}

/// Named values bound to a model's data block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataPayload(BTreeMap<String, Value>);

impl DataPayload {
    /// Create an empty payload
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an integer
    #[must_use]
    pub fn with_int(mut self, name: &str, value: i64) -> Self {
        self.0.insert(name.to_string(), Value::from(value));
        self
    }

    /// Bind a real scalar
    ///
    /// # Errors
    ///
    /// Returns `DataError::NonFinite` for NaN or infinite values, which JSON
    /// cannot carry.
    pub fn with_real(mut self, name: &str, value: f64) -> Result<Self, DataError> {
        if !value.is_finite() {
            return Err(DataError::NonFinite {
                name: name.to_string(),
                index: 0,
                value,
            });
        }
        self.0.insert(name.to_string(), Value::from(value));
        Ok(self)
    }

    /// Bind a real vector
    ///
    /// # Errors
    ///
    /// Returns `DataError::NonFinite` naming the first NaN or infinite entry.
    pub fn with_vector(mut self, name: &str, values: &[f64]) -> Result<Self, DataError> {
        if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
            return Err(DataError::NonFinite {
                name: name.to_string(),
                index,
                value,
            });
        }
        self.0.insert(name.to_string(), Value::from(values.to_vec()));
        Ok(self)
    }

    /// Bind an arbitrary JSON value (matrices, integer arrays, ...)
    pub fn insert(&mut self, name: &str, value: Value) {
        self.0.insert(name.to_string(), value);
    }

    /// Look up a bound value
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// Number of bound names
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when nothing is bound
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Serialize to the JSON object the engine reads
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }
}

/// Sampler settings, passed through to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FitOptions {
    /// Post-warmup draws per chain
    #[serde(default = "default_iter")]
    pub iter: usize,
    /// Warmup draws per chain
    #[serde(default = "default_warmup")]
    pub warmup: usize,
    /// Number of chains
    #[serde(default = "default_chains")]
    pub chains: usize,
    /// Random seed; engine default when absent
    #[serde(default)]
    pub seed: Option<u64>,
    /// Chains run at once; all of them when absent
    #[serde(default)]
    pub parallel_chains: Option<usize>,
    /// Engine-specific arguments
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

const fn default_iter() -> usize {
    1000
}
const fn default_warmup() -> usize {
    1000
}
const fn default_chains() -> usize {
    4
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            iter: default_iter(),
            warmup: default_warmup(),
            chains: default_chains(),
            seed: None,
            parallel_chains: None,
            extra: BTreeMap::new(),
        }
    }
}

impl FitOptions {
    /// Set the number of post-warmup draws per chain
    #[must_use]
    pub const fn with_iter(mut self, iter: usize) -> Self {
        self.iter = iter;
        self
    }

    /// Set the number of chains
    #[must_use]
    pub const fn with_chains(mut self, chains: usize) -> Self {
        self.chains = chains;
        self
    }

    /// Set the random seed
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Limit how many chains run at once
    #[must_use]
    pub const fn with_parallel_chains(mut self, parallel: usize) -> Self {
        self.parallel_chains = Some(parallel);
        self
    }

    /// Number of chains to run concurrently, between 1 and `chains`
    #[must_use]
    pub fn parallel_width(&self) -> usize {
        let chains = self.chains.max(1);
        self.parallel_chains.unwrap_or(chains).clamp(1, chains)
    }

    /// Add an engine-specific argument
    #[must_use]
    pub fn with_extra(mut self, key: &str, value: &str) -> Self {
        self.extra.insert(key.to_string(), value.to_string());
        self
    }
}

/// Engine-compiled model. The bytes are opaque to this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledModel {
    /// Cache key the artifact is stored under
    pub hash: String,
    /// Engine-defined serialization of the compiled model
    pub bytes: Vec<u8>,
}

/// Shape and moments of one model variable over every draw
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableSummary {
    /// Variable name without element indices
    pub name: String,
    /// Element dimensions; empty for a scalar
    pub shape: Vec<usize>,
    /// Mean over all draws and elements
    pub mean: f64,
    /// Population standard deviation over all draws and elements
    pub std: f64,
}

/// Posterior draws as named columns, one row per draw.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draws {
    columns: Vec<String>,
    values: Array2<f64>,
}

impl Draws {
    /// Build from column names and a draws × columns matrix.
    ///
    /// Returns `None` when the column count does not match the names.
    #[must_use]
    pub fn new(columns: Vec<String>, values: Array2<f64>) -> Option<Self> {
        (columns.len() == values.ncols()).then_some(Self { columns, values })
    }

    /// Column names in storage order
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Number of draws across all chains
    #[must_use]
    pub fn n_draws(&self) -> usize {
        self.values.nrows()
    }

    /// Full draws × columns matrix
    #[must_use]
    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    /// Extract a variable as a draws × elements matrix.
    ///
    /// Matches the scalar column `name` or the flattened vector columns
    /// `name.1`, `name.2`, ... in their stored order. Returns `None` when
    /// no column matches.
    #[must_use]
    pub fn extract(&self, name: &str) -> Option<Array2<f64>> {
        let prefix = format!("{name}.");
        let indices: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, column)| *column == name || column.starts_with(&prefix))
            .map(|(i, _)| i)
            .collect();

        if indices.is_empty() {
            return None;
        }
        Some(self.values.select(Axis(1), &indices))
    }

    /// Posterior mean of a scalar column
    #[must_use]
    pub fn mean(&self, name: &str) -> Option<f64> {
        let index = self.columns.iter().position(|column| column == name)?;
        self.values.column(index).mean()
    }

    /// Per-variable shape, mean and standard deviation, in column order.
    ///
    /// Flattened columns such as `theta.2.3` are grouped under `theta`, whose
    /// shape is the largest index seen in each position.
    #[must_use]
    pub fn summary(&self) -> Vec<VariableSummary> {
        let mut groups: Vec<(&str, Vec<usize>, Vec<usize>)> = Vec::new();
        for (i, column) in self.columns.iter().enumerate() {
            let (name, indices) = column
                .split_once('.')
                .map_or((column.as_str(), ""), |(name, rest)| (name, rest));
            let position = groups.iter().position(|(n, _, _)| *n == name);
            let (_, members, shape) = match position {
                Some(p) => &mut groups[p],
                None => {
                    groups.push((name, Vec::new(), Vec::new()));
                    let last = groups.len() - 1;
                    &mut groups[last]
                }
            };
            members.push(i);
            let dims = indices.split('.').filter_map(|d| d.parse::<usize>().ok());
            for (axis, dim) in dims.enumerate() {
                if axis == shape.len() {
                    shape.push(dim);
                } else {
                    shape[axis] = shape[axis].max(dim);
                }
            }
        }

        groups
            .into_iter()
            .filter_map(|(name, members, shape)| {
                let values = self.values.select(Axis(1), &members);
                Some(VariableSummary {
                    name: name.to_string(),
                    shape,
                    mean: values.mean()?,
                    std: values.std(0.0),
                })
            })
            .collect()
    }

    /// Stack draws from several chains sharing the same columns.
    ///
    /// Returns `None` for an empty input or mismatched column sets.
    #[must_use]
    pub fn concat(chains: Vec<Self>) -> Option<Self> {
        let mut chains = chains.into_iter();
        let first = chains.next()?;
        let mut views = vec![first.values.view()];
        let rest: Vec<Self> = chains.collect();
        for chain in &rest {
            if chain.columns != first.columns {
                return None;
            }
            views.push(chain.values.view());
        }
        let values = ndarray::concatenate(Axis(0), &views).ok()?;
        Some(Self {
            columns: first.columns.clone(),
            values,
        })
    }
}
