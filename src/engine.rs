//! Modeling-engine boundary.
//!
//! The cache never compiles or samples by itself; it goes through a
//! [`ModelEngine`]. [`CmdStanEngine`] drives a CmdStan installation through
//! its makefile and the compiled model's command line, the same way a user
//! would from a shell.

use crate::model::{CompiledModel, DataPayload, Draws, FitOptions, ModelSpec};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::Instant;
use tempfile::TempDir;
use thiserror::Error;

/// Errors raised by a modeling engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Model compilation failed: {stderr}")]
    Compilation { stderr: String },

    #[error("Sampling failed: {stderr}")]
    Sampling { stderr: String },

    #[error("Engine not configured: {0}")]
    NotConfigured(String),

    #[error("Engine IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode data payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed sampler output at line {line}: {message}")]
    Csv { line: usize, message: String },
}

/// Capability to compile model source and sample from the result.
pub trait ModelEngine {
    /// Version string folded into cache keys
    fn version(&self) -> &str;

    /// Compile model source into an opaque artifact
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Compilation` when the engine rejects the source.
    fn compile(&self, spec: &ModelSpec) -> Result<Vec<u8>, EngineError>;

    /// Draw posterior samples from a compiled model
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Sampling` when the engine fails to fit, e.g. on
    /// data that does not match the model's data block.
    fn sample(
        &self,
        model: &CompiledModel,
        data: &DataPayload,
        options: &FitOptions,
    ) -> Result<Draws, EngineError>;
}

/// Configuration for [`CmdStanEngine`]
#[derive(Debug, Clone)]
pub struct CmdStanConfig {
    /// CmdStan installation directory (contains the makefile)
    pub home: PathBuf,
    /// Version string used in cache keys
    pub version: String,
    /// `make` program
    pub make: String,
}

impl CmdStanConfig {
    /// Configure from an installation directory.
    ///
    /// The version is read from the trailing `-X.Y.Z` of the directory name
    /// (CmdStan's release layout), falling back to `"unknown"`.
    #[must_use]
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let version = home
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.rsplit_once('-'))
            .map_or_else(|| "unknown".to_string(), |(_, v)| v.to_string());
        Self {
            home,
            version,
            make: "make".to_string(),
        }
    }

    /// Configure from the `CMDSTAN` environment variable
    ///
    /// # Errors
    ///
    /// Returns `EngineError::NotConfigured` when the variable is unset.
    pub fn from_env() -> Result<Self, EngineError> {
        std::env::var_os("CMDSTAN")
            .map(Self::new)
            .ok_or_else(|| EngineError::NotConfigured("CMDSTAN is not set".to_string()))
    }
}

/// CmdStan command-line engine
pub struct CmdStanEngine {
    config: CmdStanConfig,
}

impl CmdStanEngine {
    /// Create an engine for a CmdStan installation
    #[must_use]
    pub const fn with_config(config: CmdStanConfig) -> Self {
        Self { config }
    }

    /// Current config
    #[must_use]
    pub const fn config(&self) -> &CmdStanConfig {
        &self.config
    }

    fn run_make(&self, target: &Path) -> Result<Output, EngineError> {
        let mut cmd = Command::new(&self.config.make);
        cmd.arg(target).current_dir(&self.config.home);
        tracing::debug!(target = %target.display(), "Running CmdStan make");
        cmd.output().map_err(EngineError::from)
    }

    fn spawn_chain(
        exe: &Path,
        dir: &Path,
        chain: usize,
        options: &FitOptions,
    ) -> Result<RunningChain, EngineError> {
        let output_file = dir.join(format!("output-{chain}.csv"));
        let args = sample_args(&dir.join("data.json"), &output_file, chain, options);

        tracing::debug!(chain, args = ?args, "Starting sampler");
        let child = Command::new(exe)
            .args(&args)
            .current_dir(dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        Ok(RunningChain {
            chain,
            child,
            output_file,
        })
    }

    /// Run chains `parallel_width` at a time, returning draws in chain order.
    fn run_chains(
        exe: &Path,
        dir: &Path,
        options: &FitOptions,
    ) -> Result<Vec<Draws>, EngineError> {
        let ids: Vec<usize> = (1..=options.chains).collect();
        let mut draws = Vec::with_capacity(ids.len());

        for batch in ids.chunks(options.parallel_width()) {
            let mut running = Vec::with_capacity(batch.len());
            for &chain in batch {
                match Self::spawn_chain(exe, dir, chain, options) {
                    Ok(run) => running.push(run),
                    Err(e) => {
                        for mut run in running {
                            run.child.kill().ok();
                            run.child.wait().ok();
                        }
                        return Err(e);
                    }
                }
            }

            // reap every child in the batch before reporting a failure
            let finished: Vec<_> = running
                .into_iter()
                .map(|run| (run.chain, run.child.wait_with_output(), run.output_file))
                .collect();
            for (chain, output, output_file) in finished {
                let output = output?;
                if !output.status.success() {
                    tracing::error!(chain, "Sampler exited with failure");
                    return Err(EngineError::Sampling {
                        stderr: combined_output(&output),
                    });
                }
                let csv = std::fs::read_to_string(&output_file)?;
                draws.push(parse_stan_csv(&csv)?);
            }
        }

        Ok(draws)
    }
}

/// Sampler process for one chain
struct RunningChain {
    chain: usize,
    child: Child,
    output_file: PathBuf,
}

impl ModelEngine for CmdStanEngine {
    fn version(&self) -> &str {
        &self.config.version
    }

    fn compile(&self, spec: &ModelSpec) -> Result<Vec<u8>, EngineError> {
        let temp_dir = TempDir::new()?;
        let source_path = temp_dir.path().join("model.stan");
        std::fs::write(&source_path, spec.source())?;

        let exe = temp_dir.path().join(executable_name("model"));
        let start = Instant::now();
        let output = self.run_make(&exe)?;
        if !output.status.success() {
            return Err(EngineError::Compilation {
                stderr: combined_output(&output),
            });
        }
        tracing::debug!(
            elapsed_secs = start.elapsed().as_secs_f64(),
            "CmdStan compile finished"
        );

        Ok(std::fs::read(&exe)?)
    }

    fn sample(
        &self,
        model: &CompiledModel,
        data: &DataPayload,
        options: &FitOptions,
    ) -> Result<Draws, EngineError> {
        let temp_dir = TempDir::new()?;
        let dir = temp_dir.path();

        let exe = dir.join(executable_name("model"));
        std::fs::write(&exe, &model.bytes)?;
        mark_executable(&exe)?;
        std::fs::write(dir.join("data.json"), data.to_json()?)?;

        let chains = Self::run_chains(&exe, dir, options)?;

        Draws::concat(chains).ok_or_else(|| EngineError::Sampling {
            stderr: "chains produced no draws or mismatched columns".to_string(),
        })
    }
}

fn executable_name(stem: &str) -> String {
    if cfg!(windows) {
        format!("{stem}.exe")
    } else {
        stem.to_string()
    }
}

#[cfg(unix)]
fn mark_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn mark_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}\n{stderr}").trim().to_string()
}

/// Build the CmdStan `sample` command line for one chain
fn sample_args(data: &Path, output: &Path, chain: usize, options: &FitOptions) -> Vec<String> {
    let mut args = vec![
        "sample".to_string(),
        format!("num_samples={}", options.iter),
        format!("num_warmup={}", options.warmup),
    ];
    for (key, value) in &options.extra {
        args.push(format!("{key}={value}"));
    }
    args.push("data".to_string());
    args.push(format!("file={}", data.display()));
    args.push("output".to_string());
    args.push(format!("file={}", output.display()));
    if let Some(seed) = options.seed {
        args.push("random".to_string());
        args.push(format!("seed={seed}"));
    }
    args.push(format!("id={chain}"));
    args
}

/// Parse a CmdStan output CSV into draws.
///
/// Lines starting with `#` (configuration echo, adaptation info, timing) are
/// skipped. The first remaining line is the header.
///
/// # Errors
///
/// Returns `EngineError::Csv` on a missing header, a row of the wrong width
/// or an unparseable number.
pub fn parse_stan_csv(text: &str) -> Result<Draws, EngineError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, line)| (i + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'));

    let (_, header) = lines.next().ok_or(EngineError::Csv {
        line: 0,
        message: "no header row".to_string(),
    })?;
    let columns: Vec<String> = header.split(',').map(|c| c.trim().to_string()).collect();

    let mut values = Vec::new();
    let mut rows = 0;
    for (line_no, line) in lines {
        let start = values.len();
        for field in line.split(',') {
            let value: f64 = field.trim().parse().map_err(|_| EngineError::Csv {
                line: line_no,
                message: format!("not a number: {field:?}"),
            })?;
            values.push(value);
        }
        if values.len() - start != columns.len() {
            return Err(EngineError::Csv {
                line: line_no,
                message: format!(
                    "expected {} fields, found {}",
                    columns.len(),
                    values.len() - start
                ),
            });
        }
        rows += 1;
    }

    let matrix = Array2::from_shape_vec((rows, columns.len()), values).map_err(|e| {
        EngineError::Csv {
            line: 0,
            message: e.to_string(),
        }
    })?;
    Draws::new(columns, matrix).ok_or(EngineError::Csv {
        line: 0,
        message: "column count mismatch".to_string(),
    })
}
